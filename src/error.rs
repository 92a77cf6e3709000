//! The error taxonomy of verge.
//!
//! Every failure a handler or the chain can produce is a variant here.
//! Handlers map most of their own failures to HTTP statuses before they
//! surface; errors which escape the chain are rendered by the connection
//! loop using [`Error::status`].

use crate::prelude::*;

/// An error from routing, a handler, or the wire.
#[derive(Debug)]
pub enum Error {
    /// The request could not be understood; an undecodable path or a
    /// malformed head.
    BadRequest(&'static str),
    /// No route, file, or upstream resource matched.
    NotFound,
    /// The resolved path escaped the configured root, or a hidden file was
    /// requested without `hidden` enabled.
    Forbidden,
    /// The upstream could not be reached, timed out, or was aborted.
    UpstreamUnavailable(&'static str),
    /// The WebSocket handshake failed before the upstream reported open.
    UpgradeFailed,
    /// Headers were mutated, or `upgrade` was called, after the head was
    /// committed to the wire.
    HeadersSent,
    /// `next()` was invoked more than once from the same chain frame.
    ChainMisuse,
    /// A startup error: unknown handler name, bad host regex, missing
    /// required handler field.
    Config(String),
    /// An explicit status raised through [`Ctx::throw`](crate::ctx::Ctx::throw).
    Status(StatusCode, String),
    /// Parsing an HTTP head failed.
    Parse(parse::Error),
    /// An input-output error from a socket or the file system.
    Io(io::Error),
}
impl Error {
    /// A static description of the variant.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::BadRequest(s) => s,
            Self::NotFound => "not found",
            Self::Forbidden => "forbidden",
            Self::UpstreamUnavailable(s) => s,
            Self::UpgradeFailed => "the WebSocket upgrade failed",
            Self::HeadersSent => "headers were already sent",
            Self::ChainMisuse => "next() was called twice in the same frame",
            Self::Config(s) => s,
            Self::Status(_, s) => s,
            Self::Parse(err) => err.as_str(),
            Self::Io(_) => "io error",
        }
    }
    /// The HTTP status the connection loop answers with when this error
    /// escapes the middleware chain.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpgradeFailed => StatusCode::BAD_GATEWAY,
            Self::Status(code, _) => *code,
            Self::Parse(_) => StatusCode::BAD_REQUEST,
            Self::HeadersSent | Self::ChainMisuse | Self::Config(_) | Self::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}
impl From<io::Error> for Error {
    #[inline]
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}
impl From<parse::Error> for Error {
    #[inline]
    fn from(err: parse::Error) -> Self {
        Self::Parse(err)
    }
}
impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io error: {err}"),
            Self::Config(s) => write!(f, "configuration error: {s}"),
            Self::Status(code, s) => write!(f, "{code}: {s}"),
            _ => f.write_str(self.as_str()),
        }
    }
}
impl std::error::Error for Error {}
