//! The write target of a request: an HTTP/1.1 response that can morph into
//! a raw WebSocket socket.
//!
//! [`UpgradableResponse`] owns the client socket for the lifetime of one
//! request. It starts **buffering** (nothing on the wire), moves to
//! **responding** once the head is serialised, or to **upgraded** when a
//! handler claims the socket for a WebSocket session. The HTTP/1.1 head
//! serialiser lives in [`crate::wire`] and is invoked from exactly one
//! place per transition.

use crate::prelude::*;
use tokio_tungstenite::WebSocketStream;
use tungstenite::protocol::frame::coding::CloseCode;

/// A duplex byte stream verge can own.
///
/// Implemented by [`TcpStream`], TLS wrappers, and the in-memory duplex
/// used in tests.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: ?Sized + AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

/// The state of an [`UpgradableResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Headers accumulate in the request context; nothing is on the wire.
    Buffering,
    /// The head is serialised; writes append body bytes.
    Responding,
    /// The socket belongs to a WebSocket session. Writes are no-ops.
    Upgraded,
}

/// The close code for an upgraded session that ended with `status`.
///
/// `500` maps to `1011` (internal error), everything else to `1000`.
#[must_use]
pub fn close_code(status: StatusCode) -> CloseCode {
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        CloseCode::Error
    } else {
        CloseCode::Normal
    }
}

/// A response target owning the client socket.
pub struct UpgradableResponse {
    io: Option<Box<dyn Io>>,
    state: State,
}
impl UpgradableResponse {
    /// Takes ownership of the client socket.
    pub fn new(io: Box<dyn Io>) -> Self {
        Self {
            io: Some(io),
            state: State::Buffering,
        }
    }

    /// The current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    /// Whether headers can still be mutated.
    #[inline]
    #[must_use]
    pub fn is_buffering(&self) -> bool {
        self.state == State::Buffering
    }

    /// The socket, for reading the request body while the response has not
    /// begun.
    pub(crate) fn io_mut(&mut self) -> Option<&mut Box<dyn Io>> {
        self.io.as_mut()
    }

    /// Serialises `HTTP/1.1 <code> <reason>` and the headers, moving to
    /// [`State::Responding`].
    ///
    /// # Errors
    ///
    /// [`Error::HeadersSent`] outside [`State::Buffering`]; otherwise any
    /// socket error.
    pub async fn send_head(
        &mut self,
        status: StatusCode,
        headers: &HeaderMap,
    ) -> Result<(), Error> {
        if self.state != State::Buffering {
            return Err(Error::HeadersSent);
        }
        // The io is present in every state but Upgraded.
        let io = self.io.as_mut().unwrap();
        wire::write_head(status, headers, io).await?;
        self.state = State::Responding;
        Ok(())
    }

    /// Appends body bytes in [`State::Responding`].
    ///
    /// In [`State::Upgraded`] this is a no-op; the socket belongs to the
    /// WebSocket session.
    ///
    /// # Errors
    ///
    /// [`Error::HeadersSent`] in [`State::Buffering`] (the head must be
    /// committed first); otherwise any socket error.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        match self.state {
            State::Buffering => Err(Error::HeadersSent),
            State::Upgraded => Ok(()),
            State::Responding => {
                let io = self.io.as_mut().unwrap();
                io.write_all(bytes).await?;
                Ok(())
            }
        }
    }

    /// Streams `reader` to the socket in [`State::Responding`].
    ///
    /// Returns the number of bytes copied. The stream is cut at the
    /// source's error or close.
    ///
    /// # Errors
    ///
    /// Same as [`Self::write`].
    pub async fn stream(
        &mut self,
        mut reader: impl AsyncRead + Unpin,
    ) -> Result<u64, Error> {
        match self.state {
            State::Buffering => Err(Error::HeadersSent),
            State::Upgraded => Ok(0),
            State::Responding => {
                let io = self.io.as_mut().unwrap();
                let copied = tokio::io::copy(&mut reader, io).await?;
                Ok(copied)
            }
        }
    }

    /// Flushes the socket.
    ///
    /// # Errors
    ///
    /// Any socket error.
    pub async fn flush(&mut self) -> Result<(), Error> {
        if let Some(io) = self.io.as_mut() {
            io.flush().await?;
        }
        Ok(())
    }

    /// Completes the client WebSocket handshake and relinquishes the
    /// socket, moving to [`State::Upgraded`].
    ///
    /// Writes the `101 Switching Protocols` head (with
    /// `sec-websocket-accept` computed from `key`) and wraps the socket in
    /// a server-role stream. `prefix` holds bytes the client pipelined
    /// after its handshake; they are replayed into the stream.
    ///
    /// # Errors
    ///
    /// [`Error::HeadersSent`] outside [`State::Buffering`]; otherwise any
    /// socket error.
    pub async fn upgrade(
        &mut self,
        key: &HeaderValue,
        prefix: Bytes,
    ) -> Result<WebSocketStream<Box<dyn Io>>, Error> {
        if self.state != State::Buffering {
            return Err(Error::HeadersSent);
        }
        let mut headers = HeaderMap::with_capacity(3);
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert("sec-websocket-accept", websocket::accept_key(key));

        let mut io = self.io.take().unwrap();
        self.state = State::Upgraded;
        wire::write_head(StatusCode::SWITCHING_PROTOCOLS, &headers, &mut io).await?;
        io.flush().await?;

        let stream = if prefix.is_empty() {
            websocket::wrap(io).await
        } else {
            WebSocketStream::from_partially_read(
                io,
                prefix.to_vec(),
                tungstenite::protocol::Role::Server,
                None,
            )
            .await
        };
        Ok(stream)
    }

    /// Takes the socket back for connection keep-alive.
    ///
    /// Returns [`None`] after an upgrade.
    pub(crate) fn take_io(&mut self) -> Option<Box<dyn Io>> {
        self.io.take()
    }
}
impl Debug for UpgradableResponse {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradableResponse")
            .field("io", &self.io.as_ref().map(|_| "[socket]"))
            .field("state", &self.state)
            .finish()
    }
}
