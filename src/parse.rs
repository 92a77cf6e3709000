//! Parsing of the small HTTP bits verge needs.
//!
//! This covers percent decoding, `accept-*` quality lists, the `range`
//! header, path normalisation, and the head of HTTP/1 requests and
//! responses. Reading heads from a stream lives in [`crate::wire`]; the
//! functions here work on bytes already in memory.

use crate::prelude::*;

/// A general error from parsing an HTTP head.
#[derive(Debug)]
pub enum Error {
    /// The stream ended (or timed out) before the head was complete.
    UnexpectedEnd,
    /// The head exceeded the configured maximum length.
    HeadTooLong,
    /// The data is not an HTTP/1 head. Maybe it is encrypted (TLS) or
    /// binary-framed (HTTP/2).
    Syntax,
    /// The [`Method`] is invalid.
    InvalidMethod,
    /// The [`Version`] is invalid.
    InvalidVersion,
    /// The [`StatusCode`] is invalid.
    InvalidStatusCode,
    /// No path was present in the request line.
    NoPath,
    /// There are illegal bytes in a [`HeaderName`].
    IllegalName,
    /// There are illegal bytes in a [`HeaderValue`].
    IllegalValue,
    /// Failed to assemble an [`http`] type.
    Http(http::Error),
}
impl Error {
    /// Gets a string representation of this error.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnexpectedEnd => "stream ended before the head was complete",
            Self::HeadTooLong => "head is too long",
            Self::Syntax => "data is not an HTTP/1 head",
            Self::InvalidMethod => "method is invalid",
            Self::InvalidVersion => "version is invalid",
            Self::InvalidStatusCode => "status code is invalid",
            Self::NoPath => "no path was supplied in the request line",
            Self::IllegalName => "header name contains illegal bytes",
            Self::IllegalValue => "header value contains illegal bytes",
            Self::Http(_) => "http library error",
        }
    }
}
impl From<http::Error> for Error {
    #[inline]
    fn from(err: http::Error) -> Self {
        Self::Http(err)
    }
}

/// Decodes the percent encoding of `input`.
///
/// Returns [`None`] when an escape is truncated, contains non-hex digits,
/// or the decoded bytes are not valid UTF-8. Borrows when nothing is
/// encoded.
#[must_use]
pub fn percent_decode(input: &str) -> Option<Cow<'_, str>> {
    if !input.contains('%') {
        return Some(Cow::Borrowed(input));
    }
    let mut decoded = Vec::with_capacity(input.len());
    let mut bytes = input.bytes();
    while let Some(byte) = bytes.next() {
        if byte == b'%' {
            let hex = [bytes.next()?, bytes.next()?];
            let hex = str::from_utf8(&hex).ok()?;
            decoded.push(u8::from_str_radix(hex, 16).ok()?);
        } else {
            decoded.push(byte);
        }
    }
    String::from_utf8(decoded).ok().map(Cow::Owned)
}

/// A value and its quality, as used in `accept-*` headers.
#[derive(Debug, PartialEq)]
pub struct ValueQuality<'a> {
    /// The listed value.
    pub value: &'a str,
    /// The quality of the value; `1.0` when unspecified.
    pub quality: f32,
}

/// Parses a header with a comma-separated value-quality list.
///
/// Useful for `accept-encoding` and friends. Entries keep declaration
/// order; selection by quality is up to the caller.
#[must_use]
pub fn quality_list(header: &str) -> Vec<ValueQuality<'_>> {
    header
        .split(',')
        .filter_map(|entry| {
            let mut parts = entry.split(';');
            let value = parts.next()?.trim();
            if value.is_empty() {
                return None;
            }
            let quality = parts
                .find_map(|p| p.trim().strip_prefix("q="))
                .and_then(|q| q.trim().parse().ok())
                .unwrap_or(1.0);
            Some(ValueQuality { value, quality })
        })
        .collect()
}

/// The quality of `value` in `header`, or `None` when it is not listed.
///
/// A `*` entry matches any value.
#[must_use]
pub fn quality_of(header: &str, value: &str) -> Option<f32> {
    let list = quality_list(header);
    list.iter()
        .find(|vq| vq.value.eq_ignore_ascii_case(value))
        .or_else(|| list.iter().find(|vq| vq.value == "*"))
        .map(|vq| vq.quality)
}

/// A parsed `range` header.
///
/// Positions are relative to the start of the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// `bytes=<start>-[end]`: from `start`, to `end` inclusive or to the
    /// end of the body.
    FromTo(u64, Option<u64>),
    /// `bytes=-<n>`: the last `n` bytes.
    Suffix(u64),
}
impl RangeSpec {
    /// Resolves this range against a body of `len` bytes to a
    /// `(start, end)` pair, end exclusive.
    ///
    /// Returns [`None`] when the range cannot be satisfied.
    #[must_use]
    pub fn resolve(self, len: u64) -> Option<(u64, u64)> {
        match self {
            Self::FromTo(start, end) => {
                let end = end.map_or(len, |e| (e + 1).min(len));
                if start >= len || start >= end {
                    return None;
                }
                Some((start, end))
            }
            Self::Suffix(n) => {
                if n == 0 {
                    return None;
                }
                Some((len.saturating_sub(n), len))
            }
        }
    }
}

/// Parses a `range` header value.
///
/// The unit before `=` is discarded; any single `<start>-<end>` range with
/// either side optional is accepted. Multi-range requests and other
/// malformed values return [`None`].
#[must_use]
pub fn range_header(value: &str) -> Option<RangeSpec> {
    let spec = value.split_once('=')?.1.trim();
    if spec.contains(',') {
        return None;
    }
    let (start, end) = spec.split_once('-')?;
    let (start, end) = (start.trim(), end.trim());
    match (start.is_empty(), end.is_empty()) {
        (true, true) => None,
        (true, false) => Some(RangeSpec::Suffix(end.parse().ok()?)),
        (false, true) => Some(RangeSpec::FromTo(start.parse().ok()?, None)),
        (false, false) => Some(RangeSpec::FromTo(
            start.parse().ok()?,
            Some(end.parse().ok()?),
        )),
    }
}

/// Normalises a rewritten or configured path.
///
/// Collapses repeated `/`, resolves `.` and `..` segments lexically
/// (never above the root), keeps a trailing slash, and guarantees a
/// leading `/`.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    let mut normalized = String::with_capacity(path.len() + 1);
    normalized.push('/');
    normalized.push_str(&segments.join("/"));
    if path.ends_with('/') && normalized.len() > 1 {
        normalized.push('/');
    }
    normalized
}

fn find_lf(bytes: &[u8], from: usize) -> Option<usize> {
    bytes[from..].iter().position(|b| *b == b'\n').map(|p| p + from)
}

/// Parses a header block, until and including the empty line.
///
/// Returns the headers and the offset of the first byte after the block.
///
/// # Errors
///
/// Returns an error when a line has no colon or a [`HeaderName`] or
/// [`HeaderValue`] contains illegal bytes.
pub fn headers(bytes: &[u8]) -> Result<(HeaderMap, usize), Error> {
    let mut map = HeaderMap::new();
    let mut pos = 0;
    loop {
        let line_end = find_lf(bytes, pos).ok_or(Error::UnexpectedEnd)?;
        let mut line = &bytes[pos..line_end];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        if line.is_empty() {
            return Ok((map, line_end + 1));
        }
        let colon = line
            .iter()
            .position(|b| *b == b':')
            .ok_or(Error::Syntax)?;
        let name = HeaderName::from_bytes(&line[..colon]).map_err(|_| Error::IllegalName)?;
        let mut value = &line[colon + 1..];
        while value.first() == Some(&b' ') {
            value = &value[1..];
        }
        let value = HeaderValue::from_bytes(value).map_err(|_| Error::IllegalValue)?;
        map.append(name, value);
        pos = line_end + 1;
    }
}

/// Parses the head of an HTTP/1 request.
///
/// The URI is kept in origin form (path and query); the `host` header is
/// left for the caller. Returns the request and the offset where the body
/// starts.
///
/// # Errors
///
/// See [`Error`]; all request-line and header failures are covered.
pub fn request_head(bytes: &[u8]) -> Result<(http::Request<()>, usize), Error> {
    let line_end = find_lf(bytes, 0).ok_or(Error::UnexpectedEnd)?;
    let line = str::from_utf8(&bytes[..line_end])
        .map_err(|_| Error::Syntax)?
        .trim_end();
    let mut words = line.split(' ').filter(|w| !w.is_empty());

    let method = Method::from_bytes(words.next().ok_or(Error::Syntax)?.as_bytes())
        .map_err(|_| Error::InvalidMethod)?;
    let path = words.next().ok_or(Error::NoPath)?;
    if !path.starts_with('/') && path != "*" {
        return Err(Error::NoPath);
    }
    let version = version(words.next().ok_or(Error::Syntax)?.as_bytes())
        .ok_or(Error::InvalidVersion)?;
    if words.next().is_some() {
        return Err(Error::Syntax);
    }

    let (headers, body_start) = headers(&bytes[line_end + 1..])?;
    let mut builder = http::Request::builder()
        .method(method)
        .uri(Uri::try_from(path).map_err(|_| Error::NoPath)?)
        .version(version);
    // The builder cannot hold an error; every part above was validated.
    *builder.headers_mut().unwrap() = headers;
    let request = builder.body(())?;
    Ok((request, line_end + 1 + body_start))
}

/// Parses the head of an HTTP/1 response.
///
/// Returns the response and the offset where the body starts.
///
/// # Errors
///
/// See [`Error`].
pub fn response_head(bytes: &[u8]) -> Result<(http::Response<()>, usize), Error> {
    let line_end = find_lf(bytes, 0).ok_or(Error::UnexpectedEnd)?;
    let line = str::from_utf8(&bytes[..line_end])
        .map_err(|_| Error::Syntax)?
        .trim_end();
    let mut words = line.splitn(3, ' ');

    let version = version(words.next().ok_or(Error::Syntax)?.as_bytes())
        .ok_or(Error::InvalidVersion)?;
    let status = words
        .next()
        .and_then(|code| StatusCode::from_bytes(code.as_bytes()).ok())
        .ok_or(Error::InvalidStatusCode)?;
    // The canonical reason, if any, is ignored.

    let (headers, body_start) = headers(&bytes[line_end + 1..])?;
    let mut builder = http::Response::builder().version(version).status(status);
    // See `request_head` for why this cannot fail.
    *builder.headers_mut().unwrap() = headers;
    let response = builder.body(())?;
    Ok((response, line_end + 1 + body_start))
}

/// Parses a [`Version`] from its wire form.
#[inline]
#[must_use]
pub fn version(bytes: &[u8]) -> Option<Version> {
    Some(match bytes {
        b"HTTP/0.9" => Version::HTTP_09,
        b"HTTP/1.0" => Version::HTTP_10,
        b"HTTP/1.1" => Version::HTTP_11,
        _ => return None,
    })
}
