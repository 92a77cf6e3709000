//! Async HTTP/1 wire plumbing.
//!
//! Reads request and response heads from any [`AsyncRead`] and serialises
//! heads and requests to any [`AsyncWrite`]. The byte-level parsing is in
//! [`crate::parse`]; this module owns buffering, limits, and timeouts.

use crate::parse::{self, Error};
use crate::prelude::*;

/// Returns whether `bytes` contains the head-terminating empty line.
fn contains_double_newline(bytes: &[u8]) -> bool {
    let mut in_row = 0_u8;
    for byte in bytes.iter().copied() {
        match byte {
            b'\n' if in_row == 0 => in_row = 1,
            b'\n' => return true,
            b'\r' => {}
            _ => in_row = 0,
        }
    }
    false
}

/// Reads from `reader` until the empty line ending an HTTP/1 head.
///
/// May over-read into the body; the caller gets the whole buffer and splits
/// at the offset the parser reports.
///
/// # Errors
///
/// [`Error::UnexpectedEnd`] on EOF or when `timeout` elapses between reads,
/// [`Error::HeadTooLong`] past `max_len`.
pub async fn read_head(
    mut reader: impl AsyncRead + Unpin,
    max_len: usize,
    timeout: Duration,
) -> Result<Bytes, Error> {
    let mut buffer = BytesMut::with_capacity(1024);
    loop {
        let read = tokio::time::timeout(timeout, reader.read_buf(&mut buffer))
            .await
            .map_err(|_| Error::UnexpectedEnd)?
            .map_err(|_| Error::UnexpectedEnd)?;
        if read == 0 {
            return Err(Error::UnexpectedEnd);
        }
        if contains_double_newline(&buffer) {
            return Ok(buffer.freeze());
        }
        if buffer.len() >= max_len {
            return Err(Error::HeadTooLong);
        }
    }
}

/// Reads and parses a request head.
///
/// Returns the request and any surplus bytes read past the head; they are
/// the start of the body.
///
/// # Errors
///
/// Same as [`read_head`] plus the parsing failures in [`parse::request_head`].
pub async fn read_request(
    reader: impl AsyncRead + Unpin,
    max_len: usize,
    timeout: Duration,
) -> Result<(http::Request<()>, Bytes), Error> {
    let buffer = read_head(reader, max_len, timeout).await?;
    let (request, body_start) = parse::request_head(&buffer)?;
    Ok((request, buffer.slice(body_start..)))
}

/// Reads and parses a response head.
///
/// Returns the response and any surplus bytes read past the head.
///
/// # Errors
///
/// Same as [`read_head`] plus the parsing failures in
/// [`parse::response_head`].
pub async fn read_response(
    reader: impl AsyncRead + Unpin,
    max_len: usize,
    timeout: Duration,
) -> Result<(http::Response<()>, Bytes), Error> {
    let buffer = read_head(reader, max_len, timeout).await?;
    let (response, body_start) = parse::response_head(&buffer)?;
    Ok((response, buffer.slice(body_start..)))
}

/// Reads `reader` into `buffer` until EOF or until `buffer` holds at least
/// `max_len` bytes.
///
/// # Errors
///
/// Passes any errors emitted from `reader`.
pub async fn read_to_end_or_max(
    buffer: &mut BytesMut,
    mut reader: impl AsyncRead + Unpin,
    max_len: usize,
) -> io::Result<()> {
    while buffer.len() < max_len {
        if reader.read_buf(buffer).await? == 0 {
            break;
        }
    }
    Ok(())
}

fn version_str(version: Version) -> &'static [u8] {
    match version {
        Version::HTTP_09 => b"HTTP/0.9",
        Version::HTTP_10 => b"HTTP/1.0",
        _ => b"HTTP/1.1",
    }
}

async fn write_headers(
    headers: &HeaderMap,
    mut writer: impl AsyncWrite + Unpin,
) -> io::Result<()> {
    for (name, value) in headers {
        writer.write_all(name.as_str().as_bytes()).await?;
        writer.write_all(b": ").await?;
        writer.write_all(value.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
    }
    Ok(())
}

/// Serialises a response head: status line, headers, and the empty line.
///
/// `writer` should be buffered.
///
/// # Errors
///
/// Passes any errors emitted from `writer`.
pub async fn write_head(
    status: StatusCode,
    headers: &HeaderMap,
    mut writer: impl AsyncWrite + Unpin,
) -> io::Result<()> {
    writer.write_all(b"HTTP/1.1 ").await?;
    writer.write_all(status.as_str().as_bytes()).await?;
    writer.write_all(b" ").await?;
    writer
        .write_all(status.canonical_reason().unwrap_or("").as_bytes())
        .await?;
    writer.write_all(b"\r\n").await?;
    write_headers(headers, &mut writer).await?;
    writer.write_all(b"\r\n").await?;
    Ok(())
}

/// Serialises a whole request: request line, headers, empty line, `body`.
/// Flushes `writer`.
///
/// # Errors
///
/// Passes any errors emitted from `writer`.
pub async fn write_request<T>(
    request: &http::Request<T>,
    body: &[u8],
    mut writer: impl AsyncWrite + Unpin,
) -> io::Result<()> {
    writer.write_all(request.method().as_str().as_bytes()).await?;
    writer.write_all(b" ").await?;
    writer
        .write_all(
            request
                .uri()
                .path_and_query()
                .map_or(&b"/"[..], |p| p.as_str().as_bytes()),
        )
        .await?;
    writer.write_all(b" ").await?;
    writer.write_all(version_str(request.version())).await?;
    writer.write_all(b"\r\n").await?;
    write_headers(request.headers(), &mut writer).await?;
    writer.write_all(b"\r\n").await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}
