#![allow(clippy::doc_markdown)] // WebSocket is the name of the protocol
//! WebSocket handshake bits.
//!
//! The 101 response itself is written by
//! [`UpgradableResponse::upgrade`](crate::response::UpgradableResponse::upgrade);
//! this module computes the `sec-websocket-accept` digest and wraps the
//! relinquished socket in a server-role stream.

use crate::prelude::*;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha1::{Digest, Sha1};

pub use tokio_tungstenite;
pub use tokio_tungstenite::tungstenite;

static SEC_MAGIC_STRING: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Computes the `sec-websocket-accept` value for a client's
/// `sec-websocket-key`.
#[must_use]
pub fn accept_key(key: &HeaderValue) -> HeaderValue {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(SEC_MAGIC_STRING);
    let encoded = STANDARD.encode(hasher.finalize());
    // Base64 output is always a legal header value.
    HeaderValue::from_str(&encoded).unwrap()
}

/// Returns whether `headers` ask for a WebSocket upgrade:
/// `connection` lists `upgrade` and `upgrade` is `websocket`.
#[must_use]
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    utility::header_contains(headers, header::CONNECTION, "upgrade")
        && utility::header_eq(headers, header::UPGRADE, "websocket")
}

/// Wraps an already-upgraded socket in a server-role WebSocket stream.
///
/// The 101 response must have been written to `io` beforehand.
pub async fn wrap(io: Box<dyn Io>) -> tokio_tungstenite::WebSocketStream<Box<dyn Io>> {
    tokio_tungstenite::WebSocketStream::from_raw_socket(
        io,
        tungstenite::protocol::Role::Server,
        None,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc_example_key() {
        // The example handshake from RFC 6455 §1.3.
        let key = HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(accept_key(&key), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn upgrade_detection() {
        let mut headers = HeaderMap::new();
        assert!(!is_upgrade_request(&headers));
        headers.insert("connection", HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        assert!(is_upgrade_request(&headers));
    }
}
