//! Helpers for whoever performs the HTTP upgrade.
//!
//! The engine itself starts after the upgrade; these two functions compute the values exchanged
//! in the `Sec-WebSocket-Key` and `Sec-WebSocket-Accept` headers.
use base64::prelude::*;
use sha1::{Digest, Sha1};

/// GUID appended to the challenge key (RFC 6455 Section 1.3).
const WEBSOCKET_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Computes the `Sec-WebSocket-Accept` value answering the client's `Sec-WebSocket-Key`.
///
/// ```rust
/// assert_eq!(
///     wsengine::handshake::accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
pub fn accept_key(challenge: impl AsRef<[u8]>) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(challenge.as_ref());
    sha1.update(WEBSOCKET_GUID);
    BASE64_STANDARD.encode(sha1.finalize())
}

/// Generates a random `Sec-WebSocket-Key` for a client handshake.
pub fn generate_key() -> String {
    let input: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(input)
}
