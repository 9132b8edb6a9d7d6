//! # wsengine
//! A WebSocket connection engine: the post-handshake half of the WebSocket protocol (RFC 6455)
//! plus permessage-deflate compression (RFC 7692), driven over any already-upgraded
//! `AsyncRead + AsyncWrite` stream.
//!
//! The crate does not perform the HTTP upgrade itself. Whoever owns the HTTP server hands over
//! the raw duplex stream together with the negotiated [`Options`], and the engine takes care of:
//!
//! - Frame header encoding/decoding and payload masking
//! - Reassembly of fragmented messages
//! - Compression and decompression of message payloads
//! - Close-code negotiation and the exactly-once close sequence
//! - Serialized writes and bounded parallel dispatch of incoming messages
//!
//! # Features
//!
//! - `logging`: Enables debug logging for connection setup, close handling and queue overflow
//!   using the `log` crate.
//! - `simd`: Uses `simdutf8` for UTF-8 validation of text messages and close reasons.
//! - `zlib`: Enables window size control for the deflate streams through
//!   `client_max_window_bits` and `server_max_window_bits`.
//! - `json`: Enables [`Conn::write_json`].
//!
//! # Server Example
//! ```no_run
//! use std::sync::Arc;
//! use wsengine::{async_trait, BoxError, Conn, Handler, Message, Options, WebSocketError};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Handler for Echo {
//!     async fn on_message(&self, conn: &Conn, message: Message) -> Result<(), BoxError> {
//!         conn.write_message(message.opcode, message.payload).await?;
//!         Ok(())
//!     }
//!
//!     async fn on_close(&self, _conn: &Conn, code: u16, _reason: &[u8]) {
//!         println!("peer closed with {code}");
//!     }
//!
//!     async fn on_error(&self, _conn: &Conn, err: &WebSocketError) {
//!         eprintln!("connection failed: {err}");
//!     }
//! }
//!
//! async fn serve(stream: tokio::net::TcpStream) {
//!     // the upgrade handshake has already been answered on `stream`
//!     let listener = Conn::server(stream, Options::default(), Arc::new(Echo));
//!     listener.listen().await;
//! }
//! ```
//!
//! # Memory Safety
//! - Maximum message size limits (configurable, default 1 MiB), enforced on single frames,
//!   on the reassembly buffer and on decompressed output
//! - Bounded backlogs for both the read and the write queue
//! - Optional UTF-8 validation for text messages and close reasons

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod close;
pub mod codec;
mod compression;
mod conn;
pub mod fragment;
pub mod frame;
pub mod handshake;
pub mod mask;
mod options;
pub mod queue;
mod session;

use close::CloseCode;
use thiserror::Error;

pub use async_trait::async_trait;
pub use compression::{Compressor, Decompressor};
pub use conn::{Conn, Handler, Listener, PingHandler, PongHandler, Role};
pub use fragment::Message;
pub use frame::{Frame, OpCode};
pub use options::{
    CompressionLevel, DeflateOptions, Options, CLOSE_TIMEOUT, COMPRESS_THRESHOLD,
    MAX_PAYLOAD_READ, QUEUE_CAPACITY,
};
pub use queue::{Backpressure, QueueDrain, TaskQueue};
pub use session::Session;

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Boxed error returned by application callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Broad classification of a [`WebSocketError`].
///
/// Protocol and I/O errors terminate the connection. Compression errors are handled exactly like
/// protocol errors. Application errors are reported to [`Handler::on_error`] and leave the
/// connection open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Protocol,
    Io,
    Compression,
    Application,
}

/// Represents errors that can occur during WebSocket operations.
///
/// The errors are broadly categorized into:
///
/// - Protocol errors (e.g., invalid frames, incorrect sequence of operations)
/// - Data validation errors (e.g., invalid UTF-8, oversized payloads)
/// - Compression errors (malformed deflate payloads)
/// - I/O errors on the underlying stream
/// - Errors raised by application callbacks and by the task queues
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// Occurs when receiving a new data frame before completing the previous fragmented one.
    #[error("Invalid fragment")]
    InvalidFragment,

    /// Occurs when receiving a continuation frame without a preceding initial frame.
    #[error("Invalid continuation frame")]
    InvalidContinuationFrame,

    /// Indicates that a text message or close frame reason contains invalid UTF-8 data.
    #[error("Invalid UTF-8")]
    InvalidUTF8,

    /// Returned when attempting to perform operations on a closed WebSocket connection.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// Indicates that reserved bits in the frame header are set when they should be 0.
    ///
    /// RSV2 and RSV3 are never valid. RSV1 is only valid on the first frame of a data
    /// message when compression was negotiated.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// Occurs when a control frame (ping, pong, or close) is received with the FIN bit not set.
    #[error("Control frame must not be fragmented")]
    ControlFrameFragmented,

    /// Indicates that a control frame carries more than 125 bytes of payload.
    #[error("Control frame too large")]
    ControlFrameTooLarge,

    /// Occurs when a received frame's payload length exceeds the maximum configured size.
    #[error("Frame too large")]
    FrameTooLarge,

    /// Occurs when a reassembled or decompressed message exceeds the maximum configured size.
    #[error("Message too large")]
    MessageTooLarge,

    /// Indicates a 64-bit payload length with the most significant bit set.
    #[error("Payload length overflows 63 bits")]
    PayloadLengthOverflow,

    /// A payload length was encoded using a longer form than necessary.
    ///
    /// Only reported when strict length encoding is enabled.
    #[error("Payload length is not minimally encoded")]
    NonMinimalLength,

    /// Indicates receipt of a frame with an invalid opcode value.
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// Occurs when receiving a compressed frame on a connection where compression was not
    /// negotiated during the handshake.
    #[error("Received compressed frame on stream that doesn't support compression")]
    CompressionNotSupported,

    /// A compressed payload could not be inflated, or deflating failed.
    #[error("Compression error: {0}")]
    Compression(std::io::Error),

    /// A task queue rejected a submission because its backlog is full.
    #[error("Task queue is full")]
    QueueFull,

    /// A task queue no longer accepts submissions.
    #[error("Task queue is closed")]
    QueueClosed,

    /// A task was submitted to a queue outside of a tokio runtime.
    #[error("Task queue used outside of a tokio runtime")]
    NoRuntime,

    /// Attempted to send a close code that must not appear on the wire.
    #[error("Invalid close code")]
    InvalidCloseCode,

    /// The connection was cancelled through its cancellation token.
    #[error("Connection cancelled")]
    Cancelled,

    /// Error raised by an application callback.
    #[error("Application error: {0}")]
    Application(BoxError),

    /// Wraps standard I/O errors that may occur during WebSocket communication,
    /// such as connection resets or network timeouts.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Occurs when serialization of JSON data fails.
    /// Only available when the `json` feature is enabled.
    #[cfg(feature = "json")]
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl WebSocketError {
    /// Returns the broad class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::IoError(_) | Self::ConnectionClosed | Self::Cancelled => ErrorKind::Io,
            Self::Compression(_) => ErrorKind::Compression,
            Self::Application(_) | Self::QueueFull | Self::QueueClosed | Self::NoRuntime => {
                ErrorKind::Application
            }
            #[cfg(feature = "json")]
            Self::Json(_) => ErrorKind::Application,
            _ => ErrorKind::Protocol,
        }
    }

    /// The status code sent to the peer when this error terminates the connection.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::FrameTooLarge | Self::MessageTooLarge => CloseCode::Size,
            Self::InvalidOpCode(_) => CloseCode::Unsupported,
            Self::InvalidUTF8 => CloseCode::Invalid,
            Self::InvalidFragment
            | Self::InvalidContinuationFrame
            | Self::ReservedBitsNotZero
            | Self::ControlFrameFragmented
            | Self::ControlFrameTooLarge
            | Self::PayloadLengthOverflow
            | Self::NonMinimalLength
            | Self::InvalidCloseCode
            | Self::CompressionNotSupported
            | Self::Compression(_) => CloseCode::Protocol,
            Self::Cancelled => CloseCode::Away,
            Self::QueueFull => CloseCode::Again,
            _ => CloseCode::Error,
        }
    }
}

/// Checks whether `bytes` is valid UTF-8, using SIMD validation when the `simd` feature is on.
#[inline]
pub(crate) fn is_utf8(bytes: &[u8]) -> bool {
    #[cfg(feature = "simd")]
    {
        simdutf8::basic::from_utf8(bytes).is_ok()
    }
    #[cfg(not(feature = "simd"))]
    {
        std::str::from_utf8(bytes).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_classification() {
        assert_eq!(WebSocketError::FrameTooLarge.close_code(), CloseCode::Size);
        assert_eq!(WebSocketError::MessageTooLarge.close_code(), CloseCode::Size);
        assert_eq!(
            WebSocketError::InvalidOpCode(3).close_code(),
            CloseCode::Unsupported
        );
        assert_eq!(WebSocketError::InvalidUTF8.close_code(), CloseCode::Invalid);
        assert_eq!(
            WebSocketError::ControlFrameTooLarge.close_code(),
            CloseCode::Protocol
        );
        assert_eq!(WebSocketError::Cancelled.close_code(), CloseCode::Away);
        assert_eq!(WebSocketError::QueueFull.close_code(), CloseCode::Again);
        assert_eq!(
            WebSocketError::InvalidCloseCode.close_code(),
            CloseCode::Protocol
        );

        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert_eq!(WebSocketError::from(io).close_code(), CloseCode::Error);
    }

    #[test]
    fn test_compression_errors_close_like_protocol_errors() {
        let err = WebSocketError::Compression(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "corrupt deflate stream",
        ));
        assert_eq!(err.kind(), ErrorKind::Compression);
        assert_eq!(err.close_code(), CloseCode::Protocol);
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(WebSocketError::InvalidFragment.kind(), ErrorKind::Protocol);
        assert_eq!(WebSocketError::Cancelled.kind(), ErrorKind::Io);
        assert_eq!(
            WebSocketError::Application("boom".into()).kind(),
            ErrorKind::Application
        );
    }

    #[test]
    fn test_is_utf8() {
        assert!(is_utf8("héllo".as_bytes()));
        assert!(!is_utf8(&[0xff, 0xfe]));
    }
}
