//! Parameters handed over together with an upgraded stream.
use std::time::Duration;

use crate::{
    compression::{Compressor, Decompressor},
    queue::{Backpressure, QueueDrain},
    Role,
};

/// Compression level used for outgoing messages, 0-9.
pub type CompressionLevel = flate2::Compression;

/// The maximum allowed message size for reading, set to 1 MiB.
///
/// Single frames, reassembled messages and inflated payloads larger than this limit are
/// rejected and the connection is closed with status 1009.
pub const MAX_PAYLOAD_READ: usize = 1024 * 1024;

/// Payloads shorter than this are sent uncompressed even when compression is enabled.
pub const COMPRESS_THRESHOLD: usize = 512;

/// Default backlog capacity of the read and the write queue.
pub const QUEUE_CAPACITY: usize = 256;

/// Default time allowed for writing the close frame and shutting the stream down.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration options for a WebSocket connection.
///
/// `Options` carries what was negotiated during the upgrade (compression parameters) together
/// with local limits and the concurrency settings of the connection.
///
/// # Example
/// ```rust
/// use wsengine::{Backpressure, CompressionLevel, Options};
///
/// let options = Options::default()
///     .with_compression_level(CompressionLevel::new(6))
///     .with_utf8()
///     .with_read_async(4)
///     .with_backpressure(Backpressure::Reject);
/// ```
#[derive(Clone, Debug)]
pub struct Options {
    /// Maximum size of an incoming message, in bytes.
    ///
    /// Applies to single frames, to the sum of the fragments of a message and to the output of
    /// decompression.
    ///
    /// Default: 1 MiB as defined in [`MAX_PAYLOAD_READ`]
    pub max_payload_read: usize,

    /// Compression settings for the WebSocket connection, `None` when permessage-deflate was
    /// not negotiated.
    pub compression: Option<DeflateOptions>,

    /// Outgoing data messages shorter than this are never compressed.
    ///
    /// Default: [`COMPRESS_THRESHOLD`]
    pub compress_threshold: usize,

    /// Whether text messages and close reasons must be valid UTF-8.
    ///
    /// Default: `false`
    pub check_utf8: bool,

    /// Rejects payload lengths that are not encoded in their shortest form.
    ///
    /// Default: `false`
    pub strict_length_encoding: bool,

    /// Dispatch incoming messages through the read queue instead of awaiting each handler call
    /// inside the read loop.
    ///
    /// Default: `false`
    pub read_async: bool,

    /// Maximum number of concurrent `on_message` calls when `read_async` is enabled. A value
    /// of 1 keeps messages in order.
    ///
    /// Default: 1
    pub read_concurrency: usize,

    /// Backlog capacity of the read queue.
    ///
    /// Default: [`QUEUE_CAPACITY`]
    pub read_queue_capacity: usize,

    /// Backlog capacity of the write queue.
    ///
    /// Default: [`QUEUE_CAPACITY`]
    pub write_queue_capacity: usize,

    /// What happens when a queue backlog is full.
    ///
    /// Default: [`Backpressure::Block`]
    pub backpressure: Backpressure,

    /// What happens to queued incoming messages when the connection closes.
    ///
    /// Default: [`QueueDrain::Drain`]
    pub drain: QueueDrain,

    /// Longest wait for the next frame. When it elapses the connection is closed with 1011.
    ///
    /// Default: `None`
    pub read_timeout: Option<Duration>,

    /// Longest time a single outgoing message may take to write. When it elapses the
    /// connection is closed with 1011.
    ///
    /// Default: `None`
    pub write_timeout: Option<Duration>,

    /// Bound on writing the close frame, and again on shutting the stream down. A close frame
    /// that cannot be written in time is skipped; the close sequence still completes.
    ///
    /// Default: [`CLOSE_TIMEOUT`]
    pub close_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_payload_read: MAX_PAYLOAD_READ,
            compression: None,
            compress_threshold: COMPRESS_THRESHOLD,
            check_utf8: false,
            strict_length_encoding: false,
            read_async: false,
            read_concurrency: 1,
            read_queue_capacity: QUEUE_CAPACITY,
            write_queue_capacity: QUEUE_CAPACITY,
            backpressure: Backpressure::Block,
            drain: QueueDrain::Drain,
            read_timeout: None,
            write_timeout: None,
            close_timeout: CLOSE_TIMEOUT,
        }
    }
}

/// Configuration options for WebSocket message compression using the Deflate algorithm.
///
/// # Context Management
///
/// - **Context Takeover** (default): Maintains compression state between messages,
///   providing better compression ratios at the cost of increased memory usage.
/// - **No Context Takeover**: Resets compression state before each message.
///
/// Each endpoint compresses with its own flag (`server_no_context_takeover` for the server,
/// `client_no_context_takeover` for the client) and decompresses with the peer's.
///
/// # Memory Window Size
/// When the `zlib` feature is enabled, the LZ77 window of each direction can be limited.
///
/// # Example
/// ```rust
/// use wsengine::{CompressionLevel, DeflateOptions};
///
/// let options = DeflateOptions {
///     level: CompressionLevel::new(6),
///     server_no_context_takeover: true,
///     ..Default::default()
/// };
/// ```
#[derive(Clone, Debug, Default)]
pub struct DeflateOptions {
    /// Sets the compression level (0-9), balancing compression ratio against CPU usage.
    pub level: CompressionLevel,

    /// Window size (in bits) of the stream compressed by the server. Valid range: 9-15 bits.
    #[cfg(feature = "zlib")]
    pub server_max_window_bits: Option<u8>,

    /// Window size (in bits) of the stream compressed by the client. Valid range: 9-15 bits.
    #[cfg(feature = "zlib")]
    pub client_max_window_bits: Option<u8>,

    /// The server resets its compression state before each message.
    pub server_no_context_takeover: bool,

    /// The client resets its compression state before each message.
    pub client_no_context_takeover: bool,
}

impl DeflateOptions {
    /// Context takeover flag and window bits of the stream compressed by `role`.
    fn stream_of(&self, role: Role) -> (bool, Option<u8>) {
        match role {
            Role::Server => {
                #[cfg(feature = "zlib")]
                let bits = self.server_max_window_bits;
                #[cfg(not(feature = "zlib"))]
                let bits = None;
                (self.server_no_context_takeover, bits)
            }
            Role::Client => {
                #[cfg(feature = "zlib")]
                let bits = self.client_max_window_bits;
                #[cfg(not(feature = "zlib"))]
                let bits = None;
                (self.client_no_context_takeover, bits)
            }
        }
    }
}

impl Options {
    /// Builds the compressor for outgoing messages sent under `role`.
    pub(crate) fn compressor(&self, role: Role) -> Option<Compressor> {
        let config = self.compression.as_ref()?;
        let (no_context_takeover, window_bits) = config.stream_of(role);

        #[cfg(feature = "logging")]
        log::debug!(
            "Established compressor for {role} with settings \
            no_context_takeover={no_context_takeover} window_bits={window_bits:?}"
        );

        Some(if no_context_takeover {
            Compressor::no_context_takeover(config.level)
        } else {
            match window_bits {
                #[cfg(feature = "zlib")]
                Some(bits) => Compressor::new_with_window_bits(config.level, bits),
                _ => Compressor::new(config.level),
            }
        })
    }

    /// Builds the decompressor for messages received under `role`, which were compressed by the
    /// opposite role.
    pub(crate) fn decompressor(&self, role: Role) -> Option<Decompressor> {
        let config = self.compression.as_ref()?;
        let (no_context_takeover, window_bits) = config.stream_of(role.peer());

        #[cfg(feature = "logging")]
        log::debug!(
            "Established decompressor for {role} with settings \
            no_context_takeover={no_context_takeover} window_bits={window_bits:?}"
        );

        Some(if no_context_takeover {
            Decompressor::no_context_takeover()
        } else {
            match window_bits {
                #[cfg(feature = "zlib")]
                Some(bits) => Decompressor::new_with_window_bits(bits),
                _ => Decompressor::new(),
            }
        })
    }

    /// Sets the compression level for outgoing messages, enabling compression.
    pub fn with_compression_level(self, level: CompressionLevel) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.level = level;

        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Sets the full compression configuration.
    pub fn with_compression(self, compression: DeflateOptions) -> Self {
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Disables compression for the WebSocket connection.
    pub fn without_compression(self) -> Self {
        Self {
            compression: None,
            ..self
        }
    }

    /// Sets the minimum payload size for compressing outgoing messages.
    pub fn with_compress_threshold(self, threshold: usize) -> Self {
        Self {
            compress_threshold: threshold,
            ..self
        }
    }

    /// Sets the maximum allowed size for incoming messages.
    pub fn with_max_payload_read(self, size: usize) -> Self {
        Self {
            max_payload_read: size,
            ..self
        }
    }

    /// Enables UTF-8 validation for incoming text messages and close reasons.
    pub fn with_utf8(self) -> Self {
        Self {
            check_utf8: true,
            ..self
        }
    }

    /// Rejects frames whose payload length is not minimally encoded.
    pub fn with_strict_length_encoding(self) -> Self {
        Self {
            strict_length_encoding: true,
            ..self
        }
    }

    /// Dispatches incoming messages through the read queue with up to `concurrency` handler
    /// calls in flight.
    pub fn with_read_async(self, concurrency: usize) -> Self {
        Self {
            read_async: true,
            read_concurrency: concurrency.max(1),
            ..self
        }
    }

    /// Sets the backlog capacity of the read and the write queue.
    pub fn with_queue_capacity(self, read: usize, write: usize) -> Self {
        Self {
            read_queue_capacity: read,
            write_queue_capacity: write,
            ..self
        }
    }

    /// Sets the behaviour of full queues.
    pub fn with_backpressure(self, backpressure: Backpressure) -> Self {
        Self {
            backpressure,
            ..self
        }
    }

    /// Sets what happens to queued incoming messages when the connection closes.
    pub fn with_drain(self, drain: QueueDrain) -> Self {
        Self { drain, ..self }
    }

    /// Closes the connection when no frame arrives within `timeout`.
    pub fn with_read_timeout(self, timeout: Duration) -> Self {
        Self {
            read_timeout: Some(timeout),
            ..self
        }
    }

    /// Closes the connection when writing a message takes longer than `timeout`.
    pub fn with_write_timeout(self, timeout: Duration) -> Self {
        Self {
            write_timeout: Some(timeout),
            ..self
        }
    }

    /// Sets the bound on writing the close frame and shutting the stream down.
    pub fn with_close_timeout(self, timeout: Duration) -> Self {
        Self {
            close_timeout: timeout,
            ..self
        }
    }

    /// Disables context takeover for server-side compression.
    pub fn server_no_context_takeover(self) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.server_no_context_takeover = true;
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Disables context takeover for client-side compression.
    pub fn client_no_context_takeover(self) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.client_no_context_takeover = true;
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Sets the maximum window size of the stream compressed by the client.
    ///
    /// This option is available only when compiled with the `zlib` feature.
    #[cfg(feature = "zlib")]
    pub fn with_client_max_window_bits(self, max_window_bits: u8) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.client_max_window_bits = Some(max_window_bits);
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Sets the maximum window size of the stream compressed by the server.
    ///
    /// This option is available only when compiled with the `zlib` feature.
    #[cfg(feature = "zlib")]
    pub fn with_server_max_window_bits(self, max_window_bits: u8) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.server_max_window_bits = Some(max_window_bits);
        Self {
            compression: Some(compression),
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::default();
        assert_eq!(options.max_payload_read, MAX_PAYLOAD_READ);
        assert!(options.compression.is_none());
        assert_eq!(options.compress_threshold, 512);
        assert!(!options.check_utf8);
        assert!(!options.strict_length_encoding);
        assert!(!options.read_async);
        assert_eq!(options.read_concurrency, 1);
        assert_eq!(options.read_queue_capacity, 256);
        assert_eq!(options.write_queue_capacity, 256);
        assert_eq!(options.backpressure, Backpressure::Block);
        assert_eq!(options.drain, QueueDrain::Drain);
        assert!(options.read_timeout.is_none());
        assert!(options.write_timeout.is_none());
        assert_eq!(options.close_timeout, CLOSE_TIMEOUT);
    }

    #[test]
    fn test_timeout_builders() {
        let options = Options::default()
            .with_read_timeout(Duration::from_secs(30))
            .with_write_timeout(Duration::from_secs(2))
            .with_close_timeout(Duration::from_millis(250));

        assert_eq!(options.read_timeout, Some(Duration::from_secs(30)));
        assert_eq!(options.write_timeout, Some(Duration::from_secs(2)));
        assert_eq!(options.close_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_no_compression_builds_nothing() {
        let options = Options::default();
        assert!(options.compressor(Role::Server).is_none());
        assert!(options.decompressor(Role::Server).is_none());
    }

    #[test]
    fn test_context_takeover_follows_role() {
        let options = Options::default().server_no_context_takeover();

        // the server compresses without context, the client inflates without context
        assert!(options
            .compressor(Role::Server)
            .unwrap()
            .is_no_context_takeover());
        assert!(!options
            .compressor(Role::Client)
            .unwrap()
            .is_no_context_takeover());
    }

    #[test]
    fn test_builders_enable_compression() {
        let options = Options::default().client_no_context_takeover();
        let compression = options.compression.unwrap();
        assert!(compression.client_no_context_takeover);
        assert!(!compression.server_no_context_takeover);

        let options = Options::default()
            .with_compression_level(CompressionLevel::fast())
            .without_compression();
        assert!(options.compression.is_none());
    }

    #[test]
    fn test_read_async_concurrency_is_at_least_one() {
        let options = Options::default().with_read_async(0);
        assert!(options.read_async);
        assert_eq!(options.read_concurrency, 1);
    }
}
