//! permessage-deflate payload transforms (RFC 7692).
//!
//! Each connection owns one [`Compressor`] for outbound messages and one [`Decompressor`] for
//! inbound ones. Whether the LZ77 window survives between messages (context takeover) is decided
//! once, when the connection is created, and never changes afterwards.
use std::io;

use bytes::Bytes;
use flate2::{CompressError, DecompressError, FlushCompress, FlushDecompress, Status};

use crate::{CompressionLevel, Result, WebSocketError};

/// Empty non-final stored block that terminates every sync-flushed message (RFC 7692 7.2.1).
const DEFLATE_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// A compressor for WebSocket payloads, supporting both contextual and no-context-takeover modes.
pub struct Compressor {
    compressor_type: CompressorType,
}

/// - `Contextual`: Maintains compression context across messages.
/// - `NoContextTakeover`: Resets the compression dictionary before each message.
enum CompressorType {
    Contextual(Deflate),
    NoContextTakeover(Deflate),
}

impl Compressor {
    /// Creates a new compressor that keeps its dictionary across messages.
    pub fn new(level: CompressionLevel) -> Self {
        Self {
            compressor_type: CompressorType::Contextual(Deflate::new(level)),
        }
    }

    /// Creates a new compressor with a specific window size for LZ77, available when `zlib` is enabled.
    #[cfg(feature = "zlib")]
    pub fn new_with_window_bits(level: CompressionLevel, window_bits: u8) -> Self {
        Self {
            compressor_type: CompressorType::Contextual(Deflate::new_with_window_bits(
                level,
                window_bits,
            )),
        }
    }

    /// Creates a new compressor in no-context-takeover mode.
    ///
    /// Every message is compressed as if it were the first one on the connection.
    pub fn no_context_takeover(level: CompressionLevel) -> Self {
        Self {
            compressor_type: CompressorType::NoContextTakeover(Deflate::new(level)),
        }
    }

    /// Compresses one complete message payload.
    ///
    /// The output is raw deflate data ending on a sync flush boundary, with the trailing
    /// `00 00 FF FF` removed.
    ///
    /// # Errors
    /// Returns [`WebSocketError::Compression`] if the deflate stream fails.
    pub fn compress(&mut self, input: &[u8]) -> Result<Bytes> {
        let output = match &mut self.compressor_type {
            CompressorType::Contextual(deflate) => deflate.compress(input),
            CompressorType::NoContextTakeover(deflate) => deflate.compress_no_context(input),
        };
        output.map_err(WebSocketError::Compression)
    }

    /// Returns `true` if this compressor resets its dictionary before each message.
    pub fn is_no_context_takeover(&self) -> bool {
        matches!(self.compressor_type, CompressorType::NoContextTakeover(_))
    }
}

/// Streaming raw deflate state.
struct Deflate {
    compress: flate2::Compress,
}

impl Deflate {
    fn new(level: CompressionLevel) -> Self {
        Self {
            compress: flate2::Compress::new(level, false),
        }
    }

    #[cfg(feature = "zlib")]
    fn new_with_window_bits(level: CompressionLevel, window_bits: u8) -> Self {
        Self {
            compress: flate2::Compress::new_with_window_bits(level, false, window_bits),
        }
    }

    fn compress_no_context(&mut self, input: &[u8]) -> io::Result<Bytes> {
        self.compress.reset();
        self.compress(input)
    }

    fn compress(&mut self, mut input: &[u8]) -> io::Result<Bytes> {
        let mut output = Vec::with_capacity(input.len() / 2 + 64);

        while !input.is_empty() {
            grow(&mut output);

            let before_in = self.compress.total_in();
            let before_out = self.compress.total_out();
            self.compress
                .compress_vec(input, &mut output, FlushCompress::None)
                .map_err(deflate_error)?;

            let consumed = (self.compress.total_in() - before_in) as usize;
            let written = (self.compress.total_out() - before_out) as usize;
            if consumed == 0 && written == 0 && output.len() < output.capacity() {
                return Err(stalled());
            }

            input = &input[consumed..];
        }

        // a sync flush is complete once it stops filling the whole buffer
        loop {
            grow(&mut output);
            self.compress
                .compress_vec(&[], &mut output, FlushCompress::Sync)
                .map_err(deflate_error)?;

            if output.len() < output.capacity() {
                break;
            }
        }

        if output.ends_with(&DEFLATE_SUFFIX) {
            output.truncate(output.len() - DEFLATE_SUFFIX.len());
        }

        Ok(output.into())
    }
}

/// A decompressor for WebSocket payloads compressed with permessage-deflate.
///
/// - Contextual mode: the dictionary is kept across messages.
/// - No-context-takeover mode: the dictionary is reset before each message.
pub struct Decompressor {
    decompressor_type: DecompressorType,
}

impl Default for Decompressor {
    fn default() -> Self {
        Self::new()
    }
}

enum DecompressorType {
    Contextual(Inflate),
    NoContextTakeover(Inflate),
}

impl Decompressor {
    /// Creates a new `Decompressor` in contextual mode.
    pub fn new() -> Self {
        Self {
            decompressor_type: DecompressorType::Contextual(Inflate::new()),
        }
    }

    /// Creates a new `Decompressor` with specific LZ77 window bits (9-15).
    ///
    /// This function is only available when compiled with the `zlib` feature enabled.
    #[cfg(feature = "zlib")]
    pub fn new_with_window_bits(window_bits: u8) -> Self {
        Self {
            decompressor_type: DecompressorType::Contextual(Inflate::new_with_window_bits(
                window_bits,
            )),
        }
    }

    /// Creates a new `Decompressor` in no-context-takeover mode.
    pub fn no_context_takeover() -> Self {
        Self {
            decompressor_type: DecompressorType::NoContextTakeover(Inflate::new()),
        }
    }

    /// Decompresses one complete message payload.
    ///
    /// The `00 00 FF FF` trailer stripped by the sender is appended before inflating.
    ///
    /// # Errors
    /// - [`WebSocketError::MessageTooLarge`] if the output grows beyond `limit` bytes
    /// - [`WebSocketError::Compression`] if the input is not a valid deflate stream
    pub fn decompress(&mut self, input: &[u8], limit: usize) -> Result<Bytes> {
        match &mut self.decompressor_type {
            DecompressorType::Contextual(inflate) => inflate.decompress(input, limit),
            DecompressorType::NoContextTakeover(inflate) => {
                inflate.decompress_no_context(input, limit)
            }
        }
    }
}

/// Streaming raw inflate state.
struct Inflate {
    decompress: flate2::Decompress,
}

impl Inflate {
    fn new() -> Self {
        Self {
            decompress: flate2::Decompress::new(false),
        }
    }

    #[cfg(feature = "zlib")]
    fn new_with_window_bits(window_bits: u8) -> Self {
        Self {
            decompress: flate2::Decompress::new_with_window_bits(false, window_bits),
        }
    }

    fn decompress_no_context(&mut self, input: &[u8], limit: usize) -> Result<Bytes> {
        self.decompress.reset(false);
        self.decompress(input, limit)
    }

    fn decompress(&mut self, input: &[u8], limit: usize) -> Result<Bytes> {
        let mut output = Vec::with_capacity(input.len().saturating_mul(2).clamp(64, limit.max(64)));

        self.write(input, &mut output, limit)?;
        self.write(&DEFLATE_SUFFIX, &mut output, limit)?;

        // drain whatever is still buffered inside the inflater
        loop {
            grow(&mut output);

            let before_out = self.decompress.total_out();
            self.decompress
                .decompress_vec(&[], &mut output, FlushDecompress::Sync)
                .map_err(inflate_error)?;

            if output.len() > limit {
                return Err(WebSocketError::MessageTooLarge);
            }
            if self.decompress.total_out() == before_out {
                break;
            }
        }

        Ok(output.into())
    }

    fn write(&mut self, mut input: &[u8], output: &mut Vec<u8>, limit: usize) -> Result<()> {
        while !input.is_empty() {
            grow(output);

            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();
            let status = self
                .decompress
                .decompress_vec(input, output, FlushDecompress::None)
                .map_err(inflate_error)?;

            let consumed = (self.decompress.total_in() - before_in) as usize;
            let produced = (self.decompress.total_out() - before_out) as usize;
            input = &input[consumed..];

            if output.len() > limit {
                return Err(WebSocketError::MessageTooLarge);
            }

            match status {
                // the sender closed the deflate stream; start a fresh one for what follows
                Status::StreamEnd => self.decompress.reset(false),
                Status::Ok | Status::BufError => {
                    if consumed == 0 && produced == 0 && output.len() < output.capacity() {
                        return Err(WebSocketError::Compression(stalled()));
                    }
                }
            }
        }

        Ok(())
    }
}

/// Makes room for at least one more chunk of output.
fn grow(output: &mut Vec<u8>) {
    if output.len() == output.capacity() {
        output.reserve(output.capacity().max(1024));
    }
}

fn deflate_error(err: CompressError) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("Compression error: {err}"),
    )
}

fn inflate_error(err: DecompressError) -> WebSocketError {
    WebSocketError::Compression(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("Decompression error: {err}"),
    ))
}

fn stalled() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "corrupt deflate stream")
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;

    const LIMIT: usize = 1 << 20;

    #[test]
    fn test_compress_strips_sync_suffix() {
        let mut compressor = Compressor::new(Compression::default());
        let compressed = compressor.compress(b"test data").unwrap();

        assert!(!compressed.is_empty());
        assert!(!compressed.ends_with(&DEFLATE_SUFFIX));
    }

    #[test]
    fn test_round_trip_with_context() {
        let mut compressor = Compressor::new(Compression::default());
        let mut decompressor = Decompressor::new();

        for data in [&b"test data"[..], b"", b"test data again", &[0u8; 4096]] {
            let compressed = compressor.compress(data).unwrap();
            let decompressed = decompressor.decompress(&compressed, LIMIT).unwrap();
            assert_eq!(&decompressed[..], data);
        }
    }

    #[test]
    fn test_round_trip_no_context_takeover() {
        let mut compressor = Compressor::no_context_takeover(Compression::default());
        let mut decompressor = Decompressor::no_context_takeover();
        assert!(compressor.is_no_context_takeover());

        for data in [&b"sample data"[..], b"sample data", b"other sample"] {
            let compressed = compressor.compress(data).unwrap();
            let decompressed = decompressor.decompress(&compressed, LIMIT).unwrap();
            assert_eq!(&decompressed[..], data);
        }
    }

    #[test]
    fn test_context_takeover_shrinks_repeated_message() {
        let message = b"The quick brown fox jumps over the lazy dog, again and again.";

        let mut contextual = Compressor::new(Compression::default());
        let first = contextual.compress(message).unwrap();
        let second = contextual.compress(message).unwrap();
        assert!(second.len() < first.len());

        let mut fresh = Compressor::no_context_takeover(Compression::default());
        let first = fresh.compress(message).unwrap();
        let second = fresh.compress(message).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_no_context_output_decodes_on_fresh_inflater() {
        let mut compressor = Compressor::no_context_takeover(Compression::default());
        let _ = compressor.compress(b"warm up the dictionary").unwrap();
        let compressed = compressor.compress(b"warm up the dictionary").unwrap();

        let decompressed = Decompressor::new().decompress(&compressed, LIMIT).unwrap();
        assert_eq!(&decompressed[..], b"warm up the dictionary");
    }

    #[test]
    fn test_decompress_rejects_corrupt_input() {
        let mut decompressor = Decompressor::new();
        let err = decompressor
            .decompress(&[0xff, 0xff, 0xff, 0xff, 0xff], LIMIT)
            .unwrap_err();
        assert!(matches!(err, WebSocketError::Compression(_)));
    }

    #[test]
    fn test_decompress_enforces_limit() {
        let data = vec![b'a'; 64 * 1024];
        let compressed = Compressor::new(Compression::best())
            .compress(&data)
            .unwrap();
        assert!(compressed.len() < 1024);

        let err = Decompressor::new()
            .decompress(&compressed, 1024)
            .unwrap_err();
        assert!(matches!(err, WebSocketError::MessageTooLarge));

        let ok = Decompressor::new()
            .decompress(&compressed, data.len())
            .unwrap();
        assert_eq!(ok.len(), data.len());
    }

    #[cfg(feature = "zlib")]
    #[test]
    fn test_round_trip_with_window_bits() {
        let mut compressor = Compressor::new_with_window_bits(Compression::default(), 10);
        let mut decompressor = Decompressor::new_with_window_bits(10);

        let data = b"window bits restrict the LZ77 history";
        let compressed = compressor.compress(data).unwrap();
        let decompressed = decompressor.decompress(&compressed, LIMIT).unwrap();
        assert_eq!(&decompressed[..], data);
    }
}
