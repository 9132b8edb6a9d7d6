//! # Frame
//!
//! The `frame` module implements WebSocket frames as defined in
//! [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//!
//! ### Frame Binary Format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! :                     Payload Data continued ...                :
//! +---------------------------------------------------------------+
//! ```
//!
//! [`Header`] is the pure header codec: [`Header::parse`] reads a header from a byte slice
//! without consuming it and [`Header::encode`] writes one using the shortest length form.
//! [`Frame`] is a header plus its payload, as produced by the [`Decoder`](crate::codec::Decoder)
//! and consumed by the [`Encoder`](crate::codec::Encoder).
//!
//! RSV1 carries the permessage-deflate "compressed" flag. RSV2 and RSV3 have no meaning in this
//! crate and are always rejected.
use bytes::Bytes;

use crate::{close::CloseCode, WebSocketError};

/// Largest possible header: 2 fixed bytes, 8 bytes of extended length and a 4-byte mask.
pub(crate) const MAX_HEAD_SIZE: usize = 16;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket operation code (OpCode) that determines the semantic meaning and handling of a frame.
///
/// The numeric values for each OpCode are defined in
/// [RFC 6455, Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8):
/// - Continuation = 0x0
/// - Text = 0x1
/// - Binary = 0x2
/// - Close = 0x8
/// - Ping = 0x9
/// - Pong = 0xA
///
/// The ranges 0x3-0x7 and 0xB-0xF are reserved and rejected.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` if the `OpCode` represents a control frame (`Close`, `Ping`, or `Pong`).
    ///
    /// Control frames cannot be fragmented and carry at most 125 bytes of payload.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    /// Returns `true` for `Text` and `Binary`, the opcodes that start a message.
    pub fn is_data(&self) -> bool {
        matches!(*self, OpCode::Text | OpCode::Binary)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Final fragment flag.
    pub fin: bool,
    /// RSV1, the per-message compression flag.
    pub rsv1: bool,
    /// Frame type.
    pub opcode: OpCode,
    /// Masking key, present when the MASK bit is set.
    pub mask: Option<[u8; 4]>,
    /// Payload length as carried on the wire.
    pub payload_len: u64,
}

impl Header {
    /// Parses a frame header from the start of `src`.
    ///
    /// Returns `Ok(None)` when `src` does not yet hold the complete header, otherwise the header
    /// and the number of bytes it occupies. Nothing is consumed from `src`.
    ///
    /// When `strict` is set, a length carried in the 16-bit or 64-bit form that would have fit a
    /// shorter form is rejected with [`WebSocketError::NonMinimalLength`].
    ///
    /// # Errors
    /// - [`WebSocketError::ReservedBitsNotZero`] if RSV2/RSV3 are set, or RSV1 is set on a
    ///   control or continuation frame
    /// - [`WebSocketError::InvalidOpCode`] for reserved opcodes
    /// - [`WebSocketError::ControlFrameFragmented`] / [`WebSocketError::ControlFrameTooLarge`]
    /// - [`WebSocketError::PayloadLengthOverflow`] if the 64-bit length has its high bit set
    pub fn parse(src: &[u8], strict: bool) -> Result<Option<(Header, usize)>, WebSocketError> {
        if src.len() < 2 {
            return Ok(None);
        }

        let fin = src[0] & 0b1000_0000 != 0;
        let rsv1 = src[0] & 0b0100_0000 != 0;
        if src[0] & 0b0011_0000 != 0 {
            return Err(WebSocketError::ReservedBitsNotZero);
        }

        let opcode = OpCode::try_from(src[0] & 0b0000_1111)?;
        if rsv1 && (opcode.is_control() || opcode == OpCode::Continuation) {
            return Err(WebSocketError::ReservedBitsNotZero);
        }

        let masked = src[1] & 0b1000_0000 != 0;
        let length_code = src[1] & 0x7F;
        let extra = match length_code {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        let header_size = 2 + extra + if masked { 4 } else { 0 };
        if src.len() < header_size {
            return Ok(None);
        }

        let payload_len = match extra {
            2 => u64::from(u16::from_be_bytes([src[2], src[3]])),
            8 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&src[2..10]);
                u64::from_be_bytes(raw)
            }
            _ => u64::from(length_code),
        };

        if payload_len >> 63 != 0 {
            return Err(WebSocketError::PayloadLengthOverflow);
        }
        if strict
            && ((extra == 2 && payload_len < 126)
                || (extra == 8 && payload_len <= u64::from(u16::MAX)))
        {
            return Err(WebSocketError::NonMinimalLength);
        }

        if opcode.is_control() {
            if !fin {
                return Err(WebSocketError::ControlFrameFragmented);
            }
            if payload_len > MAX_CONTROL_PAYLOAD as u64 {
                return Err(WebSocketError::ControlFrameTooLarge);
            }
        }

        let mask = if masked {
            let at = 2 + extra;
            Some([src[at], src[at + 1], src[at + 2], src[at + 3]])
        } else {
            None
        };

        Ok(Some((
            Header {
                fin,
                rsv1,
                opcode,
                mask,
                payload_len,
            },
            header_size,
        )))
    }

    /// Writes the header into `head` and returns the number of bytes used.
    ///
    /// The payload length uses the shortest of the three encodings.
    ///
    /// # Panics
    /// Panics if `head` is shorter than the encoded header (at most 14 bytes).
    pub fn encode(&self, head: &mut [u8]) -> usize {
        head[0] = (self.fin as u8) << 7 | (self.rsv1 as u8) << 6 | u8::from(self.opcode);

        let len = self.payload_len;
        let size = if len < 126 {
            head[1] = len as u8;
            2
        } else if len <= u64::from(u16::MAX) {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&len.to_be_bytes());
            10
        };

        if let Some(mask) = self.mask {
            head[1] |= 0x80;
            head[size..size + 4].copy_from_slice(&mask);
            size + 4
        } else {
            size
        }
    }
}

/// Represents a WebSocket frame: header flags plus payload.
///
/// Frames handed out by the [`Decoder`](crate::codec::Decoder) are already unmasked. Frames
/// handed to the [`Encoder`](crate::codec::Encoder) are masked on the way out if they carry a
/// masking key.
///
/// ```rust
/// use wsengine::frame::Frame;
/// use wsengine::close::CloseCode;
///
/// let text_frame = Frame::text("Hello");
/// let binary_frame = Frame::binary(vec![1, 2, 3]);
/// let ping_frame = Frame::ping(vec![]);
/// let close_frame = Frame::close(CloseCode::Normal, b"Goodbye");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Indicates if this is the final frame in a message.
    pub fin: bool,
    /// The opcode of the frame, defining its type.
    pub opcode: OpCode,
    /// Flag indicating whether the payload is compressed.
    pub(crate) is_compressed: bool,
    /// The masking key for the frame, if any.
    pub(crate) mask: Option<[u8; 4]>,
    /// The payload of the frame.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a new uncompressed `Frame`.
    pub fn new(fin: bool, opcode: OpCode, mask: Option<[u8; 4]>, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            opcode,
            is_compressed: false,
            mask,
            payload: payload.into(),
        }
    }

    /// Creates a new frame whose payload was produced by the permessage-deflate compressor.
    pub fn compress(
        fin: bool,
        opcode: OpCode,
        mask: Option<[u8; 4]>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            is_compressed: true,
            ..Self::new(fin, opcode, mask, payload)
        }
    }

    /// Creates a final text frame.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Text, None, payload)
    }

    /// Creates a final binary frame.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Binary, None, payload)
    }

    /// Creates a final continuation frame.
    pub fn continuation(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Continuation, None, payload)
    }

    /// Creates a ping frame.
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Ping, None, payload)
    }

    /// Creates a pong frame.
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Pong, None, payload)
    }

    /// Creates a close frame carrying `code` followed by `reason`.
    pub fn close(code: CloseCode, reason: impl AsRef<[u8]>) -> Self {
        let reason = reason.as_ref();
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&u16::from(code).to_be_bytes());
        payload.extend_from_slice(reason);
        Self::new(true, OpCode::Close, None, payload)
    }

    /// Creates a close frame with a raw payload.
    ///
    /// This method does not validate if `payload` is a valid close frame payload.
    pub fn close_raw(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Close, None, payload)
    }

    /// Sets the FIN flag.
    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Sets the masking key applied when the frame is encoded.
    pub fn with_mask(mut self, mask: [u8; 4]) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Returns whether RSV1 (compressed) is set.
    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.is_compressed
    }

    /// Returns the masking key, if any.
    #[inline]
    pub fn mask(&self) -> Option<[u8; 4]> {
        self.mask
    }

    /// Checks if the frame payload is valid UTF-8.
    #[inline]
    pub fn is_utf8(&self) -> bool {
        crate::is_utf8(&self.payload)
    }

    /// The header this frame is encoded with.
    pub fn header(&self) -> Header {
        Header {
            fin: self.fin,
            rsv1: self.is_compressed,
            opcode: self.opcode,
            mask: self.mask,
            payload_len: self.payload.len() as u64,
        }
    }

    /// Extracts the status code from a Close frame payload, if it carries one.
    pub fn close_code(&self) -> Option<CloseCode> {
        let raw: [u8; 2] = self.payload.get(0..2)?.try_into().ok()?;
        Some(CloseCode::from(u16::from_be_bytes(raw)))
    }

    /// Extracts the reason text from a Close frame payload, if it is present and valid UTF-8.
    pub fn close_reason(&self) -> Option<&str> {
        std::str::from_utf8(self.payload.get(2..)?).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod opcode_tests {
        use super::*;

        #[test]
        fn test_is_control() {
            assert!(OpCode::Close.is_control());
            assert!(OpCode::Ping.is_control());
            assert!(OpCode::Pong.is_control());

            assert!(!OpCode::Continuation.is_control());
            assert!(!OpCode::Text.is_control());
            assert!(!OpCode::Binary.is_control());
        }

        #[test]
        fn test_try_from_u8() {
            for op in [
                OpCode::Continuation,
                OpCode::Text,
                OpCode::Binary,
                OpCode::Close,
                OpCode::Ping,
                OpCode::Pong,
            ] {
                assert_eq!(OpCode::try_from(u8::from(op)).unwrap(), op);
            }

            for code in [0x3, 0x4, 0x5, 0x6, 0x7, 0xB, 0xC, 0xD, 0xE, 0xF] {
                assert!(matches!(
                    OpCode::try_from(code),
                    Err(WebSocketError::InvalidOpCode(c)) if c == code
                ));
            }
        }
    }

    mod header_tests {
        use super::*;

        fn round_trip(len: u64) -> (Header, usize) {
            let header = Header {
                fin: true,
                rsv1: false,
                opcode: OpCode::Binary,
                mask: None,
                payload_len: len,
            };
            let mut head = [0u8; MAX_HEAD_SIZE];
            let size = header.encode(&mut head);
            let (parsed, consumed) = Header::parse(&head[..size], true).unwrap().unwrap();
            assert_eq!(consumed, size);
            (parsed, size)
        }

        #[test]
        fn test_length_round_trip_uses_minimal_form() {
            let cases: [(u64, usize); 7] = [
                (0, 2),
                (1, 2),
                (125, 2),
                (126, 4),
                (65535, 4),
                (65536, 10),
                (1 << 32, 10),
            ];

            for (len, expected_size) in cases {
                let (parsed, size) = round_trip(len);
                assert_eq!(parsed.payload_len, len);
                assert_eq!(size, expected_size, "length {len}");
            }
        }

        #[test]
        fn test_encode_masked_text() {
            let mask = [0xAA, 0xBB, 0xCC, 0xDD];
            let frame = Frame::text("Header test").with_mask(mask);

            let mut head = [0u8; MAX_HEAD_SIZE];
            let size = frame.header().encode(&mut head);

            assert_eq!(size, 2 + 4);
            assert_eq!(head[0], 0x81);
            assert_eq!(head[1], 0x80 | 11);
            assert_eq!(&head[2..6], &mask);
        }

        #[test]
        fn test_parse_needs_more_bytes() {
            assert!(Header::parse(&[], false).unwrap().is_none());
            assert!(Header::parse(&[0x82], false).unwrap().is_none());
            // 16-bit length announced, only one extended byte present
            assert!(Header::parse(&[0x82, 126, 0x01], false).unwrap().is_none());
            // mask announced but missing
            assert!(Header::parse(&[0x82, 0x85, 1, 2], false).unwrap().is_none());
        }

        #[test]
        fn test_parse_reads_mask_and_compression() {
            let (header, size) = Header::parse(&[0xC1, 0x83, 1, 2, 3, 4], false)
                .unwrap()
                .unwrap();
            assert_eq!(size, 6);
            assert!(header.fin);
            assert!(header.rsv1);
            assert_eq!(header.opcode, OpCode::Text);
            assert_eq!(header.mask, Some([1, 2, 3, 4]));
            assert_eq!(header.payload_len, 3);
        }

        #[test]
        fn test_parse_rejects_reserved_bits() {
            assert!(matches!(
                Header::parse(&[0xA1, 0x00], false),
                Err(WebSocketError::ReservedBitsNotZero)
            ));
            assert!(matches!(
                Header::parse(&[0x91, 0x00], false),
                Err(WebSocketError::ReservedBitsNotZero)
            ));
            // RSV1 on a ping
            assert!(matches!(
                Header::parse(&[0xC9, 0x00], false),
                Err(WebSocketError::ReservedBitsNotZero)
            ));
            // RSV1 on a continuation
            assert!(matches!(
                Header::parse(&[0xC0, 0x00], false),
                Err(WebSocketError::ReservedBitsNotZero)
            ));
        }

        #[test]
        fn test_parse_rejects_bad_control_frames() {
            // ping without FIN
            assert!(matches!(
                Header::parse(&[0x09, 0x00], false),
                Err(WebSocketError::ControlFrameFragmented)
            ));
            // close with 126 bytes
            assert!(matches!(
                Header::parse(&[0x88, 126, 0x00, 126], false),
                Err(WebSocketError::ControlFrameTooLarge)
            ));
            // pong with exactly 125 bytes is fine
            assert!(Header::parse(&[0x8A, 125], false).unwrap().is_some());
        }

        #[test]
        fn test_parse_rejects_high_bit_length() {
            let mut src = vec![0x82, 127];
            src.extend_from_slice(&(1u64 << 63).to_be_bytes());
            assert!(matches!(
                Header::parse(&src, false),
                Err(WebSocketError::PayloadLengthOverflow)
            ));
        }

        #[test]
        fn test_non_minimal_length_only_rejected_when_strict() {
            let mut long_form = vec![0x82, 127];
            long_form.extend_from_slice(&5u64.to_be_bytes());
            let (header, _) = Header::parse(&long_form, false).unwrap().unwrap();
            assert_eq!(header.payload_len, 5);
            assert!(matches!(
                Header::parse(&long_form, true),
                Err(WebSocketError::NonMinimalLength)
            ));

            let short_form = [0x82, 126, 0x00, 0x05];
            assert!(Header::parse(&short_form, false).unwrap().is_some());
            assert!(matches!(
                Header::parse(&short_form, true),
                Err(WebSocketError::NonMinimalLength)
            ));
        }
    }

    mod frame_tests {
        use super::*;

        #[test]
        fn test_frame_new() {
            let frame = Frame::new(true, OpCode::Text, None, "Test payload");

            assert!(frame.fin);
            assert_eq!(frame.opcode, OpCode::Text);
            assert_eq!(frame.mask(), None);
            assert_eq!(frame.payload, Bytes::from("Test payload"));
            assert!(!frame.is_compressed());
        }

        #[test]
        fn test_frame_compress() {
            let frame = Frame::compress(false, OpCode::Binary, Some([0xAA, 0xBB, 0xCC, 0xDD]), "x");

            assert!(!frame.fin);
            assert_eq!(frame.opcode, OpCode::Binary);
            assert_eq!(frame.mask(), Some([0xAA, 0xBB, 0xCC, 0xDD]));
            assert!(frame.is_compressed());
            assert!(frame.header().rsv1);
        }

        #[test]
        fn test_close_frame_layout() {
            let frame = Frame::close(CloseCode::Normal, "Normal closure");

            assert_eq!(frame.opcode, OpCode::Close);
            assert_eq!(&frame.payload[..2], &1000u16.to_be_bytes());
            assert_eq!(frame.close_code(), Some(CloseCode::Normal));
            assert_eq!(frame.close_reason(), Some("Normal closure"));
        }

        #[test]
        fn test_close_accessors_on_short_payloads() {
            assert_eq!(Frame::close_raw(Bytes::new()).close_code(), None);
            assert_eq!(Frame::close_raw(vec![0x03]).close_code(), None);
            assert_eq!(Frame::close_raw(vec![0x03]).close_reason(), None);
        }

        #[test]
        fn test_frame_is_utf8() {
            assert!(Frame::text("Hello, 世界").is_utf8());
            assert!(!Frame::text(vec![0xFF, 0xFE, 0xFD]).is_utf8());
        }
    }
}
