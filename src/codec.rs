//! `tokio_util::codec` adapters for WebSocket frames.
//!
//! [`Decoder`] drives [`Header::parse`] over a streaming buffer and hands out unmasked frames.
//! [`Encoder`] writes the header in its minimal form and masks the payload in the output buffer
//! when the frame carries a key.
use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    frame::{Frame, Header, MAX_HEAD_SIZE},
    mask::apply_mask,
    options::MAX_PAYLOAD_READ,
    WebSocketError,
};

/// A header that has been parsed and consumed, waiting for its payload.
struct Pending {
    header: Header,
    payload_len: usize,
}

/// A combined codec that provides both encoding and decoding functionality for WebSocket frames.
///
/// This codec can be used with Tokio's framed streams to handle WebSocket protocol
/// frame encoding and decoding on a single, unsplit transport.
pub struct Codec {
    decoder: Decoder,
    encoder: Encoder,
}

impl Codec {
    pub fn new(decoder: Decoder, encoder: Encoder) -> Self {
        Self { decoder, encoder }
    }
}

impl From<(Decoder, Encoder)> for Codec {
    fn from((decoder, encoder): (Decoder, Encoder)) -> Self {
        Self::new(decoder, encoder)
    }
}

impl codec::Decoder for Codec {
    type Item = <Decoder as codec::Decoder>::Item;
    type Error = <Decoder as codec::Decoder>::Error;

    #[inline]
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decoder.decode(src)
    }
}

impl codec::Encoder<Frame> for Codec {
    type Error = <Encoder as codec::Encoder<Frame>>::Error;

    #[inline]
    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encoder.encode(item, dst)
    }
}

/// A decoder for WebSocket frames, handling state transitions.
///
/// `Decoder` tracks the maximum allowed payload size, whether permessage-deflate was negotiated
/// and whether non-minimal length encodings are tolerated. The state changes as each part of the
/// frame (header and payload) becomes available.
pub struct Decoder {
    /// Header consumed from the buffer whose payload is still incomplete.
    state: Option<Pending>,
    /// Maximum allowed size for a frame payload.
    max_payload_read: usize,
    /// Whether RSV1 may be set on data frames.
    compression: bool,
    /// Whether non-minimal length encodings are rejected.
    strict: bool,
}

impl Decoder {
    /// Creates a new `Decoder` limiting payloads to `max_payload_read` bytes.
    ///
    /// Compression is off and length encodings are parsed leniently.
    pub fn new(max_payload_read: usize) -> Self {
        Self {
            state: None,
            max_payload_read,
            compression: false,
            strict: false,
        }
    }

    /// Accepts frames with RSV1 set.
    pub fn with_compression(mut self, compression: bool) -> Self {
        self.compression = compression;
        self
    }

    /// Rejects payload lengths that are not encoded in their shortest form.
    pub fn with_strict_length_encoding(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD_READ)
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WebSocketError;

    /// Decodes WebSocket frames from a `BytesMut` buffer, managing header and payload parsing.
    ///
    /// # Returns
    /// - `Ok(Some(Frame))`: a fully decoded, unmasked `Frame`.
    /// - `Ok(None)`: more data is needed to complete the frame.
    /// - `Err(WebSocketError)`: a protocol violation or an oversized frame was detected.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state.take() {
                None => {
                    let Some((header, header_size)) = Header::parse(&src[..], self.strict)? else {
                        return Ok(None);
                    };

                    if header.rsv1 && !self.compression {
                        return Err(WebSocketError::CompressionNotSupported);
                    }

                    let payload_len = usize::try_from(header.payload_len)
                        .map_err(|_| WebSocketError::FrameTooLarge)?;
                    if payload_len > self.max_payload_read {
                        return Err(WebSocketError::FrameTooLarge);
                    }

                    src.advance(header_size);
                    src.reserve(payload_len.saturating_sub(src.len()));

                    self.state = Some(Pending {
                        header,
                        payload_len,
                    });
                }
                Some(pending) => {
                    if src.len() < pending.payload_len {
                        self.state = Some(pending);
                        return Ok(None);
                    }

                    let header = pending.header;
                    let mut payload = src.split_to(pending.payload_len);
                    if let Some(mask) = header.mask {
                        apply_mask(&mut payload, mask);
                    }

                    let mut frame = Frame::new(header.fin, header.opcode, None, payload.freeze());
                    frame.is_compressed = header.rsv1;

                    break Ok(Some(frame));
                }
            }
        }
    }
}

/// WebSocket frame encoder for serializing `Frame` instances into a buffer.
///
/// The header is written in its minimal form. If the frame carries a masking key, the payload
/// is copied and then masked inside `dst`, leaving the frame's own payload untouched.
#[derive(Default)]
pub struct Encoder;

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut head = [0; MAX_HEAD_SIZE];
        let size = frame.header().encode(&mut head);

        dst.reserve(size + frame.payload.len());
        dst.extend_from_slice(&head[..size]);

        let start = dst.len();
        dst.extend_from_slice(&frame.payload);
        if let Some(mask) = frame.mask {
            apply_mask(&mut dst[start..], mask);
        }

        Ok(())
    }
}
