//! Continuation-frame reassembly.
//!
//! A message is either a single Text/Binary frame with FIN set, or a Text/Binary frame with FIN
//! clear followed by Continuation frames, the last of which has FIN set. Control frames may be
//! interleaved on the wire but never reach the [`Defragmenter`].
use bytes::{Bytes, BytesMut};

use crate::{
    frame::{Frame, OpCode},
    Result, WebSocketError,
};

/// A complete data message.
///
/// `payload` is still compressed when `was_compressed` is set and the message came straight out
/// of the [`Defragmenter`]. Messages handed to [`Handler::on_message`](crate::Handler::on_message)
/// are always inflated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// [`OpCode::Text`] or [`OpCode::Binary`].
    pub opcode: OpCode,
    /// The reassembled payload.
    pub payload: Bytes,
    /// Whether RSV1 was set on the first frame.
    pub was_compressed: bool,
}

impl Message {
    /// Returns the payload as text.
    ///
    /// # Errors
    /// Returns [`WebSocketError::InvalidUTF8`] if the payload is not valid UTF-8.
    pub fn as_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.payload).map_err(|_| WebSocketError::InvalidUTF8)
    }

    /// Returns `true` for text messages.
    pub fn is_text(&self) -> bool {
        self.opcode == OpCode::Text
    }
}

/// Header of the message being accumulated.
struct Fragment {
    opcode: OpCode,
    is_compressed: bool,
}

/// Reassembles fragmented messages.
pub struct Defragmenter {
    /// Message in progress, if any.
    fragment: Option<Fragment>,
    /// Payload bytes gathered so far.
    accumulated: BytesMut,
    /// Largest message the defragmenter will hold.
    max_message_size: usize,
}

impl Defragmenter {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            fragment: None,
            accumulated: BytesMut::with_capacity(1024),
            max_message_size,
        }
    }

    /// Returns `true` while a fragmented message is incomplete.
    pub fn is_accumulating(&self) -> bool {
        self.fragment.is_some()
    }

    /// Feeds one data frame.
    ///
    /// Returns the message once its final frame arrived, or `None` while more fragments are
    /// expected.
    ///
    /// # Errors
    /// - [`WebSocketError::InvalidFragment`] for a Text/Binary frame while a message is in
    ///   progress, or for a control frame
    /// - [`WebSocketError::InvalidContinuationFrame`] for a Continuation frame with no message in
    ///   progress
    /// - [`WebSocketError::MessageTooLarge`] once the accumulated payload exceeds the maximum; the
    ///   partial message is dropped
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>> {
        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                if self.fragment.is_some() {
                    return Err(WebSocketError::InvalidFragment);
                }

                if frame.fin {
                    return Ok(Some(Message {
                        opcode: frame.opcode,
                        payload: frame.payload,
                        was_compressed: frame.is_compressed,
                    }));
                }

                self.check_size(frame.payload.len())?;
                self.fragment = Some(Fragment {
                    opcode: frame.opcode,
                    is_compressed: frame.is_compressed,
                });
                self.accumulated.extend_from_slice(&frame.payload);

                Ok(None)
            }
            OpCode::Continuation => {
                if self.fragment.is_none() {
                    return Err(WebSocketError::InvalidContinuationFrame);
                }

                self.check_size(frame.payload.len())?;
                self.accumulated.extend_from_slice(&frame.payload);

                if !frame.fin {
                    return Ok(None);
                }

                let Some(fragment) = self.fragment.take() else {
                    return Err(WebSocketError::InvalidContinuationFrame);
                };
                // hand out the buffer and start over with a small one, so one large message
                // does not pin its allocation for the rest of the connection
                let payload =
                    std::mem::replace(&mut self.accumulated, BytesMut::with_capacity(1024));

                Ok(Some(Message {
                    opcode: fragment.opcode,
                    payload: payload.freeze(),
                    was_compressed: fragment.is_compressed,
                }))
            }
            OpCode::Close | OpCode::Ping | OpCode::Pong => Err(WebSocketError::InvalidFragment),
        }
    }

    /// Drops any partial message.
    pub fn reset(&mut self) {
        self.fragment = None;
        self.accumulated = BytesMut::with_capacity(1024);
    }

    fn check_size(&mut self, incoming: usize) -> Result<()> {
        if self.accumulated.len() + incoming > self.max_message_size {
            self.reset();
            return Err(WebSocketError::MessageTooLarge);
        }
        Ok(())
    }
}
