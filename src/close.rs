//! Close status codes and close-frame negotiation (RFC 6455 Section 7).
//!
//! When the peer starts the closing handshake, [`negotiate`] decides which status code goes back
//! in the reply and which code and reason are reported to the application.
use bytes::Bytes;

/// Status code used to indicate why an endpoint is closing the WebSocket connection.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum CloseCode {
    /// Indicates a normal closure, meaning that the purpose for
    /// which the connection was established has been fulfilled.
    Normal,
    /// Indicates that an endpoint is "going away", such as a server
    /// going down or a browser having navigated away from a page.
    Away,
    /// Indicates that an endpoint is terminating the connection due
    /// to a protocol error.
    Protocol,
    /// Indicates that an endpoint is terminating the connection
    /// because it has received a type of data it cannot accept.
    Unsupported,
    /// Indicates that no status code was included in a closing frame. This
    /// close code makes it possible to use a single method, `on_close` to
    /// handle even cases where no close code was provided.
    Status,
    /// Indicates an abnormal closure. If the abnormal closure was due to an
    /// error, this close code will not be used. Instead, the `on_error` method
    /// of the handler will be called with the error.
    Abnormal,
    /// Indicates that an endpoint is terminating the connection
    /// because it has received data within a message that was not
    /// consistent with the type of the message (e.g., non-UTF-8 \[RFC3629\]
    /// data within a text message).
    Invalid,
    /// Indicates that an endpoint is terminating the connection
    /// because it has received a message that violates its policy.
    Policy,
    /// Indicates that an endpoint is terminating the connection
    /// because it has received a message that is too big for it to
    /// process.
    Size,
    /// Indicates that an endpoint (client) is terminating the
    /// connection because it has expected the server to negotiate one or
    /// more extension, but the server didn't return them in the response
    /// message of the WebSocket handshake.
    Extension,
    /// Indicates that a server is terminating the connection because
    /// it encountered an unexpected condition that prevented it from
    /// fulfilling the request.
    Error,
    /// Indicates that the server is restarting.
    Restart,
    /// Indicates that the server is overloaded and the client should either connect to a
    /// different IP (when multiple targets exist), or reconnect to the same IP when a user has
    /// performed an action.
    Again,
    /// Indicates that the connection was closed due to a failure to perform a TLS handshake.
    Tls,
    /// Reserved for future use by the protocol.
    Reserved(u16),
    /// Reserved for use by libraries, frameworks, and applications registered with IANA.
    Iana(u16),
    /// Reserved for private use by applications.
    Library(u16),
    /// Outside the ranges defined by RFC 6455.
    Bad(u16),
}

impl CloseCode {
    /// Returns `true` if this code may appear in a close frame on the wire.
    pub fn is_allowed(self) -> bool {
        !matches!(
            self,
            Self::Bad(_) | Self::Reserved(_) | Self::Status | Self::Abnormal | Self::Tls
        )
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> CloseCode {
        match code {
            1000 => Self::Normal,
            1001 => Self::Away,
            1002 => Self::Protocol,
            1003 => Self::Unsupported,
            1005 => Self::Status,
            1006 => Self::Abnormal,
            1007 => Self::Invalid,
            1008 => Self::Policy,
            1009 => Self::Size,
            1010 => Self::Extension,
            1011 => Self::Error,
            1012 => Self::Restart,
            1013 => Self::Again,
            1015 => Self::Tls,
            1004 | 1014 | 1016..=2999 => Self::Reserved(code),
            3000..=3999 => Self::Iana(code),
            4000..=4999 => Self::Library(code),
            _ => Self::Bad(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Status => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Restart => 1012,
            CloseCode::Again => 1013,
            CloseCode::Tls => 1015,
            CloseCode::Reserved(code)
            | CloseCode::Iana(code)
            | CloseCode::Library(code)
            | CloseCode::Bad(code) => code,
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u16::from(*self))
    }
}

/// Outcome of a peer-initiated close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseNegotiation {
    /// Status code to put in the reply close frame.
    pub response: CloseCode,
    /// Code the peer actually sent, `0` when the payload carried none.
    pub real_code: u16,
    /// Reason bytes following the code.
    pub reason: Bytes,
}

/// Decides the reply to a close frame received from the peer.
///
/// | payload | reply |
/// |---|---|
/// | empty | 1000, reported code 0 |
/// | 1 byte | 1002, reported code is that byte |
/// | 1004, 1005, 1006, 1014, 1015 | 1002 |
/// | below 1000, 1016 to 2999, 5000 and above | 1002 |
/// | any other code below 1016 | 1000 |
/// | 3000 to 4999 | the same code |
///
/// When `check_utf8` is set and the reason is not valid UTF-8 the reply is 1007, whatever the
/// code was.
pub fn negotiate(payload: &[u8], check_utf8: bool) -> CloseNegotiation {
    match payload {
        [] => CloseNegotiation {
            response: CloseCode::Normal,
            real_code: 0,
            reason: Bytes::new(),
        },
        [code] => CloseNegotiation {
            response: CloseCode::Protocol,
            real_code: u16::from(*code),
            reason: Bytes::new(),
        },
        [hi, lo, reason @ ..] => {
            let real_code = u16::from_be_bytes([*hi, *lo]);
            let response = if check_utf8 && !crate::is_utf8(reason) {
                CloseCode::Invalid
            } else {
                match real_code {
                    1004 | 1005 | 1006 | 1014 | 1015 => CloseCode::Protocol,
                    0..=999 | 1016..=2999 | 5000..=u16::MAX => CloseCode::Protocol,
                    1000..=1015 => CloseCode::Normal,
                    _ => CloseCode::from(real_code),
                }
            };

            CloseNegotiation {
                response,
                real_code,
                reason: Bytes::copy_from_slice(reason),
            }
        }
    }
}
