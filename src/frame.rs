//! # Frame
//!
//! WebSocket frames as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
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
//! A [`Frame`] here is always the *unmasked* view: the decoder removes the client mask before
//! handing the frame out, and the server never masks what it sends. Multi-byte length fields
//! are big-endian.

use bytes::Bytes;

use crate::ServerError;

/// WebSocket operation code that determines how a frame is interpreted.
///
/// The numeric values come from [RFC 6455, Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8):
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
    /// Returns `true` for `Close`, `Ping` and `Pong`.
    ///
    /// Control frames cannot be fragmented and carry at most 125 bytes.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = ServerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(ServerError::InvalidOpCode(value)),
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

/// Status codes carried in the first two bytes of a close frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000, the purpose of the connection has been fulfilled.
    Normal,
    /// 1001, the server is going down.
    Away,
    /// 1002, the peer violated the protocol.
    Protocol,
    /// 1003, the peer sent a frame type we cannot accept.
    Unsupported,
    /// 1007, a text message was not UTF-8.
    Invalid,
    /// 1009, a frame was too big to process.
    Size,
    /// 1011, unexpected condition on the server.
    Error,
    /// Any other code.
    Other(u16),
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Invalid => 1007,
            CloseCode::Size => 1009,
            CloseCode::Error => 1011,
            CloseCode::Other(code) => code,
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1007 => CloseCode::Invalid,
            1009 => CloseCode::Size,
            1011 => CloseCode::Error,
            code => CloseCode::Other(code),
        }
    }
}

impl CloseCode {
    /// Picks the close code to report for a protocol violation.
    pub fn for_error(err: &ServerError) -> Self {
        match err {
            ServerError::FrameTooLarge => CloseCode::Size,
            ServerError::InvalidOpCode(_) => CloseCode::Unsupported,
            ServerError::InvalidUTF8 => CloseCode::Invalid,
            ServerError::UnmaskedFrame
            | ServerError::ReservedBitsNotZero
            | ServerError::ControlFrameFragmented
            | ServerError::ControlFrameTooLarge => CloseCode::Protocol,
            _ => CloseCode::Error,
        }
    }
}

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Largest possible server frame header: 2 bytes plus an 8-byte extended length.
pub(crate) const MAX_HEAD_SIZE: usize = 10;

/// A decoded WebSocket frame.
///
/// Frames are short-lived: the decoder produces one, the engine reacts to it and drops it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Indicates if this is the final fragment of a message.
    pub fin: bool,
    /// The opcode of the frame, defining its type.
    pub opcode: OpCode,
    /// The unmasked payload.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a new frame.
    pub fn new(fin: bool, opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            opcode,
            payload: payload.into(),
        }
    }

    /// Final text frame.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Text, payload)
    }

    /// Final binary frame.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Binary, payload)
    }

    /// Ping frame carrying `payload`.
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Ping, payload)
    }

    /// Pong frame, normally echoing the payload of a ping.
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Pong, payload)
    }

    /// Close frame with a status code and a reason.
    pub fn close(code: CloseCode, reason: impl AsRef<[u8]>) -> Self {
        let reason = reason.as_ref();
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&u16::from(code).to_be_bytes());
        payload.extend_from_slice(reason);
        Self::new(true, OpCode::Close, payload)
    }

    /// Close frame with an arbitrary payload, used to echo a peer's close.
    pub fn close_raw(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Close, payload)
    }

    /// Status code of a close frame, if the payload carries one.
    pub fn close_code(&self) -> Option<CloseCode> {
        let code = self.payload.get(0..2)?;
        Some(CloseCode::from(u16::from_be_bytes([code[0], code[1]])))
    }

    /// Checks if the payload is valid UTF-8.
    #[inline(always)]
    pub fn is_utf8(&self) -> bool {
        #[cfg(not(feature = "simd"))]
        return std::str::from_utf8(&self.payload).is_ok();
        #[cfg(feature = "simd")]
        return simdutf8::basic::from_utf8(&self.payload).is_ok();
    }

    /// Payload as text, replacing invalid sequences.
    pub fn to_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Writes the frame header into `head` and returns its size.
    ///
    /// The MASK bit is never set: server-to-client frames are sent unmasked.
    ///
    /// # Panics
    /// Panics if `head` is shorter than [`MAX_HEAD_SIZE`].
    pub(crate) fn fmt_head(&self, head: &mut [u8]) -> usize {
        head[0] = (self.fin as u8) << 7 | u8::from(self.opcode);

        let len = self.payload.len();
        if len < 126 {
            head[1] = len as u8;
            2
        } else if len <= u16::MAX as usize {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        }
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
            assert_eq!(OpCode::try_from(0x0).unwrap(), OpCode::Continuation);
            assert_eq!(OpCode::try_from(0x1).unwrap(), OpCode::Text);
            assert_eq!(OpCode::try_from(0x2).unwrap(), OpCode::Binary);
            assert_eq!(OpCode::try_from(0x8).unwrap(), OpCode::Close);
            assert_eq!(OpCode::try_from(0x9).unwrap(), OpCode::Ping);
            assert_eq!(OpCode::try_from(0xA).unwrap(), OpCode::Pong);

            for code in [0x3, 0x4, 0x5, 0x6, 0x7, 0xB, 0xC, 0xD, 0xE, 0xF] {
                assert!(matches!(
                    OpCode::try_from(code),
                    Err(ServerError::InvalidOpCode(c)) if c == code
                ));
            }
        }

        #[test]
        fn test_into_u8_matches_try_from() {
            for opcode in [
                OpCode::Continuation,
                OpCode::Text,
                OpCode::Binary,
                OpCode::Close,
                OpCode::Ping,
                OpCode::Pong,
            ] {
                assert_eq!(OpCode::try_from(u8::from(opcode)).unwrap(), opcode);
            }
        }
    }

    mod frame_tests {
        use super::*;

        #[test]
        fn test_close_payload() {
            let frame = Frame::close(CloseCode::Protocol, "bad frame");

            assert_eq!(frame.opcode, OpCode::Close);
            assert_eq!(&frame.payload[..2], &1002u16.to_be_bytes());
            assert_eq!(&frame.payload[2..], b"bad frame");
            assert_eq!(frame.close_code(), Some(CloseCode::Protocol));
        }

        #[test]
        fn test_close_code_missing() {
            assert_eq!(Frame::close_raw(Bytes::new()).close_code(), None);
            assert_eq!(Frame::close_raw(vec![3u8]).close_code(), None);
        }

        #[test]
        fn test_utf8() {
            assert!(Frame::text("Hello, 世界").is_utf8());
            assert!(!Frame::text(vec![0xFFu8, 0xFE]).is_utf8());
            assert_eq!(Frame::text(vec![0x61u8, 0xFF]).to_text(), "a\u{FFFD}");
        }

        #[test]
        fn test_fmt_head_small() {
            let frame = Frame::text("Header test");
            let mut head = [0u8; MAX_HEAD_SIZE];
            let size = frame.fmt_head(&mut head);

            assert_eq!(size, 2);
            assert_eq!(head[0], 0x81); // FIN + text
            assert_eq!(head[1], 11); // no mask bit
        }

        #[test]
        fn test_fmt_head_not_final() {
            let frame = Frame::new(false, OpCode::Binary, vec![0u8; 3]);
            let mut head = [0u8; MAX_HEAD_SIZE];
            frame.fmt_head(&mut head);

            assert_eq!(head[0], 0x02);
        }

        #[test]
        fn test_fmt_head_length_boundaries() {
            let mut head = [0u8; MAX_HEAD_SIZE];

            let size = Frame::binary(vec![0u8; 125]).fmt_head(&mut head);
            assert_eq!((size, head[1]), (2, 125));

            let size = Frame::binary(vec![0u8; 126]).fmt_head(&mut head);
            assert_eq!((size, head[1]), (4, 126));
            assert_eq!(&head[2..4], &126u16.to_be_bytes());

            let size = Frame::binary(vec![0u8; 65535]).fmt_head(&mut head);
            assert_eq!((size, head[1]), (4, 126));
            assert_eq!(&head[2..4], &[0xFF, 0xFF]);

            let size = Frame::binary(vec![0u8; 65536]).fmt_head(&mut head);
            assert_eq!((size, head[1]), (10, 127));
            assert_eq!(&head[2..10], &65536u64.to_be_bytes());
        }
    }

    #[test]
    fn test_close_code_round_trip() {
        for code in [1000u16, 1001, 1002, 1003, 1007, 1009, 1011, 4000] {
            assert_eq!(u16::from(CloseCode::from(code)), code);
        }
        assert_eq!(
            CloseCode::for_error(&ServerError::UnmaskedFrame),
            CloseCode::Protocol
        );
        assert_eq!(
            CloseCode::for_error(&ServerError::FrameTooLarge),
            CloseCode::Size
        );
        assert_eq!(
            CloseCode::for_error(&ServerError::ControlFrameTooLarge),
            CloseCode::Protocol
        );
    }
}
