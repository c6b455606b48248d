//! # Codec
//!
//! Server-side WebSocket frame codec.
//!
//! [`decode_frame`] takes one frame from the front of a connection's accumulation buffer. It
//! only consumes bytes once the whole frame (header, mask key and payload) is buffered, so an
//! `Ok(None)` always leaves the buffer exactly as it was and the caller simply retries after
//! the next read.
//!
//! The server only serves masked client frames. A frame with a payload and without the MASK
//! bit is reported as [`ServerError::UnmaskedFrame`]; the connection should then be closed.
//! Frames with an empty payload are accepted either way and consume only their header (the
//! mask key counts as part of the header when present).
//!
//! [`encode_frame`] produces unmasked server-to-client frames.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec;

use crate::{
    frame::{Frame, OpCode, MAX_CONTROL_PAYLOAD, MAX_HEAD_SIZE},
    mask::apply_mask,
    Result, ServerError,
};

const FIN_BIT: u8 = 0b1000_0000;
const RSV_BITS: u8 = 0b0111_0000;
const OPCODE_BITS: u8 = 0b0000_1111;
const MASK_BIT: u8 = 0b1000_0000;
const LENGTH_BITS: u8 = 0b0111_1111;

/// Decodes a single frame with no payload size limit.
///
/// See [`Decoder::decode_frame`].
pub fn decode_frame(src: &mut BytesMut) -> Result<Option<Frame>> {
    Decoder::new(usize::MAX).decode_frame(src)
}

/// Encodes `payload` as one unmasked frame.
///
/// The length field uses the 7-bit form up to 125 bytes, the 16-bit extended form up to
/// 65535 bytes and the 64-bit extended form above that.
pub fn encode_frame(payload: impl Into<Bytes>, fin: bool, opcode: OpCode) -> Bytes {
    encode(&Frame::new(fin, opcode, payload))
}

/// Encodes an already built frame.
pub fn encode(frame: &Frame) -> Bytes {
    let mut dst = BytesMut::with_capacity(MAX_HEAD_SIZE + frame.payload.len());
    write_frame(frame, &mut dst);
    dst.freeze()
}

fn write_frame(frame: &Frame, dst: &mut BytesMut) {
    let mut head = [0; MAX_HEAD_SIZE];
    let size = frame.fmt_head(&mut head);

    dst.extend_from_slice(&head[..size]);
    dst.extend_from_slice(&frame.payload);
}

/// Parsed fixed part of a frame header.
struct Head {
    fin: bool,
    opcode: OpCode,
    mask: bool,
    /// Bytes before the payload, mask key included.
    size: usize,
    payload_len: usize,
}

/// Frame decoder enforcing a maximum payload size.
#[derive(Debug, Clone)]
pub struct Decoder {
    /// Maximum allowed size for a frame payload.
    max_payload_size: usize,
}

impl Decoder {
    /// Creates a new `Decoder` rejecting payloads larger than `max_payload_size`.
    pub fn new(max_payload_size: usize) -> Self {
        Self { max_payload_size }
    }

    /// Takes one frame from the front of `src`.
    ///
    /// # Returns
    /// - `Ok(Some(frame))`: a whole frame was buffered; its bytes have been removed from `src`
    ///   and the payload is unmasked.
    /// - `Ok(None)`: the header or payload is incomplete. `src` is untouched.
    /// - `Err(ServerError)`: the bytes violate the protocol (unmasked client frame, reserved
    ///   bits, unknown opcode, fragmented or oversized control frame, oversized payload or a
    ///   declared length that does not fit in memory).
    pub fn decode_frame(&self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let Some(head) = self.parse_head(src)? else {
            return Ok(None);
        };

        let total = head
            .size
            .checked_add(head.payload_len)
            .ok_or(ServerError::FrameTooLarge)?;
        if src.remaining() < total {
            return Ok(None);
        }

        let mut mask = None;
        if head.mask {
            let mut key = [0; 4];
            key.copy_from_slice(&src[head.size - 4..head.size]);
            mask = Some(key);
        }
        src.advance(head.size);

        let mut payload = src.split_to(head.payload_len);
        if let Some(mask) = mask {
            apply_mask(&mut payload, mask);
        }

        Ok(Some(Frame::new(head.fin, head.opcode, payload.freeze())))
    }

    fn parse_head(&self, src: &[u8]) -> Result<Option<Head>> {
        if src.len() < 2 {
            return Ok(None);
        }

        if src[0] & RSV_BITS != 0 {
            return Err(ServerError::ReservedBitsNotZero);
        }

        let fin = src[0] & FIN_BIT != 0;
        let opcode = OpCode::try_from(src[0] & OPCODE_BITS)?;
        let mask = src[1] & MASK_BIT != 0;

        let (extra, payload_len) = match src[1] & LENGTH_BITS {
            126 => {
                let Some(raw) = src.get(2..4) else {
                    return Ok(None);
                };
                (2, usize::from(u16::from_be_bytes([raw[0], raw[1]])))
            }
            127 => {
                let Some(raw) = src.get(2..10) else {
                    return Ok(None);
                };
                let mut len = [0; 8];
                len.copy_from_slice(raw);
                let len = usize::try_from(u64::from_be_bytes(len))
                    .map_err(|_| ServerError::FrameTooLarge)?;
                (8, len)
            }
            code => (0, usize::from(code)),
        };

        if opcode.is_control() && !fin {
            return Err(ServerError::ControlFrameFragmented);
        }
        if opcode.is_control() && payload_len > MAX_CONTROL_PAYLOAD {
            return Err(ServerError::ControlFrameTooLarge);
        }
        if payload_len > self.max_payload_size {
            return Err(ServerError::FrameTooLarge);
        }
        if payload_len > 0 && !mask {
            return Err(ServerError::UnmaskedFrame);
        }

        Ok(Some(Head {
            fin,
            opcode,
            mask,
            size: 2 + extra + if mask { 4 } else { 0 },
            payload_len,
        }))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(crate::options::MAX_PAYLOAD_READ)
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = ServerError;

    #[inline]
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.decode_frame(src)
    }
}

/// Encoder for unmasked server-to-client frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct Encoder;

impl codec::Encoder<Frame> for Encoder {
    type Error = ServerError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(MAX_HEAD_SIZE + frame.payload.len());
        write_frame(&frame, dst);
        Ok(())
    }
}

/// Decoder and encoder pair for use with [`tokio_util::codec::Framed`] on the server side.
#[derive(Debug, Clone, Default)]
pub struct Codec {
    decoder: Decoder,
    encoder: Encoder,
}

impl From<(Decoder, Encoder)> for Codec {
    fn from((decoder, encoder): (Decoder, Encoder)) -> Self {
        Self { decoder, encoder }
    }
}

impl codec::Decoder for Codec {
    type Item = Frame;
    type Error = ServerError;

    #[inline]
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.decoder.decode_frame(src)
    }
}

impl codec::Encoder<Frame> for Codec {
    type Error = ServerError;

    #[inline]
    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        self.encoder.encode(item, dst)
    }
}
