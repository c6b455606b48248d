//! # Packer
//!
//! Length-prefixed framing for raw binary channels that speak neither HTTP nor WebSocket.
//!
//! Every packet is a 4-byte header followed by the body:
//!
//! ```text
//! +--------------------------+------------------------------+
//! | length: i32 little-endian|  body (length bytes)         |
//! +--------------------------+------------------------------+
//! ```
//!
//! The header is a signed 32-bit integer in little-endian byte order and always equals the
//! body length. The same layout is used in both directions; there is no version or checksum
//! field.
//!
//! [`encode`] and [`decode`] are stateless. [`decode`] consumes exactly one packet from the
//! front of an accumulation buffer and leaves the rest untouched, so a buffer filled by
//! partial or batched reads can be drained with repeated calls. [`PacketCodec`] wraps the
//! same logic for use with [`tokio_util::codec::Framed`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec;

use crate::{Result, ServerError};

/// Size of the length header in bytes.
pub const HEADER_LEN: usize = std::mem::size_of::<i32>();

/// Prepends the length header to `payload`.
///
/// Fails with [`ServerError::FrameTooLarge`] if the payload does not fit in an `i32`.
pub fn encode(payload: &[u8]) -> Result<Bytes> {
    let mut dst = BytesMut::with_capacity(HEADER_LEN + payload.len());
    encode_into(payload, &mut dst)?;
    Ok(dst.freeze())
}

/// Appends one packet carrying `payload` to `dst`.
pub fn encode_into(payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    let len = i32::try_from(payload.len()).map_err(|_| ServerError::FrameTooLarge)?;
    dst.reserve(HEADER_LEN + payload.len());
    dst.put_i32_le(len);
    dst.extend_from_slice(payload);
    Ok(())
}

/// Takes one packet body from the front of `buffer`.
///
/// # Returns
/// - `Ok(Some(body))` when a whole packet was available; header and body are removed from
///   `buffer` and any trailing bytes stay in place for the next call.
/// - `Ok(None)` when fewer than [`HEADER_LEN`] bytes are present or the declared body is not
///   fully buffered yet. `buffer` is left unchanged.
/// - `Err(ServerError::NegativeLength)` when the header declares a negative length.
pub fn decode(buffer: &mut BytesMut) -> Result<Option<Bytes>> {
    let Some(len) = peek_len(buffer)? else {
        return Ok(None);
    };

    if buffer.len() - HEADER_LEN < len {
        return Ok(None);
    }

    buffer.advance(HEADER_LEN);
    Ok(Some(buffer.split_to(len).freeze()))
}

fn peek_len(buffer: &[u8]) -> Result<Option<usize>> {
    let Some(header) = buffer.get(..HEADER_LEN) else {
        return Ok(None);
    };

    let mut raw = [0; HEADER_LEN];
    raw.copy_from_slice(header);
    let len = i32::from_le_bytes(raw);

    usize::try_from(len)
        .map(Some)
        .map_err(|_| ServerError::NegativeLength(len))
}

/// [`tokio_util`] codec speaking the length-prefixed packet format.
///
/// Decoding yields packet bodies; encoding accepts anything that can be viewed as bytes.
///
/// ```
/// use bytes::BytesMut;
/// use embedded_servers::packer::PacketCodec;
/// use tokio_util::codec::{Decoder, Encoder};
///
/// let mut codec = PacketCodec::default();
/// let mut buf = BytesMut::new();
/// codec.encode(&b"ping"[..], &mut buf).unwrap();
/// assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b"ping"[..]);
/// ```
#[derive(Debug, Clone)]
pub struct PacketCodec {
    max_len: usize,
}

impl PacketCodec {
    /// Creates a codec that rejects packets whose body is larger than `max_len`.
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(crate::options::MAX_PAYLOAD_READ)
    }
}

impl codec::Decoder for PacketCodec {
    type Item = Bytes;
    type Error = ServerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if let Some(len) = peek_len(src)? {
            if len > self.max_len {
                return Err(ServerError::FrameTooLarge);
            }
            // reserve up front so large bodies don't reallocate on every read
            src.reserve((HEADER_LEN + len).saturating_sub(src.len()));
        }

        decode(src)
    }
}

impl<T: AsRef<[u8]>> codec::Encoder<T> for PacketCodec {
    type Error = ServerError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<()> {
        let payload = item.as_ref();
        if payload.len() > self.max_len {
            return Err(ServerError::FrameTooLarge);
        }
        encode_into(payload, dst)
    }
}
