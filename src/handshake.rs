//! # Handshake
//!
//! The HTTP Upgrade exchange that promotes a raw TCP connection to a WebSocket
//! ([RFC 6455 Section 4.2](https://datatracker.ietf.org/doc/html/rfc6455#section-4.2)).
//!
//! A request qualifies when it starts with a `GET` request line and carries both
//! `Sec-WebSocket-Key` and `Sec-WebSocket-Version`. The version must be a number but any
//! number is accepted. The answer is a fixed template:
//!
//! ```text
//! HTTP/1.1 101 Switching Protocols\r\n
//! Connection: Upgrade\r\n
//! Upgrade: websocket\r\n
//! Sec-WebSocket-Accept: <base64(sha1(key + GUID))>\r\n
//! \r\n
//! ```
//!
//! Failing to handshake is never fatal: the bytes stay in the buffer and the caller retries
//! once more data has arrived.

use base64::prelude::*;
use bytes::{Buf, Bytes, BytesMut};
use nom::{
    bytes::complete::{tag, take_till1, take_until, take_while1},
    character::complete::{space0, space1},
    sequence::preceded,
    IResult, Parser,
};
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Magic string appended to the client key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const EOL: &str = "\r\n";
const END_OF_HEAD: &[u8] = b"\r\n\r\n";

/// Reasons an upgrade request could not be answered (yet).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// The header block is not terminated yet.
    #[error("incomplete upgrade request")]
    Incomplete,
    /// The request does not start with a `GET` request line.
    #[error("not a GET request")]
    NotGet,
    /// The request line or a header line could not be parsed.
    #[error("malformed upgrade request")]
    Malformed,
    /// `Sec-WebSocket-Key` is absent.
    #[error("Sec-WebSocket-Key header is missing")]
    MissingSecWebSocketKey,
    /// `Sec-WebSocket-Version` is absent.
    #[error("Sec-WebSocket-Version header is missing")]
    MissingSecWebSocketVersion,
    /// `Sec-WebSocket-Version` is not a number.
    #[error("invalid Sec-WebSocket-Version: {0}")]
    InvalidSecWebSocketVersion(String),
}

/// The parts of an upgrade request the server cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest<'a> {
    /// Request target, e.g. `/chat`.
    pub target: &'a str,
    /// Value of `Sec-WebSocket-Key`.
    pub key: &'a str,
    /// Value of `Sec-WebSocket-Version`.
    pub version: u32,
}

/// Computes the `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &[u8]) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(WEBSOCKET_GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

/// Renders the `101 Switching Protocols` response for an accept value.
pub fn response(accept: &str) -> Bytes {
    Bytes::from(format!(
        "HTTP/1.1 101 Switching Protocols{EOL}\
         Connection: Upgrade{EOL}\
         Upgrade: websocket{EOL}\
         Sec-WebSocket-Accept: {accept}{EOL}\
         {EOL}"
    ))
}

/// Attempts the handshake on the bytes accumulated so far.
///
/// On success the request (up to and including the blank line) is removed from `buffer`
/// and the response bytes are returned. Anything the client sent after the request stays
/// in `buffer`. On failure `buffer` is left untouched.
pub fn handshake(buffer: &mut BytesMut) -> Result<Bytes, HandshakeError> {
    if buffer.len() < 3 {
        return Err(HandshakeError::Incomplete);
    }
    if !buffer.starts_with(b"GET") {
        return Err(HandshakeError::NotGet);
    }

    let end = buffer
        .windows(END_OF_HEAD.len())
        .position(|window| window == END_OF_HEAD)
        .ok_or(HandshakeError::Incomplete)?
        + END_OF_HEAD.len();

    let response = {
        // header values may carry non UTF-8 bytes, only the request line and key matter
        let head = String::from_utf8_lossy(&buffer[..end]);
        let request = parse_request(&head)?;
        log::debug!(
            "upgrade request for {} (version {})",
            request.target,
            request.version
        );
        response(&accept_key(request.key.as_bytes()))
    };

    buffer.advance(end);
    Ok(response)
}

/// Parses a complete request head (request line, headers and the blank line).
pub fn parse_request(head: &str) -> Result<UpgradeRequest<'_>, HandshakeError> {
    let (mut input, target) = request_line(head).map_err(|_| {
        if head.starts_with("GET") {
            HandshakeError::Malformed
        } else {
            HandshakeError::NotGet
        }
    })?;

    let mut key = None;
    let mut version = None;

    while !input.starts_with(EOL) {
        let (rest, (name, value)) = header(input).map_err(|_| HandshakeError::Malformed)?;
        if name.eq_ignore_ascii_case("Sec-WebSocket-Key") {
            key = Some(value);
        } else if name.eq_ignore_ascii_case("Sec-WebSocket-Version") {
            version = Some(value);
        }
        input = rest;
    }

    let key = key
        .filter(|key| !key.is_empty())
        .ok_or(HandshakeError::MissingSecWebSocketKey)?;
    let version = version.ok_or(HandshakeError::MissingSecWebSocketVersion)?;
    let version = version
        .parse()
        .map_err(|_| HandshakeError::InvalidSecWebSocketVersion(version.to_string()))?;

    Ok(UpgradeRequest {
        target,
        key,
        version,
    })
}

/// `GET <target> HTTP/<version>\r\n`
fn request_line(input: &str) -> IResult<&str, &str> {
    let (input, _) = tag("GET")(input)?;
    let (input, _) = space1(input)?;
    let (input, target) = take_till1(|c: char| c.is_ascii_whitespace())(input)?;
    let (input, _) = space1(input)?;
    let (input, _) = preceded(tag("HTTP/"), take_till1(|c: char| c == '\r')).parse(input)?;
    let (input, _) = tag(EOL)(input)?;
    Ok((input, target))
}

/// Header name characters (`tchar` in RFC 7230).
fn is_tchar(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c)
}

/// `<name>:<spaces><value>\r\n`
fn header(input: &str) -> IResult<&str, (&str, &str)> {
    let (input, name) = take_while1(is_tchar)(input)?;
    let (input, _) = tag(":")(input)?;
    let (input, _) = space0(input)?;
    let (input, value) = take_until(EOL)(input)?;
    let (input, _) = tag(EOL)(input)?;
    Ok((input, (name, value.trim_end())))
}
