#![allow(dead_code)]

use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context};
use rand::Rng;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    time::timeout,
};

pub const WAIT: Duration = Duration::from_secs(5);

pub async fn recv<T>(events: &mut mpsc::UnboundedReceiver<T>) -> anyhow::Result<T> {
    timeout(WAIT, events.recv())
        .await
        .context("timed out waiting for an event")?
        .context("event channel closed")
}

/// A masked client frame with a random mask key.
pub fn client_frame(first: u8, payload: &[u8]) -> Vec<u8> {
    let mask: [u8; 4] = rand::thread_rng().gen();
    masked_frame(first, payload, mask)
}

pub fn masked_frame(first: u8, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
    let mut out = vec![first];
    match payload.len() {
        len @ 0..=125 => out.push(0x80 | len as u8),
        len @ 126..=65535 => {
            out.push(0x80 | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        }
        len => {
            out.push(0x80 | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }
    out.extend_from_slice(&mask);
    out.extend(payload.iter().enumerate().map(|(i, byte)| byte ^ mask[i % 4]));
    out
}

pub fn upgrade_request(key: &str) -> String {
    format!(
        "GET /chat HTTP/1.1\r\n\
         Host: localhost\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n"
    )
}

/// Reads until the end of an HTTP response head and returns it.
pub async fn read_head(stream: &mut TcpStream) -> anyhow::Result<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = timeout(WAIT, stream.read(&mut byte)).await??;
        if n == 0 {
            bail!("connection closed during handshake");
        }
        head.push(byte[0]);
    }
    Ok(String::from_utf8(head)?)
}

/// Connects and completes the WebSocket handshake.
pub async fn connect(addr: SocketAddr) -> anyhow::Result<TcpStream> {
    let mut stream = TcpStream::connect(addr).await?;
    stream
        .write_all(upgrade_request("dGhlIHNhbXBsZSBub25jZQ==").as_bytes())
        .await?;

    let head = read_head(&mut stream).await?;
    if !head.starts_with("HTTP/1.1 101 Switching Protocols\r\n") {
        bail!("unexpected response: {head}");
    }
    Ok(stream)
}

/// Reads one unmasked server frame and returns its first byte and payload.
pub async fn read_frame(stream: &mut TcpStream) -> anyhow::Result<(u8, Vec<u8>)> {
    timeout(WAIT, async {
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await?;
        if head[1] & 0x80 != 0 {
            bail!("server frame is masked");
        }

        let len = match head[1] & 0x7F {
            126 => usize::from(stream.read_u16().await?),
            127 => usize::try_from(stream.read_u64().await?)?,
            len => usize::from(len),
        };

        let mut payload = vec![0; len];
        stream.read_exact(&mut payload).await?;
        Ok::<_, anyhow::Error>((head[0], payload))
    })
    .await?
}

/// Waits for the peer to close, draining anything it still sends.
pub async fn read_eof(stream: &mut TcpStream) -> anyhow::Result<()> {
    let mut rest = Vec::new();
    match timeout(WAIT, stream.read_to_end(&mut rest)).await? {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::ConnectionReset => Ok(()),
        Err(err) => Err(err.into()),
    }
}
