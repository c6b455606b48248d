mod common;

use std::net::{Ipv4Addr, SocketAddr};

use anyhow::Result;
use embedded_servers::{
    tcp::ConnectionId,
    websocket::{WebSocketEvent, WebSocketServer},
    Options, ServerError,
};
use rand::RngCore;
use tokio::{io::AsyncWriteExt, net::TcpStream, sync::mpsc::UnboundedReceiver};

use common::{client_frame, connect, read_eof, read_frame, recv};

type Started = (WebSocketServer, UnboundedReceiver<WebSocketEvent>, SocketAddr);

async fn start(options: Options) -> Result<Started> {
    let (server, events) = WebSocketServer::new(options.with_bind_address(Ipv4Addr::LOCALHOST));
    let addr = server.start(0).await?;
    Ok((server, events, addr))
}

/// Skips connect notifications until the connection is established.
async fn established(events: &mut UnboundedReceiver<WebSocketEvent>) -> Result<ConnectionId> {
    loop {
        match recv(events).await? {
            WebSocketEvent::Established { id } => return Ok(id),
            WebSocketEvent::Connected { .. } => continue,
            other => anyhow::bail!("unexpected event {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_text_message_roundtrip() -> Result<()> {
    let (server, mut events, addr) = start(Options::default()).await?;
    let mut client = connect(addr).await?;
    let id = established(&mut events).await?;

    client.write_all(&client_frame(0x81, b"Hello")).await?;
    match recv(&mut events).await? {
        WebSocketEvent::Message { id: from, text } => {
            assert_eq!(from, id);
            assert_eq!(text, "Hello");
        }
        other => panic!("unexpected {other:?}"),
    }

    assert_eq!(server.send("echo: Hello")?, 1);
    let (first, payload) = read_frame(&mut client).await?;
    assert_eq!(first, 0x81);
    assert_eq!(payload, b"echo: Hello");
    Ok(())
}

#[tokio::test]
async fn test_broadcast_skips_unestablished() -> Result<()> {
    let (server, mut events, addr) = start(Options::default()).await?;

    let mut a = connect(addr).await?;
    established(&mut events).await?;
    let mut b = connect(addr).await?;
    established(&mut events).await?;

    let _raw = TcpStream::connect(addr).await?;
    assert!(matches!(recv(&mut events).await?, WebSocketEvent::Connected { .. }));
    assert_eq!(server.connection_count(), 3);

    assert_eq!(server.send("all")?, 2);
    assert_eq!(server.send_binary(&b"\x00\x01"[..])?, 2);

    for client in [&mut a, &mut b] {
        assert_eq!(read_frame(client).await?, (0x81, b"all".to_vec()));
        assert_eq!(read_frame(client).await?, (0x82, vec![0, 1]));
    }
    Ok(())
}

#[tokio::test]
async fn test_send_to_one_connection() -> Result<()> {
    let (server, mut events, addr) = start(Options::default()).await?;
    let mut a = connect(addr).await?;
    let a_id = established(&mut events).await?;
    let mut b = connect(addr).await?;
    established(&mut events).await?;

    assert!(server.send_to(a_id, "only a")?);
    assert!(server.send("everyone")? == 2);

    assert_eq!(read_frame(&mut a).await?.1, b"only a");
    assert_eq!(read_frame(&mut a).await?.1, b"everyone");
    assert_eq!(read_frame(&mut b).await?.1, b"everyone");
    Ok(())
}

#[tokio::test]
async fn test_handshake_split_across_writes() -> Result<()> {
    let (_server, mut events, addr) = start(Options::default()).await?;
    let mut client = TcpStream::connect(addr).await?;
    let request = common::upgrade_request("x3JJHMbDL1EzLkh9GBhXDw==");
    let (head, tail) = request.as_bytes().split_at(17);

    client.write_all(head).await?;
    client.flush().await?;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let mut tail = tail.to_vec();
    tail.extend(client_frame(0x81, b"right after"));
    client.write_all(&tail).await?;

    let response = common::read_head(&mut client).await?;
    assert!(response.contains("Sec-WebSocket-Accept: HSmrc0sMlYUkAGmm5OPpG2HaGWk=\r\n"));

    established(&mut events).await?;
    assert!(matches!(
        recv(&mut events).await?,
        WebSocketEvent::Message { text, .. } if text == "right after"
    ));
    Ok(())
}

#[tokio::test]
async fn test_large_binary_frame() -> Result<()> {
    let (_server, mut events, addr) = start(Options::default()).await?;
    let mut client = connect(addr).await?;
    established(&mut events).await?;

    let mut payload = vec![0u8; 70_000];
    rand::thread_rng().fill_bytes(&mut payload);
    client.write_all(&client_frame(0x82, &payload)).await?;

    match recv(&mut events).await? {
        WebSocketEvent::Binary { data, .. } => assert_eq!(&data[..], &payload[..]),
        other => panic!("unexpected {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_ping_gets_pong() -> Result<()> {
    let (_server, mut events, addr) = start(Options::default()).await?;
    let mut client = connect(addr).await?;
    established(&mut events).await?;

    client.write_all(&client_frame(0x89, b"are you there")).await?;
    assert_eq!(read_frame(&mut client).await?, (0x8A, b"are you there".to_vec()));
    Ok(())
}

#[tokio::test]
async fn test_close_is_echoed() -> Result<()> {
    let (server, mut events, addr) = start(Options::default()).await?;
    let mut client = connect(addr).await?;
    let id = established(&mut events).await?;

    client.write_all(&client_frame(0x88, &1000u16.to_be_bytes())).await?;
    assert_eq!(read_frame(&mut client).await?, (0x88, vec![0x03, 0xE8]));
    read_eof(&mut client).await?;

    assert!(matches!(recv(&mut events).await?, WebSocketEvent::Closed { id: closed } if closed == id));
    assert_eq!(server.connection_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_unmasked_frame_closes_only_offender() -> Result<()> {
    let (server, mut events, addr) = start(Options::default()).await?;
    let mut good = connect(addr).await?;
    established(&mut events).await?;
    let mut bad = connect(addr).await?;
    let bad_id = established(&mut events).await?;

    bad.write_all(&[0x81, 0x03, b'b', b'a', b'd']).await?;

    match recv(&mut events).await? {
        WebSocketEvent::Error { id, error } => {
            assert_eq!(id, bad_id);
            assert!(matches!(error, ServerError::UnmaskedFrame));
        }
        other => panic!("unexpected {other:?}"),
    }

    let (first, payload) = read_frame(&mut bad).await?;
    assert_eq!(first, 0x88);
    assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1002);
    read_eof(&mut bad).await?;
    assert!(matches!(recv(&mut events).await?, WebSocketEvent::Closed { id } if id == bad_id));

    good.write_all(&client_frame(0x81, b"still here")).await?;
    assert!(matches!(
        recv(&mut events).await?,
        WebSocketEvent::Message { text, .. } if text == "still here"
    ));
    assert_eq!(server.connection_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_oversized_frame_closes_with_1009() -> Result<()> {
    let (_server, mut events, addr) = start(Options::default().with_max_payload_read(16)).await?;
    let mut client = connect(addr).await?;
    established(&mut events).await?;

    client.write_all(&client_frame(0x82, &[7; 17])).await?;
    let (first, payload) = read_frame(&mut client).await?;
    assert_eq!(first, 0x88);
    assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1009);
    read_eof(&mut client).await?;
    Ok(())
}

#[tokio::test]
async fn test_stop_is_idempotent_and_restartable() -> Result<()> {
    let (server, mut events, addr) = start(Options::default()).await?;
    let mut client = connect(addr).await?;
    let id = established(&mut events).await?;

    server.stop()?;
    server.stop()?;
    assert_eq!(server.connection_count(), 0);
    assert!(matches!(recv(&mut events).await?, WebSocketEvent::Closed { id: closed } if closed == id));
    read_eof(&mut client).await?;
    assert_eq!(server.send("nobody")?, 0);

    let addr = server.start(0).await?;
    let _client = connect(addr).await?;
    established(&mut events).await?;
    assert_eq!(server.connection_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_disposed_server_fails_fast() -> Result<()> {
    let (server, _events, _addr) = start(Options::default()).await?;
    server.dispose();

    assert!(matches!(server.send("x"), Err(ServerError::Disposed)));
    assert!(matches!(server.start(0).await, Err(ServerError::Disposed)));
    assert!(matches!(server.stop(), Err(ServerError::Disposed)));
    Ok(())
}
