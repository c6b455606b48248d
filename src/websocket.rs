//! # WebSocket engine
//!
//! [`WebSocketServer`] layers the RFC 6455 state machine over a [`TcpServer`]. Each connection
//! starts in [`WebSocketState::Negotiating`]; its first bytes move it to
//! [`WebSocketState::HandShaking`], where the accumulation buffer is parsed as an HTTP Upgrade
//! request until a complete one is found. The `101` response is then queued, the connection
//! becomes [`WebSocketState::Established`] and every following byte is decoded as frames.
//!
//! The engine works on a [`Connection::detach`]ed copy of the buffer and state, so handshake
//! hashing and frame unmasking never hold the registry entry. Only the connection's own receive
//! task touches its buffer, and the copy is reattached before the next read is appended, so
//! buffer and state still change together. Events are emitted after reattaching.
//!
//! Frame handling:
//!
//! - Text frames become [`WebSocketEvent::Message`], binary frames [`WebSocketEvent::Binary`].
//! - Pings are answered with a pong carrying the same payload. Pongs are ignored.
//! - A close frame is echoed and the connection is closed.
//! - Fragmented messages are not reassembled: non-final data frames and continuation frames
//!   are dropped.
//! - A protocol violation sends a close frame with the matching [`CloseCode`], reports
//!   [`WebSocketEvent::Error`] and closes that connection only.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{
    codec::{self, Decoder},
    frame::{CloseCode, Frame, OpCode},
    handshake,
    tcp::{Connection, ConnectionHandler, ConnectionId, TcpServer, WebSocketState},
    Options, Result, ServerError,
};

/// Notification emitted by a [`WebSocketServer`].
#[derive(Debug)]
pub enum WebSocketEvent {
    /// A TCP peer connected. It is not a WebSocket yet.
    Connected { id: ConnectionId, peer: SocketAddr },
    /// The handshake completed: the connection is now a live WebSocket.
    Established { id: ConnectionId },
    /// A text message.
    Message { id: ConnectionId, text: String },
    /// A binary message.
    Binary { id: ConnectionId, data: Bytes },
    /// The peer violated the protocol. The connection is being closed.
    Error { id: ConnectionId, error: ServerError },
    /// The connection is gone.
    Closed { id: ConnectionId },
}

impl WebSocketEvent {
    /// Connection the event refers to.
    pub fn id(&self) -> ConnectionId {
        match *self {
            Self::Connected { id, .. }
            | Self::Established { id }
            | Self::Message { id, .. }
            | Self::Binary { id, .. }
            | Self::Error { id, .. }
            | Self::Closed { id } => id,
        }
    }
}

/// Per-connection protocol logic, run by the transport on every receipt.
struct Engine {
    decoder: Decoder,
    check_utf8: bool,
    events: mpsc::UnboundedSender<WebSocketEvent>,
}

impl Engine {
    fn new(options: &Options, events: mpsc::UnboundedSender<WebSocketEvent>) -> Self {
        Self {
            decoder: Decoder::new(options.max_payload_read),
            check_utf8: options.check_utf8,
            events,
        }
    }

    fn emit(&self, event: WebSocketEvent) {
        if self.events.send(event).is_err() {
            log::trace!("websocket event receiver dropped");
        }
    }

    /// Consumes as much of the connection's buffer as the current state allows.
    fn advance(&self, connection: &mut Connection) -> Vec<WebSocketEvent> {
        let id = connection.id();
        let mut events = Vec::new();

        if connection.state == WebSocketState::Negotiating {
            connection.state = WebSocketState::HandShaking;
        }

        if connection.state == WebSocketState::HandShaking {
            match handshake::handshake(&mut connection.buffer) {
                Ok(response) => {
                    connection.send(response);
                    connection.state = WebSocketState::Established;
                    log::debug!("{id} established");
                    events.push(WebSocketEvent::Established { id });
                }
                Err(err) => {
                    log::trace!("{id} handshake not ready: {err}");
                    return events;
                }
            }
        }

        while !connection.is_closing() {
            let frame = match self.decoder.decode_frame(&mut connection.buffer) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    events.push(self.violation(connection, err));
                    break;
                }
            };

            match self.on_frame(connection, frame) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(err) => {
                    events.push(self.violation(connection, err));
                    break;
                }
            }
        }

        events
    }

    fn on_frame(
        &self,
        connection: &mut Connection,
        frame: Frame,
    ) -> Result<Option<WebSocketEvent>> {
        let id = connection.id();

        match frame.opcode {
            OpCode::Text | OpCode::Binary if !frame.fin => {
                log::debug!("{id} dropped a fragmented {:?} frame", frame.opcode);
                Ok(None)
            }
            OpCode::Continuation => {
                log::debug!("{id} dropped a continuation frame");
                Ok(None)
            }
            OpCode::Text => {
                if self.check_utf8 && !frame.is_utf8() {
                    return Err(ServerError::InvalidUTF8);
                }
                Ok(Some(WebSocketEvent::Message {
                    id,
                    text: frame.to_text(),
                }))
            }
            OpCode::Binary => Ok(Some(WebSocketEvent::Binary {
                id,
                data: frame.payload,
            })),
            OpCode::Ping => {
                connection.send(codec::encode(&Frame::pong(frame.payload)));
                Ok(None)
            }
            OpCode::Pong => Ok(None),
            OpCode::Close => {
                log::debug!("{id} close requested ({:?})", frame.close_code());
                connection.send(codec::encode(&Frame::close_raw(frame.payload)));
                connection.close();
                Ok(None)
            }
        }
    }

    fn violation(&self, connection: &mut Connection, error: ServerError) -> WebSocketEvent {
        let id = connection.id();
        let code = CloseCode::for_error(&error);
        log::warn!("{id} protocol violation: {error}, closing with {}", u16::from(code));

        connection.send(codec::encode(&Frame::close(code, error.to_string())));
        connection.buffer.clear();
        connection.close();

        WebSocketEvent::Error { id, error }
    }
}

impl ConnectionHandler for Engine {
    fn on_connected(&self, _server: &TcpServer, id: ConnectionId, peer: SocketAddr) {
        self.emit(WebSocketEvent::Connected { id, peer });
    }

    fn on_received(&self, server: &TcpServer, id: ConnectionId, _bytes: &[u8]) {
        let Some(mut work) = server.registry().update(id, Connection::detach) else {
            return;
        };

        let events = self.advance(&mut work);
        server
            .registry()
            .update(id, |connection| connection.reattach(work));

        for event in events {
            self.emit(event);
        }
    }

    fn on_disconnected(&self, _server: &TcpServer, id: ConnectionId) {
        self.emit(WebSocketEvent::Closed { id });
    }
}

/// A WebSocket server over raw TCP.
///
/// Cloning yields another handle to the same server.
#[derive(Debug, Clone)]
pub struct WebSocketServer {
    tcp: TcpServer,
}

impl WebSocketServer {
    /// Creates a stopped server and the channel its events are delivered on.
    pub fn new(options: Options) -> (Self, mpsc::UnboundedReceiver<WebSocketEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let engine = Engine::new(&options, events);
        let tcp = TcpServer::new(options, engine);
        (Self { tcp }, rx)
    }

    /// See [`TcpServer::start`].
    pub async fn start(&self, port: u16) -> Result<SocketAddr> {
        self.tcp.start(port).await
    }

    /// See [`TcpServer::stop`].
    pub fn stop(&self) -> Result<()> {
        self.tcp.stop()
    }

    /// See [`TcpServer::dispose`].
    pub fn dispose(&self) {
        self.tcp.dispose()
    }

    /// Sends `text` as one final text frame to every established connection.
    ///
    /// Returns the number of connections it was queued on.
    pub fn send(&self, text: impl Into<String>) -> Result<usize> {
        self.broadcast(&Frame::text(text.into()))
    }

    /// Sends `data` as one final binary frame to every established connection.
    pub fn send_binary(&self, data: impl Into<Bytes>) -> Result<usize> {
        self.broadcast(&Frame::binary(data))
    }

    /// Sends `text` to one connection. Returns `false` unless it is established.
    pub fn send_to(&self, id: ConnectionId, text: impl Into<String>) -> Result<bool> {
        self.send_frame(id, &Frame::text(text.into()))
    }

    /// Sends any frame to one established connection.
    pub fn send_frame(&self, id: ConnectionId, frame: &Frame) -> Result<bool> {
        self.tcp.ensure_usable()?;
        let bytes = codec::encode(frame);
        Ok(self
            .tcp
            .registry()
            .update(id, |connection| {
                connection.state == WebSocketState::Established && connection.send(bytes)
            })
            .unwrap_or(false))
    }

    /// Sends a normal close frame to one connection and closes it.
    pub fn close(&self, id: ConnectionId) -> Result<bool> {
        self.send_frame(id, &Frame::close(CloseCode::Normal, b""))?;
        self.tcp.close(id)
    }

    /// Number of accepted TCP connections, handshaken or not.
    pub fn connection_count(&self) -> usize {
        self.tcp.connection_count()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.tcp.local_addr()
    }

    /// The underlying transport.
    pub fn tcp(&self) -> &TcpServer {
        &self.tcp
    }

    fn broadcast(&self, frame: &Frame) -> Result<usize> {
        self.tcp.ensure_usable()?;
        let bytes = codec::encode(frame);
        Ok(self.tcp.registry().broadcast(&bytes, |connection| {
            connection.state == WebSocketState::Established
        }))
    }
}
