//! # TCP transport
//!
//! [`TcpServer`] owns the listener, the [`ConnectionRegistry`] and one receive loop plus one
//! writer task per accepted connection. Protocol layers plug in through the
//! [`ConnectionHandler`] trait, which is notified on connect, on every received chunk and on
//! disconnect.
//!
//! Received bytes are appended to the connection's accumulation buffer *before* the handler
//! runs, so a handler consumes complete units from [`Connection::buffer`] and leaves partial
//! ones for the next receipt. Receipts for one connection are delivered in socket order by its
//! own task; different connections are handled concurrently.
//!
//! A single [`CancellationToken`] per run gates the accept loop, and every connection uses a
//! child of it. [`TcpServer::stop`] cancels it; a stopped server may be started again.
//!
//! ```no_run
//! use embedded_servers::{tcp::{Framing, TcpEvent, TcpServer}, Options};
//!
//! # async fn run() -> embedded_servers::Result<()> {
//! let (server, mut events) = TcpServer::with_events(Options::default(), Framing::LengthPrefixed);
//! server.start(9000).await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let TcpEvent::Received { id, data } = event {
//!         server.send_to(id, embedded_servers::packer::encode(&data)?)?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod registry;

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use socket2::SockRef;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

pub use registry::{Connection, ConnectionId, ConnectionRegistry, LinkState, WebSocketState};

use crate::{packer, Options, Result, ServerError};

/// Receives the notifications of a [`TcpServer`].
///
/// Callbacks run on the connection's receive task and must not block. The server is passed in
/// so handlers can reach the registry, reply or close connections.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// A socket was accepted and registered. Its receive loop starts right after.
    fn on_connected(&self, _server: &TcpServer, _id: ConnectionId, _peer: SocketAddr) {}

    /// `bytes` were read and already appended to the connection's buffer.
    fn on_received(&self, _server: &TcpServer, _id: ConnectionId, _bytes: &[u8]) {}

    /// The connection was removed from the registry.
    fn on_disconnected(&self, _server: &TcpServer, _id: ConnectionId) {}
}

/// How an [`EventChannel`] cuts the byte stream into [`TcpEvent::Received`] payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Every read chunk is forwarded as is.
    Raw,
    /// Bytes are accumulated and forwarded one [`packer`] body at a time.
    LengthPrefixed,
}

/// Transport notification forwarded by an [`EventChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcpEvent {
    Connected { id: ConnectionId, peer: SocketAddr },
    Received { id: ConnectionId, data: Bytes },
    Disconnected { id: ConnectionId },
}

/// A [`ConnectionHandler`] that turns notifications into [`TcpEvent`]s on an unbounded channel.
///
/// With [`Framing::LengthPrefixed`] a packet declaring a negative length closes the connection.
#[derive(Debug)]
pub struct EventChannel {
    framing: Framing,
    events: mpsc::UnboundedSender<TcpEvent>,
}

impl EventChannel {
    pub fn new(framing: Framing) -> (Self, mpsc::UnboundedReceiver<TcpEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { framing, events }, rx)
    }

    fn emit(&self, event: TcpEvent) {
        if self.events.send(event).is_err() {
            log::trace!("event receiver dropped");
        }
    }
}

impl ConnectionHandler for EventChannel {
    fn on_connected(&self, _server: &TcpServer, id: ConnectionId, peer: SocketAddr) {
        self.emit(TcpEvent::Connected { id, peer });
    }

    fn on_received(&self, server: &TcpServer, id: ConnectionId, _bytes: &[u8]) {
        let framing = self.framing;
        let Some((packets, violation)) = server.registry().update(id, |connection| {
            let mut packets = Vec::new();
            match framing {
                Framing::Raw => packets.push(connection.buffer.split().freeze()),
                Framing::LengthPrefixed => loop {
                    match packer::decode(&mut connection.buffer) {
                        Ok(Some(packet)) => packets.push(packet),
                        Ok(None) => break,
                        Err(err) => return (packets, Some(err)),
                    }
                },
            }
            (packets, None)
        }) else {
            return;
        };

        for data in packets {
            self.emit(TcpEvent::Received { id, data });
        }

        if let Some(err) = violation {
            log::warn!("{id}: {err}, closing");
            server.registry().update(id, |connection| connection.close());
        }
    }

    fn on_disconnected(&self, _server: &TcpServer, id: ConnectionId) {
        self.emit(TcpEvent::Disconnected { id });
    }
}

/// Accepts TCP connections and drives their receive loops.
///
/// `TcpServer` is a cheap handle: clones share the same listener and registry.
#[derive(Clone)]
pub struct TcpServer {
    inner: Arc<Inner>,
}

struct Inner {
    options: Options,
    handler: Arc<dyn ConnectionHandler>,
    registry: ConnectionRegistry,
    lifecycle: Mutex<Lifecycle>,
}

/// Run state shared by the listeners of this crate.
#[derive(Default)]
pub(crate) struct Lifecycle {
    pub(crate) running: Option<Running>,
    pub(crate) disposed: bool,
}

pub(crate) struct Running {
    pub(crate) token: CancellationToken,
    pub(crate) local_addr: SocketAddr,
}

impl Lifecycle {
    pub(crate) fn lock(lifecycle: &Mutex<Lifecycle>) -> MutexGuard<'_, Lifecycle> {
        lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Address of the running listener, or `Disposed`.
    pub(crate) fn running_addr(&self) -> Result<Option<SocketAddr>> {
        if self.disposed {
            return Err(ServerError::Disposed);
        }
        Ok(self.running.as_ref().map(|running| running.local_addr))
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("local_addr", &self.local_addr())
            .field("connections", &self.inner.registry.len())
            .finish()
    }
}

impl TcpServer {
    /// Creates a stopped server notifying `handler`.
    pub fn new(options: Options, handler: impl ConnectionHandler) -> Self {
        Self::with_handler(options, Arc::new(handler))
    }

    /// Creates a stopped server sharing an existing handler.
    pub fn with_handler(options: Options, handler: Arc<dyn ConnectionHandler>) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                handler,
                registry: ConnectionRegistry::new(),
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        }
    }

    /// Creates a stopped server whose notifications are delivered on a channel.
    pub fn with_events(
        options: Options,
        framing: Framing,
    ) -> (Self, mpsc::UnboundedReceiver<TcpEvent>) {
        let (channel, events) = EventChannel::new(framing);
        (Self::new(options, channel), events)
    }

    /// Binds `options.bind_address:port` and spawns the accept loop.
    ///
    /// Returns the bound address, which tells the actual port when `port` is 0. Calling
    /// `start` on a running server does nothing and returns the address already bound.
    ///
    /// # Errors
    ///
    /// [`ServerError::Bind`] if the address is unavailable, [`ServerError::Disposed`] after
    /// [`dispose`](Self::dispose).
    pub async fn start(&self, port: u16) -> Result<SocketAddr> {
        if let Some(local_addr) = self.running_addr()? {
            return Ok(local_addr);
        }

        let listener = TcpListener::bind((self.inner.options.bind_address, port))
            .await
            .map_err(ServerError::Bind)?;
        let local_addr = listener.local_addr()?;
        let token = CancellationToken::new();

        {
            let mut lifecycle = self.inner.lifecycle();
            if let Some(local_addr) = lifecycle.running_addr()? {
                return Ok(local_addr);
            }
            lifecycle.running = Some(Running {
                token: token.clone(),
                local_addr,
            });
        }

        log::info!("listening on {local_addr}");
        tokio::spawn(self.clone().accept_loop(listener, token));

        Ok(local_addr)
    }

    /// Stops accepting, cancels every receive loop and shuts down every live connection.
    ///
    /// Bytes already queued for a connection are written before its socket is shut down.
    /// Stopping a stopped server is a no-op.
    pub fn stop(&self) -> Result<()> {
        let running = {
            let mut lifecycle = self.inner.lifecycle();
            if lifecycle.disposed {
                return Err(ServerError::Disposed);
            }
            lifecycle.running.take()
        };

        if let Some(running) = running {
            running.token.cancel();
            log::info!("stopped listening on {}", running.local_addr);
        }

        for connection in self.inner.registry.drain() {
            connection.close();
            self.inner.handler.on_disconnected(self, connection.id());
        }

        Ok(())
    }

    /// Stops the server for good. Every later call fails with [`ServerError::Disposed`].
    pub fn dispose(&self) {
        if self.stop().is_ok() {
            self.inner.lifecycle().disposed = true;
        }
    }

    /// Queues `bytes` on every registered connection and returns how many were reached.
    pub fn send(&self, bytes: impl Into<Bytes>) -> Result<usize> {
        self.ensure_usable()?;
        Ok(self.inner.registry.broadcast(&bytes.into(), |_| true))
    }

    /// Queues `bytes` on one connection. Returns `false` if it is not registered.
    pub fn send_to(&self, id: ConnectionId, bytes: impl Into<Bytes>) -> Result<bool> {
        self.ensure_usable()?;
        Ok(self.inner.registry.send_to(id, bytes.into()))
    }

    /// Closes one connection after flushing what was already queued for it.
    pub fn close(&self, id: ConnectionId) -> Result<bool> {
        self.ensure_usable()?;
        Ok(self
            .inner
            .registry
            .update(id, |connection| connection.close())
            .is_some())
    }

    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Address of the listener while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .lifecycle()
            .running
            .as_ref()
            .map(|running| running.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.inner.lifecycle().running.is_some()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    pub(crate) fn ensure_usable(&self) -> Result<()> {
        if self.inner.lifecycle().disposed {
            Err(ServerError::Disposed)
        } else {
            Ok(())
        }
    }

    fn running_addr(&self) -> Result<Option<SocketAddr>> {
        self.inner.lifecycle().running_addr()
    }

    async fn accept_loop(self, listener: TcpListener, token: CancellationToken) {
        loop {
            let (stream, peer) = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        accept_failed(err).await;
                        continue;
                    }
                },
            };

            self.serve(stream, peer, token.child_token());
        }

        log::debug!("accept loop finished");
    }

    fn serve(&self, stream: TcpStream, peer: SocketAddr, token: CancellationToken) {
        let options = &self.inner.options;
        if let Err(err) = stream.set_nodelay(options.no_delay) {
            log::warn!("set_nodelay for {peer}: {err}");
        }

        let chunk = SockRef::from(&stream)
            .recv_buffer_size()
            .unwrap_or(options.recv_buffer_size)
            .clamp(1, options.max_read_buffer.max(1));

        let (reader, writer) = stream.into_split();
        let (outbound, rx) = mpsc::unbounded_channel();
        let id = self
            .inner
            .registry
            .insert(Connection::new(peer, outbound, token.clone()));

        log::debug!("{id} connected from {peer}");

        tokio::spawn(write_loop(id, writer, rx, token.clone()));
        self.inner.handler.on_connected(self, id, peer);
        tokio::spawn(self.clone().read_loop(id, reader, chunk, token));
    }

    async fn read_loop(
        self,
        id: ConnectionId,
        mut reader: OwnedReadHalf,
        chunk: usize,
        token: CancellationToken,
    ) {
        let mut buf = vec![0; chunk];
        let limit = self.inner.options.max_read_buffer;

        loop {
            let read = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                read = reader.read(&mut buf) => read,
            };

            let n = match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    log::debug!("{id} read failed: {err}");
                    break;
                }
            };

            match self.inner.registry.append(id, &buf[..n]) {
                None => break,
                Some(len) if len > limit => {
                    log::warn!("{id} exceeded the read buffer limit ({len} > {limit} bytes)");
                    break;
                }
                Some(_) => self.inner.handler.on_received(&self, id, &buf[..n]),
            }
        }

        if let Some(connection) = self.inner.registry.remove(id) {
            connection.close();
            log::debug!("{id} disconnected");
            self.inner.handler.on_disconnected(&self, id);
        }
    }
}

impl Inner {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        Lifecycle::lock(&self.lifecycle)
    }
}

/// Pause after a failed `accept`, so running out of descriptors does not spin the loop.
pub(crate) const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Logs a failed accept and waits before the next attempt.
pub(crate) async fn accept_failed(err: std::io::Error) {
    log::error!("accept failed: {err}, retrying in {ACCEPT_BACKOFF:?}");
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}

/// Drains a connection's outbound queue into its socket, then shuts the socket down.
async fn write_loop(
    id: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    token: CancellationToken,
) {
    loop {
        let bytes = tokio::select! {
            biased;
            bytes = rx.recv() => match bytes {
                Some(bytes) => bytes,
                None => break,
            },
            _ = token.cancelled() => break,
        };

        if let Err(err) = writer.write_all(&bytes).await {
            log::debug!("{id} write failed: {err}");
            return;
        }
    }

    while let Ok(bytes) = rx.try_recv() {
        if writer.write_all(&bytes).await.is_err() {
            return;
        }
    }

    if let Err(err) = writer.shutdown().await {
        log::trace!("{id} shutdown: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{net::Ipv4Addr, time::Duration};
    use tokio::{io::AsyncReadExt, time::timeout};

    fn local() -> Options {
        Options::default().with_bind_address(Ipv4Addr::LOCALHOST)
    }

    async fn next(events: &mut mpsc::UnboundedReceiver<TcpEvent>) -> TcpEvent {
        timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    mod lifecycle_tests {
        use super::*;

        #[tokio::test]
        async fn test_bind_failure() {
            let (first, _events) = TcpServer::with_events(local(), Framing::Raw);
            let addr = first.start(0).await.unwrap();

            let (second, _events) = TcpServer::with_events(local(), Framing::Raw);
            let err = second.start(addr.port()).await.unwrap_err();
            assert!(matches!(err, ServerError::Bind(_)), "{err}");
            assert!(!second.is_running());
        }

        #[tokio::test]
        async fn test_start_is_idempotent() {
            let (server, _events) = TcpServer::with_events(local(), Framing::Raw);
            let addr = server.start(0).await.unwrap();
            assert_eq!(server.start(0).await.unwrap(), addr);
            assert_eq!(server.local_addr(), Some(addr));
        }

        #[tokio::test]
        async fn test_stop_twice_then_restart() {
            let (server, _events) = TcpServer::with_events(local(), Framing::Raw);
            server.stop().unwrap();

            server.start(0).await.unwrap();
            server.stop().unwrap();
            server.stop().unwrap();
            assert!(!server.is_running());
            assert_eq!(server.connection_count(), 0);

            let addr = server.start(0).await.unwrap();
            assert!(server.is_running());
            TcpStream::connect(addr).await.unwrap();
        }

        #[tokio::test]
        async fn test_failed_accept_backs_off() {
            let started = std::time::Instant::now();
            accept_failed(std::io::Error::other("too many open files")).await;
            assert!(started.elapsed() >= ACCEPT_BACKOFF);
        }

        #[tokio::test]
        async fn test_disposed_fails_fast() {
            let (server, _events) = TcpServer::with_events(local(), Framing::Raw);
            server.start(0).await.unwrap();
            server.dispose();

            assert!(matches!(server.start(0).await, Err(ServerError::Disposed)));
            assert!(matches!(server.stop(), Err(ServerError::Disposed)));
            assert!(matches!(server.send("x"), Err(ServerError::Disposed)));
            assert!(!server.is_running());
        }

        #[tokio::test]
        async fn test_send_while_stopped_is_noop() {
            let (server, _events) = TcpServer::with_events(local(), Framing::Raw);
            assert_eq!(server.send("nobody").unwrap(), 0);
        }
    }

    mod event_tests {
        use super::*;

        #[tokio::test]
        async fn test_raw_chunks_and_disconnect() {
            let (server, mut events) = TcpServer::with_events(local(), Framing::Raw);
            let addr = server.start(0).await.unwrap();

            let mut client = TcpStream::connect(addr).await.unwrap();
            let TcpEvent::Connected { id, peer } = next(&mut events).await else {
                panic!("expected a connection");
            };
            assert_eq!(peer, client.local_addr().unwrap());

            client.write_all(b"ping").await.unwrap();
            let mut received = Vec::new();
            while received.len() < 4 {
                match next(&mut events).await {
                    TcpEvent::Received { id: from, data } => {
                        assert_eq!(from, id);
                        received.extend_from_slice(&data);
                    }
                    other => panic!("unexpected {other:?}"),
                }
            }
            assert_eq!(received, b"ping");
            assert_eq!(server.registry().update(id, |c| c.buffer.len()), Some(0));

            drop(client);
            assert_eq!(next(&mut events).await, TcpEvent::Disconnected { id });
            assert_eq!(server.connection_count(), 0);
        }

        #[tokio::test]
        async fn test_close_flushes_queued_bytes() {
            let (server, mut events) = TcpServer::with_events(local(), Framing::Raw);
            let addr = server.start(0).await.unwrap();

            let mut client = TcpStream::connect(addr).await.unwrap();
            let TcpEvent::Connected { id, .. } = next(&mut events).await else {
                panic!("expected a connection");
            };

            assert!(server.send_to(id, &b"bye"[..]).unwrap());
            assert!(server.close(id).unwrap());

            let mut reply = Vec::new();
            timeout(Duration::from_secs(5), client.read_to_end(&mut reply))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(reply, b"bye");
            assert_eq!(next(&mut events).await, TcpEvent::Disconnected { id });
        }

        #[tokio::test]
        async fn test_negative_packet_length_closes() {
            let (server, mut events) = TcpServer::with_events(local(), Framing::LengthPrefixed);
            let addr = server.start(0).await.unwrap();

            let mut client = TcpStream::connect(addr).await.unwrap();
            let TcpEvent::Connected { id, .. } = next(&mut events).await else {
                panic!("expected a connection");
            };

            client.write_all(&(-1i32).to_le_bytes()).await.unwrap();
            assert_eq!(next(&mut events).await, TcpEvent::Disconnected { id });
        }

        #[tokio::test]
        async fn test_stop_notifies_disconnect() {
            let (server, mut events) = TcpServer::with_events(local(), Framing::Raw);
            let addr = server.start(0).await.unwrap();

            let mut client = TcpStream::connect(addr).await.unwrap();
            let TcpEvent::Connected { id, .. } = next(&mut events).await else {
                panic!("expected a connection");
            };

            server.stop().unwrap();
            assert_eq!(next(&mut events).await, TcpEvent::Disconnected { id });

            let mut rest = Vec::new();
            let read = timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
                .await
                .unwrap();
            assert!(read.map(|n| n == 0).unwrap_or(true));
        }
    }
}
