//! Connection registry.
//!
//! The registry is the only structure touched concurrently by many I/O tasks. Every
//! connection lives in a [`DashMap`] keyed by [`ConnectionId`]; read-modify-write sequences go
//! through [`ConnectionRegistry::update`], which holds the entry's shard lock for the whole
//! closure so concurrent receipts for the same connection can never lose an update.

use std::{
    fmt,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Identifies one accepted TCP peer for the lifetime of its registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Raw numeric value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Transport-level lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Accepted, socket being set up, not registered yet.
    Connecting,
    /// Registered and receiving.
    Connected,
    /// Removed from the registry.
    Disconnected,
}

/// WebSocket protocol state of a connection.
///
/// Transitions only move forward: `Negotiating -> HandShaking -> Established`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WebSocketState {
    /// Just accepted, no bytes classified yet.
    #[default]
    Negotiating,
    /// Bytes are being parsed as an HTTP Upgrade request.
    HandShaking,
    /// Handshake done, every further byte belongs to a frame.
    Established,
}

/// One accepted TCP peer.
///
/// `buffer` holds the bytes received but not yet consumed as a protocol unit.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    link: LinkState,
    /// Accumulation buffer.
    pub buffer: BytesMut,
    /// WebSocket state tag. Stays `Negotiating` on plain TCP servers.
    pub state: WebSocketState,
    outbound: mpsc::UnboundedSender<Bytes>,
    closer: CancellationToken,
}

impl Connection {
    /// Creates an unregistered connection.
    ///
    /// `outbound` feeds the connection's writer task and `closer` stops both its receive loop
    /// and its writer.
    pub fn new(
        peer: SocketAddr,
        outbound: mpsc::UnboundedSender<Bytes>,
        closer: CancellationToken,
    ) -> Self {
        Self {
            id: ConnectionId(0),
            peer,
            link: LinkState::Connecting,
            buffer: BytesMut::new(),
            state: WebSocketState::default(),
            outbound,
            closer,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address (host:port).
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn link(&self) -> LinkState {
        self.link
    }

    /// Queues `bytes` for the writer task. Returns `false` if the writer is gone.
    pub fn send(&self, bytes: Bytes) -> bool {
        self.outbound.send(bytes).is_ok()
    }

    /// Asks the receive loop and the writer to stop. Bytes queued before the call are still
    /// flushed before the socket is shut down.
    pub fn close(&self) {
        self.closer.cancel();
    }

    pub fn is_closing(&self) -> bool {
        self.closer.is_cancelled()
    }

    /// Moves the accumulation buffer into a working copy that can be processed without
    /// holding the registry entry. The copy shares the outbound queue and the closer.
    ///
    /// Only the connection's own receive task appends to the buffer, so the copy must be
    /// handed back with [`reattach`](Self::reattach) before the next append.
    pub fn detach(&mut self) -> Connection {
        Connection {
            id: self.id,
            peer: self.peer,
            link: self.link,
            buffer: std::mem::take(&mut self.buffer),
            state: self.state,
            outbound: self.outbound.clone(),
            closer: self.closer.clone(),
        }
    }

    /// Takes back the buffer and state of a copy made by [`detach`](Self::detach).
    pub fn reattach(&mut self, mut detached: Connection) {
        detached.buffer.unsplit(std::mem::take(&mut self.buffer));
        self.buffer = detached.buffer;
        self.state = detached.state;
    }
}

/// Concurrent set of live connections.
///
/// Closures passed to [`update`](Self::update) and [`broadcast`](Self::broadcast) run under a
/// shard lock and must not call back into the registry.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Connection>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `connection`, assigns its id and marks it connected.
    pub fn insert(&self, mut connection: Connection) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        connection.id = id;
        connection.link = LinkState::Connected;
        self.connections.insert(id, connection);
        id
    }

    /// Unregisters a connection and hands it back marked disconnected.
    pub fn remove(&self, id: ConnectionId) -> Option<Connection> {
        self.connections.remove(&id).map(|(_, mut connection)| {
            connection.link = LinkState::Disconnected;
            connection
        })
    }

    /// Removes every connection.
    pub fn drain(&self) -> Vec<Connection> {
        let ids: Vec<ConnectionId> = self.ids();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Ids of the currently registered connections, in no particular order.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    pub fn peer(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.connections.get(&id).map(|connection| connection.peer)
    }

    /// Runs `f` with exclusive access to one connection.
    ///
    /// Returns `None` if the connection is not registered.
    pub fn update<R>(&self, id: ConnectionId, f: impl FnOnce(&mut Connection) -> R) -> Option<R> {
        let mut connection = self.connections.get_mut(&id)?;
        Some(f(&mut connection))
    }

    /// Appends received bytes to a connection's accumulation buffer and returns the new
    /// buffer length.
    pub fn append(&self, id: ConnectionId, bytes: &[u8]) -> Option<usize> {
        self.update(id, |connection| {
            connection.buffer.extend_from_slice(bytes);
            connection.buffer.len()
        })
    }

    /// Queues `bytes` on every connection accepted by `filter`. Returns how many
    /// connections the bytes were queued on.
    pub fn broadcast(&self, bytes: &Bytes, filter: impl Fn(&Connection) -> bool) -> usize {
        self.connections
            .iter()
            .filter(|entry| filter(entry.value()))
            .filter(|entry| entry.value().send(bytes.clone()))
            .count()
    }

    /// Queues `bytes` on a single connection.
    pub fn send_to(&self, id: ConnectionId, bytes: Bytes) -> bool {
        self.connections
            .get(&id)
            .is_some_and(|connection| connection.send(bytes))
    }
}
