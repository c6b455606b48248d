//! Server configuration.

use std::net::{IpAddr, Ipv4Addr};

/// The maximum allowed payload size for a single frame, set to 1 MiB.
///
/// Frames declaring a larger payload are rejected with [`crate::ServerError::FrameTooLarge`].
pub const MAX_PAYLOAD_READ: usize = 1024 * 1024;

/// The maximum allowed size of a connection's accumulation buffer, set to 2 MiB.
///
/// A peer that keeps sending bytes that never complete a protocol unit gets disconnected
/// once its buffer grows past this size.
pub const MAX_READ_BUFFER: usize = 2 * 1024 * 1024;

/// Read chunk size used when the socket's receive buffer size cannot be queried.
pub const DEFAULT_RECV_BUFFER: usize = 8 * 1024;

/// Configuration shared by [`TcpServer`](crate::tcp::TcpServer),
/// [`WebSocketServer`](crate::websocket::WebSocketServer) and
/// [`HttpServer`](crate::http::HttpServer).
///
/// ```
/// use embedded_servers::Options;
///
/// let options = Options::default()
///     .with_max_payload_read(64 * 1024)
///     .without_utf8();
/// assert_eq!(options.max_payload_read, 64 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    /// Address the listener binds to. Defaults to `0.0.0.0`.
    pub bind_address: IpAddr,
    /// Fallback size of the per-read buffer.
    ///
    /// Each connection reads in chunks sized to the socket's `SO_RCVBUF`; this value is
    /// only used when that size is unavailable.
    pub recv_buffer_size: usize,
    /// Maximum payload length accepted in a single WebSocket frame.
    pub max_payload_read: usize,
    /// Maximum number of unconsumed bytes kept per connection.
    pub max_read_buffer: usize,
    /// Sets `TCP_NODELAY` on accepted sockets.
    pub no_delay: bool,
    /// Validate that text frames carry UTF-8.
    pub check_utf8: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            recv_buffer_size: DEFAULT_RECV_BUFFER,
            max_payload_read: MAX_PAYLOAD_READ,
            max_read_buffer: MAX_READ_BUFFER,
            no_delay: true,
            check_utf8: true,
        }
    }
}

impl Options {
    /// Binds the listener to `address` instead of every interface.
    pub fn with_bind_address(self, address: impl Into<IpAddr>) -> Self {
        Self {
            bind_address: address.into(),
            ..self
        }
    }

    /// Sets the fallback read chunk size.
    pub fn with_recv_buffer_size(self, size: usize) -> Self {
        Self {
            recv_buffer_size: size.max(1),
            ..self
        }
    }

    /// Sets the largest frame payload the server accepts.
    pub fn with_max_payload_read(self, size: usize) -> Self {
        Self {
            max_payload_read: size,
            ..self
        }
    }

    /// Sets the largest accumulation buffer tolerated per connection.
    pub fn with_max_read_buffer(self, size: usize) -> Self {
        Self {
            max_read_buffer: size,
            ..self
        }
    }

    /// Toggles `TCP_NODELAY` on accepted sockets.
    pub fn with_no_delay(self, no_delay: bool) -> Self {
        Self { no_delay, ..self }
    }

    /// Enables UTF-8 validation of text frames.
    pub fn with_utf8(self) -> Self {
        Self {
            check_utf8: true,
            ..self
        }
    }

    /// Disables UTF-8 validation of text frames. Invalid sequences are then replaced
    /// when the payload is converted to a string.
    pub fn without_utf8(self) -> Self {
        Self {
            check_utf8: false,
            ..self
        }
    }
}
