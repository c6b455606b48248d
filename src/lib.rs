//! # embedded-servers
//! A small multi-protocol server stack meant to live inside a host process: a raw TCP
//! connection manager, a WebSocket engine (RFC 6455 handshake and frame codec), a
//! length-prefixed message packer for binary channels, and an HTTP dispatcher that routes
//! `/<resource>/<action>?<query>` requests to registered handler functions.
//!
//! It lets a host expose live debugging and control endpoints (HTML pages, text or JSON
//! actions, WebSocket push channels) without depending on an external web server.
//!
//! # Components
//!
//! - [`packer`]: stateless 4-byte length prefix framing for raw binary streams.
//! - [`tcp::TcpServer`]: accept loop, connection registry, per-connection receive loops and
//!   broadcast send. Notifications are delivered to a [`tcp::ConnectionHandler`].
//! - [`websocket::WebSocketServer`]: the WebSocket state machine layered on top of
//!   [`tcp::TcpServer`], surfacing decoded messages as [`websocket::WebSocketEvent`]s.
//! - [`http::Dispatcher`] and [`http::HttpServer`]: path to handler resolution, query
//!   parameter binding, response serialization and failure mapping.
//!
//! # WebSocket Example
//! ```no_run
//! use embedded_servers::{websocket::{WebSocketEvent, WebSocketServer}, Options};
//!
//! #[tokio::main]
//! async fn main() -> embedded_servers::Result<()> {
//!     let (server, mut events) = WebSocketServer::new(Options::default());
//!     server.start(8081).await?;
//!
//!     while let Some(event) = events.recv().await {
//!         if let WebSocketEvent::Message { text, .. } = event {
//!             server.send(format!("echo: {text}"))?;
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # HTTP Example
//! ```no_run
//! use embedded_servers::http::{HttpServer, Router};
//! use hyper::Method;
//!
//! #[derive(Default)]
//! struct Echo;
//!
//! #[tokio::main]
//! async fn main() -> embedded_servers::Result<()> {
//!     let router = Router::new().resource("echo", Echo::default, |r| {
//!         r.method("add", &["num1", "num2"], |_: &Echo, p| {
//!             let a: i32 = p.require("num1")?.parse()?;
//!             let b: i32 = p.require("num2")?.parse()?;
//!             Ok::<_, embedded_servers::http::BoxError>(format!("{a}+{b}={}", a + b))
//!         })
//!         .route(Method::GET, "sum")
//!     });
//!
//!     let server = HttpServer::new(router, Default::default());
//!     server.start(8080).await?;
//!     tokio::signal::ctrl_c().await?;
//!     server.stop()
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod codec;
pub mod frame;
pub mod handshake;
pub mod http;
mod mask;
pub mod options;
pub mod packer;
pub mod tcp;
pub mod websocket;

use thiserror::Error;

pub use frame::{CloseCode, Frame, OpCode};
pub use options::Options;

/// A result type for server operations, using [`ServerError`] as the error type.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Represents errors that can occur across the transport, protocol and dispatch layers.
///
/// The variants fall into three groups:
///
/// - Transport errors (binding, use after disposal, socket I/O)
/// - Protocol violations detected while decoding frames or packets
/// - Serialization and HTTP library errors
///
/// "Not enough bytes yet" is never an error: decoders return `Ok(None)` and the caller
/// retries once more bytes have accumulated.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The listener could not be bound, usually because the port is taken.
    #[error("failed to bind listener: {0}")]
    Bind(#[source] std::io::Error),

    /// The server instance was explicitly disposed and can no longer be used.
    #[error("server has been disposed")]
    Disposed,

    /// A client sent a data frame without the MASK bit. RFC 6455 requires every
    /// client-to-server frame carrying a payload to be masked.
    #[error("client frame is not masked")]
    UnmaskedFrame,

    /// The frame header carries an opcode that RFC 6455 does not define.
    #[error("invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// Reserved bits are set but no extension was negotiated.
    #[error("reserved bits are not zero")]
    ReservedBitsNotZero,

    /// A control frame (close, ping, pong) arrived with the FIN bit cleared.
    #[error("control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame declared a payload longer than 125 bytes.
    #[error("control frame payload exceeds 125 bytes")]
    ControlFrameTooLarge,

    /// The declared payload length exceeds the configured maximum.
    #[error("frame too large")]
    FrameTooLarge,

    /// A text frame did not contain valid UTF-8.
    #[error("invalid UTF-8")]
    InvalidUTF8,

    /// A length-prefixed packet declared a negative body length.
    #[error("negative packet length: {0}")]
    NegativeLength(i32),

    /// Wraps standard I/O errors raised by sockets.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Wraps errors from the hyper HTTP library.
    #[error(transparent)]
    Http(#[from] hyper::Error),

    /// Occurs when serializing a structured handler result fails.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
