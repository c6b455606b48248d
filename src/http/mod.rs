//! # HTTP
//!
//! Routes `/<resource>/<action>?<query>` requests to handlers registered in a
//! [`HandlerRegistry`], usually a [`Router`].
//!
//! [`Dispatcher`] is the transport-free core: path resolution, handler lookup, parameter
//! binding, result rendering and failure mapping. [`HttpServer`] feeds it from an HTTP/1.1
//! listener built on hyper, running every handler on tokio's blocking pool so a slow handler
//! never holds up other requests.

mod dispatcher;
mod registry;

use std::{
    convert::Infallible,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex, MutexGuard},
};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    body::Incoming,
    header::{HeaderValue, CONTENT_TYPE},
    server::conn::http1,
    service::service_fn,
    Request,
};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

pub use dispatcher::{resolve_path, Dispatcher, PendingRequest, Response, NOT_FOUND};
pub use registry::{
    BoxError, HandlerRegistry, Instance, IntoReply, Json, MethodDescriptor, MissingParameter,
    Params, Reply, ResourceBuilder, ResourceDescriptor, ReturnKind, Router,
};

use crate::{
    tcp::{accept_failed, Lifecycle, Running},
    Options, Result, ServerError,
};

/// HTTP/1.1 front end for a [`Dispatcher`].
///
/// Cloning yields another handle to the same server.
#[derive(Clone)]
pub struct HttpServer {
    inner: Arc<Inner>,
}

struct Inner {
    dispatcher: Arc<Dispatcher>,
    options: Options,
    lifecycle: Mutex<Lifecycle>,
}

impl std::fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer")
            .field("local_addr", &self.local_addr())
            .field("dispatcher", &self.inner.dispatcher)
            .finish()
    }
}

impl HttpServer {
    /// Creates a stopped server dispatching to `registry`.
    pub fn new(registry: impl HandlerRegistry, options: Options) -> Self {
        Self {
            inner: Arc::new(Inner {
                dispatcher: Arc::new(Dispatcher::new(registry)),
                options,
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        }
    }

    /// Binds `options.bind_address:port` and starts serving.
    ///
    /// Starting a running server does nothing and returns the address already bound.
    ///
    /// # Errors
    ///
    /// [`ServerError::Bind`] if the port is unavailable, [`ServerError::Disposed`] after
    /// [`dispose`](Self::dispose).
    pub async fn start(&self, port: u16) -> Result<SocketAddr> {
        if let Some(local_addr) = self.inner.lifecycle().running_addr()? {
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

        match local_ip().await {
            Some(ip) => log::info!("http server listening on {local_addr} (reachable at {ip}:{})", local_addr.port()),
            None => log::info!("http server listening on {local_addr}"),
        }

        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.inner.dispatcher),
            self.inner.options.no_delay,
            token,
        ));

        Ok(local_addr)
    }

    /// Stops accepting and gracefully shuts down open connections. A no-op when stopped.
    pub fn stop(&self) -> Result<()> {
        let running = {
            let mut lifecycle = self.inner.lifecycle();
            lifecycle.running_addr()?;
            lifecycle.running.take()
        };

        if let Some(running) = running {
            running.token.cancel();
            log::info!("http server on {} stopped", running.local_addr);
        }
        Ok(())
    }

    /// Stops the server for good. Every later call fails with [`ServerError::Disposed`].
    pub fn dispose(&self) {
        if self.stop().is_ok() {
            self.inner.lifecycle().disposed = true;
        }
    }

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

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }
}

impl Inner {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        Lifecycle::lock(&self.lifecycle)
    }
}

async fn accept_loop(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    no_delay: bool,
    token: CancellationToken,
) {
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

        if let Err(err) = stream.set_nodelay(no_delay) {
            log::warn!("set_nodelay for {peer}: {err}");
        }

        tokio::spawn(serve_connection(
            stream,
            peer,
            Arc::clone(&dispatcher),
            token.child_token(),
        ));
    }

    log::debug!("http accept loop finished");
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    token: CancellationToken,
) {
    let service = service_fn(move |request: Request<Incoming>| {
        let dispatcher = Arc::clone(&dispatcher);
        async move { Ok::<_, Infallible>(handle(dispatcher, request).await) }
    });

    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = token.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    if let Err(err) = result {
        log::debug!("connection from {peer}: {err}");
    }
}

async fn handle(
    dispatcher: Arc<Dispatcher>,
    request: Request<Incoming>,
) -> hyper::Response<Full<Bytes>> {
    let uri = request.uri();
    let pending = PendingRequest::new(request.method().clone(), uri.path(), uri.query());

    let response = tokio::task::spawn_blocking(move || dispatcher.dispatch(&pending))
        .await
        .unwrap_or_else(|err| Response::error(err.to_string()));

    let mut reply = hyper::Response::new(Full::new(Bytes::from(response.body)));
    *reply.status_mut() = response.status;
    reply
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(response.content_type));
    reply
}

/// Best guess of the address other hosts on the network reach this one at.
///
/// Connecting a UDP socket sends nothing; it only makes the OS pick the outbound interface.
pub async fn local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.ok()?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 65530)).await.ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}
