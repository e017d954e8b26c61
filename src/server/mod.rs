//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and serves HTTP/1.1 requests through the
//! middleware pipeline and router. Persistent connections (keep-alive) are
//! supported out of the box; a handler may take over the raw stream through
//! [`HttpSession::try_take_transport`], after which the connection loop
//! stops parsing and hands the stream over.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::binder::{JsonResultSink, ResultSink};
use crate::config::{ConfigError, ServerConfig};
use crate::http::{
    StatusCode,
    request::{Request, RequestError},
    response::Response,
};
use crate::middleware::{
    BoxResponse, Endpoint, Middleware, MiddlewareHandler, Pipeline, from_middleware,
};
use crate::router::{RouteError, Router};
use crate::security::{BasicAuthMiddleware, BasicAuthRules};
use crate::session::{AsyncStream, HttpSession, Transport, TransportSlot};

pub mod module;

pub use module::Module;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Route(#[from] RouteError),
}

/// The HTTP server.
///
/// ```rust,no_run
/// use rawserve::Server;
/// use rawserve::binder::arg;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut server = Server::bind("127.0.0.1:8080").await?;
///     server
///         .router_mut()
///         .get("/hello/:name", (arg::<String>("name"),), |name: String| async move {
///             format!("Hello, {name}!")
///         })?;
///     server.run().await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ServerConfig,
    router: Router,
    middlewares: Vec<MiddlewareHandler>,
    sink: Arc<dyn ResultSink>,
    auth_rules: BasicAuthRules,
    shutdown: CancellationToken,
}

impl Server {
    /// Binds the server with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        Self::bind_with(addr, ServerConfig::default()).await
    }

    /// Binds the server with `config`; its path prefix applies to every route.
    ///
    /// # Errors
    ///
    /// [`ServerError::Config`] for an invalid configuration, otherwise as
    /// [`bind`](Self::bind).
    pub async fn bind_with(
        addr: impl AsRef<str>,
        mut config: ServerConfig,
    ) -> Result<Self, ServerError> {
        config.validate()?;

        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            router: Router::with_prefix(config.path_prefix.clone()),
            config,
            middlewares: Vec::new(),
            sink: Arc::new(JsonResultSink),
            auth_rules: BasicAuthRules::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn router_mut(&mut self) -> &mut Router {
        &mut self.router
    }

    /// Appends a middleware; the first one added runs outermost.
    pub fn use_middleware<M: Middleware + 'static>(&mut self, middleware: M) -> &mut Self {
        self.middlewares.push(from_middleware(Arc::new(middleware)));
        self
    }

    pub fn use_handler(&mut self, handler: MiddlewareHandler) -> &mut Self {
        self.middlewares.push(handler);
        self
    }

    /// Replaces the hook that renders handler values (JSON by default).
    pub fn result_sink(&mut self, sink: impl ResultSink) -> &mut Self {
        self.sink = Arc::new(sink);
        self
    }

    /// This server's Basic-auth rules. The handle stays valid after start,
    /// so rules may be changed while serving.
    pub fn auth_rules(&self) -> &BasicAuthRules {
        &self.auth_rules
    }

    /// Cancelled when the server shuts down; upgraded connections watch it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Installs a module.
    ///
    /// # Errors
    ///
    /// The module's own configuration error.
    pub fn install<M: Module>(&mut self, module: M) -> Result<&mut Self, ServerError> {
        debug!(module = std::any::type_name::<M>(), "installing module");
        module.install(self)?;
        Ok(self)
    }

    /// Splits the server into its listener and a [`Service`] that can serve
    /// connections accepted elsewhere (e.g. after a TLS handshake).
    pub fn into_service(self) -> (TcpListener, Service) {
        let router = Arc::new(self.router);
        let sink = self.sink;
        let endpoint: Endpoint = Arc::new(move |session: HttpSession| -> BoxResponse {
            let router = Arc::clone(&router);
            let sink = Arc::clone(&sink);
            Box::pin(async move { router.dispatch(session, sink).await })
        });

        let mut middlewares = Vec::with_capacity(self.middlewares.len() + 1);
        middlewares.push(from_middleware(Arc::new(BasicAuthMiddleware::new(self.auth_rules))));
        middlewares.extend(self.middlewares);

        let service = Service {
            inner: Arc::new(ServiceInner {
                pipeline: Pipeline::new(middlewares, endpoint),
                config: self.config,
                shutdown: self.shutdown,
            }),
        };
        (self.listener, service)
    }

    /// Accepts connections until the shutdown token is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run(self) -> Result<(), ServerError> {
        let local_addr = self.local_addr;
        let (listener, service) = self.into_service();
        info!(address = %local_addr, "rawserve listening");

        let shutdown = service.shutdown_token();
        loop {
            let accepted = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (stream, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let service = service.clone();

            tokio::spawn(async move {
                if let Err(e) = service.serve_connection(stream, Some(peer_addr)).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }

        info!(address = %local_addr, "rawserve stopped accepting");
        Ok(())
    }

    /// Runs until `signal` resolves, then cancels the shutdown token: the
    /// listener stops, idle keep-alive connections close and upgraded
    /// connections are told to go away.
    ///
    /// # Errors
    ///
    /// As [`run`](Self::run).
    pub async fn run_until<F>(self, signal: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send,
    {
        let shutdown = self.shutdown.clone();
        tokio::select! {
            result = self.run() => result,
            () = signal => {
                info!("shutdown requested");
                shutdown.cancel();
                Ok(())
            }
        }
    }
}

struct ServiceInner {
    pipeline: Pipeline,
    config: ServerConfig,
    shutdown: CancellationToken,
}

/// The per-connection side of a server, cheap to clone into tasks.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

enum ReadOutcome {
    Data,
    Closed,
    TimedOut,
    Shutdown,
}

async fn read_more<S: AsyncStream>(
    stream: &mut S,
    buf: &mut BytesMut,
    idle: Option<Duration>,
    shutdown: &CancellationToken,
) -> io::Result<ReadOutcome> {
    let read = async {
        match idle {
            Some(limit) => tokio::time::timeout(limit, stream.read_buf(buf)).await.ok(),
            None => Some(stream.read_buf(buf).await),
        }
    };

    tokio::select! {
        () = shutdown.cancelled() => Ok(ReadOutcome::Shutdown),
        result = read => match result {
            None => Ok(ReadOutcome::TimedOut),
            Some(Ok(0)) => Ok(ReadOutcome::Closed),
            Some(Ok(_)) => Ok(ReadOutcome::Data),
            Some(Err(e)) => Err(e),
        },
    }
}

async fn reject<S>(stream: &mut S, status: StatusCode, body: String) -> io::Result<()>
where
    S: AsyncStream,
{
    let response = Response::new(status).body(body).keep_alive(false);
    stream.write_all(&response.into_bytes()).await?;
    stream.flush().await
}

impl Service {
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Serves one connection over its lifetime.
    ///
    /// HTTP/1.1 connections are persistent by default: one request is read
    /// per iteration until the peer closes, sends `Connection: close`, the
    /// idle timeout fires, or a handler claims the transport.
    ///
    /// # Errors
    ///
    /// I/O errors from the stream. Protocol errors are answered with an
    /// error response and end the connection normally.
    pub async fn serve_connection<S>(
        &self,
        mut stream: S,
        peer: Option<SocketAddr>,
    ) -> io::Result<()>
    where
        S: AsyncStream + 'static,
    {
        let inner = &*self.inner;
        let config = &inner.config;
        let idle = config.idle_timeout_duration();
        let mut buf = BytesMut::with_capacity(config.initial_buffer_size);

        loop {
            let (mut request, head_len) = match Request::parse(&buf) {
                Ok(pair) => pair,
                Err(RequestError::Incomplete) => {
                    if buf.len() > config.max_request_size {
                        warn!(peer = ?peer, "request too large, sending 413");
                        reject(
                            &mut stream,
                            StatusCode::PayloadTooLarge,
                            "Request entity too large".into(),
                        )
                        .await?;
                        break;
                    }
                    match read_more(&mut stream, &mut buf, idle, &inner.shutdown).await? {
                        ReadOutcome::Data => continue,
                        ReadOutcome::Closed => {
                            debug!(peer = ?peer, "connection closed by peer");
                            break;
                        }
                        ReadOutcome::TimedOut => {
                            debug!(peer = ?peer, "idle timeout");
                            if !buf.is_empty() {
                                reject(
                                    &mut stream,
                                    StatusCode::RequestTimeout,
                                    "Request timeout".into(),
                                )
                                .await?;
                            }
                            break;
                        }
                        ReadOutcome::Shutdown => break,
                    }
                }
                Err(e) => {
                    warn!(peer = ?peer, error = %e, "bad request, sending 400");
                    reject(&mut stream, StatusCode::BadRequest, format!("Bad Request: {e}")).await?;
                    break;
                }
            };

            let content_length = match request.content_length() {
                Ok(length) => length.unwrap_or(0),
                Err(e) => {
                    warn!(peer = ?peer, error = %e, "bad request, sending 400");
                    reject(&mut stream, StatusCode::BadRequest, format!("Bad Request: {e}")).await?;
                    break;
                }
            };

            let total_needed = head_len + content_length;
            if total_needed > config.max_request_size {
                warn!(peer = ?peer, "request too large, sending 413");
                reject(
                    &mut stream,
                    StatusCode::PayloadTooLarge,
                    "Request entity too large".into(),
                )
                .await?;
                break;
            }
            while buf.len() < total_needed {
                match read_more(&mut stream, &mut buf, idle, &inner.shutdown).await? {
                    ReadOutcome::Data => {}
                    _ => return Ok(()),
                }
            }

            let mut raw = buf.split_to(total_needed);
            request.set_body(raw.split_off(head_len).freeze());
            let keep_alive = request.is_keep_alive();

            debug!(
                peer = ?peer,
                method = %request.method(),
                path = %request.path(),
                "dispatching request"
            );

            let (slot, handoff) = TransportSlot::new();
            let slot = Arc::new(slot);
            let session =
                HttpSession::attached(request, peer, Arc::clone(&slot), inner.shutdown.clone());

            let response = inner.pipeline.run(session).await;
            let keep_alive = keep_alive && response.is_keep_alive();
            let response = if keep_alive { response } else { response.keep_alive(false) };

            stream.write_all(&response.into_bytes()).await?;
            stream.flush().await?;

            if slot.is_claimed() {
                debug!(peer = ?peer, buffered = buf.len(), "transport handed over");
                let leftover = buf.split().freeze();
                // A claimant that gave up drops the stream with the send.
                let _ = handoff.send(Transport::new(stream, leftover));
                return Ok(());
            }

            if !keep_alive {
                debug!(peer = ?peer, "Connection: close, shutting down");
                break;
            }
        }

        Ok(())
    }
}
