//! Server-Sent Events endpoints.
//!
//! An [`SseModule`] answers `GET` on its path, and on any path below it, with
//! a `text/event-stream` head, then keeps the connection to push events.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::binder::{HandlerError, compile, session};
use crate::http::{Method, Request, Response, StatusCode};
use crate::realtime::hub::{BroadcastReport, Hub};
use crate::realtime::lifecycle::ConnectionId;
use crate::server::{Module, Server, ServerError};
use crate::session::{HttpSession, Transport};

pub mod connection;
pub mod event;

pub use connection::{SseConnection, SseError};
pub use event::SseEvent;

impl From<SseError> for HandlerError {
    fn from(error: SseError) -> Self {
        HandlerError::new(error)
    }
}

/// An open stream and the endpoint's hub, as seen by the lifecycle hooks.
#[derive(Debug, Clone)]
pub struct SseContext {
    connection: Arc<SseConnection>,
    hub: Hub<SseConnection>,
}

impl SseContext {
    pub fn connection(&self) -> &Arc<SseConnection> {
        &self.connection
    }

    pub fn hub(&self) -> &Hub<SseConnection> {
        &self.hub
    }

    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    /// The requested path, e.g. `/events/prices` under an `/events` endpoint.
    pub fn topic(&self) -> &str {
        self.connection.request().path()
    }

    pub fn join(&self, room: &str) -> bool {
        self.hub.join(room, &self.connection)
    }

    pub fn leave(&self, room: &str) -> bool {
        self.hub.leave(room, &self.connection.id())
    }

    /// Sends to everyone else in `room`.
    pub async fn broadcast(&self, room: &str, event: &SseEvent) -> BroadcastReport {
        self.hub.broadcast(room, event, Some(&self.connection.id())).await
    }
}

/// Runs when a stream opens or closes: `Fn(SseContext) -> impl Future`.
pub trait SseHook: Send + Sync + 'static {
    fn call(&self, ctx: SseContext) -> BoxFuture<'static, ()>;
}

impl<F, Fut> SseHook for F
where
    F: Fn(SseContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, ctx: SseContext) -> BoxFuture<'static, ()> {
        Box::pin((self)(ctx))
    }
}

struct Endpoint {
    path: String,
    keepalive: Option<Duration>,
    on_connect: Option<Arc<dyn SseHook>>,
    on_disconnect: Option<Arc<dyn SseHook>>,
    hub: Hub<SseConnection>,
}

/// An event stream endpoint.
///
/// ```rust,no_run
/// use std::time::Duration;
/// use rawserve::Server;
/// use rawserve::realtime::sse::{SseContext, SseEvent, SseModule};
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let mut server = Server::bind("127.0.0.1:8080").await?;
/// let events = SseModule::new("/events")
///     .keepalive(Duration::from_secs(15))
///     .on_connect(|ctx: SseContext| async move {
///         ctx.join("news");
///         let _ = ctx.connection().send(&SseEvent::new("welcome")).await;
///     });
/// let news = events.hub();
/// server.install(events)?;
///
/// tokio::spawn(async move {
///     news.broadcast("news", &SseEvent::new("extra!").event("headline"), None).await;
/// });
/// server.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct SseModule {
    endpoint: Endpoint,
}

impl std::fmt::Debug for SseModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseModule")
            .field("path", &self.endpoint.path)
            .field("keepalive", &self.endpoint.keepalive)
            .finish_non_exhaustive()
    }
}

impl SseModule {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            endpoint: Endpoint {
                path: path.into(),
                keepalive: None,
                on_connect: None,
                on_disconnect: None,
                hub: Hub::new(),
            },
        }
    }

    /// Sends a comment every `interval` so idle proxies keep the stream.
    #[must_use]
    pub fn keepalive(mut self, interval: Duration) -> Self {
        self.endpoint.keepalive = Some(interval);
        self
    }

    #[must_use]
    pub fn on_connect<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(SseContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.endpoint.on_connect = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_disconnect<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(SseContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.endpoint.on_disconnect = Some(Arc::new(hook));
        self
    }

    pub fn hub(&self) -> Hub<SseConnection> {
        self.endpoint.hub.clone()
    }
}

impl Module for SseModule {
    fn install(self, server: &mut Server) -> Result<(), ServerError> {
        let endpoint = Arc::new(self.endpoint);
        let wildcard = format!("{}/*", endpoint.path.trim_end_matches('/'));

        let open = compile((session(),), move |session: HttpSession| {
            let endpoint = Arc::clone(&endpoint);
            async move { endpoint.open(session) }
        });
        // `/events/*` also matches `/events` itself but never `/eventsx`.
        server.router_mut().any(wildcard.as_str(), open)?;
        info!(path = %wildcard, "event stream endpoint installed");
        Ok(())
    }
}

impl Endpoint {
    fn open(self: Arc<Self>, session: HttpSession) -> Response {
        if *session.request().method() != Method::Get {
            debug!(
                path = %self.path,
                method = %session.request().method(),
                "event stream requires GET"
            );
            return Response::new(StatusCode::MethodNotAllowed).header("Allow", "GET");
        }

        let Some(pending) = session.try_take_transport() else {
            warn!(path = %self.path, "transport already claimed, not opening event stream");
            return Response::new(StatusCode::InternalServerError).keep_alive(false);
        };

        let request = session.request_arc();
        let shutdown = session.shutdown_token().clone();
        tokio::spawn(async move {
            match pending.wait().await {
                Ok(transport) => self.serve(transport, request, shutdown).await,
                Err(e) => debug!(error = %e, "event stream abandoned"),
            }
        });

        Response::new(StatusCode::Ok)
            .header("Content-Type", "text/event-stream")
            .header("Cache-Control", "no-cache")
            .header("Connection", "keep-alive")
            .header("X-Accel-Buffering", "no")
            .head_only()
    }

    async fn serve(
        &self,
        transport: Transport,
        request: Arc<Request>,
        shutdown: CancellationToken,
    ) {
        let (reader, writer) = tokio::io::split(transport);
        let connection = Arc::new(SseConnection::new(writer, request));
        let id = connection.id();
        info!(connection = %id, path = %connection.request().path(), "event stream opened");

        let ctx = SseContext {
            connection: Arc::clone(&connection),
            hub: self.hub.clone(),
        };
        let open = async {
            if let Some(hook) = &self.on_connect {
                hook.call(ctx.clone()).await;
            }
            connection::run(Arc::clone(&connection), reader, self.keepalive, shutdown).await;
        };
        if AssertUnwindSafe(open).catch_unwind().await.is_err() {
            error!(connection = %id, "event stream task panicked");
        }
        connection.close().await;

        if let Some(hook) = &self.on_disconnect {
            if AssertUnwindSafe(hook.call(ctx)).catch_unwind().await.is_err() {
                error!(connection = %id, "event stream disconnect hook panicked");
            }
        }
        info!(connection = %id, "event stream closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    async fn serve(module: SseModule) -> DuplexStream {
        let mut server = Server::bind("127.0.0.1:0").await.unwrap();
        server.install(module).unwrap();
        let (_listener, service) = server.into_service();
        let (client, server_side) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move { service.serve_connection(server_side, None).await });
        client
    }

    async fn read_until(client: &mut DuplexStream, marker: &str) -> String {
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        while !out.ends_with(marker.as_bytes()) {
            if client.read_exact(&mut byte).await.is_err() {
                break;
            }
            out.push(byte[0]);
        }
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn stream_head_then_events() {
        let module = SseModule::new("/events").on_connect(|ctx: SseContext| async move {
            ctx.connection().send(&SseEvent::new("hello").id("1")).await.unwrap();
        });
        let mut client = serve(module).await;
        client.write_all(b"GET /events HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();

        let head = read_until(&mut client, "\r\n\r\n").await;
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Type: text/event-stream\r\n"));
        assert!(head.contains("Cache-Control: no-cache\r\n"));
        assert!(head.contains("X-Accel-Buffering: no\r\n"));
        assert!(!head.contains("Content-Length"));

        assert_eq!(read_until(&mut client, "\n\n").await, "id: 1\ndata: hello\n\n");
    }

    #[tokio::test]
    async fn sub_paths_match_but_siblings_do_not() {
        let module = SseModule::new("/events").on_connect(|ctx: SseContext| async move {
            let topic = ctx.topic().to_owned();
            ctx.connection().send(&SseEvent::new(topic)).await.unwrap();
        });
        let mut sub = serve(module).await;
        sub.write_all(b"GET /events/prices HTTP/1.1\r\n\r\n").await.unwrap();
        read_until(&mut sub, "\r\n\r\n").await;
        assert_eq!(read_until(&mut sub, "\n\n").await, "data: /events/prices\n\n");

        let mut sibling = serve(SseModule::new("/events")).await;
        sibling.write_all(b"GET /eventsx HTTP/1.1\r\n\r\n").await.unwrap();
        assert!(read_until(&mut sibling, "\r\n\r\n").await.starts_with("HTTP/1.1 404"));
    }

    #[tokio::test]
    async fn non_get_is_rejected() {
        let mut client = serve(SseModule::new("/events")).await;
        client.write_all(b"POST /events HTTP/1.1\r\nContent-Length: 0\r\n\r\n").await.unwrap();
        let head = read_until(&mut client, "\r\n\r\n").await;
        assert!(head.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
        assert!(head.contains("Allow: GET\r\n"));
    }

    #[tokio::test]
    async fn hub_broadcast_reaches_subscribers() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let tx = Arc::new(parking_lot::Mutex::new(Some(tx)));
        let module = SseModule::new("/events").on_connect(move |ctx: SseContext| {
            ctx.join("news");
            let tx = tx.lock().take();
            async move {
                if let Some(tx) = tx {
                    let _ = tx.send(());
                }
            }
        });
        let hub = module.hub();
        let mut client = serve(module).await;
        client.write_all(b"GET /events HTTP/1.1\r\n\r\n").await.unwrap();
        read_until(&mut client, "\r\n\r\n").await;
        rx.await.unwrap();

        let report = hub.broadcast("news", &SseEvent::new("flash").event("headline"), None).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(read_until(&mut client, "\n\n").await, "event: headline\ndata: flash\n\n");
    }

    #[tokio::test]
    async fn panicking_connect_hook_still_cleans_up() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let tx = Arc::new(parking_lot::Mutex::new(Some(tx)));
        let module = SseModule::new("/events")
            .on_connect(|ctx: SseContext| async move {
                ctx.join("feed");
                panic!("connect hook failed");
            })
            .on_disconnect(move |ctx: SseContext| {
                assert!(ctx.connection().is_closed());
                let tx = tx.lock().take();
                async move {
                    if let Some(tx) = tx {
                        let _ = tx.send(());
                    }
                }
            });
        let hub = module.hub();
        let mut client = serve(module).await;
        client.write_all(b"GET /events HTTP/1.1\r\n\r\n").await.unwrap();
        read_until(&mut client, "\r\n\r\n").await;

        rx.await.unwrap();
        assert!(!hub.contains_room("feed"));
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
