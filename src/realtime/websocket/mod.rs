//! WebSocket endpoints (RFC 6455).
//!
//! A [`WebSocketModule`] serves one exact path. The handshake runs as an
//! ordinary route; once the `101` head is written the module takes over the
//! connection and runs the frame loop on its own task.
//!
//! ```rust,no_run
//! use rawserve::Server;
//! use rawserve::realtime::websocket::{Envelope, WebSocketModule, WsContext};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = Server::bind("127.0.0.1:8080").await?;
//! let chat = WebSocketModule::new("/chat")
//!     .on_connect(|ctx: WsContext| async move {
//!         ctx.join("lobby");
//!     })
//!     .on("say", |ctx: WsContext, envelope: Envelope| async move {
//!         ctx.reply("said", &envelope.payload()).await?;
//!         Ok(())
//!     });
//! server.install(chat)?;
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::binder::{HandlerError, compile, session};
use crate::http::{Request, Response, StatusCode};
use crate::realtime::hub::Hub;
use crate::server::{Module, Server, ServerError};
use crate::session::{HttpSession, Transport};

pub mod connection;
pub mod frame;
pub mod handshake;
pub mod router;

pub use connection::WebSocketConnection;
pub use frame::{CloseCode, Message, WebSocketError};
pub use handshake::{Handshake, HandshakeError, accept_key};
pub use router::{BinaryHandler, Envelope, EnvelopeId, MessageHandler, MessageRouter, WsContext};

use connection::LoopSettings;

/// Default cap on a reassembled message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

impl From<WebSocketError> for HandlerError {
    fn from(error: WebSocketError) -> Self {
        HandlerError::new(error)
    }
}

/// Runs when a connection opens or closes: `Fn(WsContext) -> impl Future`.
pub trait LifecycleHook: Send + Sync + 'static {
    fn call(&self, ctx: WsContext) -> BoxFuture<'static, ()>;
}

impl<F, Fut> LifecycleHook for F
where
    F: Fn(WsContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, ctx: WsContext) -> BoxFuture<'static, ()> {
        Box::pin((self)(ctx))
    }
}

struct Endpoint {
    path: String,
    subprotocol: Option<String>,
    settings: LoopSettings,
    on_connect: Option<Arc<dyn LifecycleHook>>,
    on_disconnect: Option<Arc<dyn LifecycleHook>>,
    router: MessageRouter,
    hub: Hub<WebSocketConnection>,
}

/// A WebSocket endpoint, configured by builder methods and then installed.
pub struct WebSocketModule {
    endpoint: Endpoint,
}

impl std::fmt::Debug for WebSocketModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketModule")
            .field("path", &self.endpoint.path)
            .field("subprotocol", &self.endpoint.subprotocol)
            .field("settings", &self.endpoint.settings)
            .field("router", &self.endpoint.router)
            .finish_non_exhaustive()
    }
}

impl WebSocketModule {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            endpoint: Endpoint {
                path: path.into(),
                subprotocol: None,
                settings: LoopSettings {
                    max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
                    ping_interval: None,
                },
                on_connect: None,
                on_disconnect: None,
                router: MessageRouter::new(),
                hub: Hub::new(),
            },
        }
    }

    /// Requires clients to offer exactly this subprotocol.
    #[must_use]
    pub fn subprotocol(mut self, protocol: impl Into<String>) -> Self {
        self.endpoint.subprotocol = Some(protocol.into());
        self
    }

    #[must_use]
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.endpoint.settings.max_message_size = bytes;
        self
    }

    /// Sends a ping every `interval` while the connection is open.
    #[must_use]
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.endpoint.settings.ping_interval = Some(interval);
        self
    }

    #[must_use]
    pub fn on_connect<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(WsContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.endpoint.on_connect = Some(Arc::new(hook));
        self
    }

    /// Runs exactly once per opened connection, however it ended.
    #[must_use]
    pub fn on_disconnect<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(WsContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.endpoint.on_disconnect = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on<F, Fut>(mut self, op: impl Into<String>, handler: F) -> Self
    where
        F: Fn(WsContext, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.endpoint.router.on(op, handler);
        self
    }

    #[must_use]
    pub fn on_unknown<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(WsContext, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.endpoint.router.on_unknown(handler);
        self
    }

    #[must_use]
    pub fn on_binary<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(WsContext, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.endpoint.router.on_binary(handler);
        self
    }

    /// The rooms of this endpoint. Clones share state, so a handle taken
    /// before install keeps working afterwards.
    pub fn hub(&self) -> Hub<WebSocketConnection> {
        self.endpoint.hub.clone()
    }
}

impl Module for WebSocketModule {
    fn install(self, server: &mut Server) -> Result<(), ServerError> {
        let endpoint = Arc::new(self.endpoint);
        let path = endpoint.path.clone();

        // Every method reaches the handshake so a wrong one gets 400, not 404.
        let handshake = compile((session(),), move |session: HttpSession| {
            let endpoint = Arc::clone(&endpoint);
            async move { endpoint.upgrade(session) }
        });
        server.router_mut().any(path.as_str(), handshake)?;
        info!(path = %path, "websocket endpoint installed");
        Ok(())
    }
}

impl Endpoint {
    fn upgrade(self: Arc<Self>, session: HttpSession) -> Response {
        let handshake = match Handshake::validate(session.request(), self.subprotocol.as_deref()) {
            Ok(handshake) => handshake,
            Err(e) => {
                debug!(
                    path = %self.path,
                    status = %e.status(),
                    reason = e.reason(),
                    "websocket handshake rejected"
                );
                return e.into_response();
            }
        };

        let Some(pending) = session.try_take_transport() else {
            warn!(path = %self.path, "transport already claimed, aborting websocket handshake");
            return Response::new(StatusCode::InternalServerError).keep_alive(false);
        };

        let request = session.request_arc();
        let shutdown = session.shutdown_token().clone();
        let protocol = handshake.protocol().map(str::to_owned);
        tokio::spawn(async move {
            match pending.wait().await {
                Ok(transport) => self.serve(transport, request, protocol, shutdown).await,
                Err(e) => debug!(error = %e, "websocket handshake abandoned"),
            }
        });

        handshake.response()
    }

    async fn serve(
        &self,
        transport: Transport,
        request: Arc<Request>,
        protocol: Option<String>,
        shutdown: CancellationToken,
    ) {
        let (reader, writer) = tokio::io::split(transport);
        let connection = Arc::new(WebSocketConnection::new(writer, request, protocol));
        let id = connection.id();
        info!(connection = %id, path = %self.path, "websocket connection opened");

        let ctx = WsContext::new(Arc::clone(&connection), self.hub.clone(), None);
        let open = async {
            if let Some(hook) = &self.on_connect {
                hook.call(ctx.clone()).await;
            }
            connection::run(
                Arc::clone(&connection),
                reader,
                self.settings,
                &self.router,
                &self.hub,
                shutdown,
            )
            .await;
        };
        if AssertUnwindSafe(open).catch_unwind().await.is_err() {
            error!(connection = %id, "websocket connection task panicked");
            if let Err(e) = connection.close(CloseCode::INTERNAL_ERROR, "server error").await {
                debug!(connection = %id, error = %e, "close frame not delivered");
            }
        }
        // Closed by now unless a panic skipped the loop's own teardown.
        connection.abort().await;

        if let Some(hook) = &self.on_disconnect {
            if AssertUnwindSafe(hook.call(ctx)).catch_unwind().await.is_err() {
                error!(connection = %id, "websocket disconnect hook panicked");
            }
        }
        info!(connection = %id, path = %self.path, "websocket connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::websocket::connection::tests::server_frame;
    use crate::realtime::websocket::frame::tests::client_frame;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    const UPGRADE: &str = "Upgrade: websocket\r\nConnection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n";

    async fn serve(module: WebSocketModule) -> DuplexStream {
        let mut server = Server::bind("127.0.0.1:0").await.unwrap();
        server.install(module).unwrap();
        let (_listener, service) = server.into_service();
        let (client, server_side) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move { service.serve_connection(server_side, None).await });
        client
    }

    async fn read_head(client: &mut DuplexStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if client.read_exact(&mut byte).await.is_err() {
                break;
            }
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    #[tokio::test]
    async fn handshake_then_echo() {
        let module =
            WebSocketModule::new("/ws").on_unknown(|ctx: WsContext, env: Envelope| async move {
                ctx.connection().send_text(env.text()).await?;
                Ok::<(), HandlerError>(())
            });
        let mut client = serve(module).await;

        client
            .write_all(format!("GET /ws HTTP/1.1\r\nHost: x\r\n{UPGRADE}\r\n").as_bytes())
            .await
            .unwrap();
        let head = read_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

        client.write_all(&client_frame(true, 0x1, b"ping?")).await.unwrap();
        assert_eq!(server_frame(&mut client).await, Some((0x1, b"ping?".to_vec())));
    }

    #[tokio::test]
    async fn frames_pipelined_with_the_handshake_are_not_lost() {
        let module =
            WebSocketModule::new("/ws").on_unknown(|ctx: WsContext, env: Envelope| async move {
                ctx.connection().send_text(env.text()).await?;
                Ok::<(), HandlerError>(())
            });
        let mut client = serve(module).await;

        let mut bytes = format!("GET /ws HTTP/1.1\r\n{UPGRADE}\r\n").into_bytes();
        bytes.extend_from_slice(&client_frame(true, 0x1, b"early"));
        client.write_all(&bytes).await.unwrap();

        read_head(&mut client).await;
        assert_eq!(server_frame(&mut client).await, Some((0x1, b"early".to_vec())));
    }

    #[tokio::test]
    async fn sub_path_is_not_found() {
        let mut client = serve(WebSocketModule::new("/ws")).await;
        client
            .write_all(format!("GET /ws/extra HTTP/1.1\r\n{UPGRADE}\r\n").as_bytes())
            .await
            .unwrap();
        assert!(read_head(&mut client).await.starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[tokio::test]
    async fn bad_version_gets_426() {
        let mut client = serve(WebSocketModule::new("/ws")).await;
        let upgrade = UPGRADE.replace("Version: 13", "Version: 12");
        let request = format!("GET /ws HTTP/1.1\r\n{upgrade}\r\n");
        client.write_all(request.as_bytes()).await.unwrap();
        let head = read_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 426 Upgrade Required\r\n"));
        assert!(head.contains("Sec-WebSocket-Version: 13\r\n"));
    }

    #[tokio::test]
    async fn connect_and_disconnect_hooks_fire_once() {
        let opened = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let tx = Arc::new(parking_lot::Mutex::new(Some(tx)));

        let module = {
            let opened = Arc::clone(&opened);
            let closed = Arc::clone(&closed);
            WebSocketModule::new("/ws")
                .on_connect(move |ctx: WsContext| {
                    opened.fetch_add(1, Ordering::SeqCst);
                    async move {
                        ctx.join("all");
                    }
                })
                .on_disconnect(move |ctx: WsContext| {
                    closed.fetch_add(1, Ordering::SeqCst);
                    assert!(ctx.connection().is_closed());
                    let tx = tx.lock().take();
                    async move {
                        if let Some(tx) = tx {
                            let _ = tx.send(());
                        }
                    }
                })
        };
        let hub = module.hub();
        let mut client = serve(module).await;

        client
            .write_all(format!("GET /ws HTTP/1.1\r\n{UPGRADE}\r\n").as_bytes())
            .await
            .unwrap();
        read_head(&mut client).await;
        client.write_all(&client_frame(true, 0x8, &1000u16.to_be_bytes())).await.unwrap();

        rx.await.unwrap();
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(!hub.contains_room("all"));
    }

    #[tokio::test]
    async fn panicking_connect_hook_still_cleans_up() {
        let closed = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let tx = Arc::new(parking_lot::Mutex::new(Some(tx)));

        let module = {
            let closed = Arc::clone(&closed);
            WebSocketModule::new("/ws")
                .on_connect(|ctx: WsContext| async move {
                    ctx.join("r");
                    panic!("connect hook failed");
                })
                .on_disconnect(move |ctx: WsContext| {
                    closed.fetch_add(1, Ordering::SeqCst);
                    assert!(ctx.connection().is_closed());
                    let tx = tx.lock().take();
                    async move {
                        if let Some(tx) = tx {
                            let _ = tx.send(());
                        }
                    }
                })
        };
        let hub = module.hub();
        let mut client = serve(module).await;

        client
            .write_all(format!("GET /ws HTTP/1.1\r\n{UPGRADE}\r\n").as_bytes())
            .await
            .unwrap();
        read_head(&mut client).await;
        let (opcode, payload) = server_frame(&mut client).await.unwrap();
        assert_eq!(opcode, 0x8);
        assert_eq!(&payload[..2], &1011u16.to_be_bytes());

        rx.await.unwrap();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(!hub.contains_room("r"));
    }
}
