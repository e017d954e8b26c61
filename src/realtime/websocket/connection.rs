//! An open WebSocket connection and its read loop.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::frame::{
    CloseCode, MAX_CONTROL_PAYLOAD, Message, MessageAssembler, Opcode, WebSocketError,
    encode_close_payload, encode_frame, parse_close_payload, read_frame,
};
use super::router::MessageRouter;
use crate::http::Request;
use crate::realtime::hub::{Hub, HubMember};
use crate::realtime::lifecycle::{CloseGuard, CloseObserver, ConnectionId};
use crate::session::Transport;

/// The server end of an upgraded connection.
///
/// Sends are serialized per frame: two tasks writing at once never interleave
/// bytes, but nothing orders their messages relative to each other.
pub struct WebSocketConnection {
    id: ConnectionId,
    writer: Mutex<WriteHalf<Transport>>,
    guard: CloseGuard,
    cancel: CancellationToken,
    request: Arc<Request>,
    protocol: Option<String>,
    keepalive: parking_lot::Mutex<Option<Keepalive>>,
}

struct Keepalive {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnection")
            .field("id", &self.id)
            .field("path", &self.request.path())
            .field("closed", &self.guard.is_closed())
            .finish_non_exhaustive()
    }
}

impl WebSocketConnection {
    pub(crate) fn new(
        writer: WriteHalf<Transport>,
        request: Arc<Request>,
        protocol: Option<String>,
    ) -> Self {
        Self {
            id: ConnectionId::new(),
            writer: Mutex::new(writer),
            guard: CloseGuard::new(),
            cancel: CancellationToken::new(),
            request,
            protocol,
            keepalive: parking_lot::Mutex::new(None),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The handshake request.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The negotiated subprotocol, if the endpoint requires one.
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.guard.is_closed()
    }

    /// Runs `callback` once the connection closes (immediately if it has).
    pub fn on_closed(&self, callback: impl FnOnce(&ConnectionId) + Send + 'static) {
        self.guard.on_closed(&self.id, Box::new(callback));
    }

    /// # Errors
    ///
    /// [`WebSocketError::Closed`] after close, or the write failure.
    pub async fn send_text(&self, text: &str) -> Result<(), WebSocketError> {
        self.write_frame(Opcode::Text, text.as_bytes()).await
    }

    /// # Errors
    ///
    /// As [`send_text`](Self::send_text).
    pub async fn send_binary(&self, data: &[u8]) -> Result<(), WebSocketError> {
        self.write_frame(Opcode::Binary, data).await
    }

    /// Serializes `value` and sends it as one text message.
    ///
    /// # Errors
    ///
    /// [`WebSocketError::Serialize`], otherwise as [`send_text`](Self::send_text).
    pub async fn send_json<T>(&self, value: &T) -> Result<(), WebSocketError>
    where
        T: Serialize + ?Sized,
    {
        let text = serde_json::to_string(value)?;
        self.send_text(&text).await
    }

    /// # Errors
    ///
    /// A payload over 125 bytes is a protocol error; otherwise as
    /// [`send_text`](Self::send_text).
    pub async fn ping(&self, payload: &[u8]) -> Result<(), WebSocketError> {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::Protocol {
                code: CloseCode::PROTOCOL_ERROR,
                reason: "control frame too large",
            });
        }
        self.write_frame(Opcode::Ping, payload).await
    }

    async fn pong(&self, payload: &[u8]) -> Result<(), WebSocketError> {
        self.write_frame(Opcode::Pong, payload).await
    }

    /// Sends a close frame and ends the connection. Only the first call does
    /// anything; later calls return `Ok(())`.
    ///
    /// # Errors
    ///
    /// The write failure, if the close frame could not be sent. The
    /// connection counts as closed either way.
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<(), WebSocketError> {
        if !self.guard.close(&self.id) {
            return Ok(());
        }
        debug!(connection = %self.id, %code, reason, "closing websocket");
        self.stop_keepalive().await;

        let frame = encode_frame(Opcode::Close, &encode_close_payload(code, reason));
        let written = async {
            let mut writer = self.writer.lock().await;
            writer.write_all(&frame).await?;
            writer.flush().await?;
            writer.shutdown().await
        }
        .await;

        self.cancel.cancel();
        written.map_err(WebSocketError::from)
    }

    /// Marks the connection closed without a close frame: the peer is gone.
    pub(crate) async fn abort(&self) {
        if self.guard.close(&self.id) {
            self.cancel.cancel();
        }
        self.stop_keepalive().await;
    }

    fn start_keepalive(self: &Arc<Self>, every: Duration) {
        let cancel = self.cancel.child_token();
        let task = tokio::spawn(ping_loop(Arc::clone(self), every, cancel.clone()));
        *self.keepalive.lock() = Some(Keepalive { cancel, task });
    }

    // Must not be awaited from the ping task itself.
    async fn stop_keepalive(&self) {
        let keepalive = self.keepalive.lock().take();
        if let Some(Keepalive { cancel, task }) = keepalive {
            cancel.cancel();
            let _ = task.await;
        }
    }

    async fn write_frame(&self, opcode: Opcode, payload: &[u8]) -> Result<(), WebSocketError> {
        if self.is_closed() {
            return Err(WebSocketError::Closed);
        }
        let frame = encode_frame(opcode, payload);
        let mut writer = self.writer.lock().await;
        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = written {
            // The read loop owns teardown; wake it so it aborts the connection.
            self.cancel.cancel();
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl HubMember for WebSocketConnection {
    type Message = Message;
    type Error = WebSocketError;

    fn id(&self) -> ConnectionId {
        self.id
    }

    fn is_closed(&self) -> bool {
        self.guard.is_closed()
    }

    fn on_closed(&self, observer: CloseObserver) {
        self.guard.on_closed(&self.id, observer);
    }

    async fn deliver(&self, message: &Message) -> Result<(), WebSocketError> {
        match message {
            Message::Text(text) => self.send_text(text).await,
            Message::Binary(data) => self.send_binary(data).await,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct LoopSettings {
    pub(crate) max_message_size: usize,
    pub(crate) ping_interval: Option<Duration>,
}

#[derive(Debug)]
enum Ending {
    /// Closed by someone else, or a write failed.
    Cancelled,
    /// End of stream or a read failure.
    PeerGone,
    Close(CloseCode, &'static str),
}

// Codes a peer may put on the wire are echoed back; reserved and
// unassigned ones are a protocol error.
fn echo_code(code: CloseCode) -> CloseCode {
    match code.0 {
        1000..=1003 | 1007..=1014 | 3000..=4999 => code,
        _ => CloseCode::PROTOCOL_ERROR,
    }
}

async fn ping_loop(
    connection: Arc<WebSocketConnection>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + every, every);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = connection.ping(&[]).await {
                    debug!(connection = %connection.id, error = %e, "keepalive ping failed");
                    break;
                }
            }
        }
    }
}

/// Reads frames until the connection ends, dispatching each complete message
/// to `router` in arrival order.
///
/// However the loop ends, the connection is closed on return: the keepalive
/// task is cancelled and awaited first, so no ping races the final close
/// frame, and the close observers have run.
pub(crate) async fn run(
    connection: Arc<WebSocketConnection>,
    mut reader: ReadHalf<Transport>,
    settings: LoopSettings,
    router: &MessageRouter,
    hub: &Hub<WebSocketConnection>,
    shutdown: CancellationToken,
) {
    let id = connection.id;
    if let Some(every) = settings.ping_interval {
        connection.start_keepalive(every);
    }

    let mut assembler = MessageAssembler::new(settings.max_message_size);
    let ending = loop {
        if connection.is_closed() {
            break Ending::Cancelled;
        }

        let frame = tokio::select! {
            biased;
            () = connection.cancel.cancelled() => break Ending::Cancelled,
            () = shutdown.cancelled() => {
                break Ending::Close(CloseCode::GOING_AWAY, "server shutting down");
            }
            frame = read_frame(&mut reader, settings.max_message_size) => frame,
        };

        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => break Ending::PeerGone,
            Err(e) => match e.close_code() {
                Some(code) => {
                    warn!(connection = %id, %code, error = %e, "websocket protocol violation");
                    break Ending::Close(code, "protocol violation");
                }
                None => {
                    debug!(connection = %id, error = %e, "websocket read failed");
                    break Ending::PeerGone;
                }
            },
        };

        match frame.opcode {
            Opcode::Ping => {
                if connection.pong(&frame.payload).await.is_err() {
                    break Ending::PeerGone;
                }
            }
            Opcode::Pong => {}
            Opcode::Close => {
                let code = match parse_close_payload(&frame.payload) {
                    Ok(Some((code, _))) => echo_code(code),
                    Ok(None) => CloseCode::NORMAL,
                    Err(e) => {
                        warn!(connection = %id, error = %e, "malformed close frame");
                        e.close_code().unwrap_or(CloseCode::PROTOCOL_ERROR)
                    }
                };
                debug!(connection = %id, %code, "close frame received");
                break Ending::Close(code, "");
            }
            Opcode::Text | Opcode::Binary | Opcode::Continuation => {
                let message = match assembler.push(frame) {
                    Ok(Some(message)) => message,
                    Ok(None) => continue,
                    Err(e) => {
                        let code = e.close_code().unwrap_or(CloseCode::PROTOCOL_ERROR);
                        warn!(connection = %id, %code, error = %e, "websocket message rejected");
                        break Ending::Close(code, "invalid message");
                    }
                };

                let dispatched = AssertUnwindSafe(router.dispatch(&connection, hub, message))
                    .catch_unwind()
                    .await;
                match dispatched {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!(connection = %id, error = %e, "websocket handler failed");
                        break Ending::Close(CloseCode::INTERNAL_ERROR, "handler failure");
                    }
                    Err(_) => {
                        error!(connection = %id, "websocket handler panicked");
                        break Ending::Close(CloseCode::INTERNAL_ERROR, "handler failure");
                    }
                }
            }
        }
    };

    match ending {
        Ending::Close(code, reason) => {
            if let Err(e) = connection.close(code, reason).await {
                debug!(connection = %id, error = %e, "close frame not delivered");
            }
        }
        Ending::PeerGone | Ending::Cancelled => connection.abort().await,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::binder::HandlerError;
    use crate::realtime::websocket::frame::tests::client_frame;
    use crate::realtime::websocket::{Envelope, WsContext};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, DuplexStream};

    /// Reads one unmasked server frame: (opcode bits, payload).
    pub(crate) async fn server_frame(client: &mut DuplexStream) -> Option<(u8, Vec<u8>)> {
        let mut head = [0u8; 2];
        client.read_exact(&mut head).await.ok()?;
        assert_eq!(head[1] & 0x80, 0, "server frames are never masked");
        let len = match head[1] & 0x7F {
            126 => {
                let mut ext = [0u8; 2];
                client.read_exact(&mut ext).await.ok()?;
                usize::from(u16::from_be_bytes(ext))
            }
            127 => {
                let mut ext = [0u8; 8];
                client.read_exact(&mut ext).await.ok()?;
                usize::try_from(u64::from_be_bytes(ext)).ok()?
            }
            n => usize::from(n),
        };
        let mut payload = vec![0u8; len];
        client.read_exact(&mut payload).await.ok()?;
        Some((head[0] & 0x0F, payload))
    }

    fn request() -> Arc<Request> {
        Arc::new(Request::parse(b"GET /ws HTTP/1.1\r\n\r\n").unwrap().0)
    }

    pub(crate) type Opened = (
        Arc<WebSocketConnection>,
        ReadHalf<Transport>,
        DuplexStream,
        LoopSettings,
    );

    pub(crate) fn open(max: usize) -> Opened {
        let (server, client) = tokio::io::duplex(256 * 1024);
        let (reader, writer) = tokio::io::split(Transport::new(server, Bytes::new()));
        let connection = Arc::new(WebSocketConnection::new(writer, request(), None));
        let settings = LoopSettings {
            max_message_size: max,
            ping_interval: None,
        };
        (connection, reader, client, settings)
    }

    fn echo_router() -> MessageRouter {
        let mut router = MessageRouter::new();
        router.on("echo", |ctx: WsContext, envelope: Envelope| async move {
            ctx.reply("echo", &envelope.payload().cloned()).await?;
            Ok::<(), HandlerError>(())
        });
        router.on_unknown(|ctx: WsContext, envelope: Envelope| async move {
            ctx.connection().send_text(envelope.text()).await?;
            Ok::<(), HandlerError>(())
        });
        router
    }

    #[tokio::test]
    async fn routes_envelope_and_replies_with_id() {
        let (conn, reader, mut client, settings) = open(1024);
        let router = echo_router();
        let hub = Hub::new();
        let task = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                run(conn, reader, settings, &router, &hub, CancellationToken::new()).await
            })
        };

        let msg = br#"{"op":"echo","id":1,"payload":"hi"}"#;
        client.write_all(&client_frame(true, 0x1, msg)).await.unwrap();
        let (opcode, payload) = server_frame(&mut client).await.unwrap();
        assert_eq!(opcode, 0x1);
        assert_eq!(payload, br#"{"op":"echo","id":1,"payload":"hi"}"#);

        client.write_all(&client_frame(true, 0x8, &1000u16.to_be_bytes())).await.unwrap();
        let (opcode, payload) = server_frame(&mut client).await.unwrap();
        assert_eq!(opcode, 0x8);
        assert_eq!(&payload[..2], &1000u16.to_be_bytes());
        task.await.unwrap();
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn reassembled_fragments_reach_fallback() {
        let (conn, reader, mut client, settings) = open(1024);
        let router = echo_router();
        let hub = Hub::new();
        tokio::spawn(async move {
            run(conn, reader, settings, &router, &hub, CancellationToken::new()).await
        });

        client.write_all(&client_frame(false, 0x1, b"ab")).await.unwrap();
        client.write_all(&client_frame(true, 0x9, b"p")).await.unwrap();
        client.write_all(&client_frame(false, 0x0, b"cd")).await.unwrap();
        client.write_all(&client_frame(true, 0x0, b"ef")).await.unwrap();

        // Control frames are answered inline, between fragments.
        assert_eq!(server_frame(&mut client).await, Some((0xA, b"p".to_vec())));
        assert_eq!(server_frame(&mut client).await, Some((0x1, b"abcdef".to_vec())));
    }

    #[tokio::test]
    async fn oversized_message_closes_with_1009() {
        let (conn, reader, mut client, settings) = open(4);
        let calls = Arc::new(AtomicUsize::new(0));
        let mut router = MessageRouter::new();
        {
            let calls = Arc::clone(&calls);
            router.on_unknown(move |_ctx: WsContext, _envelope: Envelope| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<(), HandlerError>(()) }
            });
        }
        let hub = Hub::new();
        let task = tokio::spawn(async move {
            run(conn, reader, settings, &router, &hub, CancellationToken::new()).await
        });

        client.write_all(&client_frame(false, 0x1, b"abc")).await.unwrap();
        client.write_all(&client_frame(true, 0x0, b"de")).await.unwrap();

        let (opcode, payload) = server_frame(&mut client).await.unwrap();
        assert_eq!(opcode, 0x8);
        assert_eq!(&payload[..2], &1009u16.to_be_bytes());
        task.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (conn, _reader, mut client, _settings) = open(1024);
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = Arc::clone(&fired);
            conn.on_closed(move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }

        conn.close(CloseCode::NORMAL, "bye").await.unwrap();
        conn.close(CloseCode::GOING_AWAY, "again").await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(matches!(conn.send_text("late").await, Err(WebSocketError::Closed)));

        let (opcode, payload) = server_frame(&mut client).await.unwrap();
        assert_eq!(opcode, 0x8);
        assert_eq!(&payload[2..], b"bye");
        // The writer was shut down after the single close frame.
        assert!(server_frame(&mut client).await.is_none());
    }

    #[tokio::test]
    async fn handler_error_closes_with_1011() {
        let (conn, reader, mut client, settings) = open(1024);
        let mut router = MessageRouter::new();
        router.on("fail", |_ctx: WsContext, _envelope: Envelope| async {
            Err::<(), _>(HandlerError::new("boom"))
        });
        let hub = Hub::new();
        tokio::spawn(async move {
            run(conn, reader, settings, &router, &hub, CancellationToken::new()).await
        });

        client.write_all(&client_frame(true, 0x1, br#"{"op":"fail"}"#)).await.unwrap();
        let (opcode, payload) = server_frame(&mut client).await.unwrap();
        assert_eq!(opcode, 0x8);
        assert_eq!(&payload[..2], &1011u16.to_be_bytes());
    }

    #[tokio::test]
    async fn shutdown_sends_going_away() {
        let (conn, reader, mut client, settings) = open(1024);
        let router = MessageRouter::new();
        let hub = Hub::new();
        let shutdown = CancellationToken::new();
        let task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { run(conn, reader, settings, &router, &hub, shutdown).await })
        };

        shutdown.cancel();
        let (opcode, payload) = server_frame(&mut client).await.unwrap();
        assert_eq!(opcode, 0x8);
        assert_eq!(&payload[..2], &1001u16.to_be_bytes());
        task.await.unwrap();
    }

    #[tokio::test]
    async fn peer_eof_closes_without_frame_and_evicts_from_hub() {
        let (conn, reader, client, settings) = open(1024);
        let router = MessageRouter::new();
        let hub = Hub::new();
        hub.join("lobby", &conn);

        drop(client);
        run(Arc::clone(&conn), reader, settings, &router, &hub, CancellationToken::new()).await;
        assert!(conn.is_closed());
        assert!(!hub.contains_room("lobby"));
    }

    #[tokio::test]
    async fn keepalive_pings_on_interval() {
        let (conn, reader, mut client, mut settings) = open(1024);
        settings.ping_interval = Some(Duration::from_millis(20));
        let router = MessageRouter::new();
        let hub = Hub::new();
        tokio::spawn(async move {
            run(conn, reader, settings, &router, &hub, CancellationToken::new()).await
        });

        let (opcode, payload) = server_frame(&mut client).await.unwrap();
        assert_eq!(opcode, 0x9);
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn write_failure_closes_and_evicts_from_hub() {
        let (conn, reader, client, settings) = open(1024);
        let router = MessageRouter::new();
        let hub = Hub::new();
        hub.join("r", &conn);

        drop(client);
        assert!(conn.send_text("lost").await.is_err());
        assert!(!conn.is_closed());

        run(Arc::clone(&conn), reader, settings, &router, &hub, CancellationToken::new()).await;
        assert!(conn.is_closed());
        assert!(!hub.contains_room("r"));
    }

    #[tokio::test]
    async fn failed_keepalive_tears_down_the_ping_task() {
        let (conn, reader, client, mut settings) = open(1024);
        settings.ping_interval = Some(Duration::from_millis(10));
        let router = MessageRouter::new();
        let hub = Hub::new();
        hub.join("r", &conn);

        drop(client);
        run(Arc::clone(&conn), reader, settings, &router, &hub, CancellationToken::new()).await;
        assert!(conn.is_closed());
        assert!(conn.keepalive.lock().is_none());
        assert!(!hub.contains_room("r"));
    }

    #[tokio::test]
    async fn close_from_another_task_stops_keepalive_first() {
        let (conn, reader, mut client, mut settings) = open(1024);
        settings.ping_interval = Some(Duration::from_secs(3600));
        let router = MessageRouter::new();
        let hub = Hub::new();
        let task = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                run(conn, reader, settings, &router, &hub, CancellationToken::new()).await
            })
        };
        while conn.keepalive.lock().is_none() {
            tokio::task::yield_now().await;
        }

        conn.close(CloseCode::NORMAL, "done").await.unwrap();
        assert!(conn.keepalive.lock().is_none());
        let (opcode, payload) = server_frame(&mut client).await.unwrap();
        assert_eq!(opcode, 0x8);
        assert_eq!(&payload[2..], b"done");
        task.await.unwrap();
    }

    async fn close_reply(payload: &[u8]) -> Vec<u8> {
        let (conn, reader, mut client, settings) = open(1024);
        let router = MessageRouter::new();
        let hub = Hub::new();
        tokio::spawn(async move {
            run(conn, reader, settings, &router, &hub, CancellationToken::new()).await
        });
        client.write_all(&client_frame(true, 0x8, payload)).await.unwrap();
        let (opcode, payload) = server_frame(&mut client).await.unwrap();
        assert_eq!(opcode, 0x8);
        payload
    }

    #[tokio::test]
    async fn close_codes_are_echoed_or_rejected() {
        assert_eq!(&close_reply(&3000u16.to_be_bytes()).await[..2], &3000u16.to_be_bytes());
        assert_eq!(&close_reply(&1001u16.to_be_bytes()).await[..2], &1001u16.to_be_bytes());
        assert_eq!(close_reply(&[]).await[..2], 1000u16.to_be_bytes());

        for reserved in [1005u16, 1015, 1016, 2999, 5000] {
            let reply = close_reply(&reserved.to_be_bytes()).await;
            assert_eq!(reply[..2], 1002u16.to_be_bytes(), "code {reserved}");
        }
        assert_eq!(close_reply(&[0x03]).await[..2], 1002u16.to_be_bytes());
    }
}
