//! End-to-end tests over real TCP sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rawserve::Server;
use rawserve::binder::{HandlerError, Json, arg};
use rawserve::config::ServerConfig;
use rawserve::middleware::LoggerMiddleware;
use rawserve::realtime::sse::{SseContext, SseEvent, SseModule};
use rawserve::realtime::websocket::{Envelope, Message, WebSocketModule, WsContext};
use rawserve::realtime::Hub;
use rawserve::security::BasicAuth;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Notify, oneshot};
use tracing_subscriber::EnvFilter;

const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct App {
    addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    ws_hub: Hub<rawserve::realtime::WebSocketConnection>,
    sse_hub: Hub<rawserve::realtime::SseConnection>,
    sse_ready: Arc<Notify>,
}

impl Drop for App {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

async fn start() -> App {
    init_tracing();
    let config = ServerConfig::default().path_prefix("/api");
    let mut server = Server::bind_with("127.0.0.1:0", config).await.unwrap();
    server.use_middleware(LoggerMiddleware);

    server
        .router_mut()
        .get("/items/:id", (arg::<u64>("id"),), |id: u64| async move {
            Json(serde_json::json!({ "id": id }))
        })
        .unwrap();
    server.install(BasicAuth::new("/api/admin", "ops", "root", "hunter2")).unwrap();

    let chat = WebSocketModule::new("/ws")
        .ping_interval(Duration::from_secs(30))
        .on("echo", |ctx: WsContext, env: Envelope| async move {
            ctx.reply("echo", &env.payload()).await?;
            Ok::<(), HandlerError>(())
        })
        .on("join", |ctx: WsContext, env: Envelope| async move {
            let room: String = env.payload_as()?;
            ctx.join(&room);
            ctx.reply("joined", &room).await?;
            Ok::<(), HandlerError>(())
        })
        .on("say", |ctx: WsContext, env: Envelope| async move {
            let text: String = env.payload_as()?;
            ctx.broadcast("lobby", &Message::Text(text)).await;
            Ok::<(), HandlerError>(())
        });
    let ws_hub = chat.hub();
    server.install(chat).unwrap();

    let sse_ready = Arc::new(Notify::new());
    let events = {
        let ready = Arc::clone(&sse_ready);
        SseModule::new("/events").on_connect(move |ctx: SseContext| {
            ctx.join("feed");
            ready.notify_one();
            async {}
        })
    };
    let sse_hub = events.hub();
    server.install(events).unwrap();

    let addr = server.local_addr();
    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(server.run_until(async move {
        let _ = stopped.await;
    }));

    App {
        addr,
        stop: Some(stop),
        ws_hub,
        sse_hub,
        sse_ready,
    }
}

async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

fn masked_text(text: &str) -> Vec<u8> {
    let mask = [0x11, 0x22, 0x33, 0x44];
    let payload = text.as_bytes();
    assert!(payload.len() < 126);
    let mut frame = vec![0x81, 0x80 | payload.len() as u8];
    frame.extend_from_slice(&mask);
    frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    frame
}

async fn read_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await.unwrap();
    let len = match head[1] & 0x7F {
        126 => {
            let mut ext = [0u8; 2];
            stream.read_exact(&mut ext).await.unwrap();
            usize::from(u16::from_be_bytes(ext))
        }
        n => usize::from(n),
    };
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
    (head[0] & 0x0F, payload)
}

async fn open_websocket(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET /api/ws HTTP/1.1\r\nHost: test\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Key: {KEY}\r\nSec-WebSocket-Version: 13\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{head}");
    assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    stream
}

#[tokio::test]
async fn http_routes_and_auth() {
    let app = start().await;
    let mut stream = TcpStream::connect(app.addr).await.unwrap();

    stream
        .write_all(b"GET /api/items/42 HTTP/1.1\r\nHost: test\r\n\r\n")
        .await
        .unwrap();
    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Content-Type: application/json\r\n"));
    let mut body = vec![0u8; r#"{"id":42}"#.len()];
    stream.read_exact(&mut body).await.unwrap();
    assert_eq!(body, br#"{"id":42}"#);

    // Same keep-alive connection.
    stream
        .write_all(b"GET /api/admin/stats HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 401 Unauthorized\r\n"));
    assert!(head.contains("WWW-Authenticate: Basic realm=\"ops\"\r\n"));
}

#[tokio::test]
async fn websocket_echo_and_room_broadcast() {
    let app = start().await;
    let mut alice = open_websocket(app.addr).await;
    let mut bob = open_websocket(app.addr).await;

    alice
        .write_all(&masked_text(r#"{"op":"echo","id":"a1","payload":{"n":1}}"#))
        .await
        .unwrap();
    let (opcode, payload) = read_frame(&mut alice).await;
    assert_eq!(opcode, 0x1);
    assert_eq!(payload, br#"{"op":"echo","id":"a1","payload":{"n":1}}"#);

    for client in [&mut alice, &mut bob] {
        client
            .write_all(&masked_text(r#"{"op":"join","payload":"lobby"}"#))
            .await
            .unwrap();
        let (_, payload) = read_frame(client).await;
        assert_eq!(payload, br#"{"op":"joined","payload":"lobby"}"#);
    }

    alice
        .write_all(&masked_text(r#"{"op":"say","payload":"hi bob"}"#))
        .await
        .unwrap();
    assert_eq!(read_frame(&mut bob).await, (0x1, b"hi bob".to_vec()));
}

#[tokio::test]
async fn departed_websocket_client_leaves_its_rooms() {
    let app = start().await;
    let mut client = open_websocket(app.addr).await;
    client
        .write_all(&masked_text(r#"{"op":"join","payload":"lobby"}"#))
        .await
        .unwrap();
    read_frame(&mut client).await;
    assert!(app.ws_hub.contains_room("lobby"));

    drop(client);
    tokio::time::timeout(Duration::from_secs(5), async {
        while app.ws_hub.contains_room("lobby") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn websocket_wrong_version_is_refused() {
    let app = start().await;
    let mut stream = TcpStream::connect(app.addr).await.unwrap();
    let request = format!(
        "GET /api/ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Key: {KEY}\r\nSec-WebSocket-Version: 8\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 426 Upgrade Required\r\n"));
    assert!(head.contains("Sec-WebSocket-Version: 13\r\n"));
}

#[tokio::test]
async fn server_shutdown_sends_going_away() {
    let mut app = start().await;
    let mut client = open_websocket(app.addr).await;

    if let Some(stop) = app.stop.take() {
        stop.send(()).unwrap();
    }
    let (opcode, payload) = read_frame(&mut client).await;
    assert_eq!(opcode, 0x8);
    assert_eq!(&payload[..2], &1001u16.to_be_bytes());
}

#[tokio::test]
async fn sse_stream_receives_broadcasts() {
    let app = start().await;
    let mut stream = TcpStream::connect(app.addr).await.unwrap();
    stream
        .write_all(b"GET /api/events HTTP/1.1\r\nHost: test\r\nAccept: text/event-stream\r\n\r\n")
        .await
        .unwrap();
    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Content-Type: text/event-stream\r\n"));

    app.sse_ready.notified().await;
    let event = SseEvent::new("line1\nline2").id("7").event("tick");
    let report = app.sse_hub.broadcast("feed", &event, None).await;
    assert_eq!(report.delivered, 1);

    let expected = "id: 7\nevent: tick\ndata: line1\ndata: line2\n\n";
    let mut body = vec![0u8; expected.len()];
    stream.read_exact(&mut body).await.unwrap();
    assert_eq!(String::from_utf8(body).unwrap(), expected);
}
