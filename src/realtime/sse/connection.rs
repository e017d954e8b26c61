//! An open event stream.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::event::{SseEvent, encode_comment};
use crate::http::Request;
use crate::realtime::hub::HubMember;
use crate::realtime::lifecycle::{CloseGuard, CloseObserver, ConnectionId};
use crate::session::Transport;

#[derive(Debug, Error)]
pub enum SseError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("event stream is closed")]
    Closed,
}

/// The server end of an event stream. Write-only: inbound bytes are read
/// only to notice the client leaving.
pub struct SseConnection {
    id: ConnectionId,
    writer: Mutex<WriteHalf<Transport>>,
    guard: CloseGuard,
    cancel: CancellationToken,
    request: Arc<Request>,
}

impl std::fmt::Debug for SseConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseConnection")
            .field("id", &self.id)
            .field("path", &self.request.path())
            .field("closed", &self.guard.is_closed())
            .finish_non_exhaustive()
    }
}

impl SseConnection {
    pub(crate) fn new(writer: WriteHalf<Transport>, request: Arc<Request>) -> Self {
        Self {
            id: ConnectionId::new(),
            writer: Mutex::new(writer),
            guard: CloseGuard::new(),
            cancel: CancellationToken::new(),
            request,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The request that opened the stream.
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn is_closed(&self) -> bool {
        self.guard.is_closed()
    }

    pub fn on_closed(&self, callback: impl FnOnce(&ConnectionId) + Send + 'static) {
        self.guard.on_closed(&self.id, Box::new(callback));
    }

    /// # Errors
    ///
    /// [`SseError::Closed`] after close, or the write failure.
    pub async fn send(&self, event: &SseEvent) -> Result<(), SseError> {
        self.write(event.encode().as_bytes()).await
    }

    /// # Errors
    ///
    /// As [`send`](Self::send).
    pub async fn send_comment(&self, text: &str) -> Result<(), SseError> {
        self.write(encode_comment(text).as_bytes()).await
    }

    /// Ends the stream. Only the first call does anything.
    pub async fn close(&self) {
        if !self.guard.close(&self.id) {
            return;
        }
        self.cancel.cancel();
        if let Err(e) = self.writer.lock().await.shutdown().await {
            debug!(connection = %self.id, error = %e, "event stream shutdown failed");
        }
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), SseError> {
        if self.is_closed() {
            return Err(SseError::Closed);
        }
        let mut writer = self.writer.lock().await;
        let written = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = written {
            self.cancel.cancel();
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl HubMember for SseConnection {
    type Message = SseEvent;
    type Error = SseError;

    fn id(&self) -> ConnectionId {
        self.id
    }

    fn is_closed(&self) -> bool {
        self.guard.is_closed()
    }

    fn on_closed(&self, observer: CloseObserver) {
        self.guard.on_closed(&self.id, observer);
    }

    async fn deliver(&self, event: &SseEvent) -> Result<(), SseError> {
        self.send(event).await
    }
}

/// Keeps the stream open until the client leaves, the connection is closed
/// or the server shuts down, sending keepalive comments in between.
pub(crate) async fn run(
    connection: Arc<SseConnection>,
    mut reader: ReadHalf<Transport>,
    keepalive: Option<Duration>,
    shutdown: CancellationToken,
) {
    let mut ticker = keepalive.map(|every| interval_at(Instant::now() + every, every));
    let mut scratch = [0u8; 512];

    loop {
        let tick = async {
            match ticker.as_mut() {
                Some(ticker) => {
                    ticker.tick().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            () = connection.cancel.cancelled() => break,
            () = shutdown.cancelled() => break,
            read = reader.read(&mut scratch) => match read {
                Ok(0) | Err(_) => {
                    debug!(connection = %connection.id, "event stream client went away");
                    break;
                }
                Ok(_) => {}
            },
            () = tick => {
                if connection.send_comment("keepalive").await.is_err() {
                    break;
                }
            }
        }
    }

    connection.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::hub::Hub;
    use bytes::Bytes;
    use tokio::io::DuplexStream;

    fn open() -> (Arc<SseConnection>, ReadHalf<Transport>, DuplexStream) {
        let (server, client) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(Transport::new(server, Bytes::new()));
        let request = Arc::new(Request::parse(b"GET /events HTTP/1.1\r\n\r\n").unwrap().0);
        (Arc::new(SseConnection::new(writer, request)), reader, client)
    }

    async fn read_some(client: &mut DuplexStream, n: usize) -> String {
        let mut buf = vec![0u8; n];
        client.read_exact(&mut buf).await.unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[tokio::test]
    async fn sends_events_and_comments() {
        let (conn, _reader, mut client) = open();
        conn.send(&SseEvent::new("hi").event("greet")).await.unwrap();
        conn.send_comment("note").await.unwrap();

        let expected = "event: greet\ndata: hi\n\n: note\n\n";
        assert_eq!(read_some(&mut client, expected.len()).await, expected);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_ends_stream() {
        let (conn, _reader, mut client) = open();
        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        {
            let fired = Arc::clone(&fired);
            conn.on_closed(move |_| {
                fired.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            });
        }
        conn.close().await;
        conn.close().await;

        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(matches!(conn.send(&SseEvent::new("x")).await, Err(SseError::Closed)));
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn client_disconnect_is_detected() {
        let (conn, reader, client) = open();
        let hub = Hub::new();
        hub.join("news", &conn);

        drop(client);
        run(Arc::clone(&conn), reader, None, CancellationToken::new()).await;
        assert!(conn.is_closed());
        assert!(!hub.contains_room("news"));
    }

    #[tokio::test]
    async fn keepalive_comments_flow() {
        let (conn, reader, mut client) = open();
        tokio::spawn(run(conn, reader, Some(Duration::from_millis(20)), CancellationToken::new()));
        assert_eq!(read_some(&mut client, 13).await, ": keepalive\n\n");
    }

    #[tokio::test]
    async fn shutdown_ends_the_stream() {
        let (conn, reader, mut client) = open();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(Arc::clone(&conn), reader, None, shutdown.clone()));
        shutdown.cancel();
        task.await.unwrap();

        assert!(conn.is_closed());
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
    }
}
