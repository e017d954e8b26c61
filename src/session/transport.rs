//! Exclusive ownership of a connection's byte stream.
//!
//! The HTTP loop owns the socket while it parses requests. A protocol module
//! that wants the raw stream calls [`HttpSession::try_take_transport`] during
//! dispatch; once the response head is on the wire the loop stops parsing and
//! sends the stream, together with any bytes it had already buffered past the
//! request, to the claimant.
//!
//! [`HttpSession::try_take_transport`]: super::HttpSession::try_take_transport

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::oneshot;

/// Any full-duplex byte stream the server can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

#[derive(Debug, Error)]
pub enum TransportError {
    /// The session never handed the stream over, usually because writing the
    /// handshake response failed and the socket was dropped.
    #[error("the connection was closed before the transport was handed over")]
    Abandoned,
}

/// A claimed connection stream.
///
/// Reads first drain the bytes the HTTP loop had buffered beyond the request
/// that triggered the takeover, then continue on the socket.
pub struct Transport {
    io: Box<dyn AsyncStream>,
    buffered: Bytes,
}

impl Transport {
    pub fn new(io: impl AsyncStream + 'static, buffered: Bytes) -> Self {
        Self {
            io: Box::new(io),
            buffered,
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("buffered", &self.buffered.len())
            .finish_non_exhaustive()
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.buffered.has_remaining() {
            let n = this.buffered.len().min(buf.remaining());
            buf.put_slice(&this.buffered[..n]);
            this.buffered.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

/// The claim side of the handoff; resolves once the response head is written.
#[derive(Debug)]
pub struct PendingTransport {
    receiver: oneshot::Receiver<Transport>,
}

impl PendingTransport {
    /// Waits for the HTTP loop to hand over the stream.
    ///
    /// # Errors
    ///
    /// [`TransportError::Abandoned`] if the loop dropped the stream instead.
    pub async fn wait(self) -> Result<Transport, TransportError> {
        self.receiver.await.map_err(|_| TransportError::Abandoned)
    }
}

/// One-shot ownership slot shared between a session and its HTTP loop.
#[derive(Debug)]
pub(crate) struct TransportSlot {
    claim: Mutex<Option<oneshot::Receiver<Transport>>>,
}

impl TransportSlot {
    /// Creates a slot and the sender the HTTP loop keeps.
    pub(crate) fn new() -> (Self, oneshot::Sender<Transport>) {
        let (sender, receiver) = oneshot::channel();
        let slot = Self {
            claim: Mutex::new(Some(receiver)),
        };
        (slot, sender)
    }

    /// Takes the claim; `None` once anyone has taken it.
    pub(crate) fn try_take(&self) -> Option<PendingTransport> {
        self.claim
            .lock()
            .take()
            .map(|receiver| PendingTransport { receiver })
    }

    pub(crate) fn is_claimed(&self) -> bool {
        self.claim.lock().is_none()
    }
}
