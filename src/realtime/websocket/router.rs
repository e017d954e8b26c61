//! Message routing over the `{op, id, payload}` JSON envelope.
//!
//! Text messages are parsed as an envelope and routed by exact, case-sensitive
//! `op`. Anything that does not resolve to a handler goes to the fallback
//! handler, or is dropped when there is none. Binary messages go to the single
//! binary handler.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::connection::WebSocketConnection;
use super::frame::{Message, WebSocketError};
use crate::binder::HandlerError;
use crate::realtime::hub::{BroadcastReport, Hub};
use crate::realtime::lifecycle::ConnectionId;

/// The correlation id a client may attach to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvelopeId {
    Text(String),
    Number(serde_json::Number),
}

/// One received text message, as routed.
#[derive(Debug, Clone)]
pub struct Envelope {
    op: Option<String>,
    id: Option<EnvelopeId>,
    payload: Option<Value>,
    text: String,
    is_json: bool,
}

impl Envelope {
    /// Parses `text`. Never fails: a message that is not a JSON object, or has
    /// no string `op`, simply has no op.
    pub fn parse(text: String) -> Self {
        let (is_json, op, id, payload) = match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(mut map)) => {
                let op = match map.remove("op") {
                    Some(Value::String(op)) if !op.is_empty() => Some(op),
                    _ => None,
                };
                let id = match map.remove("id") {
                    Some(Value::String(id)) => Some(EnvelopeId::Text(id)),
                    Some(Value::Number(id)) => Some(EnvelopeId::Number(id)),
                    _ => None,
                };
                (true, op, id, map.remove("payload"))
            }
            Ok(_) => (true, None, None, None),
            Err(_) => (false, None, None, None),
        };

        Self {
            op,
            id,
            payload,
            text,
            is_json,
        }
    }

    pub fn op(&self) -> Option<&str> {
        self.op.as_deref()
    }

    pub fn id(&self) -> Option<&EnvelopeId> {
        self.id.as_ref()
    }

    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    /// Deserializes the payload; a missing payload reads as `null`.
    ///
    /// # Errors
    ///
    /// The deserializer error when the payload does not fit `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone().unwrap_or_default())
    }

    /// The raw message text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Whether the text parsed as JSON at all.
    pub fn is_json(&self) -> bool {
        self.is_json
    }
}

#[derive(Serialize)]
struct Outgoing<'a, T: ?Sized> {
    op: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a EnvelopeId>,
    payload: &'a T,
}

/// What a handler gets: its connection, the endpoint's hub and the id of the
/// message being answered.
#[derive(Debug, Clone)]
pub struct WsContext {
    connection: Arc<WebSocketConnection>,
    hub: Hub<WebSocketConnection>,
    reply_to: Option<EnvelopeId>,
}

impl WsContext {
    pub(crate) fn new(
        connection: Arc<WebSocketConnection>,
        hub: Hub<WebSocketConnection>,
        reply_to: Option<EnvelopeId>,
    ) -> Self {
        Self {
            connection,
            hub,
            reply_to,
        }
    }

    pub fn connection(&self) -> &Arc<WebSocketConnection> {
        &self.connection
    }

    pub fn hub(&self) -> &Hub<WebSocketConnection> {
        &self.hub
    }

    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    /// Sends `{op, id, payload}`, echoing the id of the message being handled.
    ///
    /// # Errors
    ///
    /// As [`WebSocketConnection::send_json`].
    pub async fn reply<T>(&self, op: &str, payload: &T) -> Result<(), WebSocketError>
    where
        T: Serialize + ?Sized,
    {
        self.connection
            .send_json(&Outgoing {
                op,
                id: self.reply_to.as_ref(),
                payload,
            })
            .await
    }

    pub fn join(&self, room: &str) -> bool {
        self.hub.join(room, &self.connection)
    }

    pub fn leave(&self, room: &str) -> bool {
        self.hub.leave(room, &self.connection.id())
    }

    /// Broadcasts to everyone else in `room`.
    pub async fn broadcast(&self, room: &str, message: &Message) -> BroadcastReport {
        self.hub.broadcast(room, message, Some(&self.connection.id())).await
    }
}

pub type HandlerFuture = BoxFuture<'static, Result<(), HandlerError>>;

/// Handles routed text messages: `Fn(WsContext, Envelope) -> impl Future`.
pub trait MessageHandler: Send + Sync + 'static {
    fn call(&self, ctx: WsContext, envelope: Envelope) -> HandlerFuture;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(WsContext, Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn call(&self, ctx: WsContext, envelope: Envelope) -> HandlerFuture {
        Box::pin((self)(ctx, envelope))
    }
}

/// Handles binary messages: `Fn(WsContext, Bytes) -> impl Future`.
pub trait BinaryHandler: Send + Sync + 'static {
    fn call(&self, ctx: WsContext, data: Bytes) -> HandlerFuture;
}

impl<F, Fut> BinaryHandler for F
where
    F: Fn(WsContext, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn call(&self, ctx: WsContext, data: Bytes) -> HandlerFuture {
        Box::pin((self)(ctx, data))
    }
}

#[derive(Clone, Default)]
pub struct MessageRouter {
    routes: HashMap<String, Arc<dyn MessageHandler>>,
    unknown: Option<Arc<dyn MessageHandler>>,
    binary: Option<Arc<dyn BinaryHandler>>,
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ops: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        ops.sort_unstable();
        f.debug_struct("MessageRouter")
            .field("ops", &ops)
            .field("unknown", &self.unknown.is_some())
            .field("binary", &self.binary.is_some())
            .finish()
    }
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `op` to `handler`, replacing any earlier mapping.
    pub fn on<F, Fut>(&mut self, op: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(WsContext, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.routes.insert(op.into(), Arc::new(handler));
        self
    }

    /// Handles text that is not JSON, has no `op`, or has an unmapped one.
    pub fn on_unknown<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(WsContext, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.unknown = Some(Arc::new(handler));
        self
    }

    pub fn on_binary<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(WsContext, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.binary = Some(Arc::new(handler));
        self
    }

    pub fn contains(&self, op: &str) -> bool {
        self.routes.contains_key(op)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Runs the handler for one message. Unhandled messages are dropped.
    ///
    /// # Errors
    ///
    /// Whatever the handler returns.
    pub async fn dispatch(
        &self,
        connection: &Arc<WebSocketConnection>,
        hub: &Hub<WebSocketConnection>,
        message: Message,
    ) -> Result<(), HandlerError> {
        match message {
            Message::Text(text) => {
                let envelope = Envelope::parse(text);
                let handler = envelope
                    .op()
                    .and_then(|op| self.routes.get(op))
                    .or(self.unknown.as_ref())
                    .cloned();
                let Some(handler) = handler else {
                    debug!(
                        connection = %connection.id(),
                        op = ?envelope.op(),
                        "no handler, message dropped"
                    );
                    return Ok(());
                };
                let reply_to = envelope.id().cloned();
                let ctx = WsContext::new(Arc::clone(connection), hub.clone(), reply_to);
                handler.call(ctx, envelope).await
            }
            Message::Binary(data) => {
                let Some(handler) = self.binary.clone() else {
                    debug!(
                        connection = %connection.id(),
                        len = data.len(),
                        "no binary handler, message dropped"
                    );
                    return Ok(());
                };
                handler.call(WsContext::new(Arc::clone(connection), hub.clone(), None), data).await
            }
        }
    }
}
