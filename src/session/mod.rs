//! Per-request session: the request snapshot, matched route values,
//! extensions and the one-shot transport capability.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::Request;

pub mod transport;

pub use transport::{AsyncStream, PendingTransport, Transport, TransportError};
pub(crate) use transport::TransportSlot;

/// Type-erased request extensions, used by middleware to hand values to
/// handlers (e.g. the authenticated user).
#[derive(Default, Clone)]
pub struct Extensions {
    map: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T>(&mut self, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.map.insert(TypeId::of::<T>(), Arc::new(value));
    }

    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn contains<T>(&self) -> bool
    where
        T: Send + Sync + 'static,
    {
        self.map.contains_key(&TypeId::of::<T>())
    }
}

impl std::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extensions")
            .field("len", &self.map.len())
            .finish()
    }
}

/// Values captured from the path by the matched route.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct RouteValues {
    map: HashMap<String, String>,
}

impl RouteValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.map.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// The session a handler runs in.
///
/// Cloning is cheap: the request is shared, the transport slot is shared, so a
/// clone handed to a handler still claims the same connection.
#[derive(Clone, Debug)]
pub struct HttpSession {
    request: Arc<Request>,
    route_values: RouteValues,
    extensions: Extensions,
    peer: Option<SocketAddr>,
    transport: Arc<TransportSlot>,
    shutdown: CancellationToken,
}

impl HttpSession {
    /// A session detached from any connection. A transport claim succeeds
    /// but waiting on it yields [`TransportError::Abandoned`].
    pub fn new(request: Request) -> Self {
        let (slot, _sender) = TransportSlot::new();
        Self::attached(request, None, Arc::new(slot), CancellationToken::new())
    }

    pub(crate) fn attached(
        request: Request,
        peer: Option<SocketAddr>,
        transport: Arc<TransportSlot>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            request: Arc::new(request),
            route_values: RouteValues::new(),
            extensions: Extensions::new(),
            peer,
            transport,
            shutdown,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// A shared handle to the request snapshot, for connections that outlive dispatch.
    pub fn request_arc(&self) -> Arc<Request> {
        Arc::clone(&self.request)
    }

    pub fn route_values(&self) -> &RouteValues {
        &self.route_values
    }

    pub(crate) fn set_route_values(&mut self, values: RouteValues) {
        self.route_values = values;
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Cancelled when the server shuts down.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Claims exclusive ownership of the connection's byte stream.
    ///
    /// Returns `None` if it was already claimed; the caller must then abort.
    /// Once claimed, the HTTP loop stops parsing requests on this connection
    /// after writing the current response.
    pub fn try_take_transport(&self) -> Option<PendingTransport> {
        self.transport.try_take()
    }

    pub fn transport_claimed(&self) -> bool {
        self.transport.is_claimed()
    }

    /// Deserializes the request body as JSON.
    ///
    /// # Errors
    ///
    /// Returns the deserializer error for a malformed or mismatched body.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(self.request.body())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(raw: &str) -> HttpSession {
        let (req, _) = Request::parse(raw.as_bytes()).unwrap();
        HttpSession::new(req)
    }

    #[test]
    fn extensions_store_by_type() {
        let mut ext = Extensions::new();
        ext.insert(42u32);
        ext.insert(String::from("user"));
        assert_eq!(ext.get::<u32>(), Some(&42));
        assert_eq!(ext.get::<String>().map(String::as_str), Some("user"));
        assert!(!ext.contains::<u64>());
    }

    #[test]
    fn clones_share_the_transport_claim() {
        let s = session("GET /ws HTTP/1.1\r\nHost: a\r\n\r\n");
        let clone = s.clone();
        assert!(clone.try_take_transport().is_some());
        assert!(s.transport_claimed());
        assert!(s.try_take_transport().is_none());
    }

    #[test]
    fn json_body() {
        let (mut req, _) = Request::parse(b"POST / HTTP/1.1\r\n\r\n").unwrap();
        req.set_body(bytes::Bytes::from_static(br#"{"n":5}"#));
        let s = HttpSession::new(req);
        let v: serde_json::Value = s.json().unwrap();
        assert_eq!(v["n"], 5);
    }
}
