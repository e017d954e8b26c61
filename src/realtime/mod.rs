//! Real-time endpoints: WebSocket and Server-Sent Events.
//!
//! Both take over the connection from the HTTP loop once their handshake
//! response is written. Each endpoint owns a [`Hub`] of rooms for broadcast.

pub mod hub;
pub mod lifecycle;
pub mod sse;
pub mod websocket;

pub use hub::{BroadcastReport, Hub, HubMember};
pub use lifecycle::{CloseObserver, ConnectionId};
pub use sse::{SseConnection, SseEvent, SseModule};
pub use websocket::{WebSocketConnection, WebSocketModule};
