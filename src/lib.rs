//! # rawserve
//!
//! An embeddable async HTTP/1.1 server built directly on Tokio sockets, with
//! WebSocket and Server-Sent Events endpoints that take over connections
//! after their handshake.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rawserve::Server;
//! use rawserve::binder::{Json, arg};
//! use rawserve::realtime::websocket::{Envelope, WebSocketModule, WsContext};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = Server::bind("127.0.0.1:8080").await?;
//!
//!     server.router_mut().get("/items/:id", (arg::<u64>("id"),), |id: u64| async move {
//!         Json(serde_json::json!({ "id": id }))
//!     })?;
//!
//!     let echo = WebSocketModule::new("/ws")
//!         .on("echo", |ctx: WsContext, env: Envelope| async move {
//!             ctx.reply("echo", &env.payload()).await?;
//!             Ok(())
//!         });
//!     server.install(echo)?;
//!
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod binder;
pub mod config;
pub mod http;
pub mod middleware;
pub mod realtime;
pub mod router;
pub mod security;
pub mod server;
pub mod session;

pub use http::{Headers, Method, Request, Response, StatusCode};
pub use router::Router;
pub use server::{Server, ServerError};
pub use session::HttpSession;
