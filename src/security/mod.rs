//! Pre-built security middlewares.
//!
//! - [`CorsMiddleware`]: `Origin` allow-list, preflight short-circuit.
//! - [`BasicAuthMiddleware`]: `401` challenge for protected path prefixes,
//!   driven by a per-server [`BasicAuthRules`] registry.

pub mod basic_auth;
pub mod cors;

pub use basic_auth::{AuthRule, BasicAuth, BasicAuthMiddleware, BasicAuthRules};
pub use cors::CorsMiddleware;
