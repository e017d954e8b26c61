//! Installable server extensions.

use super::{Server, ServerError};

/// A unit of functionality that configures a server before it starts:
/// routes, middleware, auth rules.
///
/// A module receives the server exactly once. Installing into a running
/// server cannot happen: [`Server::run`] consumes the server.
///
/// ```rust,no_run
/// use rawserve::binder::compile_sync;
/// use rawserve::server::{Module, Server, ServerError};
/// use rawserve::Method;
///
/// struct Health;
///
/// impl Module for Health {
///     fn install(self, server: &mut Server) -> Result<(), ServerError> {
///         server
///             .router_mut()
///             .route(Method::Get, "/health", compile_sync((), || "ok"))?;
///         Ok(())
///     }
/// }
/// ```
pub trait Module {
    /// # Errors
    ///
    /// Whatever configuration error the module hits; the server must not be
    /// started after a failed install.
    fn install(self, server: &mut Server) -> Result<(), ServerError>;
}
