//! Controllers: a group of handlers sharing a route prefix and a per-request
//! instance.

use std::marker::PhantomData;

use super::{IntoPaths, RouteError, Router};
use crate::Method;
use crate::binder::{
    AsyncHandler, Bind, IntoReply, SyncHandler, WithController, compile, compile_sync,
};
use crate::session::HttpSession;

/// A type whose methods serve routes.
///
/// A fresh instance is created for every request that hits one of its routes
/// and is passed to the handler as its first argument.
///
/// ```rust,no_run
/// use rawserve::binder::arg;
/// use rawserve::router::{Absolute, Controller, ControllerScope, RouteError};
/// use rawserve::session::HttpSession;
///
/// struct Users {
///     caller: Option<std::net::SocketAddr>,
/// }
///
/// impl Users {
///     async fn show(self, id: u64) -> String {
///         format!("user {id} for {:?}", self.caller)
///     }
///
///     fn health(self) -> &'static str {
///         "ok"
///     }
/// }
///
/// impl Controller for Users {
///     const PREFIX: &'static str = "/users";
///
///     fn create(session: &HttpSession) -> Self {
///         Self { caller: session.peer_addr() }
///     }
///
///     fn routes(scope: &mut ControllerScope<'_, Self>) -> Result<(), RouteError> {
///         scope.get(":id", (arg::<u64>("id"),), Self::show)?;
///         scope.route_sync(rawserve::Method::Get, Absolute("/health"), (), Self::health)
///     }
/// }
/// ```
pub trait Controller: Sized + Send + 'static {
    const PREFIX: &'static str = "";

    fn create(session: &HttpSession) -> Self;

    /// Declares the controller's routes.
    ///
    /// # Errors
    ///
    /// Any [`RouteError`] raised while registering.
    fn routes(scope: &mut ControllerScope<'_, Self>) -> Result<(), RouteError>;
}

/// Registers routes on behalf of controller `C`.
pub struct ControllerScope<'r, C> {
    router: &'r mut Router,
    _controller: PhantomData<fn() -> C>,
}

impl<'r, C: Controller> ControllerScope<'r, C> {
    pub(crate) fn new(router: &'r mut Router) -> Self {
        Self {
            router,
            _controller: PhantomData,
        }
    }

    /// Registers an async controller method.
    ///
    /// # Errors
    ///
    /// As [`Router::get`].
    pub fn route<B, H>(
        &mut self,
        method: Method,
        paths: impl IntoPaths,
        binders: B,
        handler: H,
    ) -> Result<(), RouteError>
    where
        WithController<C, B>: Bind,
        H: AsyncHandler<<WithController<C, B> as Bind>::Output>,
        H::Output: IntoReply,
    {
        let compiled = compile(WithController::<C, B>::new(binders), handler);
        self.router
            .register(Some(method), Some(C::PREFIX), paths.into_paths(), compiled)
    }

    /// Registers a synchronous controller method.
    ///
    /// # Errors
    ///
    /// As [`Router::get`].
    pub fn route_sync<B, H>(
        &mut self,
        method: Method,
        paths: impl IntoPaths,
        binders: B,
        handler: H,
    ) -> Result<(), RouteError>
    where
        WithController<C, B>: Bind,
        H: SyncHandler<<WithController<C, B> as Bind>::Output>,
        H::Output: IntoReply,
    {
        let compiled = compile_sync(WithController::<C, B>::new(binders), handler);
        self.router
            .register(Some(method), Some(C::PREFIX), paths.into_paths(), compiled)
    }

    /// # Errors
    ///
    /// As [`Router::get`].
    pub fn get<B, H>(
        &mut self,
        paths: impl IntoPaths,
        binders: B,
        handler: H,
    ) -> Result<(), RouteError>
    where
        WithController<C, B>: Bind,
        H: AsyncHandler<<WithController<C, B> as Bind>::Output>,
        H::Output: IntoReply,
    {
        self.route(Method::Get, paths, binders, handler)
    }

    /// # Errors
    ///
    /// As [`Router::get`].
    pub fn post<B, H>(
        &mut self,
        paths: impl IntoPaths,
        binders: B,
        handler: H,
    ) -> Result<(), RouteError>
    where
        WithController<C, B>: Bind,
        H: AsyncHandler<<WithController<C, B> as Bind>::Output>,
        H::Output: IntoReply,
    {
        self.route(Method::Post, paths, binders, handler)
    }

    /// # Errors
    ///
    /// As [`Router::get`].
    pub fn put<B, H>(
        &mut self,
        paths: impl IntoPaths,
        binders: B,
        handler: H,
    ) -> Result<(), RouteError>
    where
        WithController<C, B>: Bind,
        H: AsyncHandler<<WithController<C, B> as Bind>::Output>,
        H::Output: IntoReply,
    {
        self.route(Method::Put, paths, binders, handler)
    }

    /// # Errors
    ///
    /// As [`Router::get`].
    pub fn delete<B, H>(
        &mut self,
        paths: impl IntoPaths,
        binders: B,
        handler: H,
    ) -> Result<(), RouteError>
    where
        WithController<C, B>: Bind,
        H: AsyncHandler<<WithController<C, B> as Bind>::Output>,
        H::Output: IntoReply,
    {
        self.route(Method::Delete, paths, binders, handler)
    }
}
