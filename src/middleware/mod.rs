//! Middleware pipeline: ordered interceptors wrapped around the router.
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by all middleware.
//! - [`Next`]: cursor into the remaining chain; call [`Next::run`] to advance.
//!   Once the middlewares are exhausted it runs the endpoint (the router).
//! - [`MiddlewareHandler`]: type-erased, cheaply cloneable middleware function.
//! - [`Pipeline`]: the assembled chain the connection loop calls per request.
//! - [`LoggerMiddleware`]: built-in request/response logger.

use std::{future::Future, pin::Pin, sync::Arc};
use tokio::time::Instant;

use crate::{Response, session::HttpSession};

/// Boxed future returned by every layer of the pipeline.
pub type BoxResponse = Pin<Box<dyn Future<Output = Response> + Send>>;

/// A type-erased, reference-counted middleware function.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use rawserve::{middleware::{BoxResponse, MiddlewareHandler, Next}, session::HttpSession};
///
/// let handler: MiddlewareHandler = Arc::new(|session: HttpSession, next: Next| -> BoxResponse {
///     Box::pin(async move { next.run(session).await })
/// });
/// ```
pub type MiddlewareHandler =
    Arc<dyn Fn(HttpSession, Next) -> BoxResponse + Send + Sync + 'static>;

/// The innermost layer; produces the response once every middleware has
/// passed the request on.
pub type Endpoint = Arc<dyn Fn(HttpSession) -> BoxResponse + Send + Sync + 'static>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |session: HttpSession, next: Next| middleware.handle(session, next))
}

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is consumed by [`run`](Self::run), so each middleware can forward a
/// request at most once.
///
/// ```rust,no_run
/// use rawserve::middleware::{BoxResponse, Middleware, Next};
/// use rawserve::session::HttpSession;
///
/// struct PassThrough;
///
/// impl Middleware for PassThrough {
///     fn handle(&self, session: HttpSession, next: Next) -> BoxResponse {
///         Box::pin(async move { next.run(session).await })
///     }
/// }
/// ```
pub struct Next {
    middlewares: Arc<[MiddlewareHandler]>,
    // Which middleware the next `run` call invokes.
    index: usize,
    endpoint: Endpoint,
}

impl Next {
    /// Invokes the next middleware, or the endpoint when none remain.
    pub async fn run(mut self, session: HttpSession) -> Response {
        if let Some(handler) = self.middlewares.get(self.index).cloned() {
            self.index += 1;
            handler(session, self).await
        } else {
            (self.endpoint)(session).await
        }
    }
}

/// The core trait for all middleware.
///
/// Implementors may pass a request through (`next.run(session).await`),
/// short-circuit with their own [`Response`], or decorate the downstream
/// response. They must not hold `&mut` state across an `.await`.
pub trait Middleware: Send + Sync {
    fn handle(&self, session: HttpSession, next: Next) -> BoxResponse;
}

/// An assembled chain: middlewares in registration order, then the endpoint.
#[derive(Clone)]
pub struct Pipeline {
    middlewares: Arc<[MiddlewareHandler]>,
    endpoint: Endpoint,
}

impl Pipeline {
    pub fn new(middlewares: Vec<MiddlewareHandler>, endpoint: Endpoint) -> Self {
        Self {
            middlewares: middlewares.into(),
            endpoint,
        }
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    pub async fn run(&self, session: HttpSession) -> Response {
        let next = Next {
            middlewares: Arc::clone(&self.middlewares),
            index: 0,
            endpoint: Arc::clone(&self.endpoint),
        };
        next.run(session).await
    }
}

/// Logs each request's method, path, status and duration.
///
/// Emits one `tracing::info!` line after the downstream layers complete:
///
/// ```text
/// METHOD /path - STATUS (duration)
/// ```
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(&self, session: HttpSession, next: Next) -> BoxResponse {
        Box::pin(async move {
            let start = Instant::now();
            let method = session.request().method().as_str().to_string();
            let path = session.request().path().to_string();

            let response = next.run(session).await;

            let duration = start.elapsed();
            let status = response.status().as_u16();

            tracing::info!("{} {} - {} ({:?})", method, path, status, duration);

            response
        })
    }
}
