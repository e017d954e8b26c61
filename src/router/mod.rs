//! Request routing: map (method, path) pairs to compiled handlers.
//!
//! Lookup runs in three tiers. Exact paths are a hash lookup; parameterized
//! and regex patterns are tried next in registration order; wildcard
//! patterns come last. Trailing slashes are ignored on both sides, and the
//! server-level prefix is part of every registered path.
//!
//! ```rust,no_run
//! use rawserve::Router;
//! use rawserve::binder::{arg, Json};
//!
//! # fn main() -> Result<(), rawserve::router::RouteError> {
//! let mut router = Router::with_prefix("/api");
//! router.get("/users/:id", (arg::<u64>("id"),), |id: u64| async move {
//!     Json(serde_json::json!({ "id": id }))
//! })?;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::binder::{
    AsyncHandler, Bind, Compiled, HandlerError, IntoReply, ParamSource, ResultSink, compile,
};
use crate::session::{HttpSession, RouteValues};
use crate::{Method, Response, StatusCode};

pub mod controller;
pub mod pattern;

pub use controller::{Controller, ControllerScope};
pub use pattern::WILDCARD;

use pattern::{Pattern, full_path, normalize};

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("route {method} {path} is already registered")]
    Duplicate { method: String, path: String },

    #[error("invalid route regex `{pattern}`: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// One path a handler is registered under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePath {
    path: String,
    absolute: bool,
}

/// Marks a controller route path as absolute: the controller prefix is not
/// applied (the server prefix still is).
#[derive(Debug, Clone, Copy)]
pub struct Absolute<S>(pub S);

/// Anything that names one or more route paths.
pub trait IntoPaths {
    fn into_paths(self) -> Vec<RoutePath>;
}

impl IntoPaths for &str {
    fn into_paths(self) -> Vec<RoutePath> {
        vec![RoutePath {
            path: self.to_owned(),
            absolute: false,
        }]
    }
}

impl IntoPaths for String {
    fn into_paths(self) -> Vec<RoutePath> {
        vec![RoutePath {
            path: self,
            absolute: false,
        }]
    }
}

impl<S: Into<String>> IntoPaths for Absolute<S> {
    fn into_paths(self) -> Vec<RoutePath> {
        vec![RoutePath {
            path: self.0.into(),
            absolute: true,
        }]
    }
}

impl<P: IntoPaths, const N: usize> IntoPaths for [P; N] {
    fn into_paths(self) -> Vec<RoutePath> {
        self.into_iter().flat_map(IntoPaths::into_paths).collect()
    }
}

impl<P: IntoPaths> IntoPaths for Vec<P> {
    fn into_paths(self) -> Vec<RoutePath> {
        self.into_iter().flat_map(IntoPaths::into_paths).collect()
    }
}

// `None` accepts every method.
type MethodKey = Option<Method>;

struct Route {
    method: MethodKey,
    path: String,
    pattern: Pattern,
    compiled: Compiled,
    // Required named parameters the pattern itself captures; a match that
    // leaves one of them empty is not a match.
    required: Vec<String>,
}

impl Route {
    fn accepts(&self, method: &Method) -> bool {
        self.method.as_ref().is_none_or(|m| m == method)
    }

    fn matches(&self, method: &Method, path: &str) -> Option<RouteValues> {
        if !self.accepts(method) {
            return None;
        }
        let values = self.pattern.matches(path)?;
        self.required
            .iter()
            .all(|name| values.get(name).is_some_and(|v| !v.is_empty()))
            .then_some(values)
    }
}

/// A matched route: its registered path and the captured values.
#[derive(Debug, Clone)]
pub struct RouteMatch<'r> {
    pub path: &'r str,
    pub values: RouteValues,
    compiled: &'r Compiled,
}

impl RouteMatch<'_> {
    pub fn compiled(&self) -> &Compiled {
        self.compiled
    }
}

#[derive(Default)]
pub struct Router {
    prefix: String,
    routes: Vec<Route>,
    exact: HashMap<MethodKey, HashMap<String, usize>>,
    patterns: Vec<usize>,
    wildcards: Vec<usize>,
    keys: HashSet<(MethodKey, String)>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("prefix", &self.prefix)
            .field("routes", &self.routes.len())
            .finish()
    }
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// A router whose every route lives under `prefix`.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Registers an async handler for `GET`.
    ///
    /// # Errors
    ///
    /// [`RouteError::Duplicate`] if one of the paths is already taken for this
    /// method, [`RouteError::InvalidRegex`] for a malformed `^` pattern.
    pub fn get<B, H>(
        &mut self,
        paths: impl IntoPaths,
        binders: B,
        handler: H,
    ) -> Result<(), RouteError>
    where
        B: Bind,
        H: AsyncHandler<B::Output>,
        H::Output: IntoReply,
    {
        self.route(Method::Get, paths, compile(binders, handler))
    }

    /// Registers an async handler for `POST`.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get).
    pub fn post<B, H>(
        &mut self,
        paths: impl IntoPaths,
        binders: B,
        handler: H,
    ) -> Result<(), RouteError>
    where
        B: Bind,
        H: AsyncHandler<B::Output>,
        H::Output: IntoReply,
    {
        self.route(Method::Post, paths, compile(binders, handler))
    }

    /// Registers an async handler for `PUT`.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get).
    pub fn put<B, H>(
        &mut self,
        paths: impl IntoPaths,
        binders: B,
        handler: H,
    ) -> Result<(), RouteError>
    where
        B: Bind,
        H: AsyncHandler<B::Output>,
        H::Output: IntoReply,
    {
        self.route(Method::Put, paths, compile(binders, handler))
    }

    /// Registers an async handler for `DELETE`.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get).
    pub fn delete<B, H>(
        &mut self,
        paths: impl IntoPaths,
        binders: B,
        handler: H,
    ) -> Result<(), RouteError>
    where
        B: Bind,
        H: AsyncHandler<B::Output>,
        H::Output: IntoReply,
    {
        self.route(Method::Delete, paths, compile(binders, handler))
    }

    /// Registers an async handler for `PATCH`.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get).
    pub fn patch<B, H>(
        &mut self,
        paths: impl IntoPaths,
        binders: B,
        handler: H,
    ) -> Result<(), RouteError>
    where
        B: Bind,
        H: AsyncHandler<B::Output>,
        H::Output: IntoReply,
    {
        self.route(Method::Patch, paths, compile(binders, handler))
    }

    /// Registers an async handler for `OPTIONS`.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get).
    pub fn options<B, H>(
        &mut self,
        paths: impl IntoPaths,
        binders: B,
        handler: H,
    ) -> Result<(), RouteError>
    where
        B: Bind,
        H: AsyncHandler<B::Output>,
        H::Output: IntoReply,
    {
        self.route(Method::Options, paths, compile(binders, handler))
    }

    /// Registers an already compiled handler, e.g. one built with
    /// [`compile_sync`](crate::binder::compile_sync).
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get).
    pub fn route(
        &mut self,
        method: Method,
        paths: impl IntoPaths,
        compiled: Compiled,
    ) -> Result<(), RouteError> {
        self.register(Some(method), None, paths.into_paths(), compiled)
    }

    /// Registers a handler for every method on `paths`.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get).
    pub fn any(&mut self, paths: impl IntoPaths, compiled: Compiled) -> Result<(), RouteError> {
        self.register(None, None, paths.into_paths(), compiled)
    }

    /// Registers every route a controller declares.
    ///
    /// # Errors
    ///
    /// The first [`RouteError`] raised by the controller's routes.
    pub fn controller<C: Controller>(&mut self) -> Result<(), RouteError> {
        let mut scope = ControllerScope::new(self);
        C::routes(&mut scope)
    }

    pub(crate) fn register(
        &mut self,
        method: MethodKey,
        scope_prefix: Option<&str>,
        paths: Vec<RoutePath>,
        compiled: Compiled,
    ) -> Result<(), RouteError> {
        for RoutePath { path, absolute } in paths {
            let full = match scope_prefix {
                Some(scope) if !absolute => full_path(&[self.prefix.as_str(), scope], &path),
                _ => full_path(&[self.prefix.as_str()], &path),
            };

            let key = (method.clone(), full.clone());
            if self.keys.contains(&key) {
                return Err(RouteError::Duplicate {
                    method: method_label(&method).to_owned(),
                    path: full,
                });
            }

            let pattern = Pattern::parse(&full)?;
            let captures = pattern.captures();
            let required = compiled
                .params()
                .iter()
                .filter(|p| p.required && p.source == ParamSource::Named)
                .filter(|p| captures.contains(&p.name))
                .map(|p| p.name.clone())
                .collect();

            let id = self.routes.len();
            match &pattern {
                Pattern::Exact(p) => {
                    self.exact
                        .entry(method.clone())
                        .or_default()
                        .insert(p.clone(), id);
                }
                Pattern::Parameterized { .. } | Pattern::Regex(_) => self.patterns.push(id),
                Pattern::Wildcard(_) => self.wildcards.push(id),
            }

            debug!(
                method = method_label(&method),
                path = %full,
                kind = %compiled.kind(),
                "route registered"
            );
            self.keys.insert(key);
            self.routes.push(Route {
                method: method.clone(),
                path: full,
                pattern,
                compiled: compiled.clone(),
                required,
            });
        }
        Ok(())
    }

    /// Finds the route serving `method` and `path`.
    pub fn find(&self, method: &Method, path: &str) -> Option<RouteMatch<'_>> {
        let path = normalize(path);

        for key in [Some(method.clone()), None] {
            if let Some(&id) = self.exact.get(&key).and_then(|paths| paths.get(path)) {
                let route = &self.routes[id];
                return Some(RouteMatch {
                    path: &route.path,
                    values: RouteValues::new(),
                    compiled: &route.compiled,
                });
            }
        }

        self.patterns
            .iter()
            .chain(&self.wildcards)
            .map(|&id| &self.routes[id])
            .find_map(|route| {
                route.matches(method, path).map(|values| RouteMatch {
                    path: &route.path,
                    values,
                    compiled: &route.compiled,
                })
            })
    }

    /// Runs the matching route's executor, or answers `404`.
    ///
    /// Executor failures become error responses here; they never reach the
    /// connection loop.
    pub async fn dispatch(&self, mut session: HttpSession, sink: Arc<dyn ResultSink>) -> Response {
        let method = session.request().method().clone();
        let Some(found) = self.find(&method, session.request().path()) else {
            return Response::new(StatusCode::NotFound);
        };

        let compiled = found.compiled.clone();
        let path = found.path.to_owned();
        session.set_route_values(found.values);

        match compiled.execute(session, sink).await {
            Ok(response) => response,
            Err(err) => {
                log_failure(&method, &path, &err);
                err.into_response()
            }
        }
    }
}

fn method_label(method: &MethodKey) -> &str {
    method.as_ref().map_or("*", Method::as_str)
}

fn log_failure(method: &Method, route: &str, err: &HandlerError) {
    warn!(%method, route, status = err.status().as_u16(), error = %err, "handler failed");
}
