//! Cross-Origin Resource Sharing.

use std::sync::Arc;

use crate::{
    Method, Response, StatusCode,
    middleware::{BoxResponse, Middleware, Next},
    session::HttpSession,
};

#[derive(Debug)]
struct Policy {
    any_origin: bool,
    origins: Vec<String>,
    methods: String,
    headers: String,
    max_age: u32,
}

/// Validates the `Origin` header, answers preflight requests and adds
/// `Access-Control-*` headers to actual responses.
///
/// - Requests without an `Origin`, or with one outside the allow-list, pass
///   through untouched.
/// - `OPTIONS` preflights are answered with `204 No Content`; the router is
///   not called.
/// - A specific (non-wildcard) origin is echoed back with `Vary: Origin`.
///
/// ```rust
/// use rawserve::security::CorsMiddleware;
///
/// let cors = CorsMiddleware::new()
///     .allow_origin("https://example.com")
///     .allow_method("PATCH")
///     .allow_header("X-Custom-Header");
/// ```
#[derive(Debug, Clone)]
pub struct CorsMiddleware {
    any_origin: bool,
    origins: Vec<String>,
    methods: Vec<String>,
    headers: Vec<String>,
    max_age: u32,
    compiled: Option<Arc<Policy>>,
}

impl Default for CorsMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl CorsMiddleware {
    /// No origins allowed yet; `GET`, `POST`, `PUT`, `DELETE`;
    /// `Content-Type` and `Authorization`; preflight cached for an hour.
    pub fn new() -> Self {
        Self {
            any_origin: false,
            origins: Vec::new(),
            methods: ["GET", "POST", "PUT", "DELETE"].map(String::from).to_vec(),
            headers: ["Content-Type", "Authorization"].map(String::from).to_vec(),
            max_age: 3600,
            compiled: None,
        }
    }

    /// Every origin is accepted and answered with `*`.
    pub fn permissive() -> Self {
        Self::new().allow_origin("*")
    }

    /// Adds an allowed origin; `"*"` allows all.
    #[must_use]
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        let origin = origin.into();
        if origin == "*" {
            self.any_origin = true;
        } else {
            self.origins.push(origin);
        }
        self.compiled = None;
        self
    }

    #[must_use]
    pub fn allow_method(mut self, method: impl Into<String>) -> Self {
        self.methods.push(method.into());
        self.compiled = None;
        self
    }

    #[must_use]
    pub fn allow_header(mut self, header: impl Into<String>) -> Self {
        self.headers.push(header.into());
        self.compiled = None;
        self
    }

    #[must_use]
    pub fn max_age(mut self, seconds: u32) -> Self {
        self.max_age = seconds;
        self.compiled = None;
        self
    }

    fn policy(&self) -> Arc<Policy> {
        match &self.compiled {
            Some(policy) => Arc::clone(policy),
            None => Arc::new(Policy {
                any_origin: self.any_origin,
                origins: self.origins.clone(),
                methods: self.methods.join(", "),
                headers: self.headers.join(", "),
                max_age: self.max_age,
            }),
        }
    }

    /// Freezes the builder so requests share one policy allocation.
    #[must_use]
    pub fn build(mut self) -> Self {
        self.compiled = Some(self.policy());
        self
    }
}

impl Policy {
    fn allow_origin(&self, origin: &str) -> Option<String> {
        if self.any_origin {
            Some("*".to_owned())
        } else if self.origins.iter().any(|o| o == origin) {
            Some(origin.to_owned())
        } else {
            None
        }
    }

    fn decorate(&self, response: &mut Response, allow_origin: &str) {
        response.add_header("Access-Control-Allow-Origin", allow_origin);
        response.add_header("Access-Control-Allow-Methods", &self.methods);
        response.add_header("Access-Control-Allow-Headers", &self.headers);
        if allow_origin != "*" {
            response.add_header("Vary", "Origin");
        }
    }
}

impl Middleware for CorsMiddleware {
    fn handle(&self, session: HttpSession, next: Next) -> BoxResponse {
        let policy = self.policy();

        Box::pin(async move {
            let origin = session.request().headers().get("origin").map(str::to_owned);
            let Some(allow_origin) = origin.and_then(|o| policy.allow_origin(&o)) else {
                return next.run(session).await;
            };

            if session.request().method() == &Method::Options {
                let mut response = Response::new(StatusCode::NoContent)
                    .header("Access-Control-Max-Age", policy.max_age.to_string());
                policy.decorate(&mut response, &allow_origin);
                return response;
            }

            let mut response = next.run(session).await;
            policy.decorate(&mut response, &allow_origin);
            response
        })
    }
}
