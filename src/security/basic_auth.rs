//! HTTP Basic authentication by path prefix.
//!
//! Rules live in a copy-on-write registry owned by one server. Readers load
//! the current snapshot without locking; writers serialize on a mutex, build
//! a new rule list and swap it in.

use std::sync::Arc;

use arc_swap::ArcSwap;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;
use tracing::debug;

use crate::{
    Response, StatusCode,
    middleware::{BoxResponse, Middleware, Next},
    server::{Module, Server, ServerError},
    session::HttpSession,
};

/// One protected prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRule {
    pub prefix: String,
    pub realm: String,
    username: String,
    password: String,
}

impl AuthRule {
    pub fn new(
        prefix: impl Into<String>,
        realm: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        let mut prefix: String = prefix.into();
        while prefix.len() > 1 && prefix.ends_with('/') {
            prefix.pop();
        }
        Self {
            prefix,
            realm: realm.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    fn covers(&self, path: &str) -> bool {
        if self.prefix == "/" {
            return true;
        }
        path.strip_prefix(self.prefix.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    }

    fn accepts(&self, authorization: Option<&str>) -> bool {
        let Some(encoded) = authorization.and_then(|v| v.strip_prefix("Basic ")) else {
            return false;
        };
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };
        decoded
            .split_once(':')
            .is_some_and(|(user, pass)| user == self.username && pass == self.password)
    }
}

#[derive(Debug, Default)]
struct Registry {
    current: ArcSwap<Vec<AuthRule>>,
    update: Mutex<()>,
}

/// Shared handle to a server's rule set. Clones refer to the same registry.
#[derive(Debug, Clone, Default)]
pub struct BasicAuthRules {
    inner: Arc<Registry>,
}

impl BasicAuthRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a rule, replacing any rule for the same prefix.
    pub fn add(&self, rule: AuthRule) {
        self.modify(|rules| {
            rules.retain(|r| r.prefix != rule.prefix);
            rules.push(rule);
            // Longest prefix first, so the most specific rule wins.
            rules.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        });
    }

    /// Returns whether a rule was removed.
    pub fn remove(&self, prefix: &str) -> bool {
        let mut removed = false;
        self.modify(|rules| {
            let before = rules.len();
            rules.retain(|r| r.prefix != prefix);
            removed = rules.len() != before;
        });
        removed
    }

    pub fn snapshot(&self) -> Arc<Vec<AuthRule>> {
        self.inner.current.load_full()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.current.load().is_empty()
    }

    /// The most specific rule covering `path`.
    pub fn rule_for(&self, path: &str) -> Option<AuthRule> {
        self.inner
            .current
            .load()
            .iter()
            .find(|rule| rule.covers(path))
            .cloned()
    }

    fn modify(&self, change: impl FnOnce(&mut Vec<AuthRule>)) {
        let _guard = self.inner.update.lock();
        let mut next = self.inner.current.load().as_ref().clone();
        change(&mut next);
        self.inner.current.store(Arc::new(next));
    }
}

/// Challenges requests under a protected prefix that lack matching
/// credentials with `401` and `WWW-Authenticate: Basic realm="..."`.
#[derive(Debug, Clone)]
pub struct BasicAuthMiddleware {
    rules: BasicAuthRules,
}

impl BasicAuthMiddleware {
    pub fn new(rules: BasicAuthRules) -> Self {
        Self { rules }
    }
}

impl Middleware for BasicAuthMiddleware {
    fn handle(&self, session: HttpSession, next: Next) -> BoxResponse {
        let rule = self.rules.rule_for(session.request().path());

        Box::pin(async move {
            let Some(rule) = rule else {
                return next.run(session).await;
            };
            if rule.accepts(session.request().headers().get("authorization")) {
                return next.run(session).await;
            }

            debug!(path = session.request().path(), realm = %rule.realm, "basic auth challenge");
            Response::new(StatusCode::Unauthorized)
                .header("WWW-Authenticate", format!("Basic realm=\"{}\"", rule.realm))
                .body("Unauthorized")
        })
    }
}

/// Protects a prefix on the server it is installed into.
///
/// ```rust,no_run
/// use rawserve::{Server, security::BasicAuth};
///
/// # async fn demo() -> Result<(), rawserve::ServerError> {
/// let mut server = Server::bind("127.0.0.1:0").await?;
/// server.install(BasicAuth::new("/admin", "admin area", "root", "hunter2"))?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct BasicAuth {
    rule: AuthRule,
}

impl BasicAuth {
    pub fn new(
        prefix: impl Into<String>,
        realm: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            rule: AuthRule::new(prefix, realm, username, password),
        }
    }
}

impl Module for BasicAuth {
    fn install(self, server: &mut Server) -> Result<(), ServerError> {
        server.auth_rules().add(self.rule);
        Ok(())
    }
}
