//! Route pattern compilation and matching.
//!
//! | Pattern              | Example match              | Captured values                  |
//! |----------------------|----------------------------|----------------------------------|
//! | `/users`             | `/users`                   | *(none)*                         |
//! | `/users/:id`         | `/users/42`                | `id → "42"`                      |
//! | `^/v(?P<n>\d+)/info$` | `/v2/info`                | `n → "2"`                        |
//! | `/files/*`           | `/files/docs/readme.txt`   | `wildcard → "/docs/readme.txt"`  |

use regex::Regex;

use super::RouteError;
use crate::session::RouteValues;

/// Name under which a wildcard pattern stores the matched remainder.
pub const WILDCARD: &str = "wildcard";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Segment {
    Static(String),
    Parameter(String),
}

#[derive(Debug, Clone)]
pub(crate) enum Pattern {
    Exact(String),
    Parameterized { segments: Vec<Segment> },
    /// Anchored against the whole normalized path; named groups become route values.
    Regex(Regex),
    /// Matches the prefix itself and anything below it.
    Wildcard(String),
}

/// Strips trailing slashes; the root stays `/`.
pub(crate) fn normalize(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() { "/" } else { trimmed }
}

/// Joins prefix pieces and a path into one normalized route path.
pub(crate) fn join(parts: &[&str]) -> String {
    let mut out = String::new();
    for part in parts {
        let part = part.trim_matches('/');
        if !part.is_empty() {
            out.push('/');
            out.push_str(part);
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Prepends literal prefixes to a route path. Regex paths get the escaped
/// prefix inserted after their `^`.
pub(crate) fn full_path(prefixes: &[&str], path: &str) -> String {
    match path.strip_prefix('^') {
        Some(expr) => {
            let prefix = join(prefixes);
            let prefix = if prefix == "/" { "" } else { prefix.as_str() };
            format!("^{}{expr}", regex::escape(prefix))
        }
        None => {
            let mut parts = prefixes.to_vec();
            parts.push(path);
            join(&parts)
        }
    }
}

impl Pattern {
    /// Classifies a full route path.
    ///
    /// A leading `^` marks a regular expression; a trailing `/*` a wildcard;
    /// any `:name` segment a parameterized pattern. Everything else is exact.
    pub(crate) fn parse(pattern: &str) -> Result<Self, RouteError> {
        if pattern.starts_with('^') {
            let anchored = if pattern.ends_with('$') {
                pattern.to_owned()
            } else {
                format!("{pattern}$")
            };
            let regex = Regex::new(&anchored).map_err(|source| RouteError::InvalidRegex {
                pattern: pattern.to_owned(),
                source,
            })?;
            return Ok(Self::Regex(regex));
        }

        let pattern = normalize(pattern);

        if pattern == "/*" {
            return Ok(Self::Wildcard(String::new()));
        }
        if let Some(prefix) = pattern.strip_suffix("/*") {
            return Ok(Self::Wildcard(prefix.to_owned()));
        }

        if pattern.split('/').any(|s| s.starts_with(':')) {
            let segments = pattern
                .split('/')
                .filter(|s| !s.is_empty())
                .map(|s| match s.strip_prefix(':') {
                    Some(name) => Segment::Parameter(name.to_owned()),
                    None => Segment::Static(s.to_owned()),
                })
                .collect();
            return Ok(Self::Parameterized { segments });
        }

        Ok(Self::Exact(pattern.to_owned()))
    }

    /// Names this pattern can capture.
    pub(crate) fn captures(&self) -> Vec<String> {
        match self {
            Self::Exact(_) => Vec::new(),
            Self::Parameterized { segments } => segments
                .iter()
                .filter_map(|s| match s {
                    Segment::Parameter(name) => Some(name.clone()),
                    Segment::Static(_) => None,
                })
                .collect(),
            Self::Regex(regex) => regex.capture_names().flatten().map(str::to_owned).collect(),
            Self::Wildcard(_) => vec![WILDCARD.to_owned()],
        }
    }

    /// Matches an already normalized path.
    pub(crate) fn matches(&self, path: &str) -> Option<RouteValues> {
        match self {
            Self::Exact(p) => (p == path).then(RouteValues::new),
            Self::Parameterized { segments } => {
                let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
                if parts.len() != segments.len() {
                    return None;
                }

                let mut values = RouteValues::new();
                for (segment, part) in segments.iter().zip(parts) {
                    match segment {
                        Segment::Static(s) if s != part => return None,
                        Segment::Static(_) => {}
                        Segment::Parameter(name) => values.insert(name.clone(), part),
                    }
                }
                Some(values)
            }
            Self::Regex(regex) => {
                let caps = regex.captures(path)?;
                let mut values = RouteValues::new();
                for name in regex.capture_names().flatten() {
                    if let Some(m) = caps.name(name) {
                        values.insert(name, m.as_str());
                    }
                }
                Some(values)
            }
            Self::Wildcard(prefix) => {
                let rest = path.strip_prefix(prefix.as_str())?;
                if !rest.is_empty() && !rest.starts_with('/') {
                    return None;
                }
                let mut values = RouteValues::new();
                values.insert(WILDCARD, rest);
                Some(values)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(p: &str) -> Pattern {
        Pattern::parse(p).unwrap()
    }

    #[test]
    fn parse_root_and_exact() {
        assert!(matches!(parse("/"), Pattern::Exact(s) if s == "/"));
        assert!(matches!(parse("/users/profile"), Pattern::Exact(s) if s == "/users/profile"));
    }

    #[test]
    fn parse_strips_trailing_slash() {
        assert!(matches!(parse("/users/"), Pattern::Exact(s) if s == "/users"));
    }

    #[test]
    fn parse_parameterized() {
        match parse("/users/:id/posts/:post_id") {
            Pattern::Parameterized { segments } => {
                assert_eq!(segments.len(), 4);
                assert_eq!(segments[1], Segment::Parameter("id".into()));
                assert_eq!(segments[3], Segment::Parameter("post_id".into()));
            }
            other => panic!("expected Parameterized, got {other:?}"),
        }
    }

    #[test]
    fn parse_wildcard() {
        assert!(matches!(parse("/files/*"), Pattern::Wildcard(s) if s == "/files"));
    }

    #[test]
    fn parse_rejects_bad_regex() {
        assert!(matches!(
            Pattern::parse("^/a(["),
            Err(RouteError::InvalidRegex { .. })
        ));
    }

    #[test]
    fn exact_match() {
        let pat = parse("/users");
        assert!(pat.matches("/users").is_some());
        assert!(pat.matches("/posts").is_none());
    }

    #[test]
    fn param_extracts_values() {
        let pat = parse("/users/:id/posts/:post_id");
        let values = pat.matches("/users/7/posts/99").unwrap();
        assert_eq!(values.get("id"), Some("7"));
        assert_eq!(values.get("post_id"), Some("99"));
        assert_eq!(pat.captures(), ["id", "post_id"]);
    }

    #[test]
    fn param_wrong_shape() {
        let pat = parse("/users/:id");
        assert!(pat.matches("/users").is_none());
        assert!(pat.matches("/users/42/extra").is_none());
        assert!(pat.matches("/posts/42").is_none());
    }

    #[test]
    fn regex_named_groups() {
        let pat = parse(r"^/v(?P<version>\d+)/info");
        let values = pat.matches("/v2/info").unwrap();
        assert_eq!(values.get("version"), Some("2"));
        assert!(pat.matches("/v2/info/more").is_none());
        assert_eq!(pat.captures(), ["version"]);
    }

    #[test]
    fn wildcard_respects_segment_boundary() {
        let pat = parse("/files/*");
        let values = pat.matches("/files/docs/readme.txt").unwrap();
        assert_eq!(values.get(WILDCARD), Some("/docs/readme.txt"));
        assert!(pat.matches("/files").is_some());
        assert!(pat.matches("/filesystem").is_none());
        assert!(pat.matches("/other/readme.txt").is_none());
    }

    #[test]
    fn join_builds_full_paths() {
        assert_eq!(join(&["/api", "/users/", ":id"]), "/api/users/:id");
        assert_eq!(join(&["", "/"]), "/");
        assert_eq!(join(&["/api/", ""]), "/api");
    }

    #[test]
    fn full_path_handles_regex_routes() {
        assert_eq!(full_path(&["/api"], "/users"), "/api/users");
        assert_eq!(full_path(&["/api.v1"], r"^/(?P<n>\d+)"), r"^/api\.v1/(?P<n>\d+)");
        assert_eq!(full_path(&[""], "^/x"), "^/x");
    }

    #[test]
    fn normalize_keeps_root() {
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("//"), "/");
        assert_eq!(normalize("/a/"), "/a");
    }
}
