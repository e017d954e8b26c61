//! The HTTP side of the WebSocket upgrade (RFC 6455 §4.2).

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::http::{Method, Request, Response, StatusCode};

/// Appended to the client key before hashing.
pub const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub const SUPPORTED_VERSION: &str = "13";

/// `Sec-WebSocket-Accept` for a client key.
///
/// ```
/// use rawserve::realtime::websocket::accept_key;
///
/// assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
/// ```
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(ACCEPT_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// A rejected upgrade request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("websocket handshake rejected ({status}): {reason}")]
pub struct HandshakeError {
    status: StatusCode,
    reason: &'static str,
}

impl HandshakeError {
    fn bad_request(reason: &'static str) -> Self {
        Self {
            status: StatusCode::BadRequest,
            reason,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn reason(&self) -> &'static str {
        self.reason
    }

    /// The rejection sent to the client; the connection closes after it.
    pub fn into_response(self) -> Response {
        let response = Response::new(self.status).body(self.reason).keep_alive(false);
        if self.status == StatusCode::UpgradeRequired {
            response.header("Sec-WebSocket-Version", SUPPORTED_VERSION)
        } else {
            response
        }
    }
}

/// An accepted upgrade, ready to answer with `101 Switching Protocols`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    accept: String,
    protocol: Option<String>,
}

impl Handshake {
    /// Checks an upgrade request.
    ///
    /// With `required_protocol` set, the client must offer exactly that
    /// subprotocol (case-sensitive) among its `Sec-WebSocket-Protocol`
    /// tokens.
    ///
    /// # Errors
    ///
    /// `400` for a non-GET request, missing upgrade headers, a missing key or
    /// a subprotocol mismatch; `426` for a version other than 13.
    pub fn validate(
        request: &Request,
        required_protocol: Option<&str>,
    ) -> Result<Self, HandshakeError> {
        if *request.method() != Method::Get {
            return Err(HandshakeError::bad_request("websocket upgrade requires GET"));
        }

        let headers = request.headers();
        if !headers.has_token("upgrade", "websocket") {
            return Err(HandshakeError::bad_request("missing Upgrade: websocket"));
        }
        if !headers.has_token("connection", "upgrade") {
            return Err(HandshakeError::bad_request("missing Connection: Upgrade"));
        }
        let key = headers
            .get("sec-websocket-key")
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| HandshakeError::bad_request("missing Sec-WebSocket-Key"))?;

        if headers.get("sec-websocket-version").map(str::trim) != Some(SUPPORTED_VERSION) {
            return Err(HandshakeError {
                status: StatusCode::UpgradeRequired,
                reason: "unsupported websocket version",
            });
        }

        let protocol = match required_protocol {
            Some(required) => {
                if !headers.tokens("sec-websocket-protocol").any(|p| p == required) {
                    return Err(HandshakeError::bad_request("required subprotocol not offered"));
                }
                Some(required.to_owned())
            }
            None => None,
        };

        Ok(Self {
            accept: accept_key(key),
            protocol,
        })
    }

    pub fn accept(&self) -> &str {
        &self.accept
    }

    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// The `101` head. It carries no `Content-Length`: the stream changes
    /// hands right after it.
    pub fn response(&self) -> Response {
        let response = Response::new(StatusCode::SwitchingProtocols)
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
            .header("Sec-WebSocket-Accept", self.accept.as_str());
        let response = match &self.protocol {
            Some(protocol) => response.header("Sec-WebSocket-Protocol", protocol.as_str()),
            None => response,
        };
        response.head_only()
    }
}
