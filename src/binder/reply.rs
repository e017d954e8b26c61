//! Handler return values and the result pipeline.
//!
//! A handler may return nothing, a ready [`Response`], or a value. Values are
//! handed to the server's [`ResultSink`], which turns them into bytes on the
//! wire (JSON by default). Which of these a route produces is decided by the
//! handler's return type, so it is known when the route is compiled.

use std::fmt;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use super::args::BindError;
use crate::http::{Response, StatusCode};
use crate::session::HttpSession;

/// An error raised while binding or running a handler. The dispatch boundary
/// turns it into an error response; it never closes the connection.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("failed to serialize handler result: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("{0}")]
    Failed(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    /// Wraps any error (or message) raised by handler code.
    pub fn new(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Failed(error.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Bind(e) => e.status(),
            Self::Serialize(_) | Self::Failed(_) => StatusCode::InternalServerError,
        }
    }

    /// The response sent in place of the handler's own.
    pub fn into_response(self) -> Response {
        let status = self.status();
        Response::new(status).body(status.canonical_reason())
    }
}

/// What a handler produced.
#[derive(Debug)]
pub enum Reply {
    /// Nothing to forward; the server answers `200 OK` with no body.
    Empty,
    /// A response written by the handler itself.
    Response(Response),
    /// A value for the [`ResultSink`].
    Value(Value),
}

/// Whether a return type yields a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyShape {
    Empty,
    Value,
}

/// The closed set of return kinds a compiled route can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    NoResult,
    SyncValue,
    AsyncNoResult,
    AsyncValue,
}

impl ReplyKind {
    pub fn classify(shape: ReplyShape, is_async: bool) -> Self {
        match (shape, is_async) {
            (ReplyShape::Empty, false) => Self::NoResult,
            (ReplyShape::Value, false) => Self::SyncValue,
            (ReplyShape::Empty, true) => Self::AsyncNoResult,
            (ReplyShape::Value, true) => Self::AsyncValue,
        }
    }
}

impl fmt::Display for ReplyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NoResult => "no-result",
            Self::SyncValue => "sync-value",
            Self::AsyncNoResult => "async-no-result",
            Self::AsyncValue => "async-value",
        })
    }
}

/// Converts a handler's return value into a [`Reply`].
pub trait IntoReply: Send + 'static {
    const SHAPE: ReplyShape;

    /// # Errors
    ///
    /// Propagates a handler's `Err` or a serialization failure.
    fn into_reply(self) -> Result<Reply, HandlerError>;
}

impl IntoReply for () {
    const SHAPE: ReplyShape = ReplyShape::Empty;

    fn into_reply(self) -> Result<Reply, HandlerError> {
        Ok(Reply::Empty)
    }
}

impl IntoReply for Response {
    const SHAPE: ReplyShape = ReplyShape::Value;

    fn into_reply(self) -> Result<Reply, HandlerError> {
        Ok(Reply::Response(self))
    }
}

/// A serializable handler result.
#[derive(Debug, Clone)]
pub struct Json<T>(pub T);

impl<T: Serialize + Send + 'static> IntoReply for Json<T> {
    const SHAPE: ReplyShape = ReplyShape::Value;

    fn into_reply(self) -> Result<Reply, HandlerError> {
        Ok(Reply::Value(serde_json::to_value(&self.0)?))
    }
}

macro_rules! impl_into_reply_for_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl IntoReply for $ty {
                const SHAPE: ReplyShape = ReplyShape::Value;

                fn into_reply(self) -> Result<Reply, HandlerError> {
                    Ok(Reply::Value(Value::from(self)))
                }
            }
        )*
    };
}

impl_into_reply_for_value!(Value, String, &'static str, bool, i32, i64, u32, u64, f64);

/// `None` is the null result: nothing is forwarded to the sink.
impl<T: IntoReply> IntoReply for Option<T> {
    const SHAPE: ReplyShape = T::SHAPE;

    fn into_reply(self) -> Result<Reply, HandlerError> {
        match self {
            Some(value) => value.into_reply(),
            None => Ok(Reply::Empty),
        }
    }
}

impl<T, E> IntoReply for Result<T, E>
where
    T: IntoReply,
    E: Into<HandlerError> + Send + 'static,
{
    const SHAPE: ReplyShape = T::SHAPE;

    fn into_reply(self) -> Result<Reply, HandlerError> {
        match self {
            Ok(value) => value.into_reply(),
            Err(error) => Err(error.into()),
        }
    }
}

/// Turns a non-null handler value into a response.
pub trait ResultSink: Send + Sync + 'static {
    /// # Errors
    ///
    /// A serialization failure, surfaced to the client as a 500.
    fn render(&self, session: &HttpSession, value: Value) -> Result<Response, HandlerError>;
}

/// Writes values as `application/json` with status 200.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonResultSink;

impl ResultSink for JsonResultSink {
    fn render(&self, _session: &HttpSession, value: Value) -> Result<Response, HandlerError> {
        Ok(Response::json(StatusCode::Ok, &value)?)
    }
}

impl Reply {
    pub(crate) fn into_response(
        self,
        session: &HttpSession,
        sink: &dyn ResultSink,
    ) -> Result<Response, HandlerError> {
        match self {
            Self::Empty => Ok(Response::new(StatusCode::Ok)),
            Self::Response(response) => Ok(response),
            Self::Value(value) => sink.render(session, value),
        }
    }
}
