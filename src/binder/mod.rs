//! Route compilation. A handler's declared parameters and its return type
//! are resolved once, when the route is registered.
//!
//! ```rust,no_run
//! use rawserve::binder::{arg, compile, session, Json};
//! use rawserve::session::HttpSession;
//!
//! async fn show(session: HttpSession, id: u64, verbose: bool) -> Json<serde_json::Value> {
//!     Json(serde_json::json!({ "id": id, "verbose": verbose, "path": session.request().path() }))
//! }
//!
//! let compiled = compile((session(), arg::<u64>("id"), arg::<bool>("verbose").or(false)), show);
//! assert_eq!(compiled.params().len(), 3);
//! ```
//!
//! At request time the executor only resolves values and calls the handler;
//! all type decisions were made by the compiler when `compile` was
//! monomorphized.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::debug;

use crate::http::Response;
use crate::session::HttpSession;

pub mod args;
pub mod fn_trait;
pub mod reply;
pub mod value;

pub use args::{
    Arg, Bind, BindError, JsonBody, Optional, ParamInfo, ParamSource, SessionArg, WithController,
    WithDefault, arg, json_body, session,
};
pub use fn_trait::{AsyncHandler, SyncHandler};
pub use reply::{
    HandlerError, IntoReply, Json, JsonResultSink, Reply, ReplyKind, ReplyShape, ResultSink,
};
pub use value::{ConversionError, ParamValue};

/// The future a compiled executor returns.
pub type ExecFuture = Pin<Box<dyn Future<Output = Result<Response, HandlerError>> + Send>>;

/// A compiled route body: `(session, result sink) → response`.
///
/// Holds no mutable state; it captures the descriptors and the handler only.
pub type CompiledExecutor =
    Arc<dyn Fn(HttpSession, Arc<dyn ResultSink>) -> ExecFuture + Send + Sync + 'static>;

/// A compiled handler plus what was learned about it at registration.
#[derive(Clone)]
pub struct Compiled {
    executor: CompiledExecutor,
    params: Vec<ParamInfo>,
    kind: ReplyKind,
}

impl Compiled {
    pub fn executor(&self) -> &CompiledExecutor {
        &self.executor
    }

    pub fn params(&self) -> &[ParamInfo] {
        &self.params
    }

    pub fn kind(&self) -> ReplyKind {
        self.kind
    }

    /// Runs the executor for one request.
    ///
    /// # Errors
    ///
    /// Any [`HandlerError`] from binding or from the handler itself.
    pub async fn execute(
        &self,
        session: HttpSession,
        sink: Arc<dyn ResultSink>,
    ) -> Result<Response, HandlerError> {
        (self.executor)(session, sink).await
    }
}

impl std::fmt::Debug for Compiled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compiled")
            .field("params", &self.params)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

fn describe<B: Bind>(binders: &B) -> Vec<ParamInfo> {
    let mut params = Vec::new();
    binders.describe(&mut params);
    params
}

/// Compiles an async handler.
pub fn compile<B, H>(binders: B, handler: H) -> Compiled
where
    B: Bind,
    H: AsyncHandler<B::Output>,
    H::Output: IntoReply,
{
    let params = describe(&binders);
    let kind = ReplyKind::classify(<H::Output as IntoReply>::SHAPE, true);
    debug!(params = params.len(), %kind, "compiled async handler");

    let state = Arc::new((binders, handler));
    let executor: CompiledExecutor =
        Arc::new(move |session: HttpSession, sink: Arc<dyn ResultSink>| {
            let state = Arc::clone(&state);
            Box::pin(async move {
                let (binders, handler) = &*state;
                let args = binders.bind(&session)?;
                let reply = handler.call(args).await.into_reply()?;
                reply.into_response(&session, sink.as_ref())
            }) as ExecFuture
        });

    Compiled {
        executor,
        params,
        kind,
    }
}

/// Compiles a synchronous handler; it runs inline on the connection's task.
pub fn compile_sync<B, H>(binders: B, handler: H) -> Compiled
where
    B: Bind,
    H: SyncHandler<B::Output>,
    H::Output: IntoReply,
{
    let params = describe(&binders);
    let kind = ReplyKind::classify(<H::Output as IntoReply>::SHAPE, false);
    debug!(params = params.len(), %kind, "compiled sync handler");

    let state = Arc::new((binders, handler));
    let executor: CompiledExecutor =
        Arc::new(move |session: HttpSession, sink: Arc<dyn ResultSink>| {
            let state = Arc::clone(&state);
            Box::pin(async move {
                let (binders, handler) = &*state;
                let args = binders.bind(&session)?;
                let reply = handler.call(args).into_reply()?;
                reply.into_response(&session, sink.as_ref())
            }) as ExecFuture
        });

    Compiled {
        executor,
        params,
        kind,
    }
}
