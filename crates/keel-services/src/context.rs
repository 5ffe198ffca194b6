//! Ambient call context.
//!
//! The principal-binding interceptor runs each handler inside
//! [`with_context`], so domain code reads the caller with
//! [`current_context`] instead of threading it through every signature.

use std::future::Future;

use keel_protocol::CallContext;

use crate::{ServiceError, ServiceResult};

tokio::task_local! {
    static CURRENT: CallContext;
}

/// Run `fut` with `ctx` as the ambient call context.
pub async fn with_context<F: Future>(ctx: CallContext, fut: F) -> F::Output {
    CURRENT.scope(ctx, fut).await
}

/// The ambient call context, if a call is in progress on this task.
pub fn current_context() -> Option<CallContext> {
    CURRENT.try_with(|ctx| ctx.clone()).ok()
}

/// The ambient call context, or a security error when none is bound.
pub fn require_context() -> ServiceResult<CallContext> {
    current_context().ok_or_else(|| ServiceError::Security("No call context bound".into()))
}
