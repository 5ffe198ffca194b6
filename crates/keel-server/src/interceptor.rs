//! Interceptor chain for servant calls.
//!
//! Interceptors wrap the raw domain call of every servant method. The chain
//! is applied once, when a servant is built; each call then runs through the
//! already-wrapped invocation without re-establishing anything.

use std::sync::Arc;
use std::time::Instant;

use keel_protocol::CallContext;
use keel_services::{HandlerFuture, with_context};
use serde_json::Value;
use tracing::{Instrument, debug, debug_span};

/// A servant method ready to be called with a context and arguments.
pub type Invocation = Arc<dyn Fn(CallContext, Value) -> HandlerFuture + Send + Sync>;

/// Trait for call interceptors.
pub trait Interceptor: Send + Sync {
    /// Interceptor name for debugging.
    fn name(&self) -> &str;

    /// Priority (lower runs first, i.e. outermost).
    fn priority(&self) -> i32 {
        0
    }

    /// Wrap `next`, the rest of the chain for `method`.
    fn wrap(&self, method: &'static str, next: Invocation) -> Invocation;
}

/// An ordered list of interceptors.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// The chain every session gets unless told otherwise.
    pub fn standard() -> Self {
        let mut chain = Self::new();
        chain.add(CallLogging);
        chain.add(PrincipalBinding);
        chain
    }

    pub fn add<I: Interceptor + 'static>(&mut self, interceptor: I) {
        self.interceptors.push(Arc::new(interceptor));
        self.interceptors.sort_by_key(|i| i.priority());
    }

    /// Wrap `raw` so the first interceptor is the outermost layer.
    pub fn apply(&self, method: &'static str, raw: Invocation) -> Invocation {
        self.interceptors
            .iter()
            .rev()
            .fold(raw, |next, interceptor| interceptor.wrap(method, next))
    }

    pub fn names(&self) -> Vec<&str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Bundled interceptors
// ─────────────────────────────────────────────────────────────────────────────

/// Binds the call context as ambient state around the domain call.
pub struct PrincipalBinding;

impl Interceptor for PrincipalBinding {
    fn name(&self) -> &str {
        "principal-binding"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn wrap(&self, _method: &'static str, next: Invocation) -> Invocation {
        Arc::new(move |ctx: CallContext, args: Value| -> HandlerFuture {
            let inner = next(ctx.clone(), args);
            Box::pin(with_context(ctx, inner))
        })
    }
}

/// Runs every call inside a tracing span and logs its duration.
pub struct CallLogging;

impl Interceptor for CallLogging {
    fn name(&self) -> &str {
        "call-logging"
    }

    fn priority(&self) -> i32 {
        -10
    }

    fn wrap(&self, method: &'static str, next: Invocation) -> Invocation {
        Arc::new(move |ctx: CallContext, args: Value| -> HandlerFuture {
            let span = debug_span!(
                "servant_call",
                method,
                target = %ctx.target,
                call_id = %ctx.call_id,
                user = %ctx.principal.user,
            );
            let inner = next(ctx, args);
            Box::pin(
                async move {
                    let started = Instant::now();
                    let result = inner.await;
                    debug!(ok = result.is_ok(), "call finished in {:?}", started.elapsed());
                    result
                }
                .instrument(span),
            )
        })
    }
}
