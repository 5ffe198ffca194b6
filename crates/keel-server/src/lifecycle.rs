//! Stateful servant lifecycle: `ACTIVE -> CLOSING -> CLOSED`.
//!
//! Closing is two independent stages. The domain stage runs the service's
//! `pre_close` and `close` hooks; the unregistration stage publishes an
//! unregister event so the identity leaves its registry. Each stage runs
//! whatever the other did, a domain error wins over a bookkeeping error, and
//! `post_close` runs last no matter what.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use keel_protocol::{CallContext, Identity, LifecycleMethods, RpcError, RpcErrorCode};
use keel_services::{HandlerFuture, ServiceError, ServiceResult, StatefulService, current_context};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::dispatch::map_service_error;
use crate::events::{BusError, ServantEvent};
use crate::interceptor::{InterceptorChain, Invocation};
use crate::servant::{DispatchTable, ServantRuntime, bind_table};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Active,
    Closing,
    Closed,
}

/// Object-safe version of [`StatefulService`]'s hooks.
trait LifecycleDyn: Send + Sync {
    fn activate_dyn(&self) -> BoxFuture<'_, ServiceResult<()>>;
    fn passivate_dyn(&self) -> BoxFuture<'_, ServiceResult<()>>;
    fn pre_close_dyn(&self) -> BoxFuture<'_, ServiceResult<()>>;
    fn close_dyn(&self) -> BoxFuture<'_, ServiceResult<()>>;
    fn post_close_dyn(&self) -> BoxFuture<'_, ()>;
}

impl<S: StatefulService> LifecycleDyn for S {
    fn activate_dyn(&self) -> BoxFuture<'_, ServiceResult<()>> {
        Box::pin(self.activate())
    }

    fn passivate_dyn(&self) -> BoxFuture<'_, ServiceResult<()>> {
        Box::pin(self.passivate())
    }

    fn pre_close_dyn(&self) -> BoxFuture<'_, ServiceResult<()>> {
        Box::pin(self.pre_close())
    }

    fn close_dyn(&self) -> BoxFuture<'_, ServiceResult<()>> {
        Box::pin(StatefulService::close(self))
    }

    fn post_close_dyn(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.post_close())
    }
}

/// A servant holding resources, closed exactly once.
pub struct StatefulServant {
    identity: Identity,
    interface: &'static str,
    table: DispatchTable,
    hooks: Arc<dyn LifecycleDyn>,
    state: Mutex<LifecycleState>,
    runtime: ServantRuntime,
}

impl StatefulServant {
    pub(crate) fn new<S: StatefulService>(
        identity: Identity,
        svc: Arc<S>,
        chain: &InterceptorChain,
        runtime: ServantRuntime,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Self>| {
            let mut table = bind_table(&svc, chain);
            for (name, raw) in lifecycle_methods(this) {
                if table.contains_key(name) {
                    warn!("{} declares reserved method {name}; the lifecycle version wins", S::INTERFACE);
                }
                table.insert(name, chain.apply(name, raw));
            }
            let hooks: Arc<dyn LifecycleDyn> = svc;
            Self {
                identity,
                interface: S::INTERFACE,
                table,
                hooks,
                state: Mutex::new(LifecycleState::Active),
                runtime,
            }
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn interface(&self) -> &'static str {
        self.interface
    }

    pub(crate) fn table(&self) -> &DispatchTable {
        &self.table
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    pub fn ensure_active(&self) -> Result<(), RpcError> {
        match self.state() {
            LifecycleState::Active => Ok(()),
            state => Err(RpcError::resource(format!(
                "Servant {} is {state:?}",
                self.identity
            ))),
        }
    }

    pub async fn activate(&self) -> ServiceResult<()> {
        self.hooks.activate_dyn().await
    }

    pub async fn passivate(&self) -> ServiceResult<()> {
        self.hooks.passivate_dyn().await
    }

    /// Close and wait, running the pass on the dispatch pool. Falls back to
    /// running inline when the pool is gone.
    pub async fn close(self: &Arc<Self>) -> Result<(), RpcError> {
        if self.runtime.bridge.is_shut_down() {
            return self.close_pass().await;
        }
        let this = Arc::clone(self);
        let result = self
            .runtime
            .bridge
            .run_and_wait(format!("close:{}", self.identity), async move {
                this.close_pass().await.map(|()| Value::Null).map_err(ServiceError::Rpc)
            })
            .await;
        match result {
            // The pool shut down before the job ran.
            Err(e) if e.is(RpcErrorCode::ShutdownInProgress) && self.state() == LifecycleState::Active => {
                self.close_pass().await
            }
            other => other.map(|_| ()),
        }
    }

    /// The two-stage close. A servant that is already closing or closed is
    /// left alone.
    pub async fn close_pass(&self) -> Result<(), RpcError> {
        {
            let mut state = self.state.lock();
            if *state != LifecycleState::Active {
                debug!("Close of {} skipped: already {:?}", self.identity, *state);
                return Ok(());
            }
            *state = LifecycleState::Closing;
        }
        let label = self.identity.to_string();

        let hooks = &self.hooks;
        // Both hooks always run; the first failure is the one kept.
        let pre_close = run_hook(&label, "pre_close", hooks.pre_close_dyn()).await;
        let close = run_hook(&label, "close", hooks.close_dyn()).await;
        let stage1 = pre_close.err().or(close.err());

        let stage2 = match self
            .runtime
            .events
            .publish(ServantEvent::Unregister(self.identity.clone()))
        {
            Ok(_) => None,
            Err(BusError::ShuttingDown) => Some(RpcError::shutting_down()),
        };

        if AssertUnwindSafe(hooks.post_close_dyn()).catch_unwind().await.is_err() {
            error!("post_close of {label} panicked");
        }
        *self.state.lock() = LifecycleState::Closed;
        info!("Servant {label} closed");

        match (stage1, stage2) {
            (Some(e), _) | (None, Some(e)) => Err(e),
            (None, None) => Ok(()),
        }
    }
}

/// Await one domain hook, turning an error or a panic into the wire error.
async fn run_hook(
    label: &str,
    hook: &str,
    fut: BoxFuture<'_, ServiceResult<()>>,
) -> Result<(), RpcError> {
    let err = match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(e)) => map_service_error(label, e),
        Err(_) => {
            error!("{hook} of {label} panicked");
            RpcError::internal_generic()
        }
    };
    warn!("{hook} of {label} failed: {err}");
    Err(err)
}

fn upgrade(this: &Weak<StatefulServant>) -> ServiceResult<Arc<StatefulServant>> {
    this.upgrade()
        .ok_or_else(|| ServiceError::NotFound("Servant is gone".into()))
}

/// The reserved methods every stateful servant answers.
fn lifecycle_methods(this: &Weak<StatefulServant>) -> Vec<(&'static str, Invocation)> {
    let activate = this.clone();
    let passivate = this.clone();
    let close = this.clone();

    vec![
        (
            LifecycleMethods::ACTIVATE,
            Arc::new(move |_ctx: CallContext, _args: Value| -> HandlerFuture {
                let this = activate.clone();
                Box::pin(async move {
                    upgrade(&this)?.activate().await?;
                    Ok(json!({ "success": true }))
                })
            }),
        ),
        (
            LifecycleMethods::PASSIVATE,
            Arc::new(move |_ctx: CallContext, _args: Value| -> HandlerFuture {
                let this = passivate.clone();
                Box::pin(async move {
                    upgrade(&this)?.passivate().await?;
                    Ok(json!({ "success": true }))
                })
            }),
        ),
        (
            LifecycleMethods::CLOSE,
            // Already on a pool worker; run the pass directly.
            Arc::new(move |_ctx: CallContext, _args: Value| -> HandlerFuture {
                let this = close.clone();
                Box::pin(async move {
                    upgrade(&this)?.close_pass().await?;
                    Ok(json!({ "success": true }))
                })
            }),
        ),
        (
            LifecycleMethods::GET_CURRENT_CONTEXT,
            Arc::new(|_ctx: CallContext, _args: Value| -> HandlerFuture {
                Box::pin(async move { Ok(json!(current_context())) })
            }),
        ),
    ]
}
