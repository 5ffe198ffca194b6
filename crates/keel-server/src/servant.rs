//! Servants: a service instance bound to its identity and dispatch table.

use std::collections::HashMap;
use std::sync::Arc;

use keel_protocol::{CallContext, Identity, ProxyHandle, RpcError};
use keel_services::{HandlerFuture, ServiceInterface, StatefulService};
use serde_json::Value;

use crate::dispatch::DispatchBridge;
use crate::events::EventBus;
use crate::interceptor::{InterceptorChain, Invocation};
use crate::lifecycle::StatefulServant;

/// Method name → fully wrapped invocation.
pub(crate) type DispatchTable = HashMap<&'static str, Invocation>;

/// Bind every method of `S`'s table to `svc` and run each through the chain.
pub(crate) fn bind_table<S: ServiceInterface>(
    svc: &Arc<S>,
    chain: &InterceptorChain,
) -> DispatchTable {
    S::method_table()
        .iter()
        .map(|(name, handler)| {
            let handler = handler.clone();
            let svc = svc.clone();
            let raw: Invocation = Arc::new(move |_ctx: CallContext, args: Value| -> HandlerFuture {
                handler(svc.clone(), args)
            });
            (name, chain.apply(name, raw))
        })
        .collect()
}

/// Process-wide collaborators every servant needs.
#[derive(Clone)]
pub struct ServantRuntime {
    pub bridge: Arc<DispatchBridge>,
    pub events: Arc<EventBus>,
}

impl ServantRuntime {
    pub fn new(bridge: Arc<DispatchBridge>, events: Arc<EventBus>) -> Self {
        Self { bridge, events }
    }
}

pub struct StatelessServant {
    identity: Identity,
    interface: &'static str,
    table: DispatchTable,
}

/// A live servant of either kind. Cloning is cheap.
#[derive(Clone)]
pub enum Servant {
    Stateless(Arc<StatelessServant>),
    Stateful(Arc<StatefulServant>),
}

impl std::fmt::Debug for Servant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Servant")
            .field("identity", self.identity())
            .field("interface", &self.interface())
            .finish_non_exhaustive()
    }
}

impl Servant {
    pub fn identity(&self) -> &Identity {
        match self {
            Self::Stateless(s) => &s.identity,
            Self::Stateful(s) => s.identity(),
        }
    }

    pub fn interface(&self) -> &'static str {
        match self {
            Self::Stateless(s) => s.interface,
            Self::Stateful(s) => s.interface(),
        }
    }

    pub fn is_stateful(&self) -> bool {
        matches!(self, Self::Stateful(_))
    }

    pub fn as_stateful(&self) -> Option<&Arc<StatefulServant>> {
        match self {
            Self::Stateful(s) => Some(s),
            Self::Stateless(_) => None,
        }
    }

    pub fn proxy(&self) -> ProxyHandle {
        ProxyHandle {
            identity: self.identity().clone(),
            interface: self.interface().to_string(),
            stateful: self.is_stateful(),
        }
    }

    pub fn lookup(&self, method: &str) -> Option<Invocation> {
        let table = match self {
            Self::Stateless(s) => &s.table,
            Self::Stateful(s) => s.table(),
        };
        table.get(method).cloned()
    }

    /// Stateless servants are always callable; stateful ones only while
    /// `ACTIVE`.
    pub fn ensure_active(&self) -> Result<(), RpcError> {
        match self {
            Self::Stateless(_) => Ok(()),
            Self::Stateful(s) => s.ensure_active(),
        }
    }
}

/// Handed to catalog factories to turn a service instance into a servant.
pub struct ServantBuilder<'a> {
    identity: Identity,
    chain: &'a InterceptorChain,
    runtime: &'a ServantRuntime,
}

impl<'a> ServantBuilder<'a> {
    pub fn new(identity: Identity, chain: &'a InterceptorChain, runtime: &'a ServantRuntime) -> Self {
        Self {
            identity,
            chain,
            runtime,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn stateless<S: ServiceInterface>(self, svc: S) -> Servant {
        let svc = Arc::new(svc);
        Servant::Stateless(Arc::new(StatelessServant {
            table: bind_table(&svc, self.chain),
            identity: self.identity,
            interface: S::INTERFACE,
        }))
    }

    pub fn stateful<S: StatefulService>(self, svc: S) -> Servant {
        Servant::Stateful(StatefulServant::new(
            self.identity,
            Arc::new(svc),
            self.chain,
            self.runtime.clone(),
        ))
    }
}
