//! Servant contracts and bundled services.
//!
//! A service declares its interface once as a [`MethodTable`]: method names
//! mapped to typed handler functions. The server turns an instance plus its
//! table into a servant, wrapping every handler in the session's interceptor
//! chain exactly once at construction time.
//!
//! Stateful services additionally implement [`StatefulService`], whose hooks
//! drive the activate / passivate / close lifecycle.

pub mod config;
pub mod context;
pub mod raw_file;
pub mod shared_resources;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use keel_protocol::RpcError;
use serde::de::DeserializeOwned;
use serde_json::Value;

pub use context::{current_context, require_context, with_context};

// ─────────────────────────────────────────────────────────────────────────────
// Domain errors
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised by domain code. The dispatch layer maps each onto the
/// nearest wire taxonomy kind.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Security(String),
    #[error("{0}")]
    NotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("{0}")]
    Internal(String),
}

impl ServiceError {
    /// Internal errors carry detail that must stay in the server log.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}

impl From<ServiceError> for RpcError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Validation(msg) => RpcError::validation(msg),
            ServiceError::Security(msg) => RpcError::authorization(msg),
            ServiceError::NotFound(msg) => RpcError::resource(msg),
            ServiceError::Io(e) => RpcError::resource(format!("I/O error: {e}")),
            ServiceError::Rpc(e) => e,
            ServiceError::Internal(_) => RpcError::internal_generic(),
        }
    }
}

impl From<keel_acquire::AcquireError> for ServiceError {
    fn from(err: keel_acquire::AcquireError) -> Self {
        Self::Rpc(err.into())
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

// ─────────────────────────────────────────────────────────────────────────────
// Dispatch tables
// ─────────────────────────────────────────────────────────────────────────────

/// Boxed future returned by every handler.
pub type HandlerFuture = BoxFuture<'static, ServiceResult<Value>>;

/// A typed handler: the servant instance plus JSON arguments.
pub type Handler<S> = Arc<dyn Fn(Arc<S>, Value) -> HandlerFuture + Send + Sync>;

/// Method name → handler, built once per interface definition.
pub struct MethodTable<S> {
    interface: &'static str,
    methods: HashMap<&'static str, Handler<S>>,
}

impl<S: Send + Sync + 'static> MethodTable<S> {
    pub fn new(interface: &'static str) -> Self {
        Self {
            interface,
            methods: HashMap::new(),
        }
    }

    /// Register `handler` under `name`.
    pub fn method<F, Fut>(mut self, name: &'static str, handler: F) -> Self
    where
        F: Fn(Arc<S>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ServiceResult<Value>> + Send + 'static,
    {
        let erased: Handler<S> = Arc::new(move |svc: Arc<S>, args: Value| -> HandlerFuture {
            Box::pin(handler(svc, args))
        });
        self.methods.insert(name, erased);
        self
    }

    pub fn interface(&self) -> &'static str {
        self.interface
    }

    pub fn get(&self, name: &str) -> Option<&Handler<S>> {
        self.methods.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Handler<S>)> {
        self.methods.iter().map(|(name, h)| (*name, h))
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.methods.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// Implemented by every service type that can back a servant.
pub trait ServiceInterface: Send + Sync + Sized + 'static {
    /// Declared interface name, e.g. "Config".
    const INTERFACE: &'static str;

    /// The interface's dispatch table. Implementations build it once and keep
    /// it in a `static`.
    fn method_table() -> &'static MethodTable<Self>;
}

/// Lifecycle hooks of a servant holding resources.
///
/// The close pass runs `pre_close`, then `close`; a failure in either is
/// reported but does not stop the servant from being unregistered.
/// `post_close` always runs last and cannot fail.
pub trait StatefulService: ServiceInterface {
    fn activate(&self) -> impl Future<Output = ServiceResult<()>> + Send {
        async { Ok(()) }
    }

    fn passivate(&self) -> impl Future<Output = ServiceResult<()>> + Send {
        async { Ok(()) }
    }

    fn pre_close(&self) -> impl Future<Output = ServiceResult<()>> + Send {
        async { Ok(()) }
    }

    /// Domain close behavior.
    fn close(&self) -> impl Future<Output = ServiceResult<()>> + Send {
        async { Ok(()) }
    }

    fn post_close(&self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Deserialize handler arguments, mapping failures to a validation error.
pub fn parse_args<T: DeserializeOwned>(args: Value) -> ServiceResult<T> {
    serde_json::from_value(args).map_err(|e| ServiceError::Validation(format!("Invalid arguments: {e}")))
}

/// Like [`parse_args`] but falls back to `T::default()` for null/missing args.
pub fn parse_args_optional<T: DeserializeOwned + Default>(args: Value) -> ServiceResult<T> {
    if args.is_null() {
        return Ok(T::default());
    }
    parse_args(args)
}
