//! Keel Server: sessions, servants and the dispatch bridge.
//!
//! The server owns the process-wide runtime (worker pool, event bus, shared
//! session state), builds a [`Session`] per connection and provides the
//! `RequestHandler` implementation for the transport layer.

pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod interceptor;
pub mod lifecycle;
pub mod manager;
pub mod registry;
pub mod router;
pub mod servant;
pub mod session;
pub mod store;

pub use catalog::{BundledServices, ServiceCatalog, ServiceKind};
pub use config::ServerConfig;
pub use dispatch::{Completion, DispatchBridge, PendingInvocation, PendingResult};
pub use events::{BusError, EventBus, EventListener, ServantEvent};
pub use interceptor::{Interceptor, InterceptorChain, Invocation};
pub use lifecycle::{LifecycleState, StatefulServant};
pub use manager::SessionManager;
pub use registry::{DrainReport, RegistryError, ServantRegistry};
pub use router::{RpcServer, ServerState};
pub use servant::{Servant, ServantBuilder, ServantRuntime};
pub use session::{Session, SessionEnv, SessionInfo};
pub use store::SessionStateStore;
