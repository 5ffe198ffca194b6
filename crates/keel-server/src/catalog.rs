//! Public service names and the factories behind them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use keel_acquire::{BroadcastAccept, DirectoryPoll};
use keel_protocol::RpcError;
use keel_services::config::{ConfigService, SharedSettings};
use keel_services::raw_file::RawFileService;
use keel_services::shared_resources::SharedResourcesService;
use keel_services::ServiceInterface;

use crate::servant::{Servant, ServantBuilder};

pub type ServantFactory = Arc<dyn Fn(ServantBuilder<'_>) -> Servant + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Stateless,
    Stateful,
}

struct Entry {
    kind: ServiceKind,
    factory: ServantFactory,
}

/// Collaborators the bundled services are built from.
pub struct BundledServices {
    pub settings: SharedSettings,
    pub file_root: PathBuf,
    pub processors: Arc<BroadcastAccept>,
    pub resources: Arc<DirectoryPoll>,
}

#[derive(Default)]
pub struct ServiceCatalog {
    entries: HashMap<String, Entry>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Config`, `SharedResources` and the stateful `RawFile`.
    pub fn bundled(services: BundledServices) -> Self {
        let BundledServices {
            settings,
            file_root,
            processors,
            resources,
        } = services;

        let mut catalog = Self::new();
        catalog.register_stateless(ConfigService::INTERFACE, move |b| {
            b.stateless(ConfigService::new(settings.clone()))
        });
        catalog.register_stateless(SharedResourcesService::INTERFACE, move |b| {
            b.stateless(SharedResourcesService::new(processors.clone(), resources.clone()))
        });
        catalog.register_stateful(RawFileService::INTERFACE, move |b| {
            b.stateful(RawFileService::new(file_root.clone()))
        });
        catalog
    }

    pub fn register_stateless<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(ServantBuilder<'_>) -> Servant + Send + Sync + 'static,
    {
        self.insert(name.into(), ServiceKind::Stateless, Arc::new(factory));
    }

    pub fn register_stateful<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(ServantBuilder<'_>) -> Servant + Send + Sync + 'static,
    {
        self.insert(name.into(), ServiceKind::Stateful, Arc::new(factory));
    }

    fn insert(&mut self, name: String, kind: ServiceKind, factory: ServantFactory) {
        self.entries.insert(name, Entry { kind, factory });
    }

    /// The factory for `name`, which must be registered as `kind`.
    pub fn factory(&self, name: &str, kind: ServiceKind) -> Result<ServantFactory, RpcError> {
        match self.entries.get(name) {
            Some(entry) if entry.kind == kind => Ok(Arc::clone(&entry.factory)),
            Some(entry) => Err(RpcError::authorization(format!(
                "Service {name} is {:?}, not {kind:?}",
                entry.kind
            ))),
            None => Err(RpcError::authorization(format!("Unknown service: {name}"))),
        }
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
