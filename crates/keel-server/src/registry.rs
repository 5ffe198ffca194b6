//! Concurrent keyed store of live servants for one session category.
//!
//! Lock ordering: the whole-table lock is a `RwLock<()>`. Creators take it
//! shared and then the per-key mutex; teardown takes it exclusive and never
//! touches a per-key mutex. Both paths acquire the table lock first, so no
//! cycle exists. Work running on the dispatch pool never takes either lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use keel_protocol::{Identity, RpcError};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, info, warn};

use crate::events::{EventListener, ServantEvent};
use crate::servant::Servant;

/// Key of the whole-table lock.
pub const WHOLE_TABLE: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("servant {0} is already registered")]
    Duplicate(Identity),
    #[error("registry {0} has been drained")]
    Drained(String),
}

impl From<RegistryError> for RpcError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Duplicate(_) => RpcError::internal_generic(),
            RegistryError::Drained(_) => RpcError::resource(err.to_string()),
        }
    }
}

/// Held registry lock. Dropping it releases the lock.
pub enum RegistryLock<'a> {
    Table {
        _table: RwLockWriteGuard<'a, ()>,
    },
    Key {
        _table: RwLockReadGuard<'a, ()>,
        _key: OwnedMutexGuard<()>,
    },
}

/// Outcome of [`ServantRegistry::drain`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub entries: usize,
    pub closed: usize,
    /// Keys whose close pass reported an error. They were removed anyway.
    pub failed: Vec<String>,
}

pub struct ServantRegistry {
    category: String,
    entries: DashMap<String, Servant>,
    key_locks: DashMap<String, Arc<Mutex<()>>>,
    table: RwLock<()>,
    drained: AtomicBool,
}

impl ServantRegistry {
    pub fn new(category: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            entries: DashMap::new(),
            key_locks: DashMap::new(),
            table: RwLock::new(()),
            drained: AtomicBool::new(false),
        }
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn identity_of(&self, key: &str) -> Identity {
        Identity::new(self.category.as_str(), key)
    }

    /// Acquire the lock for `key`; [`WHOLE_TABLE`] excludes every creator.
    pub async fn lock(&self, key: &str) -> RegistryLock<'_> {
        if key == WHOLE_TABLE {
            return RegistryLock::Table {
                _table: self.table.write().await,
            };
        }
        let table = self.table.read().await;
        let key_lock = self
            .key_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        RegistryLock::Key {
            _table: table,
            _key: key_lock.lock_owned().await,
        }
    }

    pub fn get(&self, key: &str) -> Option<Servant> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Store `servant` under `key`, returning whatever it replaced.
    pub fn put(&self, key: impl Into<String>, servant: Servant) -> Option<Servant> {
        self.entries.insert(key.into(), servant)
    }

    pub fn remove(&self, key: &str) -> Option<Servant> {
        let removed = self.entries.remove(key).map(|(_, s)| s);
        // Nobody else holds the mutex once only the map references it.
        self.key_locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        if removed.is_some() {
            debug!("Servant {}/{key} unregistered", self.category);
        }
        removed
    }

    pub fn list_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), RegistryError> {
        if self.is_drained() {
            return Err(RegistryError::Drained(self.category.clone()));
        }
        Ok(())
    }

    /// Return the servant under `key`, creating it with `factory` if absent.
    /// Creation is serialized per key.
    pub async fn get_or_create<F>(&self, key: &str, factory: F) -> Result<Servant, RpcError>
    where
        F: FnOnce() -> Result<Servant, RpcError>,
    {
        let _lock = self.lock(key).await;
        self.ensure_open()?;
        if let Some(existing) = self.get(key) {
            return Ok(existing);
        }
        let servant = factory()?;
        self.entries.insert(key.to_string(), servant.clone());
        debug!("Servant {} created", servant.identity());
        Ok(servant)
    }

    /// Create a servant under a key that must not exist yet.
    pub async fn create<F>(&self, key: &str, factory: F) -> Result<Servant, RpcError>
    where
        F: FnOnce() -> Result<Servant, RpcError>,
    {
        let _lock = self.lock(key).await;
        self.ensure_open()?;
        if self.contains(key) {
            let err = RegistryError::Duplicate(self.identity_of(key));
            error!("Refusing to register servant: {err}");
            return Err(err.into());
        }
        let servant = factory()?;
        self.entries.insert(key.to_string(), servant.clone());
        debug!("Servant {} created", servant.identity());
        Ok(servant)
    }

    /// Close every stateful servant and empty the table. No servant can be
    /// created while this runs or afterwards. A failed close is logged and
    /// the entry removed anyway.
    pub async fn drain(&self) -> DrainReport {
        let _table = self.lock(WHOLE_TABLE).await;
        self.drained.store(true, Ordering::SeqCst);

        let keys = self.list_keys();
        let mut report = DrainReport {
            entries: keys.len(),
            ..DrainReport::default()
        };
        for key in keys {
            // A close pass may already have unregistered it.
            let Some(servant) = self.get(&key) else {
                continue;
            };
            if let Some(stateful) = servant.as_stateful() {
                match stateful.close().await {
                    Ok(()) => report.closed += 1,
                    Err(e) => {
                        warn!("Close of {} failed during drain: {e}", servant.identity());
                        report.failed.push(key.clone());
                    }
                }
            }
            self.entries.remove(&key);
        }
        self.key_locks.clear();
        info!(
            "Registry {} drained: {} entries, {} closed, {} failed",
            self.category,
            report.entries,
            report.closed,
            report.failed.len()
        );
        report
    }
}

impl EventListener for ServantRegistry {
    fn on_event(&self, event: &ServantEvent) {
        match event {
            ServantEvent::Unregister(identity) if identity.category == self.category => {
                self.remove(&identity.name);
            }
            ServantEvent::Unregister(_) => {}
        }
    }
}
