//! Process-wide map from login session name to its shared servant registry.
//!
//! Every attachment with the same session name shares one registry, so
//! stateful servants survive reconnects. The registry leaves the store only
//! when its last attachment is released with the close policy set.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::events::{EventBus, EventListener};
use crate::registry::ServantRegistry;

struct SharedState {
    registry: Arc<ServantRegistry>,
    attachments: usize,
}

pub struct SessionStateStore {
    states: RwLock<HashMap<String, SharedState>>,
    events: Arc<EventBus>,
}

impl SessionStateStore {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Look up or create the registry for `key` and count one more
    /// attachment to it.
    pub fn attach(&self, key: &str) -> Arc<ServantRegistry> {
        let mut states = self.states.write();
        let state = states.entry(key.to_string()).or_insert_with(|| {
            let registry = Arc::new(ServantRegistry::new(key));
            let weak: Weak<ServantRegistry> = Arc::downgrade(&registry);
            let listener: Weak<dyn EventListener> = weak;
            self.events.subscribe(key, listener);
            info!("Shared state created for session {key}");
            SharedState {
                registry,
                attachments: 0,
            }
        });
        state.attachments += 1;
        debug!("Session {key} now has {} attachment(s)", state.attachments);
        Arc::clone(&state.registry)
    }

    /// Count one attachment gone. Returns the registry when this was the
    /// last attachment and `close` is set; the caller must drain it.
    pub fn release(&self, key: &str, close: bool) -> Option<Arc<ServantRegistry>> {
        let mut states = self.states.write();
        let state = states.get_mut(key)?;
        state.attachments = state.attachments.saturating_sub(1);
        debug!("Session {key} now has {} attachment(s)", state.attachments);
        if state.attachments > 0 || !close {
            return None;
        }
        states.remove(key).map(|s| {
            info!("Shared state for session {key} released");
            s.registry
        })
    }

    pub fn attachments(&self, key: &str) -> usize {
        self.states.read().get(key).map_or(0, |s| s.attachments)
    }

    pub fn registry(&self, key: &str) -> Option<Arc<ServantRegistry>> {
        self.states.read().get(key).map(|s| Arc::clone(&s.registry))
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.states.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Remove every registry regardless of attachments, for server shutdown.
    pub fn take_all(&self) -> Vec<Arc<ServantRegistry>> {
        self.states.write().drain().map(|(_, s)| s.registry).collect()
    }
}
