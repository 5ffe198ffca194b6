//! Discovery of candidate endpoints for directory polling.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What the caller wants a worker to open for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    /// Declared type of the endpoints able to serve this (e.g. "Tables").
    pub kind: String,
    /// The thing to open (a file id, a table name, ...).
    pub target: String,
    #[serde(default)]
    pub params: Value,
}

/// A resource opened on a remote worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceHandle {
    pub endpoint: String,
    pub resource_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CandidateError {
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("endpoint timed out")]
    Timeout,
    #[error("endpoint failed: {0}")]
    Failed(String),
}

impl CandidateError {
    /// Unreachable and timed-out endpoints may come back; poll again later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Timeout)
    }
}

/// A remote endpoint that may serve an acquire call.
pub trait Candidate: Send + Sync {
    fn endpoint(&self) -> &str;

    /// `Ok(None)` means the endpoint is up but declined.
    fn acquire<'a>(
        &'a self,
        descriptor: &'a ResourceDescriptor,
    ) -> BoxFuture<'a, Result<Option<ResourceHandle>, CandidateError>>;
}

/// Returns the currently known candidates of a declared type.
pub trait Discovery: Send + Sync {
    fn candidates<'a>(
        &'a self,
        declared_type: &'a str,
    ) -> BoxFuture<'a, Result<Vec<Arc<dyn Candidate>>, CandidateError>>;
}

/// Discovery over an explicitly maintained candidate list.
#[derive(Default)]
pub struct StaticDiscovery {
    by_type: RwLock<HashMap<String, Vec<Arc<dyn Candidate>>>>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, declared_type: impl Into<String>, candidate: Arc<dyn Candidate>) {
        self.by_type
            .write()
            .entry(declared_type.into())
            .or_default()
            .push(candidate);
    }

    /// Drop every candidate with the given endpoint. Returns how many went.
    pub fn deregister(&self, endpoint: &str) -> usize {
        let mut removed = 0;
        for list in self.by_type.write().values_mut() {
            let before = list.len();
            list.retain(|c| c.endpoint() != endpoint);
            removed += before - list.len();
        }
        removed
    }
}

impl Discovery for StaticDiscovery {
    fn candidates<'a>(
        &'a self,
        declared_type: &'a str,
    ) -> BoxFuture<'a, Result<Vec<Arc<dyn Candidate>>, CandidateError>> {
        let found = self
            .by_type
            .read()
            .get(declared_type)
            .cloned()
            .unwrap_or_default();
        Box::pin(async move { Ok(found) })
    }
}
