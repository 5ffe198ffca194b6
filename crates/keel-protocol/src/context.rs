//! Call context: per-invocation state threaded through servant dispatch.
//!
//! Built by the router for every servant call from the connection's session.
//! Interceptors bind it as ambient state around the domain call, so handlers
//! can read the caller's principal without it being passed explicitly.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::identity::{Identity, Principal};

/// Context for a single servant invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallContext {
    /// Unique id of this call, for log correlation.
    pub call_id: String,
    /// Transport-level client connection that issued the call.
    pub client_id: String,
    /// Principal of the owning session.
    pub principal: Principal,
    /// Servant being invoked.
    pub target: Identity,
    /// Free-form key/values supplied by the client (e.g. a group override).
    #[serde(default)]
    pub values: HashMap<String, String>,
}

impl CallContext {
    pub fn new(
        call_id: impl Into<String>,
        client_id: impl Into<String>,
        principal: Principal,
        target: Identity,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            client_id: client_id.into(),
            principal,
            target,
            values: HashMap::new(),
        }
    }

    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}
