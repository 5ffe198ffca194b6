//! Servant identities, principals and proxy handles.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Stable `(category, name)` address of a servant.
///
/// The category is the owning session's name; the name is either a public
/// service name (stateless) or a generated unique key (stateful).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    pub category: String,
    pub name: String,
}

impl Identity {
    pub fn new(category: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.category, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityParseError {
    #[error("identity is missing the '/' separator: {0}")]
    MissingSeparator(String),
    #[error("identity has an empty name: {0}")]
    EmptyName(String),
}

impl FromStr for Identity {
    type Err = IdentityParseError;

    /// Parses `category/name`. The category may be empty; the name may not.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (category, name) = s
            .split_once('/')
            .ok_or_else(|| IdentityParseError::MissingSeparator(s.to_string()))?;
        if name.is_empty() {
            return Err(IdentityParseError::EmptyName(s.to_string()));
        }
        Ok(Self::new(category, name))
    }
}

/// The authenticated party a session is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    /// Login name.
    pub user: String,
    pub user_id: i64,
    /// Active group name.
    pub group: String,
    pub group_id: i64,
    /// Administrators may use workers owned by any user.
    #[serde(default)]
    pub admin: bool,
    /// Login session name. Attachments of the same user with the same session
    /// name share one servant registry.
    pub session: String,
}

impl Principal {
    /// The key under which this principal's shared state is stored; also the
    /// category of every servant the session owns. It carries the user id, so
    /// two users naming their sessions alike never share state.
    pub fn session_key(&self) -> String {
        format!("{}:{}", self.user_id, self.session)
    }
}

/// What a client receives when it asks for a service: enough to address the
/// servant on later calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyHandle {
    pub identity: Identity,
    /// Declared interface of the servant (e.g. "Config", "RawFile").
    pub interface: String,
    pub stateful: bool,
}
