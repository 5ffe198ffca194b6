//! The JSON-RPC 2.0 envelope as Keel speaks it.
//!
//! Inbound text frames are parsed once into a [`Call`]. Everything going out
//! is an [`RpcResponse`] or an [`RpcNotification`]. The `"jsonrpc"` marker is
//! the zero-sized [`Version`], so a frame claiming any other version never
//! becomes a `Call`.

use serde::de::{Error as _, Unexpected};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::RpcError;

/// Result of a servant invocation or session operation.
pub type HandlerResult = Result<Value, RpcError>;

/// The `"2.0"` version marker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Version;

impl Version {
    pub const WIRE: &'static str = "2.0";
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(Self::WIRE)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw == Self::WIRE {
            Ok(Version)
        } else {
            Err(D::Error::invalid_value(Unexpected::Str(&raw), &"\"2.0\""))
        }
    }
}

/// Request id: a string or an integer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound
// ─────────────────────────────────────────────────────────────────────────────

/// One inbound request.
#[derive(Debug, Clone, Deserialize)]
pub struct Call {
    #[serde(rename = "jsonrpc")]
    _version: Version,
    #[serde(default)]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Call {
    /// Parse a text frame. On failure the ready-made error response is
    /// returned, carrying the request id whenever one could be read.
    pub fn parse(text: &str) -> Result<Self, RpcResponse> {
        let raw: Value = serde_json::from_str(text)
            .map_err(|_| RpcResponse::failure(None, RpcError::parse_error("Invalid JSON")))?;
        let id = raw
            .get("id")
            .cloned()
            .and_then(|v| serde_json::from_value::<RequestId>(v).ok());
        match serde_json::from_value::<Call>(raw) {
            Ok(call) if !call.method.is_empty() => Ok(call),
            _ => Err(RpcResponse::failure(
                id,
                RpcError::invalid_request("Invalid JSON-RPC 2.0 request"),
            )),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound
// ─────────────────────────────────────────────────────────────────────────────

/// Either half of a response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Result(Value),
    Error(RpcError),
}

/// A response. The id is echoed as sent, `null` when the request had none or
/// could not be read.
#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: Version,
    pub id: Option<RequestId>,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl RpcResponse {
    /// Answer a call with its handler's outcome.
    pub fn reply(id: Option<RequestId>, result: HandlerResult) -> Self {
        let outcome = match result {
            Ok(value) => Outcome::Result(value),
            Err(err) => Outcome::Error(err),
        };
        Self {
            jsonrpc: Version,
            id,
            outcome,
        }
    }

    pub fn failure(id: Option<RequestId>, error: RpcError) -> Self {
        Self::reply(id, Err(error))
    }
}

/// Server-initiated message; no id and no reply.
#[derive(Debug, Clone, Serialize)]
pub struct RpcNotification {
    pub jsonrpc: Version,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: Version,
            method: method.into(),
            params,
        }
    }
}
