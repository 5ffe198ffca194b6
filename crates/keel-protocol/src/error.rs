//! Keel error taxonomy and JSON-RPC 2.0 error codes.
//!
//! Every failure that crosses the wire is an [`RpcError`]. The code places it
//! in one of the taxonomy kinds; acquisition timeouts are not errors and never
//! show up here.

use serde::{Deserialize, Serialize};

/// Standard JSON-RPC 2.0 error codes plus the Keel taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorCode {
    // JSON-RPC 2.0 standard errors
    ParseError,
    InvalidRequest,
    MethodNotFound,

    // Taxonomy
    /// Bad arguments (e.g. an excessive wait time).
    ValidationError,
    /// The caller is not allowed to do this.
    AuthorizationError,
    /// I/O or transport failure below the domain layer.
    ResourceError,
    /// Unexpected failure. Full detail stays in the server log.
    InternalError,
    /// The transport is tearing down underneath the call.
    ShutdownInProgress,

    // Server lifecycle
    NotInitialized,

    Custom(i32),
}

impl RpcErrorCode {
    pub fn code(&self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::ValidationError => -32602,
            Self::InternalError => -32603,
            Self::NotInitialized => -32001,
            Self::ShutdownInProgress => -32002,
            Self::AuthorizationError => -32010,
            Self::ResourceError => -32020,
            Self::Custom(c) => *c,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            -32700 => Self::ParseError,
            -32600 => Self::InvalidRequest,
            -32601 => Self::MethodNotFound,
            -32602 => Self::ValidationError,
            -32603 => Self::InternalError,
            -32001 => Self::NotInitialized,
            -32002 => Self::ShutdownInProgress,
            -32010 => Self::AuthorizationError,
            -32020 => Self::ResourceError,
            c => Self::Custom(c),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcError {
    pub fn new(code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::ParseError, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::InvalidRequest, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(RpcErrorCode::MethodNotFound, format!("Method not found: {method}"))
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::ValidationError, message)
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::AuthorizationError, message)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::ResourceError, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::InternalError, message)
    }

    /// The message surfaced to callers when an unexpected failure happened.
    pub fn internal_generic() -> Self {
        Self::internal("Internal server error; see server log for details")
    }

    pub fn shutting_down() -> Self {
        Self::new(RpcErrorCode::ShutdownInProgress, "Server is shutting down")
    }

    pub fn not_initialized() -> Self {
        Self::new(RpcErrorCode::NotInitialized, "Server is not initialized")
    }

    pub fn error_code(&self) -> RpcErrorCode {
        RpcErrorCode::from_code(self.code)
    }

    pub fn is(&self, code: RpcErrorCode) -> bool {
        self.code == code.code()
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RPC Error [{}]: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}
