//! Error types for the bridge.
//!
//! Local failures (bad arguments, missing descriptors, dead sockets) surface as
//! `BridgeError` values. Failures raised while serving a remote request never
//! leave the server; they are rendered into a `"failure <message>"` reply.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the bridge library.
#[derive(Debug, Error)]
pub enum BridgeError {
    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Could not resolve local host name: {0}")]
    HostResolution(String),

    // Transport errors
    #[error("Transport timeout after {timeout:?}: {message}")]
    TransportTimeout { timeout: Duration, message: String },

    #[error("Connection to {endpoint} failed: {message}")]
    ConnectionFailed {
        endpoint: String,
        message: String,
        #[source]
        source: Option<Box<BridgeError>>,
    },

    #[error("Channel is not connected")]
    NotConnected,

    #[error("Refusing to send an empty payload")]
    EmptyPayload,

    #[error("Protocol error: {0}")]
    Protocol(String),

    // Session errors
    #[error("Invalid session: {0}")]
    InvalidSession(String),

    #[error("Malformed session descriptor: {0}")]
    MalformedSession(String),

    #[error("Session {hostname}:{port} not found")]
    NotFound { hostname: String, port: u16 },

    #[error("Version mismatch: expected major {expected}, got {actual}")]
    VersionMismatch { expected: String, actual: String },

    #[error("Peer {hostname}:{port} is unreachable")]
    UnreachablePeer { hostname: String, port: u16 },

    // Dispatch errors
    #[error("Invalid key")]
    InvalidKey,

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("No endpoints connected")]
    NoEndpoints,

    #[error("Function name must not be empty")]
    EmptyFunctionName,

    // Registration errors
    #[error("Callback name must not be empty")]
    EmptyName,

    #[error("Callback already registered: {0}")]
    DuplicateName(String),

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Raised by user callbacks
    #[error("{0}")]
    Other(String),
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl BridgeError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        BridgeError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Wrap a lower-level failure as `ConnectionFailed` for `endpoint`.
    pub fn connection_failed(endpoint: impl Into<String>, cause: BridgeError) -> Self {
        BridgeError::ConnectionFailed {
            endpoint: endpoint.into(),
            message: cause.to_string(),
            source: Some(Box::new(cause)),
        }
    }

    /// Check if the operation that produced this error may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::TransportTimeout { .. } | BridgeError::ConnectionFailed { .. }
        )
    }
}
