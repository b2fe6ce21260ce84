//! Application error types.
//!
//! All errors use `thiserror`. The worker, pool and dispatch layers each have
//! their own typed failure so that nothing reaches the wire as a generic
//! error; the crate-level [`Error`] wraps them for the IPC surface.

use std::time::Duration;

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// A worker could not be reached, or its startup routine failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("connect to {address} failed: {reason}")]
pub struct ConnectError {
    pub address: String,
    pub reason: String,
}

impl ConnectError {
    pub fn new(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            reason: reason.into(),
        }
    }
}

/// A previously healthy connection broke mid-call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport failure: {0}")]
    Broken(String),

    /// The worker answered with an error; the connection is still usable.
    #[error("remote error: {0}")]
    Remote(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe => TransportError::Closed,
            _ => TransportError::Broken(err.to_string()),
        }
    }
}

/// A single invocation against a worker failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invoke on {address} failed: {message}")]
pub struct InvokeError {
    pub address: String,
    /// Safe to retry against a different worker.
    pub transient: bool,
    pub message: String,
}

impl InvokeError {
    pub fn transport(address: impl Into<String>, err: &TransportError) -> Self {
        Self {
            address: address.into(),
            transient: true,
            message: err.to_string(),
        }
    }

    /// The worker rejected the call. Retrying elsewhere may not help.
    pub fn remote(address: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            transient: false,
            message: message.into(),
        }
    }

    pub fn not_ready(address: impl Into<String>, state: impl std::fmt::Debug) -> Self {
        Self {
            address: address.into(),
            transient: true,
            message: format!("worker not accepting work (state {:?})", state),
        }
    }
}

/// Pool-level dispatch failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("no healthy workers")]
    NoHealthyWorkers,

    #[error("timed out after {0:?} waiting for a healthy worker")]
    Timeout(Duration),

    #[error(transparent)]
    Invoke(#[from] InvokeError),
}

/// Discovery source failed to resolve; treated as "no change this tick".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("resolve {name} failed: {reason}")]
pub struct DiscoveryError {
    pub name: String,
    pub reason: String,
}

/// Typed failure returned by the dispatch surface.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchFailure {
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("timed out: {0}")]
    Timeout(String),
}

impl DispatchFailure {
    /// Wire error code.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchFailure::RateLimited { .. } => "RATE_LIMITED",
            DispatchFailure::Unavailable(_) => "UNAVAILABLE",
            DispatchFailure::Transient(_) => "TRANSIENT",
            DispatchFailure::Timeout(_) => "TIMEOUT",
        }
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            DispatchFailure::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

impl From<PoolError> for DispatchFailure {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::NoHealthyWorkers => DispatchFailure::Unavailable(err.to_string()),
            PoolError::Timeout(_) => DispatchFailure::Timeout(err.to_string()),
            PoolError::Invoke(e) => DispatchFailure::Transient(e.to_string()),
        }
    }
}

/// Main error enum for the dispatch server.
#[derive(Error, Debug)]
pub enum Error {
    /// Validation errors (map to INVALID_ARGUMENT).
    #[error("validation error: {0}")]
    Validation(String),

    /// Resource not found (map to NOT_FOUND).
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid configuration; fatal at startup.
    #[error("config error: {0}")]
    Config(String),

    /// Internal errors (map to INTERNAL).
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Dispatch(#[from] DispatchFailure),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Convert to an IPC error code string.
    pub fn to_ipc_error_code(&self) -> &'static str {
        match self {
            Error::Validation(_) | Error::Config(_) => "INVALID_ARGUMENT",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Connect(_) => "UNAVAILABLE",
            Error::Dispatch(failure) => failure.code(),
            Error::Internal(_) | Error::Serialization(_) | Error::Io(_) => "INTERNAL",
        }
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
