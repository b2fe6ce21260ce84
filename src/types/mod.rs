//! Core types for the dispatch server.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (CallerId, CallClass, RequestId)
//! - **Errors**: Typed failures for each layer, with thiserror derives
//! - **Config**: Configuration structures for server, workers, pool and limits

mod config;
mod errors;
mod ids;

pub use config::{
    CleanupConfig, Config, DiscoveryConfig, IpcConfig, ObservabilityConfig, PoolConfig,
    ServerConfig, WorkerConfig,
};
pub use errors::{
    ConnectError, DiscoveryError, DispatchFailure, Error, InvokeError, PoolError, Result,
    TransportError,
};
pub use ids::{CallClass, CallerId, RequestId};
