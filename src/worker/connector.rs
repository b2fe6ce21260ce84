//! Transport capability consumed by worker managers.
//!
//! The core never speaks a device protocol itself: a [`Connector`] opens a
//! [`Connection`], and a connection runs named calls with JSON arguments.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::types::{ConnectError, TransportError};

/// An open connection to one worker.
#[async_trait]
pub trait Connection: Send + Sync + std::fmt::Debug {
    /// Run one remote call.
    async fn call(&self, name: &str, args: Value) -> Result<Value, TransportError>;

    /// Close the connection. Must be safe to call more than once.
    async fn close(&self);

    /// Whether several calls may be in flight on this connection at once.
    fn supports_concurrent_calls(&self) -> bool {
        false
    }
}

/// Opens connections to worker addresses.
#[async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug {
    async fn connect(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn Connection>, ConnectError>;
}
