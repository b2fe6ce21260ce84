//! Top-level IPC router: routes by service, delegates to handlers.

use crate::ipc::handlers;
use crate::kernel::Kernel;
use crate::types::{Error, Result};
use serde_json::Value;
use std::net::SocketAddr;

/// Route an IPC request to the appropriate service handler.
pub async fn route_request(
    kernel: &Kernel,
    peer: SocketAddr,
    service: &str,
    method: &str,
    body: Value,
) -> Result<Value> {
    match service {
        "dispatch" => handlers::dispatch::handle(kernel, peer, method, body).await,
        "pool" => handlers::pool::handle(kernel, method, body).await,
        "metrics" => handlers::metrics::handle(kernel, method, body).await,
        _ => Err(Error::not_found(format!("Unknown service: {}", service))),
    }
}

// =============================================================================
// Shared helpers used by all handler modules
// =============================================================================

pub fn str_field(body: &Value, key: &str) -> Result<String> {
    body.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| Error::validation(format!("Missing required field: {}", key)))
}

pub fn opt_str_field(body: &Value, key: &str) -> Option<String> {
    body.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.to_string())
}

pub fn str_list_field(body: &Value, key: &str) -> Result<Vec<String>> {
    let items = body
        .get(key)
        .and_then(|v| v.as_array())
        .ok_or_else(|| Error::validation(format!("Missing required field: {}", key)))?;
    items
        .iter()
        .map(|v| {
            v.as_str()
                .map(|s| s.to_string())
                .ok_or_else(|| Error::validation(format!("{} must contain only strings", key)))
        })
        .collect()
}
