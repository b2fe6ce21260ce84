//! Metrics service handler.

use crate::kernel::Kernel;
use crate::types::{Error, Result};
use serde_json::{json, Value};

pub async fn handle(kernel: &Kernel, method: &str, _body: Value) -> Result<Value> {
    match method {
        "Snapshot" => Ok(serde_json::to_value(kernel.metrics().snapshot())?),

        "Health" => {
            let pool = kernel.pool();
            let workers = pool.len().await;
            let healthy = pool.healthy_count().await;
            let status = if !kernel.is_accepting() {
                "shutting_down"
            } else if healthy == 0 {
                "unavailable"
            } else if healthy < workers {
                "degraded"
            } else {
                "ok"
            };
            Ok(json!({
                "status": status,
                "workers": workers,
                "healthy": healthy,
                "in_flight": kernel.in_flight(),
            }))
        }

        _ => Err(Error::not_found(format!("Unknown metrics method: {}", method))),
    }
}
