//! Pool service handler: membership inspection and manual changes.

use crate::ipc::router::{str_field, str_list_field};
use crate::kernel::Kernel;
use crate::types::{Error, Result};
use crate::validation::validate_address;
use serde_json::{json, Value};
use std::collections::BTreeSet;

pub async fn handle(kernel: &Kernel, method: &str, body: Value) -> Result<Value> {
    let pool = kernel.pool();
    match method {
        "ListWorkers" => Ok(json!({
            "workers": pool.workers().await,
            "healthy": pool.healthy_count().await,
        })),

        "AddWorker" => {
            let address = str_field(&body, "address")?;
            validate_address(&address, "address")?;
            let added = pool.add_address(&address).await?;
            Ok(json!({ "address": address, "added": added }))
        }

        "RemoveWorker" => {
            let address = str_field(&body, "address")?;
            if !pool.remove(&address).await {
                return Err(Error::not_found(format!("Worker {} not found", address)));
            }
            Ok(json!({ "address": address, "removed": true }))
        }

        "Reconcile" => {
            let addresses = str_list_field(&body, "addresses")?;
            for address in &addresses {
                validate_address(address, "addresses")?;
            }
            let discovered: BTreeSet<String> = addresses.into_iter().collect();
            let report = pool.reconcile(&discovered).await;
            Ok(serde_json::to_value(report)?)
        }

        "HealthSweep" => Ok(serde_json::to_value(pool.health_sweep().await)?),

        _ => Err(Error::not_found(format!("Unknown pool method: {}", method))),
    }
}
