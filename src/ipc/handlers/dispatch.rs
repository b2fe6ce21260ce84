//! Dispatch service handler: rate-limited calls forwarded to the pool.

use crate::ipc::router::{opt_str_field, str_field};
use crate::kernel::Kernel;
use crate::types::{CallClass, CallerId, Error, Result};
use serde_json::{json, Value};
use std::net::SocketAddr;

pub async fn handle(kernel: &Kernel, peer: SocketAddr, method: &str, body: Value) -> Result<Value> {
    match method {
        "Generate" => {
            let class = CallClass::from_string(str_field(&body, "class")?)
                .map_err(Error::validation)?;
            // Callers that do not identify themselves are limited per peer host.
            let caller = opt_str_field(&body, "caller").unwrap_or_else(|| peer.ip().to_string());
            let caller = CallerId::from_string(caller).map_err(Error::validation)?;
            let payload = body.get("payload").cloned().unwrap_or(Value::Null);

            let result = kernel.generate(&class, &caller, payload).await?;
            Ok(json!({ "result": result }))
        }

        _ => Err(Error::not_found(format!("Unknown dispatch method: {}", method))),
    }
}
