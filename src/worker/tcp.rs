//! Worker transport over TCP using the IPC frame codec.
//!
//! Each remote call is one request frame `{id, service: "worker", method,
//! body}` answered by one response frame. A connection carries a single
//! call at a time.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::connector::{Connection, Connector};
use crate::ipc::codec::{read_frame, write_frame, Frame, Request, Response, MSG_REQUEST};
use crate::types::{ConnectError, RequestId, TransportError};

/// Service name carried by worker-bound requests.
pub const WORKER_SERVICE: &str = "worker";

/// Opens TCP connections to `host:port` worker addresses.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    max_frame_bytes: u32,
}

impl TcpConnector {
    pub fn new(max_frame_bytes: u32) -> Self {
        Self { max_frame_bytes }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn Connection>, ConnectError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| ConnectError::new(address, "connect timed out"))?
            .map_err(|e| ConnectError::new(address, e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| ConnectError::new(address, e.to_string()))?;

        tracing::debug!(worker = %address, "tcp_connected");
        Ok(Arc::new(TcpConnection {
            address: address.to_string(),
            stream: Mutex::new(stream),
            max_frame_bytes: self.max_frame_bytes,
            closed: AtomicBool::new(false),
        }))
    }
}

#[derive(Debug)]
struct TcpConnection {
    address: String,
    stream: Mutex<TcpStream>,
    max_frame_bytes: u32,
    closed: AtomicBool,
}

#[async_trait]
impl Connection for TcpConnection {
    async fn call(&self, name: &str, args: Value) -> Result<Value, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let id = RequestId::new().to_string();
        let request = Request {
            id: id.clone(),
            service: WORKER_SERVICE.to_string(),
            method: name.to_string(),
            body: args,
        };
        let frame = Frame::encode(MSG_REQUEST, &request)?;

        let mut stream = self.stream.lock().await;
        write_frame(&mut *stream, &frame).await?;
        let reply = read_frame(&mut *stream, self.max_frame_bytes)
            .await?
            .ok_or(TransportError::Closed)?;
        drop(stream);

        let response: Response = reply.decode()?;
        if response.id != id {
            return Err(TransportError::Broken(format!(
                "response id {} does not match request {}",
                response.id, id
            )));
        }
        if response.ok {
            return Ok(response.body.unwrap_or(Value::Null));
        }
        let message = response
            .error
            .map(|e| format!("{}: {}", e.code, e.message))
            .unwrap_or_else(|| "worker returned an error".to_string());
        tracing::debug!(worker = %self.address, method = name, %message, "worker_call_rejected");
        Err(TransportError::Remote(message))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut stream = self.stream.lock().await;
        if let Err(e) = stream.shutdown().await {
            tracing::debug!(worker = %self.address, error = %e, "tcp_shutdown_failed");
        }
    }
}
