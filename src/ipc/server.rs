//! TCP IPC server: accept loop and per-connection handler.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::ipc::codec::{read_frame, write_frame, ErrorBody, Frame, Request, Response, MSG_REQUEST};
use crate::ipc::router;
use crate::kernel::Kernel;
use crate::types::{Error, IpcConfig};

/// IPC server wrapping the kernel.
#[derive(Debug)]
pub struct IpcServer {
    kernel: Arc<Kernel>,
    addr: SocketAddr,
    cancel: CancellationToken,
    ipc_config: IpcConfig,
}

impl IpcServer {
    pub fn new(kernel: Arc<Kernel>, addr: SocketAddr, ipc_config: IpcConfig) -> Self {
        Self {
            kernel,
            addr,
            cancel: CancellationToken::new(),
            ipc_config,
        }
    }

    /// Bind the configured address and serve until cancelled.
    pub async fn serve(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve_on(listener).await
    }

    /// Serve on an already bound listener until cancelled or a fatal error
    /// occurs.
    pub async fn serve_on(&self, listener: TcpListener) -> std::io::Result<()> {
        let conn_semaphore = Arc::new(Semaphore::new(self.ipc_config.max_connections));
        tracing::info!(
            "IPC server listening on {} (max_connections={})",
            listener.local_addr()?,
            self.ipc_config.max_connections,
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("IPC server shutting down");
                    break;
                }
                accept = listener.accept() => {
                    let (stream, peer) = accept?;

                    // Acquire connection permit (backpressure when at capacity).
                    let permit = match conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            tracing::warn!(
                                "Connection from {} rejected: at max_connections ({})",
                                peer,
                                self.ipc_config.max_connections,
                            );
                            drop(stream);
                            continue;
                        }
                    };

                    tracing::debug!("IPC connection from {} (active={})",
                        peer,
                        self.ipc_config.max_connections - conn_semaphore.available_permits(),
                    );
                    let kernel = self.kernel.clone();
                    let cancel = self.cancel.clone();
                    let ipc_config = self.ipc_config.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, kernel, cancel, ipc_config, permit).await {
                            tracing::warn!("Connection from {} error: {}", peer, e);
                        }
                    });
                }
            }
        }
        Ok(())
    }

    /// Stop accepting connections and requests.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Handle a single TCP connection: read frames → route → write responses.
///
/// Requests on one connection are answered in order. A request already
/// being routed when cancellation arrives still gets its response.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    kernel: Arc<Kernel>,
    cancel: CancellationToken,
    ipc_config: IpcConfig,
    _permit: OwnedSemaphorePermit, // held for connection lifetime
) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    let read_timeout = Duration::from_secs(ipc_config.read_timeout_secs);
    let write_timeout = Duration::from_secs(ipc_config.write_timeout_secs);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame_result = tokio::time::timeout(read_timeout, read_frame(&mut reader, ipc_config.max_frame_bytes)) => {
                let frame = match frame_result {
                    Err(_elapsed) => {
                        tracing::debug!("Read timeout ({}s), dropping connection", ipc_config.read_timeout_secs);
                        break;
                    }
                    Ok(result) => match result? {
                        Some(f) => f,
                        None => break, // clean EOF
                    },
                };

                let response = respond(&kernel, peer, frame).await;
                timed_write(&mut writer, &response.into_frame()?, write_timeout).await?;
            }
        }
    }

    Ok(())
}

/// Decode, route and build the response for one frame.
async fn respond(kernel: &Kernel, peer: SocketAddr, frame: Frame) -> Response {
    if frame.kind != MSG_REQUEST {
        return Response::failure(
            "",
            ErrorBody {
                code: "INVALID_ARGUMENT".to_string(),
                message: format!("Unexpected message type: 0x{:02X}", frame.kind),
                retry_after_ms: None,
            },
        );
    }

    let request: Request = match frame.decode() {
        Ok(request) => request,
        Err(e) => {
            return Response::failure(
                "",
                ErrorBody {
                    code: "INVALID_ARGUMENT".to_string(),
                    message: format!("Invalid msgpack: {}", e),
                    retry_after_ms: None,
                },
            );
        }
    };

    match router::route_request(kernel, peer, &request.service, &request.method, request.body).await {
        Ok(body) => Response::success(request.id, body),
        Err(e) => {
            tracing::debug!(
                service = %request.service,
                method = %request.method,
                code = e.to_ipc_error_code(),
                error = %e,
                "ipc_request_failed"
            );
            Response::failure(request.id, error_body(&e))
        }
    }
}

fn error_body(e: &Error) -> ErrorBody {
    ErrorBody {
        code: e.to_ipc_error_code().to_string(),
        message: e.to_string(),
        retry_after_ms: match e {
            Error::Dispatch(failure) => failure.retry_after_ms(),
            _ => None,
        },
    }
}

/// Write a frame with a timeout. Returns an error if the write takes too long
/// (prevents slow consumers from holding connections indefinitely).
async fn timed_write<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame: &Frame,
    timeout: Duration,
) -> std::io::Result<()> {
    tokio::time::timeout(timeout, write_frame(writer, frame))
        .await
        .map_err(|_| {
            tracing::warn!("Write timeout ({}s), dropping connection", timeout.as_secs());
            std::io::Error::new(std::io::ErrorKind::TimedOut, "write timeout")
        })?
}
