//! TCP+msgpack IPC transport layer.
//!
//! Length-prefixed msgpack frames carrying `{id, service, method, body}`
//! requests. The same framing is spoken to workers by the TCP connector.

pub mod codec;
pub mod handlers;
pub mod router;
pub mod server;

pub use server::IpcServer;
