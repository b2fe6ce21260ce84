//! Service handlers, one module per IPC service.

pub mod dispatch;
pub mod metrics;
pub mod pool;
