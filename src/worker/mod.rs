//! Remote workers: transport capability, lifecycle state, and the manager
//! that drives one worker's connection.

mod connector;
mod manager;
mod state;
mod tcp;

#[cfg(test)]
pub(crate) mod testing;

pub use connector::{Connection, Connector};
pub use manager::{Reservation, WorkerManager, WorkerOptions, WorkerSnapshot};
pub use state::{Backoff, ReattachPolicy, WorkerState};
pub use tcp::{TcpConnector, WORKER_SERVICE};
