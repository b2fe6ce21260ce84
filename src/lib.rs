//! # devpool - Dispatch Server over Remote Worker Devices
//!
//! Routes client calls to a pool of unreliable remote workers:
//! - Per-(caller, class) fixed-window rate limiting
//! - Worker lifecycle with automatic reattach after transport failures
//! - Round-robin dispatch with fail-fast or bounded waiting
//! - Periodic health sweeps and discovery reconciliation
//! - TCP+msgpack IPC service layer for clients
//!
//! ## Architecture
//!
//! ```text
//!                    ┌──────────────────────────────────────┐
//!   IPC requests  →  │               Kernel                 │
//!                    │  ┌───────────┐   ┌────────────────┐  │
//!                    │  │   Rate    │   │    Metrics     │  │
//!                    │  │  Limiter  │   │   Collector    │  │
//!                    │  └───────────┘   └────────────────┘  │
//!                    │  ┌────────────────────────────────┐  │
//!                    │  │          WorkerPool            │  │
//!                    │  │  health sweep │ reconcile loop │  │
//!                    │  └────────────────────────────────┘  │
//!                    └───────────┬───────────┬──────────────┘
//!                                │           │
//!                         WorkerManager  WorkerManager  →  devices
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod ipc;
pub mod kernel;
pub mod metrics;
pub mod pool;
pub mod types;
pub mod worker;

// Internal utilities
pub mod observability;
pub mod validation;

pub use types::{Config, Error, Result};
