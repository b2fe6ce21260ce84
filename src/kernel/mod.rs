//! Kernel - request admission and forwarding.
//!
//! The Kernel owns the subsystems a dispatch passes through. Each subsystem
//! guards its own state; no lock is held across components.
//!
//! ```text
//!   dispatch(class, caller, payload)
//!        │
//!        ▼
//!   RateLimiter.admit ──rejected──► RATE_LIMITED{retry_after_ms}
//!        │ admitted
//!        ▼
//!   WorkerPool.invoke_with_any ──► NoHealthyWorkers → UNAVAILABLE
//!        │                         Timeout          → TIMEOUT
//!        │                         Invoke           → TRANSIENT
//!        ▼
//!      result
//! ```

pub mod cleanup;
pub mod rate_limiter;

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::metrics::{DispatchOutcome, MetricsCollector};
use crate::pool::{PoolOptions, WorkerPool};
use crate::types::{CallClass, CallerId, Config, DispatchFailure};
use crate::worker::{Connector, ReattachPolicy, WorkerOptions};

pub use cleanup::{CleanupService, CleanupStats};
pub use rate_limiter::{Admission, RateLimitRule, RateLimiter};

/// Dispatch core shared by every IPC connection.
#[derive(Debug)]
pub struct Kernel {
    pool: Arc<WorkerPool>,
    rate_limiter: Mutex<RateLimiter>,
    metrics: Arc<MetricsCollector>,
    /// Call class → remote method name. Unmapped classes call a method of
    /// the same name.
    methods: HashMap<String, String>,
    accepting: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
}

impl Kernel {
    pub fn new(
        pool: Arc<WorkerPool>,
        rate_limiter: RateLimiter,
        methods: HashMap<String, String>,
    ) -> Self {
        Self {
            metrics: pool.metrics().clone(),
            pool,
            rate_limiter: Mutex::new(rate_limiter),
            methods,
            accepting: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    /// Build the pool and limiter from configuration.
    ///
    /// With `exit_on_worker_loss`, a worker whose reattach fails is destroyed
    /// and the token cancelled instead of retrying.
    pub fn from_config(
        config: &Config,
        connector: Arc<dyn Connector>,
        exit_on_worker_loss: Option<CancellationToken>,
    ) -> Self {
        let mut worker_options = WorkerOptions::from(&config.worker);
        if let Some(token) = exit_on_worker_loss {
            worker_options.reattach = ReattachPolicy::Terminate(token);
        }
        let pool = Arc::new(WorkerPool::new(
            connector,
            worker_options,
            PoolOptions::from_config(&config.pool, &config.discovery),
            Arc::new(MetricsCollector::new()),
        ));
        Self::new(
            pool,
            RateLimiter::new(config.rate_limits.clone()),
            config.methods.clone(),
        )
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Dispatches currently past admission.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Remote method invoked for a call class.
    pub fn method_for<'a>(&'a self, class: &'a str) -> &'a str {
        self.methods.get(class).map(String::as_str).unwrap_or(class)
    }

    pub fn admit(&self, caller: &CallerId, class: &CallClass) -> Admission {
        self.limiter().admit(caller.as_str(), class.as_str())
    }

    /// Evict expired rate-limit windows. Returns the number evicted.
    pub fn cleanup_rate_windows(&self) -> usize {
        self.limiter().cleanup_expired()
    }

    pub fn rate_window_count(&self) -> usize {
        self.limiter().window_count()
    }

    fn limiter(&self) -> std::sync::MutexGuard<'_, RateLimiter> {
        self.rate_limiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit and forward one call.
    ///
    /// Every admitted call yields exactly one result or one typed failure.
    pub async fn generate(
        &self,
        class: &CallClass,
        caller: &CallerId,
        payload: Value,
    ) -> Result<Value, DispatchFailure> {
        let _guard = InFlight::enter(self);
        if !self.is_accepting() {
            self.metrics.record_dispatch(DispatchOutcome::Unavailable);
            return Err(DispatchFailure::Unavailable("server is shutting down".to_string()));
        }

        if let Admission::Rejected { retry_after_ms } = self.admit(caller, class) {
            self.metrics.record_dispatch(DispatchOutcome::RateLimited);
            tracing::debug!(%caller, %class, retry_after_ms, "dispatch_rate_limited");
            return Err(DispatchFailure::RateLimited { retry_after_ms });
        }
        self.metrics.record_admitted();

        let method = self.method_for(class.as_str()).to_string();
        let result = self
            .pool
            .invoke_with_any(class.as_str(), move |conn| async move {
                conn.call(&method, payload).await
            })
            .await;

        match result {
            Ok(value) => {
                self.metrics.record_dispatch(DispatchOutcome::Succeeded);
                Ok(value)
            }
            Err(e) => {
                let failure = DispatchFailure::from(e);
                self.metrics.record_dispatch(match failure {
                    DispatchFailure::RateLimited { .. } => DispatchOutcome::RateLimited,
                    DispatchFailure::Unavailable(_) => DispatchOutcome::Unavailable,
                    DispatchFailure::Transient(_) => DispatchOutcome::Transient,
                    DispatchFailure::Timeout(_) => DispatchOutcome::Timeout,
                });
                tracing::info!(%caller, %class, code = failure.code(), error = %failure, "dispatch_failed");
                Err(failure)
            }
        }
    }

    /// Stop accepting dispatches, wait up to `grace` for in-flight calls,
    /// then destroy every worker.
    pub async fn shutdown(&self, grace: Duration) {
        self.accepting.store(false, Ordering::SeqCst);
        tracing::info!(in_flight = self.in_flight(), ?grace, "kernel_shutdown_started");

        let drain = async {
            loop {
                let drained = self.drained.notified();
                if self.in_flight() == 0 {
                    break;
                }
                drained.await;
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            tracing::warn!(remaining = self.in_flight(), "kernel_shutdown_grace_expired");
        }

        self.pool.shutdown().await;
        tracing::info!("kernel_shutdown_complete");
    }
}

/// Counts a dispatch as in flight until dropped.
struct InFlight<'a> {
    kernel: &'a Kernel,
}

impl<'a> InFlight<'a> {
    fn enter(kernel: &'a Kernel) -> Self {
        kernel.in_flight.fetch_add(1, Ordering::SeqCst);
        Self { kernel }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.kernel.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.kernel.drained.notify_waiters();
        }
    }
}
