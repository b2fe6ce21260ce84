//! Worker pool: membership, selection, health sweeps and reconciliation.
//!
//! ```text
//!   invoke_with_any ──► select (round-robin, idle first)
//!          │                 │ none healthy
//!          │                 ▼
//!          │        fail fast, or wait on state/membership changes
//!          ▼
//!   WorkerManager::invoke
//!
//!   background: health sweep (ping READY) · reconcile (discovery)
//! ```

mod balancer;
mod discovery;
mod health;

use futures::future::select_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::metrics::MetricsCollector;
use crate::types::{ConnectError, DiscoveryConfig, PoolConfig, PoolError, TransportError};
use crate::worker::{Connection, Connector, WorkerManager, WorkerOptions, WorkerSnapshot, WorkerState};
use balancer::Ring;

pub use discovery::{Discovery, DiscoveryTask, DnsDiscovery, ReconcileReport};
pub use health::SweepReport;

/// Pool behaviour.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// `None` fails fast when no worker is healthy; otherwise the longest a
    /// dispatch waits for one.
    pub wait_for_worker: Option<Duration>,
    pub health_interval: Duration,
    /// Consecutive reconcile passes an address must be absent from
    /// discovery before its worker is removed.
    pub removal_threshold: u32,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self::from_config(&PoolConfig::default(), &DiscoveryConfig::default())
    }
}

impl PoolOptions {
    pub fn from_config(pool: &PoolConfig, discovery: &DiscoveryConfig) -> Self {
        Self {
            wait_for_worker: pool.wait_for_worker,
            health_interval: pool.health_interval,
            removal_threshold: discovery.removal_threshold.max(1),
        }
    }
}

/// Set of worker managers keyed by address.
#[derive(Debug)]
pub struct WorkerPool {
    members: RwLock<Ring<Arc<WorkerManager>>>,
    membership_changed: Notify,
    connector: Arc<dyn Connector>,
    worker_options: WorkerOptions,
    options: PoolOptions,
    metrics: Arc<MetricsCollector>,
    /// Consecutive absences per address; holding the lock serializes
    /// reconcile passes.
    absences: Mutex<std::collections::HashMap<String, u32>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        connector: Arc<dyn Connector>,
        worker_options: WorkerOptions,
        options: PoolOptions,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            members: RwLock::new(Ring::default()),
            membership_changed: Notify::new(),
            connector,
            worker_options,
            options,
            metrics,
            absences: Mutex::new(std::collections::HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Insert a manager. Returns false, destroying the manager, if its
    /// address is already present or the pool is shutting down.
    pub async fn add(&self, manager: Arc<WorkerManager>) -> bool {
        let inserted = {
            let mut members = self.members.write().await;
            !self.shutdown.is_cancelled()
                && members.insert(manager.address().to_string(), manager.clone())
        };
        if !inserted {
            manager.destroy().await;
            return false;
        }
        self.membership_changed.notify_waiters();
        tracing::info!(worker = %manager.address(), "pool_member_added");
        true
    }

    /// Connect to `address` and insert the resulting manager.
    pub async fn add_address(&self, address: &str) -> Result<bool, ConnectError> {
        if self.contains(address).await {
            return Ok(false);
        }
        let manager = WorkerManager::create(
            address,
            self.connector.clone(),
            self.worker_options.clone(),
            Some(self.metrics.clone()),
        )
        .await?;
        Ok(self.add(manager).await)
    }

    /// Detach and destroy the worker at `address`.
    pub async fn remove(&self, address: &str) -> bool {
        let removed = self.members.write().await.remove(address);
        let Some(manager) = removed else {
            return false;
        };
        self.membership_changed.notify_waiters();
        manager.destroy().await;
        self.metrics.forget_worker(address);
        tracing::info!(worker = %address, "pool_member_removed");
        true
    }

    /// Remove `address` only if it still maps to this exact manager.
    async fn remove_instance(&self, manager: &Arc<WorkerManager>) -> bool {
        {
            let mut members = self.members.write().await;
            match members.get(manager.address()) {
                Some(current) if Arc::ptr_eq(current, manager) => {
                    members.remove(manager.address());
                }
                _ => return false,
            }
        }
        self.membership_changed.notify_waiters();
        manager.destroy().await;
        true
    }

    pub async fn contains(&self, address: &str) -> bool {
        self.members.read().await.contains(address)
    }

    pub async fn len(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn addresses(&self) -> Vec<String> {
        self.members.read().await.addresses()
    }

    pub async fn get(&self, address: &str) -> Option<Arc<WorkerManager>> {
        self.members.read().await.get(address).cloned()
    }

    pub async fn workers(&self) -> Vec<WorkerSnapshot> {
        self.members
            .read()
            .await
            .members()
            .map(|m| m.snapshot())
            .collect()
    }

    pub async fn healthy_count(&self) -> usize {
        self.members
            .read()
            .await
            .members()
            .filter(|m| m.state().accepts_work())
            .count()
    }

    async fn members_snapshot(&self) -> Vec<Arc<WorkerManager>> {
        self.members.read().await.members().cloned().collect()
    }

    /// Pick a healthy worker, idle ones first.
    async fn select(&self) -> Option<Arc<WorkerManager>> {
        self.members
            .read()
            .await
            .next(
                |m| m.state() == WorkerState::Ready,
                |m| m.state().accepts_work(),
            )
            .cloned()
    }

    /// Run `work` on one healthy worker.
    ///
    /// With no healthy worker this fails fast with `NoHealthyWorkers`, or,
    /// when a wait is configured, blocks until a worker becomes healthy or
    /// the wait elapses (`Timeout`). A worker lost between selection and
    /// reservation is replaced by selecting again once. Once the work runs,
    /// the chosen worker's failure is returned as `Invoke`; the pool does not
    /// retry on another worker.
    pub async fn invoke_with_any<F, Fut, T>(&self, call_class: &str, work: F) -> Result<T, PoolError>
    where
        F: FnOnce(Arc<dyn Connection>) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut reselected = false;
        let reservation = loop {
            let manager = self.acquire().await?;
            match manager.reserve().await {
                Ok(reservation) => break reservation,
                Err(e) if !reselected => {
                    reselected = true;
                    tracing::debug!(worker = %manager.address(), call_class, error = %e, "pool_reselecting");
                }
                Err(e) => {
                    self.metrics.record_call_failure(manager.address());
                    tracing::warn!(worker = %manager.address(), call_class, error = %e, "pool_call_failed");
                    return Err(PoolError::Invoke(e));
                }
            }
        };
        let address = reservation.manager().address().to_string();
        let started = Instant::now();

        match reservation.run(work).await {
            Ok(value) => {
                self.metrics.record_call_success(&address, started.elapsed());
                tracing::debug!(worker = %address, call_class, "pool_call_succeeded");
                Ok(value)
            }
            Err(e) => {
                self.metrics.record_call_failure(&address);
                tracing::warn!(worker = %address, call_class, error = %e, "pool_call_failed");
                Err(PoolError::Invoke(e))
            }
        }
    }

    /// Invoke a named remote method on any healthy worker.
    pub async fn call_any(
        &self,
        call_class: &str,
        method: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, PoolError> {
        let method = method.to_string();
        self.invoke_with_any(call_class, move |conn| async move {
            conn.call(&method, args).await
        })
        .await
    }

    async fn acquire(&self) -> Result<Arc<WorkerManager>, PoolError> {
        if let Some(manager) = self.select().await {
            return Ok(manager);
        }
        let Some(wait) = self.options.wait_for_worker else {
            return Err(PoolError::NoHealthyWorkers);
        };

        let _waiting = self.metrics.waiting();
        let deadline = Instant::now() + wait;
        tracing::debug!(?wait, "pool_waiting_for_worker");

        loop {
            if self.shutdown.is_cancelled() {
                return Err(PoolError::NoHealthyWorkers);
            }
            // Register interest before re-checking so no wakeup is missed.
            let membership_changed = self.membership_changed.notified();
            let mut receivers: Vec<_> = self
                .members_snapshot()
                .await
                .iter()
                .map(|m| m.subscribe())
                .collect();
            if let Some(manager) = self.select().await {
                return Ok(manager);
            }

            let state_changed = async {
                if receivers.is_empty() {
                    std::future::pending::<()>().await;
                } else {
                    let changes = receivers.iter_mut().map(|rx| Box::pin(rx.changed()));
                    let _ = select_all(changes).await;
                }
            };

            tokio::select! {
                _ = state_changed => {}
                _ = membership_changed => {}
                _ = self.shutdown.cancelled() => return Err(PoolError::NoHealthyWorkers),
                _ = tokio::time::sleep_until(deadline) => return Err(PoolError::Timeout(wait)),
            }
        }
    }

    /// Start the health sweep and, when a discovery source is given, the
    /// reconcile loop.
    pub async fn start(self: &Arc<Self>, discovery: Option<DiscoveryTask>) {
        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(health::run(self.clone())));
        if let Some(task) = discovery {
            tasks.push(tokio::spawn(discovery::run(self.clone(), task)));
        }
    }

    /// Attach statically configured workers in the background, retrying
    /// the ones that fail every `retry` until each has attached once.
    /// Membership changes made through `add` and `remove` are never undone.
    pub async fn attach_static(self: &Arc<Self>, addresses: Vec<String>, retry: Duration) {
        let addresses = addresses.into_iter().collect();
        self.tasks
            .lock()
            .await
            .push(tokio::spawn(discovery::run_static(self.clone(), addresses, retry)));
    }

    /// Stop background loops, release waiters and destroy every worker.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "pool_task_join_failed");
            }
        }

        let managers = self.members.write().await.drain();
        self.membership_changed.notify_waiters();
        let count = managers.len();
        futures::future::join_all(managers.iter().map(|m| m.destroy())).await;
        tracing::info!(destroyed = count, "pool_shutdown_complete");
    }
}
