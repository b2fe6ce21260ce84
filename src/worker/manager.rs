//! Connection lifecycle of a single worker.
//!
//! A `WorkerManager` is the only writer of its worker's state. State lives
//! in a `watch` cell so transitions are totally ordered and observers (the
//! pool, waiting dispatches) are woken on every change.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use super::connector::{Connection, Connector};
use super::state::{Backoff, ReattachPolicy, WorkerState};
use crate::metrics::{AttachEvent, MetricsCollector};
use crate::types::{ConnectError, InvokeError, TransportError, WorkerConfig};

/// Per-worker connection options.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub connect_timeout: Duration,
    pub call_timeout: Duration,
    pub ping_timeout: Duration,
    pub startup_method: Option<String>,
    pub ping_method: String,
    pub max_concurrent_calls: usize,
    pub reattach: ReattachPolicy,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for WorkerOptions {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            call_timeout: config.call_timeout,
            ping_timeout: config.ping_timeout,
            startup_method: config.startup_method.clone(),
            ping_method: config.ping_method.clone(),
            max_concurrent_calls: config.max_concurrent_calls,
            reattach: ReattachPolicy::Retry(Backoff {
                initial: config.reattach_delay,
                max: config.reattach_max_delay,
                multiplier: config.reattach_multiplier,
            }),
        }
    }
}

/// Point-in-time view of a worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub address: String,
    pub state: WorkerState,
    pub consecutive_failures: u32,
    pub in_flight: usize,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Owns one worker's connection: connect, verify ready, invoke, detect
/// disconnect, reattach.
#[derive(Debug)]
pub struct WorkerManager {
    address: String,
    connector: Arc<dyn Connector>,
    options: WorkerOptions,
    metrics: Option<Arc<MetricsCollector>>,
    state: watch::Sender<WorkerState>,
    /// Only mutated inside the state cell's modify closures.
    in_flight: AtomicUsize,
    connection: RwLock<Option<Arc<dyn Connection>>>,
    gate: Arc<Semaphore>,
    /// Permits the gate currently holds in total.
    permits: AtomicUsize,
    consecutive_failures: AtomicU32,
    /// Unix millis of the last successful exchange; 0 means never.
    last_seen_ms: AtomicI64,
    shutdown: CancellationToken,
}

impl WorkerManager {
    /// Connect, run the startup routine and enter `Ready`.
    ///
    /// The caller decides whether to retry on `ConnectError`.
    pub async fn create(
        address: impl Into<String>,
        connector: Arc<dyn Connector>,
        options: WorkerOptions,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Result<Arc<Self>, ConnectError> {
        let address = address.into();
        tracing::debug!(worker = %address, "worker_attaching");

        let conn = match establish(connector.as_ref(), &address, &options).await {
            Ok(conn) => conn,
            Err(e) => {
                if let Some(m) = &metrics {
                    m.record_attach(&address, AttachEvent::AttachFailure);
                }
                tracing::warn!(worker = %address, error = %e, "worker_attach_failed");
                return Err(e);
            }
        };

        let permits = permits_for(conn.as_ref(), &options);
        let (state, _) = watch::channel(WorkerState::Connecting);
        let manager = Arc::new(Self {
            address,
            connector,
            options,
            metrics,
            state,
            in_flight: AtomicUsize::new(0),
            connection: RwLock::new(Some(conn)),
            gate: Arc::new(Semaphore::new(permits)),
            permits: AtomicUsize::new(permits),
            consecutive_failures: AtomicU32::new(0),
            last_seen_ms: AtomicI64::new(0),
            shutdown: CancellationToken::new(),
        });

        manager.transition_to(WorkerState::Ready);
        manager.touch();
        manager.record(AttachEvent::AttachSuccess);
        tracing::info!(worker = %manager.address, permits, "worker_attached");
        Ok(manager)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Receiver woken on every state transition.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        match self.last_seen_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            address: self.address.clone(),
            state: self.state(),
            consecutive_failures: self.consecutive_failures(),
            in_flight: self.in_flight(),
            last_seen: self.last_seen(),
        }
    }

    /// Run `work` against this worker's connection.
    ///
    /// Calls serialize per worker unless the connection supports concurrent
    /// calls. A connection fault moves the worker to `Degraded` before the
    /// error is returned and starts a reattach in the background.
    pub async fn invoke<F, Fut, T>(self: &Arc<Self>, work: F) -> Result<T, InvokeError>
    where
        F: FnOnce(Arc<dyn Connection>) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        self.reserve().await?.run(work).await
    }

    /// Wait for a call slot on this worker.
    ///
    /// Fails with a `not_ready` error when the worker stops accepting work
    /// before a slot frees up; no work has been handed to the device then.
    pub async fn reserve(self: &Arc<Self>) -> Result<Reservation, InvokeError> {
        let state = self.state();
        if !state.accepts_work() {
            return Err(InvokeError::not_ready(&self.address, state));
        }

        let permit = tokio::select! {
            permit = self.gate.clone().acquire_owned() => permit
                .map_err(|_| InvokeError::not_ready(&self.address, WorkerState::Destroyed))?,
            _ = self.shutdown.cancelled() => {
                return Err(InvokeError::not_ready(&self.address, WorkerState::Destroyed));
            }
        };

        let conn = self
            .connection
            .read()
            .await
            .clone()
            .ok_or_else(|| InvokeError::not_ready(&self.address, self.state()))?;
        let Some(call) = CallGuard::enter(self) else {
            return Err(InvokeError::not_ready(&self.address, self.state()));
        };
        Ok(Reservation {
            conn,
            call,
            _permit: permit,
        })
    }

    /// Invoke a single remote method.
    pub async fn call(self: &Arc<Self>, name: &str, args: Value) -> Result<Value, InvokeError> {
        let name = name.to_string();
        self.invoke(move |conn| async move { conn.call(&name, args).await })
            .await
    }

    /// Lightweight liveness probe.
    ///
    /// Leaves the state untouched on success. A failed probe degrades the
    /// worker exactly like a failed invocation. A worker busy serving calls
    /// is reported healthy without probing.
    pub async fn ping(self: &Arc<Self>) -> bool {
        if !self.state().accepts_work() {
            return false;
        }
        let Ok(_permit) = self.gate.try_acquire() else {
            return true;
        };
        let Some(conn) = self.connection.read().await.clone() else {
            return false;
        };

        let probe = conn.call(&self.options.ping_method, Value::Null);
        let result = match tokio::time::timeout(self.options.ping_timeout, probe).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.options.ping_timeout)),
        };

        match result {
            Ok(_) | Err(TransportError::Remote(_)) => {
                self.touch();
                true
            }
            Err(err) => {
                tracing::warn!(worker = %self.address, error = %err, "worker_ping_failed");
                self.degrade(&err);
                false
            }
        }
    }

    /// Re-establish a broken connection.
    ///
    /// Only acts on a `Degraded` worker; concurrent callers return at once.
    /// Loops per the reattach policy until the worker is `Ready` again or
    /// destroyed.
    pub async fn reattach(self: Arc<Self>) {
        if !self.transition_to(WorkerState::Reattaching) {
            return;
        }
        tracing::info!(worker = %self.address, "worker_reattaching");

        loop {
            if let Some(old) = self.connection.write().await.take() {
                old.close().await;
            }

            let attempt = tokio::select! {
                attempt = establish(self.connector.as_ref(), &self.address, &self.options) => attempt,
                _ = self.shutdown.cancelled() => return,
            };

            match attempt {
                Ok(conn) => {
                    let resized = tokio::select! {
                        _ = self.resize_gate(permits_for(conn.as_ref(), &self.options)) => true,
                        _ = self.shutdown.cancelled() => false,
                    };
                    if !resized {
                        conn.close().await;
                        return;
                    }
                    *self.connection.write().await = Some(conn);
                    if self.transition_to(WorkerState::Ready) {
                        self.consecutive_failures.store(0, Ordering::SeqCst);
                        self.touch();
                        self.record(AttachEvent::ReattachSuccess);
                        tracing::info!(worker = %self.address, "worker_reattached");
                    } else if let Some(conn) = self.connection.write().await.take() {
                        // Destroyed while connecting.
                        conn.close().await;
                    }
                    return;
                }
                Err(e) => {
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    self.record(AttachEvent::ReattachFailure);
                    tracing::warn!(
                        worker = %self.address,
                        failures,
                        error = %e,
                        "worker_reattach_failed"
                    );

                    match &self.options.reattach {
                        ReattachPolicy::Retry(backoff) => {
                            let delay = backoff.delay(failures);
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = self.shutdown.cancelled() => return,
                            }
                        }
                        ReattachPolicy::Terminate(token) => {
                            tracing::error!(
                                worker = %self.address,
                                "worker_lost_without_substitute; requesting process exit"
                            );
                            self.destroy().await;
                            token.cancel();
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Close the connection and enter `Destroyed`. Idempotent.
    pub async fn destroy(&self) {
        let previous = self.state.send_replace(WorkerState::Destroyed);
        if previous == WorkerState::Destroyed {
            return;
        }
        self.shutdown.cancel();
        self.gate.close();
        if let Some(conn) = self.connection.write().await.take() {
            conn.close().await;
        }
        tracing::info!(worker = %self.address, ?previous, "worker_destroyed");
    }

    /// Match the gate to a new connection's concurrency support.
    async fn resize_gate(&self, want: usize) {
        let have = self.permits.swap(want, Ordering::SeqCst);
        if want > have {
            self.gate.add_permits(want - have);
        } else if want < have {
            // Retire the surplus once calls still holding it release it.
            let surplus = u32::try_from(have - want).unwrap_or(u32::MAX);
            if let Ok(permits) = self.gate.acquire_many(surplus).await {
                permits.forget();
            }
        }
        if want != have {
            tracing::debug!(worker = %self.address, permits = want, "worker_gate_resized");
        }
    }

    fn transition_to(&self, to: WorkerState) -> bool {
        self.state.send_if_modified(|state| {
            if state.can_transition_to(to) {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    fn enter_call(&self) -> bool {
        let mut entered = false;
        self.state.send_if_modified(|state| {
            if !state.accepts_work() {
                return false;
            }
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            entered = true;
            if *state == WorkerState::Ready {
                *state = WorkerState::InUse;
                true
            } else {
                false
            }
        });
        entered
    }

    fn exit_call(&self) {
        self.state.send_if_modified(|state| {
            let remaining = self.in_flight.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
            if *state == WorkerState::InUse && remaining == 0 {
                *state = WorkerState::Ready;
                true
            } else {
                false
            }
        });
    }

    fn degrade(self: &Arc<Self>, err: &TransportError) {
        if self.transition_to(WorkerState::Degraded) {
            tracing::warn!(worker = %self.address, error = %err, "worker_degraded");
            tokio::spawn(self.clone().reattach());
        }
    }

    fn touch(&self) {
        self.last_seen_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn record(&self, event: AttachEvent) {
        if let Some(m) = &self.metrics {
            m.record_attach(&self.address, event);
        }
    }
}

/// A reserved call slot on one worker.
///
/// Holds the worker's gate permit and counts as in flight until it is run
/// or dropped. Dropping it, including when a caller abandons the call
/// mid-flight, returns an idle worker to `Ready`.
#[derive(Debug)]
pub struct Reservation {
    conn: Arc<dyn Connection>,
    call: CallGuard,
    _permit: OwnedSemaphorePermit,
}

impl Reservation {
    pub fn manager(&self) -> &Arc<WorkerManager> {
        &self.call.manager
    }

    /// Hand the connection to `work`, bounded by the call timeout.
    pub async fn run<F, Fut, T>(self, work: F) -> Result<T, InvokeError>
    where
        F: FnOnce(Arc<dyn Connection>) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let manager = self.call.manager.clone();
        let _gauge = manager.metrics.as_ref().map(|m| m.in_flight());
        let call_timeout = manager.options.call_timeout;

        let result = match tokio::time::timeout(call_timeout, work(self.conn.clone())).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(call_timeout)),
        };

        match result {
            Ok(value) => {
                drop(self);
                manager.touch();
                Ok(value)
            }
            Err(TransportError::Remote(message)) => {
                // The device answered; the connection itself is fine.
                drop(self);
                manager.touch();
                Err(InvokeError::remote(&manager.address, message))
            }
            Err(err) => {
                manager.degrade(&err);
                drop(self);
                Err(InvokeError::transport(&manager.address, &err))
            }
        }
    }
}

#[derive(Debug)]
struct CallGuard {
    manager: Arc<WorkerManager>,
}

impl CallGuard {
    fn enter(manager: &Arc<WorkerManager>) -> Option<Self> {
        manager.enter_call().then(|| Self {
            manager: manager.clone(),
        })
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.manager.exit_call();
    }
}

fn permits_for(conn: &dyn Connection, options: &WorkerOptions) -> usize {
    if conn.supports_concurrent_calls() {
        options.max_concurrent_calls.max(1)
    } else {
        1
    }
}

/// Connect and run the startup routine. Never yields a connection whose
/// startup did not complete.
async fn establish(
    connector: &dyn Connector,
    address: &str,
    options: &WorkerOptions,
) -> Result<Arc<dyn Connection>, ConnectError> {
    let conn = tokio::time::timeout(
        options.connect_timeout,
        connector.connect(address, options.connect_timeout),
    )
    .await
    .map_err(|_| ConnectError::new(address, "connect timed out"))??;

    if let Some(method) = &options.startup_method {
        let startup = tokio::time::timeout(options.connect_timeout, conn.call(method, Value::Null));
        let reason = match startup.await {
            Ok(Ok(_)) => None,
            Ok(Err(e)) => Some(format!("startup {} failed: {}", method, e)),
            Err(_) => Some(format!("startup {} timed out", method)),
        };
        if let Some(reason) = reason {
            conn.close().await;
            return Err(ConnectError::new(address, reason));
        }
    }

    Ok(conn)
}
