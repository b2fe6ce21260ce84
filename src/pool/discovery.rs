//! Worker discovery and membership reconciliation.

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use super::WorkerPool;
use crate::types::DiscoveryError;
use crate::worker::WorkerManager;

/// Resolves a service name to the set of worker addresses behind it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<BTreeSet<String>, DiscoveryError>;
}

/// DNS-based discovery: every address the name resolves to, on a fixed port.
#[derive(Debug, Clone)]
pub struct DnsDiscovery {
    port: u16,
}

impl DnsDiscovery {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

#[async_trait]
impl Discovery for DnsDiscovery {
    async fn resolve(&self, name: &str) -> Result<BTreeSet<String>, DiscoveryError> {
        let addrs = tokio::net::lookup_host((name, self.port))
            .await
            .map_err(|e| DiscoveryError {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        Ok(addrs.map(|addr| addr.to_string()).collect())
    }
}

/// A discovery source polled by the pool.
pub struct DiscoveryTask {
    pub source: Arc<dyn Discovery>,
    pub name: String,
    pub interval: Duration,
}

impl std::fmt::Debug for DiscoveryTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryTask")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

/// What one reconcile pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub failed: Vec<String>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.failed.is_empty()
    }
}

impl WorkerPool {
    /// Converge membership toward `discovered`.
    ///
    /// Passes are serialized. Members absent from `discovered` for
    /// `removal_threshold` consecutive passes are removed; new addresses are
    /// connected concurrently and a failed connect is retried on the next
    /// pass. Members present in both sets are untouched.
    pub async fn reconcile(&self, discovered: &BTreeSet<String>) -> ReconcileReport {
        let mut absences = self.absences.lock().await;
        let mut report = ReconcileReport::default();
        let current = self.addresses().await;

        absences.retain(|address, _| current.contains(address));
        for address in &current {
            if discovered.contains(address) {
                absences.remove(address);
                continue;
            }
            let misses = absences.entry(address.clone()).or_insert(0);
            *misses += 1;
            if *misses < self.options.removal_threshold {
                tracing::debug!(worker = %address, misses = *misses, "reconcile_member_absent");
                continue;
            }
            absences.remove(address);
            if self.remove(address).await {
                report.removed.push(address.clone());
            }
        }

        let additions: Vec<&String> = discovered
            .iter()
            .filter(|address| !current.contains(address))
            .collect();
        let attempts = join_all(additions.iter().map(|address| {
            WorkerManager::create(
                address.as_str(),
                self.connector.clone(),
                self.worker_options.clone(),
                Some(self.metrics.clone()),
            )
        }))
        .await;

        for (address, attempt) in additions.into_iter().zip(attempts) {
            match attempt {
                Ok(manager) => {
                    if self.add(manager).await {
                        report.added.push(address.clone());
                    }
                }
                Err(e) => {
                    tracing::warn!(worker = %address, error = %e, "reconcile_attach_failed");
                    report.failed.push(address.clone());
                }
            }
        }

        if !report.is_noop() {
            tracing::info!(
                added = ?report.added,
                removed = ?report.removed,
                failed = ?report.failed,
                "reconcile_completed"
            );
        }
        report
    }
}

impl WorkerPool {
    /// Attach each address in `pending`, dropping it from `pending` once it
    /// is a member. Only ever adds; existing members are left alone.
    pub async fn attach_pending(&self, pending: &mut BTreeSet<String>) -> ReconcileReport {
        let candidates: Vec<String> = pending.iter().cloned().collect();
        let attempts = join_all(candidates.iter().map(|address| self.add_address(address))).await;

        let mut report = ReconcileReport::default();
        for (address, attempt) in candidates.into_iter().zip(attempts) {
            match attempt {
                Ok(added) => {
                    pending.remove(&address);
                    if added {
                        report.added.push(address);
                    }
                }
                Err(e) => {
                    tracing::warn!(worker = %address, error = %e, "static_attach_failed");
                    report.failed.push(address);
                }
            }
        }
        report
    }
}

/// Retry configured workers that have not attached yet until all have.
pub(super) async fn run_static(pool: Arc<WorkerPool>, addresses: BTreeSet<String>, retry: Duration) {
    let mut pending = addresses;
    let mut ticker = tokio::time::interval(retry);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(workers = pending.len(), ?retry, "static_attach_started");
    while !pending.is_empty() {
        tokio::select! {
            _ = ticker.tick() => {
                pool.attach_pending(&mut pending).await;
            }
            _ = pool.shutdown.cancelled() => return,
        }
    }
    tracing::info!("static_workers_attached");
}

pub(super) async fn run(pool: Arc<WorkerPool>, task: DiscoveryTask) {
    let DiscoveryTask {
        source,
        name,
        interval,
    } = task;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(%name, ?interval, "discovery_started");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match source.resolve(&name).await {
                    Ok(discovered) => {
                        pool.reconcile(&discovered).await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "discovery_failed; keeping membership");
                    }
                }
            }
            _ = pool.shutdown.cancelled() => {
                tracing::info!("discovery_stopped");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::pool;
    use super::*;
    use crate::worker::testing::FakeConnector;
    use crate::worker::WorkerState;
    use pretty_assertions::assert_eq;

    fn set(addresses: &[&str]) -> BTreeSet<String> {
        addresses.iter().map(|a| a.to_string()).collect()
    }

    fn strings(addresses: &[&str]) -> Vec<String> {
        addresses.iter().map(|a| a.to_string()).collect()
    }

    #[tokio::test]
    async fn converges_to_the_discovered_set() {
        let connector = FakeConnector::new();
        let pool = pool(connector.clone(), None);
        pool.add_address("A:1").await.unwrap();
        pool.add_address("C:1").await.unwrap();
        let a = pool.get("A:1").await.unwrap();
        let c = pool.get("C:1").await.unwrap();

        let report = pool.reconcile(&set(&["A:1", "B:1"])).await;
        assert_eq!(
            report,
            ReconcileReport {
                added: strings(&["B:1"]),
                removed: strings(&["C:1"]),
                failed: vec![],
            }
        );

        let mut addresses = pool.addresses().await;
        addresses.sort();
        assert_eq!(addresses, strings(&["A:1", "B:1"]));
        assert_eq!(c.state(), WorkerState::Destroyed);
        // A was untouched.
        assert_eq!(a.state(), WorkerState::Ready);
        assert!(Arc::ptr_eq(&a, &pool.get("A:1").await.unwrap()));
        assert_eq!(connector.device("A:1").connects(), 1);
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let connector = FakeConnector::new();
        let pool = pool(connector.clone(), None);
        let target = set(&["A:1", "B:1"]);

        assert_eq!(pool.reconcile(&target).await.added.len(), 2);
        assert!(pool.reconcile(&target).await.is_noop());
        assert_eq!(connector.device("A:1").connects(), 1);
    }

    #[tokio::test]
    async fn failed_additions_are_retried_next_pass() {
        let connector = FakeConnector::new();
        connector.device("B:1").set_reachable(false);
        let pool = pool(connector.clone(), None);

        let report = pool.reconcile(&set(&["B:1"])).await;
        assert_eq!(report.failed, strings(&["B:1"]));
        assert!(pool.is_empty().await);

        connector.device("B:1").set_reachable(true);
        let report = pool.reconcile(&set(&["B:1"])).await;
        assert_eq!(report.added, strings(&["B:1"]));
    }

    #[tokio::test]
    async fn removal_waits_for_consecutive_absences() {
        let connector = FakeConnector::new();
        let metrics = Arc::new(crate::metrics::MetricsCollector::new());
        let pool = WorkerPool::new(
            connector,
            super::super::tests::worker_options(),
            super::super::PoolOptions {
                wait_for_worker: None,
                health_interval: Duration::from_secs(5),
                removal_threshold: 3,
            },
            metrics,
        );
        pool.reconcile(&set(&["A:1"])).await;

        assert!(pool.reconcile(&set(&[])).await.removed.is_empty());
        assert!(pool.reconcile(&set(&[])).await.removed.is_empty());
        // Reappearing resets the count.
        pool.reconcile(&set(&["A:1"])).await;
        assert!(pool.reconcile(&set(&[])).await.removed.is_empty());
        assert!(pool.reconcile(&set(&[])).await.removed.is_empty());
        assert_eq!(pool.reconcile(&set(&[])).await.removed, strings(&["A:1"]));
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn concurrent_passes_do_not_double_add() {
        let connector = FakeConnector::new();
        let pool = pool(connector.clone(), None);
        let target = set(&["A:1", "B:1"]);

        let (r1, r2) = tokio::join!(pool.reconcile(&target), pool.reconcile(&target));
        assert_eq!(r1.added.len() + r2.added.len(), 2);
        assert_eq!(pool.len().await, 2);
        assert_eq!(connector.device("A:1").connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_loop_reconciles_and_tolerates_failures() {
        let connector = FakeConnector::new();
        let pool = pool(connector, None);

        let mut source = MockDiscovery::new();
        let mut calls = 0;
        source.expect_resolve().returning(move |_| {
            calls += 1;
            match calls {
                1 => Ok(set(&["A:1"])),
                2 => Err(DiscoveryError {
                    name: "devices.local".to_string(),
                    reason: "SERVFAIL".to_string(),
                }),
                _ => Ok(set(&["A:1", "B:1"])),
            }
        });

        pool.start(Some(DiscoveryTask {
            source: Arc::new(source),
            name: "devices.local".to_string(),
            interval: Duration::from_secs(30),
        }))
        .await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(pool.addresses().await, strings(&["A:1"]));

        // Failed resolution keeps membership.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(pool.addresses().await, strings(&["A:1"]));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(pool.addresses().await, strings(&["A:1", "B:1"]));

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn attach_pending_retries_only_unattached_workers() {
        let connector = FakeConnector::new();
        connector.device("B:1").set_reachable(false);
        let pool = pool(connector.clone(), None);
        let mut pending = set(&["A:1", "B:1"]);

        let first = pool.attach_pending(&mut pending).await;
        assert_eq!(first.added, strings(&["A:1"]));
        assert_eq!(first.failed, strings(&["B:1"]));
        assert_eq!(pending, set(&["B:1"]));

        connector.device("B:1").set_reachable(true);
        let second = pool.attach_pending(&mut pending).await;
        assert_eq!(second.added, strings(&["B:1"]));
        assert!(pending.is_empty());
        assert_eq!(connector.device("A:1").connects(), 1);
    }

    #[tokio::test]
    async fn attach_pending_leaves_manual_changes_alone() {
        let connector = FakeConnector::new();
        let pool = pool(connector.clone(), None);
        let mut pending = set(&["a:1"]);
        pool.attach_pending(&mut pending).await;

        pool.add_address("manual:1").await.unwrap();
        assert!(pool.remove("a:1").await);

        let report = pool.attach_pending(&mut pending).await;
        assert!(report.is_noop());
        assert_eq!(pool.addresses().await, strings(&["manual:1"]));
    }

    #[tokio::test(start_paused = true)]
    async fn static_attach_loop_stops_once_every_worker_attached() {
        let connector = FakeConnector::new();
        let device = connector.device("B:1");
        device.set_reachable(false);
        let pool = pool(connector.clone(), None);

        pool.attach_static(strings(&["A:1", "B:1"]), Duration::from_secs(30))
            .await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(pool.addresses().await, strings(&["A:1"]));

        device.set_reachable(true);
        tokio::time::sleep(Duration::from_secs(30)).await;
        let mut addresses = pool.addresses().await;
        addresses.sort();
        assert_eq!(addresses, strings(&["A:1", "B:1"]));

        // Later manual removals stick.
        assert!(pool.remove("B:1").await);
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(pool.addresses().await, strings(&["A:1"]));
        assert_eq!(device.connects(), 2);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn dns_discovery_resolves_localhost() {
        let found = DnsDiscovery::new(27042).resolve("localhost").await.unwrap();
        assert!(found.iter().all(|a| a.ends_with(":27042")));
        assert!(!found.is_empty());
    }
}
