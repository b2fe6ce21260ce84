//! Periodic liveness sweep over pool members.

use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;

use super::WorkerPool;
use crate::worker::WorkerState;

/// Result of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub probed: usize,
    pub healthy: usize,
    pub failed: Vec<String>,
    pub pruned: Vec<String>,
}

impl WorkerPool {
    /// Ping every `Ready` worker concurrently and prune destroyed ones.
    ///
    /// Busy and reattaching workers are left alone; a failed ping degrades
    /// its worker, which starts reattaching on its own.
    pub async fn health_sweep(&self) -> SweepReport {
        let mut probes = Vec::new();
        let mut destroyed = Vec::new();
        for manager in self.members_snapshot().await {
            match manager.state() {
                WorkerState::Ready => probes.push(manager),
                WorkerState::Destroyed => destroyed.push(manager),
                _ => {}
            }
        }

        let results = join_all(probes.iter().map(|m| m.ping())).await;

        let mut report = SweepReport {
            probed: probes.len(),
            ..SweepReport::default()
        };
        for (manager, alive) in probes.iter().zip(results) {
            if alive {
                report.healthy += 1;
            } else {
                report.failed.push(manager.address().to_string());
            }
        }
        for manager in destroyed {
            if self.remove_instance(&manager).await {
                report.pruned.push(manager.address().to_string());
            }
        }

        if !report.failed.is_empty() || !report.pruned.is_empty() {
            tracing::info!(
                probed = report.probed,
                failed = ?report.failed,
                pruned = ?report.pruned,
                "health_sweep_completed"
            );
        } else {
            tracing::debug!(probed = report.probed, "health_sweep_completed");
        }
        report
    }
}

pub(super) async fn run(pool: Arc<WorkerPool>) {
    let mut ticker = tokio::time::interval(pool.options.health_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // First tick completes immediately.
    ticker.tick().await;

    tracing::info!(interval = ?pool.options.health_interval, "health_sweep_started");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                pool.health_sweep().await;
            }
            _ = pool.shutdown.cancelled() => {
                tracing::info!("health_sweep_stopped");
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
    use std::time::Duration;
    use tracing_test::traced_test;

    #[tokio::test(start_paused = true)]
    async fn third_ping_failure_degrades_then_recovers() {
        let connector = FakeConnector::new();
        let device = connector.device("a:1");
        device.fail_ping_number(3);
        let pool = pool(connector.clone(), None);
        pool.add_address("a:1").await.unwrap();
        let manager = pool.get("a:1").await.unwrap();
        pool.start(None).await;

        let mut states = manager.subscribe();
        states.borrow_and_update();

        // Sweeps at 5s and 10s succeed; the one at 15s fails.
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(device.pings(), 2);
        assert!(!states.has_changed().unwrap());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(device.pings(), 3);
        assert!(states.has_changed().unwrap());

        // Reattach after the 1s delay at the latest.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(manager.state(), WorkerState::Ready);
        assert_eq!(device.startups(), 2);
        assert_eq!(pool.len().await, 1);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn sweep_skips_busy_and_reattaching_workers() {
        let connector = FakeConnector::new();
        let pool = pool(connector.clone(), None);
        pool.add_address("a:1").await.unwrap();
        pool.add_address("b:1").await.unwrap();

        connector.device("b:1").set_call_delay(Duration::from_millis(200));
        let busy = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let b = pool.get("b:1").await.unwrap();
                b.call("sign", serde_json::Value::Null).await
            })
        };
        let b = pool.get("b:1").await.unwrap();
        let mut rx = b.subscribe();
        while *rx.borrow_and_update() != WorkerState::InUse {
            rx.changed().await.unwrap();
        }

        let report = pool.health_sweep().await;
        assert_eq!(report.probed, 1);
        assert_eq!(report.healthy, 1);
        assert_eq!(connector.device("b:1").pings(), 0);
        busy.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_pings_a_worker_whose_caller_gave_up() {
        let connector = FakeConnector::new();
        connector.device("a:1").set_call_delay(Duration::from_secs(2));
        let pool = pool(connector.clone(), None);
        pool.add_address("a:1").await.unwrap();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            pool.call_any("sign", "sign", serde_json::Value::Null),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(pool.metrics().snapshot().in_flight, 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        let report = pool.health_sweep().await;
        assert_eq!(report.probed, 1);
        assert_eq!(report.healthy, 1);
        let manager = pool.get("a:1").await.unwrap();
        assert_eq!(manager.state(), WorkerState::Ready);
        assert_eq!(manager.in_flight(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn sweep_prunes_destroyed_members() {
        let connector = FakeConnector::new();
        let pool = pool(connector, None);
        pool.add_address("a:1").await.unwrap();
        pool.get("a:1").await.unwrap().destroy().await;

        let report = pool.health_sweep().await;
        assert_eq!(report.pruned, vec!["a:1".to_string()]);
        assert!(pool.is_empty().await);
        assert!(logs_contain("health_sweep_completed"));
    }
}
