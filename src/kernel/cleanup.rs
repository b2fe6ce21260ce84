//! Background cleanup for long-running servers.
//!
//! CleanupService periodically evicts rate-limit windows whose period has
//! elapsed, so identities with no recent activity hold no memory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::{interval, Duration as TokioDuration, MissedTickBehavior};

use crate::kernel::Kernel;
use crate::types::CleanupConfig;

/// Statistics from a cleanup cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupStats {
    /// Number of rate limit windows evicted
    pub rate_windows_cleaned: usize,
    /// Windows still held after the cycle
    pub rate_windows_remaining: usize,
    /// When cleanup cycle completed
    pub completed_at: Option<DateTime<Utc>>,
}

/// CleanupService handles background garbage collection.
#[derive(Debug)]
pub struct CleanupService {
    kernel: Arc<Kernel>,
    config: CleanupConfig,
    stop_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl CleanupService {
    pub fn new(kernel: Arc<Kernel>, config: CleanupConfig) -> Self {
        Self {
            kernel,
            config,
            stop_tx: None,
        }
    }

    /// Start the cleanup loop in the background.
    /// Returns immediately; cleanup runs in a spawned task.
    pub fn start(&mut self) -> tokio::task::JoinHandle<()> {
        let kernel = self.kernel.clone();
        let period = TokioDuration::from_secs(self.config.interval_seconds.max(1));
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();
        self.stop_tx = Some(stop_tx);

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::run_cleanup_cycle(&kernel);
                    }
                    _ = &mut stop_rx => {
                        tracing::info!("cleanup_service_stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the cleanup loop.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Run a single cleanup cycle.
    pub fn run_cleanup_cycle(kernel: &Kernel) -> CleanupStats {
        let rate_windows_cleaned = kernel.cleanup_rate_windows();
        let stats = CleanupStats {
            rate_windows_cleaned,
            rate_windows_remaining: kernel.rate_window_count(),
            completed_at: Some(Utc::now()),
        };

        tracing::debug!(
            "cleanup_cycle_completed: rate_windows={}, remaining={}",
            stats.rate_windows_cleaned,
            stats.rate_windows_remaining,
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CallClass, CallerId, Config};
    use crate::worker::testing::FakeConnector;

    fn create_test_kernel() -> Kernel {
        let mut config = Config::default();
        config
            .rate_limits
            .insert("sign".to_string(), "1/100ms".parse().unwrap());
        Kernel::from_config(&config, FakeConnector::new(), None)
    }

    #[test]
    fn test_cleanup_config_defaults() {
        let config = CleanupConfig::default();
        assert_eq!(config.interval_seconds, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_evicts_expired_windows() {
        let kernel = create_test_kernel();
        let class = CallClass::from_string("sign".to_string()).unwrap();
        for caller in ["u1", "u2"] {
            let caller = CallerId::from_string(caller.to_string()).unwrap();
            assert!(kernel.admit(&caller, &class).is_admitted());
        }
        assert_eq!(kernel.rate_window_count(), 2);

        // Nothing expired yet.
        let stats = CleanupService::run_cleanup_cycle(&kernel);
        assert_eq!(stats.rate_windows_cleaned, 0);
        assert_eq!(stats.rate_windows_remaining, 2);

        tokio::time::advance(TokioDuration::from_millis(100)).await;
        let stats = CleanupService::run_cleanup_cycle(&kernel);
        assert_eq!(stats.rate_windows_cleaned, 2);
        assert_eq!(stats.rate_windows_remaining, 0);
        assert!(stats.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_cleanup_service_start_stop() {
        let kernel = Arc::new(create_test_kernel());
        let config = CleanupConfig { interval_seconds: 1 };

        let mut service = CleanupService::new(kernel, config);
        let handle = service.start();

        // Let it run briefly
        tokio::time::sleep(TokioDuration::from_millis(100)).await;

        // Stop it
        service.stop();

        // Wait for task to complete
        let _ = tokio::time::timeout(TokioDuration::from_secs(2), handle)
            .await
            .expect("cleanup service should stop");
    }
}
