//! Counters and latency tracking for workers and dispatch outcomes.
//!
//! Every counter is an atomic; the per-worker table sits behind a std
//! `RwLock` that is only held long enough to look up or insert an entry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

const NUM_HISTOGRAM_BINS: usize = 64;

/// Log2-bucketed latency histogram over microseconds.
///
/// Bin `i` holds samples in `[2^i, 2^(i+1))` µs; bin 0 also holds zero.
#[derive(Debug)]
struct LatencyHistogram {
    bins: [AtomicU64; NUM_HISTOGRAM_BINS],
    total_latency_us: AtomicU64,
    sample_count: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            bins: std::array::from_fn(|_| AtomicU64::new(0)),
            total_latency_us: AtomicU64::new(0),
            sample_count: AtomicU64::new(0),
        }
    }

    fn record(&self, latency: Duration) {
        let us = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.bins[Self::bin(us)].fetch_add(1, Ordering::Relaxed);
        self.total_latency_us.fetch_add(us, Ordering::Relaxed);
        self.sample_count.fetch_add(1, Ordering::Relaxed);
    }

    fn bin(us: u64) -> usize {
        if us == 0 {
            0
        } else {
            (63 - us.leading_zeros()) as usize
        }
    }

    /// Upper edge of the bin containing the given percentile.
    fn percentile(&self, p: f64) -> u64 {
        let count = self.sample_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0;
        }
        let target = ((count as f64) * p).ceil().max(1.0) as u64;
        let mut seen = 0;
        for (i, bin) in self.bins.iter().enumerate() {
            seen += bin.load(Ordering::Relaxed);
            if seen >= target {
                return 1u64.checked_shl(i as u32 + 1).unwrap_or(u64::MAX);
            }
        }
        u64::MAX
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.sample_count.load(Ordering::Relaxed);
        let total = self.total_latency_us.load(Ordering::Relaxed);
        LatencySnapshot {
            samples: count,
            avg_us: if count == 0 { 0 } else { total / count },
            p50_us: self.percentile(0.50),
            p95_us: self.percentile(0.95),
            p99_us: self.percentile(0.99),
        }
    }
}

#[derive(Debug)]
struct WorkerCounters {
    attach_success: AtomicU64,
    attach_failure: AtomicU64,
    reattach_success: AtomicU64,
    reattach_failure: AtomicU64,
    call_success: AtomicU64,
    call_failure: AtomicU64,
    latency: LatencyHistogram,
}

impl WorkerCounters {
    fn new() -> Self {
        Self {
            attach_success: AtomicU64::new(0),
            attach_failure: AtomicU64::new(0),
            reattach_success: AtomicU64::new(0),
            reattach_failure: AtomicU64::new(0),
            call_success: AtomicU64::new(0),
            call_failure: AtomicU64::new(0),
            latency: LatencyHistogram::new(),
        }
    }

    fn snapshot(&self) -> WorkerMetrics {
        WorkerMetrics {
            attach_success: self.attach_success.load(Ordering::Relaxed),
            attach_failure: self.attach_failure.load(Ordering::Relaxed),
            reattach_success: self.reattach_success.load(Ordering::Relaxed),
            reattach_failure: self.reattach_failure.load(Ordering::Relaxed),
            call_success: self.call_success.load(Ordering::Relaxed),
            call_failure: self.call_failure.load(Ordering::Relaxed),
            latency: self.latency.snapshot(),
        }
    }
}

#[derive(Debug, Default)]
struct DispatchCounters {
    admitted: AtomicU64,
    succeeded: AtomicU64,
    rate_limited: AtomicU64,
    unavailable: AtomicU64,
    transient: AtomicU64,
    timeouts: AtomicU64,
}

/// Dispatch outcome recorded by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Succeeded,
    RateLimited,
    Unavailable,
    Transient,
    Timeout,
}

/// Worker lifecycle event recorded by a worker manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachEvent {
    AttachSuccess,
    AttachFailure,
    ReattachSuccess,
    ReattachFailure,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencySnapshot {
    pub samples: u64,
    pub avg_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub attach_success: u64,
    pub attach_failure: u64,
    pub reattach_success: u64,
    pub reattach_failure: u64,
    pub call_success: u64,
    pub call_failure: u64,
    pub latency: LatencySnapshot,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchMetrics {
    pub admitted: u64,
    pub succeeded: u64,
    pub rate_limited: u64,
    pub unavailable: u64,
    pub transient: u64,
    pub timeouts: u64,
}

/// Complete metrics snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_ms: u64,
    pub waiting_dispatches: i64,
    pub in_flight: i64,
    pub dispatch: DispatchMetrics,
    pub workers: BTreeMap<String, WorkerMetrics>,
}

/// Shared metrics sink for managers, pool and kernel.
#[derive(Debug)]
pub struct MetricsCollector {
    started_at: Instant,
    workers: RwLock<BTreeMap<String, Arc<WorkerCounters>>>,
    dispatch: DispatchCounters,
    waiting_dispatches: AtomicI64,
    in_flight: AtomicI64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            workers: RwLock::new(BTreeMap::new()),
            dispatch: DispatchCounters::default(),
            waiting_dispatches: AtomicI64::new(0),
            in_flight: AtomicI64::new(0),
        }
    }

    fn worker(&self, address: &str) -> Arc<WorkerCounters> {
        if let Some(counters) = self
            .workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
        {
            return counters.clone();
        }
        self.workers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(WorkerCounters::new()))
            .clone()
    }

    pub fn record_attach(&self, address: &str, event: AttachEvent) {
        let counters = self.worker(address);
        let counter = match event {
            AttachEvent::AttachSuccess => &counters.attach_success,
            AttachEvent::AttachFailure => &counters.attach_failure,
            AttachEvent::ReattachSuccess => &counters.reattach_success,
            AttachEvent::ReattachFailure => &counters.reattach_failure,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_call_success(&self, address: &str, latency: Duration) {
        let counters = self.worker(address);
        counters.call_success.fetch_add(1, Ordering::Relaxed);
        counters.latency.record(latency);
    }

    pub fn record_call_failure(&self, address: &str) {
        self.worker(address)
            .call_failure
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_admitted(&self) {
        self.dispatch.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch(&self, outcome: DispatchOutcome) {
        let counter = match outcome {
            DispatchOutcome::Succeeded => &self.dispatch.succeeded,
            DispatchOutcome::RateLimited => &self.dispatch.rate_limited,
            DispatchOutcome::Unavailable => &self.dispatch.unavailable,
            DispatchOutcome::Transient => &self.dispatch.transient,
            DispatchOutcome::Timeout => &self.dispatch.timeouts,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Track a dispatch waiting for a healthy worker until the guard drops.
    pub fn waiting(&self) -> GaugeGuard<'_> {
        GaugeGuard::new(&self.waiting_dispatches)
    }

    /// Track an in-flight worker call until the guard drops.
    pub fn in_flight(&self) -> GaugeGuard<'_> {
        GaugeGuard::new(&self.in_flight)
    }

    /// Drop the counters of a worker that left the pool.
    pub fn forget_worker(&self, address: &str) {
        self.workers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address);
    }

    pub fn worker_metrics(&self, address: &str) -> Option<WorkerMetrics> {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .map(|c| c.snapshot())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let d = &self.dispatch;
        MetricsSnapshot {
            uptime_ms: u64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            waiting_dispatches: self.waiting_dispatches.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            dispatch: DispatchMetrics {
                admitted: d.admitted.load(Ordering::Relaxed),
                succeeded: d.succeeded.load(Ordering::Relaxed),
                rate_limited: d.rate_limited.load(Ordering::Relaxed),
                unavailable: d.unavailable.load(Ordering::Relaxed),
                transient: d.transient.load(Ordering::Relaxed),
                timeouts: d.timeouts.load(Ordering::Relaxed),
            },
            workers: self
                .workers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .map(|(addr, c)| (addr.clone(), c.snapshot()))
                .collect(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Increments a gauge on creation and decrements it on drop.
#[derive(Debug)]
pub struct GaugeGuard<'a> {
    gauge: &'a AtomicI64,
}

impl<'a> GaugeGuard<'a> {
    fn new(gauge: &'a AtomicI64) -> Self {
        gauge.fetch_add(1, Ordering::Relaxed);
        Self { gauge }
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.gauge.fetch_sub(1, Ordering::Relaxed);
    }
}
