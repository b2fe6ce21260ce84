//! Worker lifecycle state and reattach policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Worker lifecycle state.
///
/// State transitions:
/// ```text
/// CONNECTING → READY ⇄ IN_USE
///                ↓        ↓
///             DEGRADED ←──┘
///                ↓
///           REATTACHING → READY
///
/// any → DESTROYED (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    Connecting,
    Ready,
    InUse,
    Degraded,
    Reattaching,
    Destroyed,
}

impl WorkerState {
    /// Invocation is permitted.
    pub fn accepts_work(self) -> bool {
        matches!(self, WorkerState::Ready | WorkerState::InUse)
    }

    pub fn is_terminal(self) -> bool {
        self == WorkerState::Destroyed
    }

    /// Check if transition is valid.
    pub fn can_transition_to(self, to: WorkerState) -> bool {
        match (self, to) {
            (WorkerState::Destroyed, _) => false,
            (_, WorkerState::Destroyed) => true,
            (WorkerState::Connecting, WorkerState::Ready) => true,
            (WorkerState::Ready, WorkerState::InUse) => true,
            (WorkerState::InUse, WorkerState::Ready) => true,
            (WorkerState::Ready | WorkerState::InUse, WorkerState::Degraded) => true,
            (WorkerState::Degraded, WorkerState::Reattaching) => true,
            (WorkerState::Reattaching, WorkerState::Ready) => true,
            _ => false,
        }
    }
}

/// Delay schedule between failed reattach attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Backoff {
    /// The same delay before every retry.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial: delay,
            max: delay,
            multiplier: 1.0,
        }
    }

    /// Delay after the given number of consecutive failures (1-based).
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(64) as i32;
        let scaled = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(scaled).max(self.initial)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(1))
    }
}

/// What a manager does after a failed reattach attempt.
#[derive(Debug, Clone)]
pub enum ReattachPolicy {
    /// Keep retrying forever, sleeping per the backoff schedule.
    Retry(Backoff),
    /// Destroy the manager and cancel the token. Used when there is no
    /// substitute worker and the process should exit.
    Terminate(CancellationToken),
}

impl Default for ReattachPolicy {
    fn default() -> Self {
        ReattachPolicy::Retry(Backoff::default())
    }
}
