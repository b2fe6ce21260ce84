//! Rate limiting and throttling.
//!
//! Fixed-window admission control keyed by (caller identity, call class).
//! Each call class carries its own rule; classes without a rule are unlimited.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

use humantime_serde::re::humantime;

/// Ceiling and period for one call class.
///
/// Written as `"<ceiling>/<period>"`, e.g. `"2/1s"`, `"10/500ms"` or
/// `"100/1m"`. A bare number after the slash is read as milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RateLimitRule {
    pub ceiling: u32,
    pub period: Duration,
}

impl RateLimitRule {
    pub fn new(ceiling: u32, period: Duration) -> Self {
        Self { ceiling, period }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.ceiling == 0 {
            return Err("ceiling must be positive".to_string());
        }
        if self.period.is_zero() {
            return Err("period must be positive".to_string());
        }
        Ok(())
    }
}

impl FromStr for RateLimitRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ceiling, period) = s
            .split_once('/')
            .ok_or_else(|| format!("expected <ceiling>/<period>, got {:?}", s))?;
        let ceiling: u32 = ceiling
            .trim()
            .parse()
            .map_err(|_| format!("invalid ceiling {:?}", ceiling))?;
        let period = period.trim();
        let period = match period.parse::<u64>() {
            Ok(millis) => Duration::from_millis(millis),
            Err(_) => humantime::parse_duration(period)
                .map_err(|e| format!("invalid period {:?}: {}", period, e))?,
        };
        let rule = Self::new(ceiling, period);
        rule.validate()?;
        Ok(rule)
    }
}

impl TryFrom<String> for RateLimitRule {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RateLimitRule> for String {
    fn from(rule: RateLimitRule) -> Self {
        rule.to_string()
    }
}

impl fmt::Display for RateLimitRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ceiling, humantime::format_duration(self.period))
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Rejected { retry_after_ms: u64 },
}

impl Admission {
    pub fn is_admitted(self) -> bool {
        self == Admission::Admitted
    }
}

/// One (caller, class) window.
#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: Instant,
    count: u32,
}

impl Window {
    fn is_expired(&self, now: Instant, period: Duration) -> bool {
        now.saturating_duration_since(self.started_at) >= period
    }
}

/// Rate limiter - per-caller admission for each configured call class.
///
/// NOT a separate actor - owned by the Kernel and called via &mut self.
#[derive(Debug, Default)]
pub struct RateLimiter {
    rules: HashMap<String, RateLimitRule>,
    windows: HashMap<(String, String), Window>,
}

impl RateLimiter {
    pub fn new(rules: HashMap<String, RateLimitRule>) -> Self {
        Self {
            rules,
            windows: HashMap::new(),
        }
    }

    pub fn rule(&self, class: &str) -> Option<&RateLimitRule> {
        self.rules.get(class)
    }

    /// Admit or reject one call, recording it when admitted.
    pub fn admit(&mut self, caller: &str, class: &str) -> Admission {
        self.admit_at(caller, class, Instant::now())
    }

    pub fn admit_at(&mut self, caller: &str, class: &str, now: Instant) -> Admission {
        let Some(rule) = self.rules.get(class).copied() else {
            return Admission::Admitted;
        };

        let window = self
            .windows
            .entry((caller.to_string(), class.to_string()))
            .or_insert(Window {
                started_at: now,
                count: 0,
            });

        if window.is_expired(now, rule.period) {
            *window = Window {
                started_at: now,
                count: 0,
            };
        }

        if window.count < rule.ceiling {
            window.count += 1;
            return Admission::Admitted;
        }

        let remaining = rule
            .period
            .saturating_sub(now.saturating_duration_since(window.started_at));
        Admission::Rejected {
            retry_after_ms: ceil_millis(remaining).max(1),
        }
    }

    /// Calls admitted in the caller's current window for `class`.
    pub fn current_count(&self, caller: &str, class: &str) -> u32 {
        let now = Instant::now();
        match (
            self.rules.get(class),
            self.windows.get(&(caller.to_string(), class.to_string())),
        ) {
            (Some(rule), Some(window)) if !window.is_expired(now, rule.period) => window.count,
            _ => 0,
        }
    }

    /// Clear every window held for a caller.
    pub fn clear_caller_limits(&mut self, caller: &str) {
        self.windows.retain(|(c, _), _| c != caller);
    }

    /// Evict windows whose period has elapsed. Returns the number evicted.
    pub fn cleanup_expired(&mut self) -> usize {
        self.cleanup_expired_at(Instant::now())
    }

    pub fn cleanup_expired_at(&mut self, now: Instant) -> usize {
        let before = self.windows.len();
        let rules = &self.rules;
        self.windows.retain(|(_, class), window| match rules.get(class) {
            Some(rule) => !window.is_expired(now, rule.period),
            None => false,
        });
        before - self.windows.len()
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }
}

fn ceil_millis(d: Duration) -> u64 {
    let micros = d.as_micros();
    u64::try_from(micros.div_ceil(1000)).unwrap_or(u64::MAX)
}
