//! Configuration structures.
//!
//! Configuration is loaded from a JSON file, overridden from the command
//! line, and validated once before the server starts.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::kernel::rate_limiter::RateLimitRule;
use crate::types::{Error, Result};
use crate::validation::{validate_address, validate_non_empty, validate_non_zero, validate_positive};

/// Global server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Per-worker connection settings.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Pool membership and dispatch settings.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Dynamic discovery (disabled when `name` is unset).
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Rate limit rule per call class. Classes not listed are unlimited.
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimitRule>,

    /// Remote method per call class. Classes not listed call a method of the same name.
    #[serde(default)]
    pub methods: HashMap<String, String>,

    /// Background cleanup.
    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// IPC transport configuration.
    #[serde(default)]
    pub ipc: IpcConfig,
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::config(format!("cannot parse {}: {}", path.display(), e)))
    }

    /// Reject configurations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.check().map_err(|e| match e {
            Error::Validation(msg) => Error::Config(msg),
            other => other,
        })
    }

    fn check(&self) -> Result<()> {
        self.server
            .listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| Error::config(format!("server.listen_addr: {}", e)))?;

        for address in &self.pool.workers {
            validate_address(address, "pool.workers")?;
        }

        validate_non_zero(self.worker.connect_timeout, "worker.connect_timeout")?;
        validate_non_zero(self.worker.call_timeout, "worker.call_timeout")?;
        validate_non_zero(self.worker.ping_timeout, "worker.ping_timeout")?;
        validate_non_empty(&self.worker.ping_method, "worker.ping_method")?;
        validate_positive(self.worker.max_concurrent_calls as u64, "worker.max_concurrent_calls")?;
        validate_non_zero(self.worker.reattach_delay, "worker.reattach_delay")?;
        if self.worker.reattach_max_delay < self.worker.reattach_delay {
            return Err(Error::config(
                "worker.reattach_max_delay must be >= worker.reattach_delay",
            ));
        }
        if !(self.worker.reattach_multiplier >= 1.0) {
            return Err(Error::config("worker.reattach_multiplier must be >= 1.0"));
        }

        validate_non_zero(self.pool.health_interval, "pool.health_interval")?;

        if let Some(name) = &self.discovery.name {
            if !self.pool.workers.is_empty() {
                return Err(Error::config(
                    "pool.workers and discovery.name are mutually exclusive",
                ));
            }
            validate_non_empty(name, "discovery.name")?;
            validate_positive(u64::from(self.discovery.port), "discovery.port")?;
            validate_non_zero(self.discovery.interval, "discovery.interval")?;
            validate_positive(u64::from(self.discovery.removal_threshold), "discovery.removal_threshold")?;
        }

        for (class, rule) in &self.rate_limits {
            validate_non_empty(class, "rate_limits key")?;
            rule.validate()
                .map_err(|e| Error::config(format!("rate_limits.{}: {}", class, e)))?;
        }

        if self.cleanup.interval_seconds == 0 {
            return Err(Error::config("cleanup.interval_seconds must be positive"));
        }

        Ok(())
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// IPC server bind address (TCP).
    pub listen_addr: String,

    /// How long shutdown waits for in-flight calls.
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:50061".to_string(),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level used when `RUST_LOG` is unset.
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Connection settings applied to every worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Upper bound on a single dispatched call.
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub ping_timeout: Duration,

    /// Remote method run once after every (re)connect. None skips startup.
    pub startup_method: Option<String>,

    /// Remote method used as the liveness probe.
    pub ping_method: String,

    /// Concurrent calls per worker when the transport allows it.
    pub max_concurrent_calls: usize,

    /// Delay before the first reattach retry.
    #[serde(with = "humantime_serde")]
    pub reattach_delay: Duration,

    #[serde(with = "humantime_serde")]
    pub reattach_max_delay: Duration,

    /// 1.0 keeps the delay fixed.
    pub reattach_multiplier: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(2),
            startup_method: Some("setup".to_string()),
            ping_method: "ping".to_string(),
            max_concurrent_calls: 8,
            reattach_delay: Duration::from_secs(1),
            reattach_max_delay: Duration::from_secs(1),
            reattach_multiplier: 1.0,
        }
    }
}

/// Pool membership and dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Statically configured worker addresses.
    pub workers: Vec<String>,

    /// Wait this long for a healthy worker instead of failing fast.
    #[serde(with = "humantime_serde")]
    pub wait_for_worker: Option<Duration>,

    #[serde(with = "humantime_serde")]
    pub health_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: Vec::new(),
            wait_for_worker: None,
            health_interval: Duration::from_secs(5),
        }
    }
}

/// Discovery via name resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Name to resolve. Discovery is off when unset.
    pub name: Option<String>,

    /// Port appended to every resolved address.
    pub port: u16,

    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Consecutive passes a member must be missing before it is removed.
    pub removal_threshold: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            name: None,
            port: 27042,
            interval: Duration::from_secs(30),
            removal_threshold: 1,
        }
    }
}

/// Configuration for cleanup behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// How often to evict idle rate limit windows (default: 60 seconds).
    pub interval_seconds: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
        }
    }
}

/// IPC transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcConfig {
    /// Maximum frame payload size in bytes.
    pub max_frame_bytes: u32,

    /// Maximum concurrent TCP connections. Connections beyond this limit
    /// are rejected.
    pub max_connections: usize,

    /// Read timeout in seconds per frame. Connections idle beyond this
    /// duration are dropped.
    pub read_timeout_secs: u64,

    /// Write timeout in seconds per frame.
    pub write_timeout_secs: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 5 * 1024 * 1024,
            max_connections: 1000,
            read_timeout_secs: 300,
            write_timeout_secs: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn loads_durations_and_rate_limits_from_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "pool": {{ "wait_for_worker": "2s" }},
                "discovery": {{ "name": "devices.local", "interval": "45s", "removal_threshold": 3 }},
                "rate_limits": {{ "sign": "2/1s", "bulk": "100/1m" }}
            }}"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.pool.wait_for_worker, Some(Duration::from_secs(2)));
        assert_eq!(config.pool.health_interval, Duration::from_secs(5));
        assert_eq!(config.discovery.interval, Duration::from_secs(45));
        assert_eq!(config.discovery.removal_threshold, 3);
        assert_eq!(config.rate_limits["sign"].ceiling, 2);
        assert_eq!(config.rate_limits["bulk"].period, Duration::from_secs(60));
        config.validate().unwrap();
    }

    #[test]
    fn bad_rate_limit_syntax_fails_to_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "rate_limits": {{ "sign": "two per second" }} }}"#).unwrap();
        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn bad_worker_address_is_rejected() {
        let mut config = Config::default();
        config.pool.workers.push("no-port".to_string());
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn static_workers_and_discovery_do_not_mix() {
        let mut config = Config::default();
        config.pool.workers.push("10.0.0.2:27042".to_string());
        config.discovery.name = Some("devices.local".to_string());
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn shrinking_backoff_is_rejected() {
        let mut config = Config::default();
        config.worker.reattach_delay = Duration::from_secs(5);
        config.worker.reattach_max_delay = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }
}
