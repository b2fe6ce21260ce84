//! Scriptable in-memory connector for unit tests.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::connector::{Connection, Connector};
use crate::types::{ConnectError, TransportError};

/// Behaviour and counters of one fake device.
#[derive(Debug)]
pub(crate) struct FakeDevice {
    reachable: AtomicBool,
    fail_startup: AtomicBool,
    fail_calls: AtomicU32,
    fail_ping: AtomicU32,
    call_delay: Mutex<Duration>,
    connects: AtomicU32,
    startups: AtomicU32,
    pings: AtomicU32,
    closes: AtomicU32,
    active_calls: AtomicU32,
    max_active_calls: AtomicU32,
}

impl Default for FakeDevice {
    fn default() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            fail_startup: AtomicBool::new(false),
            fail_calls: AtomicU32::new(0),
            fail_ping: AtomicU32::new(0),
            call_delay: Mutex::new(Duration::ZERO),
            connects: AtomicU32::new(0),
            startups: AtomicU32::new(0),
            pings: AtomicU32::new(0),
            closes: AtomicU32::new(0),
            active_calls: AtomicU32::new(0),
            max_active_calls: AtomicU32::new(0),
        }
    }
}

impl FakeDevice {
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_fail_startup(&self, fail: bool) {
        self.fail_startup.store(fail, Ordering::SeqCst);
    }

    /// The next `n` ordinary calls break the connection.
    pub fn fail_next_calls(&self, n: u32) {
        self.fail_calls.store(n, Ordering::SeqCst);
    }

    /// The ping with this 1-based sequence number fails.
    pub fn fail_ping_number(&self, n: u32) {
        self.fail_ping.store(n, Ordering::SeqCst);
    }

    pub fn set_call_delay(&self, delay: Duration) {
        *self.call_delay.lock().unwrap() = delay;
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn startups(&self) -> u32 {
        self.startups.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> u32 {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_calls(&self) -> u32 {
        self.max_active_calls.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeConnector {
    devices: Mutex<HashMap<String, Arc<FakeDevice>>>,
    concurrent: AtomicBool,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connections accept several calls at once.
    pub fn concurrent() -> Arc<Self> {
        Arc::new(Self {
            devices: Mutex::new(HashMap::new()),
            concurrent: AtomicBool::new(true),
        })
    }

    /// Applies to connections opened from now on.
    pub fn set_concurrent(&self, concurrent: bool) {
        self.concurrent.store(concurrent, Ordering::SeqCst);
    }

    pub fn device(&self, address: &str) -> Arc<FakeDevice> {
        self.devices
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        address: &str,
        _timeout: Duration,
    ) -> Result<Arc<dyn Connection>, ConnectError> {
        let device = self.device(address);
        device.connects.fetch_add(1, Ordering::SeqCst);
        if !device.reachable.load(Ordering::SeqCst) {
            return Err(ConnectError::new(address, "connection refused"));
        }
        Ok(Arc::new(FakeConnection {
            address: address.to_string(),
            device,
            concurrent: self.concurrent.load(Ordering::SeqCst),
            closed: AtomicBool::new(false),
        }))
    }
}

#[derive(Debug)]
struct FakeConnection {
    address: String,
    device: Arc<FakeDevice>,
    concurrent: bool,
    closed: AtomicBool,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn call(&self, name: &str, args: Value) -> Result<Value, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let device = &self.device;
        match name {
            "setup" => {
                device.startups.fetch_add(1, Ordering::SeqCst);
                if device.fail_startup.load(Ordering::SeqCst) {
                    return Err(TransportError::Broken("setup failed".to_string()));
                }
                Ok(Value::Null)
            }
            "ping" => {
                let n = device.pings.fetch_add(1, Ordering::SeqCst) + 1;
                if n == device.fail_ping.load(Ordering::SeqCst) {
                    return Err(TransportError::Closed);
                }
                Ok(json!("pong"))
            }
            "reject" => Err(TransportError::Remote("rejected by device".to_string())),
            _ => {
                let active = device.active_calls.fetch_add(1, Ordering::SeqCst) + 1;
                device.max_active_calls.fetch_max(active, Ordering::SeqCst);
                let delay = *device.call_delay.lock().unwrap();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                device.active_calls.fetch_sub(1, Ordering::SeqCst);

                let failing = device
                    .fail_calls
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if failing {
                    self.closed.store(true, Ordering::SeqCst);
                    return Err(TransportError::Closed);
                }
                Ok(json!({"worker": self.address, "method": name, "args": args}))
            }
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.device.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn supports_concurrent_calls(&self) -> bool {
        self.concurrent
    }
}
