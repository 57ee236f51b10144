//! Round-robin proxy rotation with per-endpoint health tracking.

use std::sync::{Mutex, MutexGuard};

use serde::Serialize;

/// Attempts after which a poor endpoint is excluded.
pub const EXCLUDE_AFTER_ATTEMPTS: u64 = 10;
/// Success rate below which an endpoint past the attempt floor is excluded.
pub const EXCLUDE_BELOW_RATE: f64 = 0.3;
/// Attempts before an endpoint can be considered degraded.
pub const DEGRADED_AFTER_ATTEMPTS: u64 = 3;
pub const DEGRADED_BELOW_RATE: f64 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyHealth {
    Healthy,
    Degraded,
    /// Terminal for the lifetime of the rotator.
    Excluded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxyEndpoint {
    pub address: String,
    pub successes: u64,
    pub failures: u64,
    pub health: ProxyHealth,
}

impl ProxyEndpoint {
    fn new(address: String) -> Self {
        Self {
            address,
            successes: 0,
            failures: 0,
            health: ProxyHealth::Healthy,
        }
    }

    pub fn attempts(&self) -> u64 {
        self.successes + self.failures
    }

    pub fn success_rate(&self) -> f64 {
        match self.attempts() {
            0 => 1.0,
            n => self.successes as f64 / n as f64,
        }
    }

    fn reassess(&mut self) {
        if self.health == ProxyHealth::Excluded {
            return;
        }
        let attempts = self.attempts();
        let rate = self.success_rate();
        self.health = if attempts > EXCLUDE_AFTER_ATTEMPTS && rate < EXCLUDE_BELOW_RATE {
            ProxyHealth::Excluded
        } else if attempts >= DEGRADED_AFTER_ATTEMPTS && rate < DEGRADED_BELOW_RATE {
            ProxyHealth::Degraded
        } else {
            ProxyHealth::Healthy
        };
    }
}

#[derive(Debug)]
struct RotatorInner {
    endpoints: Vec<ProxyEndpoint>,
    cursor: usize,
}

/// Hands out proxy addresses round-robin, skipping excluded endpoints.
#[derive(Debug)]
pub struct ProxyRotator {
    inner: Mutex<RotatorInner>,
    strict: bool,
}

impl ProxyRotator {
    /// Duplicate and blank addresses are dropped.
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut endpoints: Vec<ProxyEndpoint> = Vec::new();
        for address in addresses {
            let address = address.into().trim().to_string();
            if address.is_empty() || endpoints.iter().any(|e| e.address == address) {
                continue;
            }
            endpoints.push(ProxyEndpoint::new(address));
        }
        Self {
            inner: Mutex::new(RotatorInner {
                endpoints,
                cursor: 0,
            }),
            strict: false,
        }
    }

    /// Refuse to run unproxied once every endpoint is excluded.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    fn lock_inner(&self) -> MutexGuard<'_, RotatorInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned proxy rotator mutex");
            poisoned.into_inner()
        })
    }

    /// Next usable address, or `None` when every endpoint is excluded.
    pub fn next_proxy(&self) -> Option<String> {
        let mut inner = self.lock_inner();
        let len = inner.endpoints.len();
        for _ in 0..len {
            let idx = inner.cursor % len;
            inner.cursor = inner.cursor.wrapping_add(1);
            let endpoint = &inner.endpoints[idx];
            if endpoint.health != ProxyHealth::Excluded {
                return Some(endpoint.address.clone());
            }
        }
        None
    }

    pub fn report_success(&self, address: &str) {
        self.record(address, true);
    }

    pub fn report_failure(&self, address: &str) {
        self.record(address, false);
    }

    fn record(&self, address: &str, success: bool) {
        let mut inner = self.lock_inner();
        let Some(endpoint) = inner.endpoints.iter_mut().find(|e| e.address == address) else {
            tracing::debug!(%address, "Ignoring report for unknown proxy");
            return;
        };

        if success {
            endpoint.successes += 1;
        } else {
            endpoint.failures += 1;
        }

        let before = endpoint.health;
        endpoint.reassess();
        if endpoint.health != before {
            tracing::warn!(
                proxy = %endpoint.address,
                from = ?before,
                to = ?endpoint.health,
                success_rate = endpoint.success_rate(),
                "Proxy health changed"
            );
        }
    }

    pub fn health_report(&self) -> Vec<ProxyEndpoint> {
        self.lock_inner().endpoints.clone()
    }

    pub fn available(&self) -> usize {
        self.lock_inner()
            .endpoints
            .iter()
            .filter(|e| e.health != ProxyHealth::Excluded)
            .count()
    }
}
