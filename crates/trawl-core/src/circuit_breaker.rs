//! Per-source circuit breaker.
//!
//! A source that keeps pushing back (rate limits, challenges, timeouts)
//! is given a cooling-off period instead of being hammered by every
//! remaining detail task.
//!
//! ```text
//! CLOSED --[N throttle-worthy failures]--> OPEN --[cooldown]--> HALF_OPEN
//!    ^                                                             |
//!    +-----------------------[success]-----------------------------+
//!                            [failure] --> OPEN
//! ```

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive throttle-worthy failures before opening.
    pub failure_threshold: u32,
    /// How long the circuit stays open before letting a probe through.
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    last_error: Option<String>,
    times_opened: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub times_opened: u64,
    pub last_error: Option<String>,
    pub time_until_half_open: Option<Duration>,
}

/// Cloneable handle; clones share state.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                last_error: None,
                times_opened: 0,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock_inner(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock_inner();
        self.maybe_half_open(&mut inner);
        inner.state
    }

    /// Fail fast while the circuit is open.
    pub fn check(&self) -> Result<(), AppError> {
        let mut inner = self.lock_inner();
        self.maybe_half_open(&mut inner);

        if inner.state == CircuitState::Open {
            let retry_after = self.remaining_cooldown(&inner).unwrap_or_default();
            return Err(AppError::RateLimitExceeded(format!(
                "circuit for source '{}' is open, retry after {}s",
                self.name,
                retry_after.as_secs()
            )));
        }
        Ok(())
    }

    pub fn record_success(&self) {
        let mut inner = self.lock_inner();
        if inner.state == CircuitState::HalfOpen {
            tracing::info!(circuit = %self.name, "Probe succeeded, closing circuit");
            inner.state = CircuitState::Closed;
            inner.last_error = None;
        }
        inner.failure_count = 0;
    }

    /// Count a failure. Errors that do not signal remote pushback are ignored.
    pub fn record_failure(&self, error: &AppError) {
        if !error.should_throttle() {
            return;
        }

        let mut inner = self.lock_inner();
        inner.last_error = Some(error.to_string());

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        circuit = %self.name,
                        failures = inner.failure_count,
                        error = %error,
                        "Opening circuit after consecutive failures"
                    );
                    self.open(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(
                    circuit = %self.name,
                    error = %error,
                    "Probe failed, reopening circuit"
                );
                self.open(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock_inner();
        self.maybe_half_open(&mut inner);
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            times_opened: inner.times_opened,
            last_error: inner.last_error.clone(),
            time_until_half_open: self.remaining_cooldown(&inner),
        }
    }

    fn open(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.times_opened += 1;
    }

    fn remaining_cooldown(&self, inner: &BreakerInner) -> Option<Duration> {
        if inner.state != CircuitState::Open {
            return None;
        }
        inner
            .opened_at
            .map(|t| self.config.recovery_timeout.saturating_sub(t.elapsed()))
    }

    fn maybe_half_open(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open
            && let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= self.config.recovery_timeout
        {
            tracing::info!(circuit = %self.name, "Circuit half-open, allowing a probe");
            inner.state = CircuitState::HalfOpen;
        }
    }
}
