//! Request pacing toward a remote source.
//!
//! Three interchangeable strategies share the [`RateLimiter`] trait:
//!
//! - [`TokenBucket`]: continuous refill, bursts up to capacity. Waits are
//!   capped and bounded, after which the request is force-granted so a
//!   caller can never starve.
//! - [`SlidingWindow`]: at most N grants inside any trailing window.
//!   Stricter than the bucket, at the cost of tracking every timestamp.
//! - [`AdaptiveRateLimiter`]: a token bucket whose rate follows feedback.
//!   One failure halves the rate at once; ten successes in a row raise it
//!   by 10%.
//!
//! All counters live behind the limiter's own mutex, which is never held
//! across an `.await`.
//!
//! # Example
//!
//! ```rust,no_run
//! use trawl_core::rate_limit::{Limiter, RateLimitConfig, RateLimiter};
//!
//! # async fn run() -> Result<(), trawl_core::AppError> {
//! let limiter = Limiter::from_config(&RateLimitConfig::adaptive(2.0, 0.2, 8.0))?;
//! limiter.acquire(1).await;
//! limiter.report_success();
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::AppError;

/// Longest single sleep inside [`TokenBucket::acquire`].
pub const MAX_SINGLE_WAIT: Duration = Duration::from_secs(5);

/// Wait/re-check cycles before a token bucket force-grants.
pub const MAX_WAIT_CYCLES: u32 = 3;

/// Consecutive successes that trigger one adaptive rate increase.
pub const SUCCESS_STREAK_FOR_INCREASE: u32 = 10;

/// Slack for float drift when comparing token counts.
const TOKEN_EPSILON: f64 = 1e-9;

/// Common interface of all pacing strategies.
pub trait RateLimiter: Send + Sync {
    /// Suspend until `n` units of capacity have been granted.
    fn acquire(&self, n: u32) -> impl Future<Output = ()> + Send;

    fn stats(&self) -> RateLimiterStats;

    /// Feedback hook; only the adaptive strategy reacts.
    fn report_success(&self) {}

    /// Feedback hook; only the adaptive strategy reacts.
    fn report_failure(&self) {}
}

/// Snapshot of a limiter's counters.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterStats {
    pub strategy: &'static str,
    /// Completed `acquire` calls.
    pub total_requests: u64,
    /// Time spent suspended inside `acquire`, summed over all callers.
    pub total_wait: Duration,
    /// Grants issued after the wait budget ran out.
    pub forced_grants: u64,
    /// Current sustained rate in requests per second.
    pub current_rate: f64,
    /// Tokens in the bucket, or free slots in the window.
    pub available: f64,
    pub successes: u64,
    pub failures: u64,
    /// Number of adaptive rate changes.
    pub adjustments: u64,
}

/// Serializable limiter selection, usable in source definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RateLimitConfig {
    TokenBucket {
        /// Units added per period.
        rate: f64,
        capacity: f64,
        #[serde(default = "default_period_secs")]
        period_secs: f64,
    },
    SlidingWindow {
        max_requests: usize,
        window_secs: f64,
    },
    Adaptive {
        /// Starting rate in requests per second.
        initial_rate: f64,
        min_rate: f64,
        max_rate: f64,
        #[serde(default = "default_increase_factor")]
        increase_factor: f64,
        #[serde(default = "default_decrease_factor")]
        decrease_factor: f64,
    },
}

fn default_period_secs() -> f64 {
    1.0
}

fn default_increase_factor() -> f64 {
    1.1
}

fn default_decrease_factor() -> f64 {
    0.5
}

impl RateLimitConfig {
    pub fn token_bucket(rate: f64, capacity: f64) -> Self {
        Self::TokenBucket {
            rate,
            capacity,
            period_secs: default_period_secs(),
        }
    }

    pub fn sliding_window(max_requests: usize, window: Duration) -> Self {
        Self::SlidingWindow {
            max_requests,
            window_secs: window.as_secs_f64(),
        }
    }

    pub fn adaptive(initial_rate: f64, min_rate: f64, max_rate: f64) -> Self {
        Self::Adaptive {
            initial_rate,
            min_rate,
            max_rate,
            increase_factor: default_increase_factor(),
            decrease_factor: default_decrease_factor(),
        }
    }
}

impl Default for RateLimitConfig {
    /// Adaptive, starting at 1 req/s within [0.1, 5] req/s.
    fn default() -> Self {
        Self::adaptive(1.0, 0.1, 5.0)
    }
}

/// Acquires a std mutex, recovering from poison if necessary.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("Recovered from poisoned rate limiter mutex");
        poisoned.into_inner()
    })
}

fn positive(value: f64, name: &str) -> Result<f64, AppError> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(AppError::Config(format!("{name} must be a positive number, got {value}")))
    }
}

fn seconds(value: f64, name: &str) -> Result<Duration, AppError> {
    Duration::try_from_secs_f64(positive(value, name)?)
        .map_err(|e| AppError::Config(format!("{name} is out of range: {e}")))
}

// ---------------------------------------------------------------------------
// Token bucket
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct BucketState {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
    total_requests: u64,
    total_wait: Duration,
    forced_grants: u64,
}

/// Continuously refilling token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    period: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// A full bucket of `capacity` tokens refilling at `rate` per `period`.
    pub fn new(rate: f64, capacity: f64, period: Duration) -> Result<Self, AppError> {
        let capacity = positive(capacity, "capacity")?;
        Self::with_tokens(rate, capacity, period, capacity)
    }

    /// A bucket starting with `tokens` (clamped to `[0, capacity]`).
    pub fn with_tokens(
        rate: f64,
        capacity: f64,
        period: Duration,
        tokens: f64,
    ) -> Result<Self, AppError> {
        let rate = positive(rate, "rate")?;
        let capacity = positive(capacity, "capacity")?;
        if period.is_zero() {
            return Err(AppError::Config("period must be greater than zero".into()));
        }
        Ok(Self {
            period,
            state: Mutex::new(BucketState {
                rate,
                capacity,
                tokens: tokens.clamp(0.0, capacity),
                last_refill: Instant::now(),
                total_requests: 0,
                total_wait: Duration::ZERO,
                forced_grants: 0,
            }),
        })
    }

    pub fn rate(&self) -> f64 {
        lock(&self.state).rate
    }

    pub fn capacity(&self) -> f64 {
        lock(&self.state).capacity
    }

    /// Change rate and capacity in place.
    ///
    /// Tokens earned so far are credited at the old rate and then clamped
    /// to the new capacity, so a retune never grants a fresh burst.
    pub fn retune(&self, rate: f64, capacity: f64) -> Result<(), AppError> {
        let rate = positive(rate, "rate")?;
        let capacity = positive(capacity, "capacity")?;
        let mut state = lock(&self.state);
        self.refill(&mut state);
        state.rate = rate;
        state.capacity = capacity;
        state.tokens = state.tokens.min(capacity);
        Ok(())
    }

    /// Tokens currently available, after refilling.
    pub fn available(&self) -> f64 {
        let mut state = lock(&self.state);
        self.refill(&mut state);
        state.tokens
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill);
        let added = elapsed.as_secs_f64() * state.rate / self.period.as_secs_f64();
        state.tokens = (state.tokens + added).min(state.capacity);
        state.last_refill = now;
    }

    fn wait_for(&self, state: &BucketState, deficit: f64) -> Duration {
        let secs = deficit * self.period.as_secs_f64() / state.rate;
        Duration::try_from_secs_f64(secs.max(0.0))
            .unwrap_or(MAX_SINGLE_WAIT)
            .min(MAX_SINGLE_WAIT)
    }

    pub async fn acquire(&self, n: u32) {
        let needed = f64::from(n);
        let started = Instant::now();

        for cycle in 0..=MAX_WAIT_CYCLES {
            let wait = {
                let mut state = lock(&self.state);
                self.refill(&mut state);

                if state.tokens + TOKEN_EPSILON >= needed {
                    state.tokens = (state.tokens - needed).max(0.0);
                    state.total_requests += 1;
                    state.total_wait += started.elapsed();
                    return;
                }

                if cycle == MAX_WAIT_CYCLES {
                    // Liveness over fairness: hand out the grant anyway.
                    state.tokens = (state.tokens - needed).max(0.0);
                    state.total_requests += 1;
                    state.total_wait += started.elapsed();
                    state.forced_grants += 1;
                    tracing::warn!(
                        requested = n,
                        rate = state.rate,
                        "Token bucket wait budget exhausted, forcing grant"
                    );
                    return;
                }

                self.wait_for(&state, needed - state.tokens)
            };

            tracing::trace!(wait_ms = %wait.as_millis(), cycle, "Token bucket waiting");
            tokio::time::sleep(wait).await;
        }
    }

    pub fn stats(&self) -> RateLimiterStats {
        let mut state = lock(&self.state);
        self.refill(&mut state);
        RateLimiterStats {
            strategy: "token_bucket",
            total_requests: state.total_requests,
            total_wait: state.total_wait,
            forced_grants: state.forced_grants,
            current_rate: state.rate / self.period.as_secs_f64(),
            available: state.tokens,
            successes: 0,
            failures: 0,
            adjustments: 0,
        }
    }
}

impl RateLimiter for TokenBucket {
    fn acquire(&self, n: u32) -> impl Future<Output = ()> + Send {
        TokenBucket::acquire(self, n)
    }

    fn stats(&self) -> RateLimiterStats {
        TokenBucket::stats(self)
    }
}

// ---------------------------------------------------------------------------
// Sliding window
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct WindowState {
    grants: VecDeque<Instant>,
    total_requests: u64,
    total_wait: Duration,
}

/// At most `max_requests` grants within any trailing `window`.
#[derive(Debug)]
pub struct SlidingWindow {
    max_requests: usize,
    window: Duration,
    state: Mutex<WindowState>,
}

impl SlidingWindow {
    pub fn new(max_requests: usize, window: Duration) -> Result<Self, AppError> {
        if max_requests == 0 {
            return Err(AppError::Config("max_requests must be at least 1".into()));
        }
        if window.is_zero() {
            return Err(AppError::Config("window must be greater than zero".into()));
        }
        Ok(Self {
            max_requests,
            window,
            state: Mutex::new(WindowState {
                grants: VecDeque::with_capacity(max_requests),
                total_requests: 0,
                total_wait: Duration::ZERO,
            }),
        })
    }

    fn evict(&self, grants: &mut VecDeque<Instant>, now: Instant) {
        while let Some(&oldest) = grants.front() {
            if now.duration_since(oldest) >= self.window {
                grants.pop_front();
            } else {
                break;
            }
        }
    }

    pub async fn acquire(&self, n: u32) {
        let requested = (n as usize).max(1);
        if requested > self.max_requests {
            tracing::warn!(
                requested,
                max_requests = self.max_requests,
                "Request exceeds window size, clamping"
            );
        }
        let needed = requested.min(self.max_requests);
        let started = Instant::now();

        loop {
            let wait = {
                let mut state = lock(&self.state);
                let now = Instant::now();
                self.evict(&mut state.grants, now);

                if state.grants.len() + needed <= self.max_requests {
                    state.grants.extend(std::iter::repeat_n(now, needed));
                    state.total_requests += 1;
                    state.total_wait += started.elapsed();
                    return;
                }

                match state.grants.front() {
                    Some(&oldest) => self.window.saturating_sub(now.duration_since(oldest)),
                    None => Duration::ZERO,
                }
            };

            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    pub fn stats(&self) -> RateLimiterStats {
        let mut state = lock(&self.state);
        self.evict(&mut state.grants, Instant::now());
        RateLimiterStats {
            strategy: "sliding_window",
            total_requests: state.total_requests,
            total_wait: state.total_wait,
            forced_grants: 0,
            current_rate: self.max_requests as f64 / self.window.as_secs_f64(),
            available: (self.max_requests - state.grants.len()) as f64,
            successes: 0,
            failures: 0,
            adjustments: 0,
        }
    }
}

impl RateLimiter for SlidingWindow {
    fn acquire(&self, n: u32) -> impl Future<Output = ()> + Send {
        SlidingWindow::acquire(self, n)
    }

    fn stats(&self) -> RateLimiterStats {
        SlidingWindow::stats(self)
    }
}

// ---------------------------------------------------------------------------
// Adaptive
// ---------------------------------------------------------------------------

/// Parameters of the adaptive limiter, in requests per second.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveConfig {
    pub initial_rate: f64,
    pub min_rate: f64,
    pub max_rate: f64,
    pub increase_factor: f64,
    pub decrease_factor: f64,
}

impl AdaptiveConfig {
    fn validate(&self) -> Result<(), AppError> {
        positive(self.min_rate, "min_rate")?;
        positive(self.max_rate, "max_rate")?;
        positive(self.initial_rate, "initial_rate")?;
        if self.min_rate > self.max_rate {
            return Err(AppError::Config(format!(
                "min_rate ({}) exceeds max_rate ({})",
                self.min_rate, self.max_rate
            )));
        }
        if !(self.increase_factor.is_finite() && self.increase_factor >= 1.0) {
            return Err(AppError::Config("increase_factor must be >= 1.0".into()));
        }
        if !(self.decrease_factor > 0.0 && self.decrease_factor <= 1.0) {
            return Err(AppError::Config("decrease_factor must be in (0, 1]".into()));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct AdaptiveState {
    current_rate: f64,
    success_streak: u32,
    successes: u64,
    failures: u64,
    adjustments: u64,
}

/// Token bucket whose rate tracks success/failure feedback.
///
/// Lock order is state, then bucket.
#[derive(Debug)]
pub struct AdaptiveRateLimiter {
    config: AdaptiveConfig,
    bucket: TokenBucket,
    state: Mutex<AdaptiveState>,
}

/// Burst size for a bucket running at `rate` req/s: one second's worth.
fn capacity_for(rate: f64) -> f64 {
    rate.ceil().max(1.0)
}

impl AdaptiveRateLimiter {
    pub fn new(config: AdaptiveConfig) -> Result<Self, AppError> {
        config.validate()?;
        let rate = config.initial_rate.clamp(config.min_rate, config.max_rate);
        let bucket = TokenBucket::new(rate, capacity_for(rate), Duration::from_secs(1))?;
        Ok(Self {
            config,
            bucket,
            state: Mutex::new(AdaptiveState {
                current_rate: rate,
                success_streak: 0,
                successes: 0,
                failures: 0,
                adjustments: 0,
            }),
        })
    }

    pub fn current_rate(&self) -> f64 {
        lock(&self.state).current_rate
    }

    pub async fn acquire(&self, n: u32) {
        self.bucket.acquire(n).await;
    }

    pub fn report_success(&self) {
        let mut state = lock(&self.state);
        state.successes += 1;
        state.success_streak += 1;

        if state.success_streak >= SUCCESS_STREAK_FOR_INCREASE {
            state.success_streak = 0;
            let new_rate = (state.current_rate * self.config.increase_factor)
                .min(self.config.max_rate);
            if new_rate > state.current_rate {
                tracing::debug!(
                    from = state.current_rate,
                    to = new_rate,
                    "Raising adaptive rate after success streak"
                );
                self.adjust(&mut state, new_rate);
            }
        }
    }

    pub fn report_failure(&self) {
        let mut state = lock(&self.state);
        state.failures += 1;
        state.success_streak = 0;

        let new_rate = (state.current_rate * self.config.decrease_factor).max(self.config.min_rate);
        if new_rate < state.current_rate {
            tracing::info!(
                from = state.current_rate,
                to = new_rate,
                "Lowering adaptive rate after failure"
            );
            self.adjust(&mut state, new_rate);
        }
    }

    /// Retune the shared bucket. Callers already waiting on it are paced
    /// at the new rate from here on.
    fn adjust(&self, state: &mut AdaptiveState, rate: f64) {
        match self.bucket.retune(rate, capacity_for(rate)) {
            Ok(()) => {
                state.current_rate = rate;
                state.adjustments += 1;
            }
            Err(e) => {
                // Unreachable with a validated config; keep the old rate.
                tracing::error!(error = %e, rate, "Failed to retune adaptive bucket");
            }
        }
    }

    pub fn stats(&self) -> RateLimiterStats {
        let state = lock(&self.state);
        let bucket = self.bucket.stats();
        RateLimiterStats {
            strategy: "adaptive",
            total_requests: bucket.total_requests,
            total_wait: bucket.total_wait,
            forced_grants: bucket.forced_grants,
            current_rate: state.current_rate,
            available: bucket.available,
            successes: state.successes,
            failures: state.failures,
            adjustments: state.adjustments,
        }
    }
}

impl RateLimiter for AdaptiveRateLimiter {
    fn acquire(&self, n: u32) -> impl Future<Output = ()> + Send {
        AdaptiveRateLimiter::acquire(self, n)
    }

    fn stats(&self) -> RateLimiterStats {
        AdaptiveRateLimiter::stats(self)
    }

    fn report_success(&self) {
        AdaptiveRateLimiter::report_success(self)
    }

    fn report_failure(&self) {
        AdaptiveRateLimiter::report_failure(self)
    }
}

// ---------------------------------------------------------------------------
// Limiter (config-selected strategy)
// ---------------------------------------------------------------------------

/// One of the three strategies, chosen from a [`RateLimitConfig`].
#[derive(Debug)]
pub enum Limiter {
    TokenBucket(TokenBucket),
    SlidingWindow(SlidingWindow),
    Adaptive(AdaptiveRateLimiter),
}

impl Limiter {
    pub fn from_config(config: &RateLimitConfig) -> Result<Self, AppError> {
        match config {
            RateLimitConfig::TokenBucket {
                rate,
                capacity,
                period_secs,
            } => {
                let period = seconds(*period_secs, "period_secs")?;
                Ok(Self::TokenBucket(TokenBucket::new(*rate, *capacity, period)?))
            }
            RateLimitConfig::SlidingWindow {
                max_requests,
                window_secs,
            } => {
                let window = seconds(*window_secs, "window_secs")?;
                Ok(Self::SlidingWindow(SlidingWindow::new(*max_requests, window)?))
            }
            RateLimitConfig::Adaptive {
                initial_rate,
                min_rate,
                max_rate,
                increase_factor,
                decrease_factor,
            } => Ok(Self::Adaptive(AdaptiveRateLimiter::new(AdaptiveConfig {
                initial_rate: *initial_rate,
                min_rate: *min_rate,
                max_rate: *max_rate,
                increase_factor: *increase_factor,
                decrease_factor: *decrease_factor,
            })?)),
        }
    }
}

impl RateLimiter for Limiter {
    async fn acquire(&self, n: u32) {
        match self {
            Limiter::TokenBucket(l) => l.acquire(n).await,
            Limiter::SlidingWindow(l) => l.acquire(n).await,
            Limiter::Adaptive(l) => l.acquire(n).await,
        }
    }

    fn stats(&self) -> RateLimiterStats {
        match self {
            Limiter::TokenBucket(l) => l.stats(),
            Limiter::SlidingWindow(l) => l.stats(),
            Limiter::Adaptive(l) => l.stats(),
        }
    }

    fn report_success(&self) {
        if let Limiter::Adaptive(l) = self {
            l.report_success();
        }
    }

    fn report_failure(&self) {
        if let Limiter::Adaptive(l) = self {
            l.report_failure();
        }
    }
}
