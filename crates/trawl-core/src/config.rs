use std::time::Duration;

use crate::error::AppError;

/// Per-run fetch configuration.
///
/// Built once, validated, then shared read-only (usually behind an `Arc`)
/// by every pool, limiter and source scraper of the run.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchConfig {
    /// Maximum detail fetches in flight per source.
    pub max_concurrent: usize,
    /// Number of long-lived automation handles per pool.
    pub pool_size: usize,
    /// Per-page navigation timeout.
    pub timeout: Duration,
    /// Retries after the initial attempt.
    pub retry_attempts: u32,
    /// Base delay for exponential backoff (`retry_delay * 2^attempt`).
    pub retry_delay: Duration,
    pub headless: bool,
    /// Fixed proxy used when no rotator is configured.
    pub proxy: Option<String>,
    /// Fixed user agent; `None` keeps the backend default.
    pub user_agent: Option<String>,
    /// How long to wait for a detected challenge to clear.
    pub challenge_timeout: Duration,
    /// Poll interval while waiting for a challenge to clear.
    pub challenge_poll_interval: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            pool_size: 3,
            timeout: Duration::from_secs(30),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            headless: true,
            proxy: None,
            user_agent: None,
            challenge_timeout: Duration::from_secs(60),
            challenge_poll_interval: Duration::from_secs(2),
        }
    }
}

impl FetchConfig {
    /// Sets `max_concurrent` and sizes the pool to match.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self.pool_size = max;
        self
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_delay = delay;
        self
    }

    pub fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_challenge_wait(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.challenge_timeout = timeout;
        self.challenge_poll_interval = poll_interval;
        self
    }

    /// Check the invariants every component relies on.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.max_concurrent == 0 {
            return Err(AppError::Config("max_concurrent must be at least 1".into()));
        }
        if self.pool_size == 0 {
            return Err(AppError::Config("pool_size must be at least 1".into()));
        }
        if self.timeout.is_zero() {
            return Err(AppError::Config("timeout must be greater than zero".into()));
        }
        if self.challenge_poll_interval.is_zero() && !self.challenge_timeout.is_zero() {
            return Err(AppError::Config(
                "challenge_poll_interval must be greater than zero".into(),
            ));
        }
        if let Some(proxy) = &self.proxy
            && url::Url::parse(proxy).is_err()
        {
            return Err(AppError::Config(format!("Invalid proxy URL '{proxy}'")));
        }
        Ok(())
    }

    /// Read configuration from environment variables, falling back to
    /// defaults for anything unset.
    ///
    /// - `TRAWL_MAX_CONCURRENT`, `TRAWL_POOL_SIZE`
    /// - `TRAWL_TIMEOUT_SECS`, `TRAWL_CHALLENGE_TIMEOUT_SECS`
    /// - `TRAWL_RETRY_ATTEMPTS`, `TRAWL_RETRY_DELAY_MS`
    /// - `TRAWL_HEADLESS` (`true`/`false`)
    /// - `TRAWL_PROXY`, `TRAWL_USER_AGENT`
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let mut config = Self::default();

        if let Some(max) = parse_var::<usize>(&lookup, "TRAWL_MAX_CONCURRENT")? {
            config = config.with_max_concurrent(max);
        }
        if let Some(size) = parse_var::<usize>(&lookup, "TRAWL_POOL_SIZE")? {
            config.pool_size = size;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "TRAWL_TIMEOUT_SECS")? {
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(attempts) = parse_var::<u32>(&lookup, "TRAWL_RETRY_ATTEMPTS")? {
            config.retry_attempts = attempts;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "TRAWL_RETRY_DELAY_MS")? {
            config.retry_delay = Duration::from_millis(ms);
        }
        if let Some(headless) = parse_var::<bool>(&lookup, "TRAWL_HEADLESS")? {
            config.headless = headless;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "TRAWL_CHALLENGE_TIMEOUT_SECS")? {
            config.challenge_timeout = Duration::from_secs(secs);
        }
        config.proxy = lookup("TRAWL_PROXY").filter(|p| !p.trim().is_empty());
        config.user_agent = lookup("TRAWL_USER_AGENT").filter(|ua| !ua.trim().is_empty());

        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, AppError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| AppError::Config(format!("Invalid {key} '{raw}'"))),
    }
}
