use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Application-wide error types for Trawl.
#[derive(Error, Debug)]
pub enum AppError {
    /// A rate limiter or the remote service refused to grant capacity.
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Source login or session establishment failed.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Fetched content could not be converted into a job record.
    #[error("Parsing error: {0}")]
    Parsing(String),

    /// The resource pool or proxy set has no capacity left.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// An anti-automation challenge was detected and did not clear.
    #[error("Challenge detected: {0}")]
    Challenge(String),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Network/connection error.
    #[error("Network error: {0}")]
    Network(String),

    /// Catch-all fetch failure.
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// A local policy refused the request before it was sent.
    #[error("Blocked: {0}")]
    Blocked(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The resource pool was used before `initialize()`.
    #[error("Resource pool has not been initialized")]
    PoolNotInitialized,

    /// An operation was attempted in a state that does not allow it.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The run was cancelled.
    #[error("Cancelled")]
    Cancelled,

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Returns true if another attempt at the same task is allowed.
    ///
    /// Every per-task failure is retried; only errors that end the run and
    /// local policy refusals are not.
    pub fn is_retryable(&self) -> bool {
        !self.is_fatal() && !matches!(self, AppError::Blocked(_))
    }

    /// Returns true if this error signals pushback from the remote service,
    /// so pacing toward it should slow down.
    pub fn should_throttle(&self) -> bool {
        matches!(
            self,
            AppError::RateLimitExceeded(_)
                | AppError::Challenge(_)
                | AppError::Timeout(_)
                | AppError::Network(_)
                | AppError::Fetch(_)
        )
    }

    /// Returns true for errors that must terminate the run instead of being
    /// recorded as a per-task or per-source failure.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AppError::Config(_)
                | AppError::PoolNotInitialized
                | AppError::InvalidState(_)
                | AppError::Cancelled
        )
    }

    /// The error's message without the variant prefix added by `Display`.
    pub fn detail(&self) -> String {
        match self {
            AppError::RateLimitExceeded(msg)
            | AppError::Authentication(msg)
            | AppError::Parsing(msg)
            | AppError::ResourceExhausted(msg)
            | AppError::Challenge(msg)
            | AppError::Network(msg)
            | AppError::Fetch(msg)
            | AppError::Blocked(msg)
            | AppError::Config(msg)
            | AppError::InvalidState(msg) => msg.clone(),
            AppError::Timeout(secs) => secs.to_string(),
            AppError::Serialization(e) => e.to_string(),
            AppError::PoolNotInitialized | AppError::Cancelled => self.to_string(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            AppError::RateLimitExceeded(_) => FailureKind::RateLimit,
            AppError::Authentication(_) => FailureKind::Authentication,
            AppError::Parsing(_) | AppError::Serialization(_) => FailureKind::Parsing,
            AppError::ResourceExhausted(_) => FailureKind::ResourceExhausted,
            AppError::Challenge(_) => FailureKind::Challenge,
            AppError::Timeout(_) => FailureKind::Timeout,
            AppError::Cancelled => FailureKind::Cancelled,
            AppError::Blocked(_) => FailureKind::Blocked,
            AppError::Config(_) => FailureKind::Config,
            AppError::PoolNotInitialized | AppError::InvalidState(_) => FailureKind::Internal,
            AppError::Network(_) | AppError::Fetch(_) => FailureKind::Fetch,
        }
    }
}

/// Coarse failure category carried by a failed task result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RateLimit,
    Authentication,
    Parsing,
    ResourceExhausted,
    Challenge,
    Timeout,
    Cancelled,
    Blocked,
    Config,
    Internal,
    Fetch,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::RateLimit => "rate_limit",
            FailureKind::Authentication => "authentication",
            FailureKind::Parsing => "parsing",
            FailureKind::ResourceExhausted => "resource_exhausted",
            FailureKind::Challenge => "challenge",
            FailureKind::Timeout => "timeout",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Blocked => "blocked",
            FailureKind::Config => "config",
            FailureKind::Internal => "internal",
            FailureKind::Fetch => "fetch",
        }
    }

    /// Failures that end the whole source run instead of one task.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FailureKind::Config | FailureKind::Internal | FailureKind::Cancelled
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
