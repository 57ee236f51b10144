use std::future::Future;
use std::time::Duration;

use crate::config::FetchConfig;
use crate::error::{AppError, FailureKind};

/// Exponential backoff: `base_delay * 2^attempt` between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts,
            base_delay,
        }
    }

    pub fn from_config(config: &FetchConfig) -> Self {
        Self::new(config.retry_attempts, config.retry_delay)
    }

    /// Delay before retry number `attempt + 1` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Outcome of one submitted task. Failures are values, never raised.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult<T> {
    Success(T),
    Failure {
        kind: FailureKind,
        message: String,
        attempts: u32,
    },
}

impl<T> TaskResult<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskResult::Success(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            TaskResult::Success(value) => Some(value),
            TaskResult::Failure { .. } => None,
        }
    }

    /// Failure carrying `error`'s kind and its message without the
    /// `Display` prefix.
    pub fn failure(error: &AppError, attempts: u32) -> Self {
        TaskResult::Failure {
            kind: error.kind(),
            message: error.detail(),
            attempts,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, TaskResult::Failure { kind, .. } if kind.is_fatal())
    }

    /// Convert back into an error for callers that must propagate.
    pub fn into_result(self) -> Result<T, AppError> {
        match self {
            TaskResult::Success(value) => Ok(value),
            TaskResult::Failure { kind, message, .. } => Err(match kind {
                FailureKind::RateLimit => AppError::RateLimitExceeded(message),
                FailureKind::Authentication => AppError::Authentication(message),
                FailureKind::Parsing => AppError::Parsing(message),
                FailureKind::ResourceExhausted => AppError::ResourceExhausted(message),
                FailureKind::Challenge => AppError::Challenge(message),
                FailureKind::Timeout => AppError::Timeout(message.parse().unwrap_or_default()),
                FailureKind::Cancelled => AppError::Cancelled,
                FailureKind::Blocked => AppError::Blocked(message),
                FailureKind::Config => AppError::Config(message),
                FailureKind::Internal => AppError::InvalidState(message),
                FailureKind::Fetch => AppError::Fetch(message),
            }),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// retry budget is spent. `op` receives the 0-based attempt number.
///
/// Every error is retried except the fatal ones (see
/// [`AppError::is_fatal`]) and local policy refusals.
pub async fn run_with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> TaskResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return TaskResult::Success(value),
            Err(e) if e.is_retryable() && attempt < policy.attempts => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::debug!(
                    task = %label,
                    attempt = attempt + 1,
                    delay_ms = %delay.as_millis(),
                    error = %e,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::warn!(
                    task = %label,
                    attempts = attempt + 1,
                    error = %e,
                    "Task failed"
                );
                return TaskResult::failure(&e, attempt + 1);
            }
        }
    }
}
