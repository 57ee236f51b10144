pub mod challenge;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod pool;
pub mod proxy;
pub mod rate_limit;
pub mod retry;
pub mod scheduler;
pub mod source;
pub mod traits;
pub mod util;

#[cfg(test)]
mod testutil;

pub use config::FetchConfig;
pub use error::{AppError, FailureKind};
pub use models::{Filters, JobQuery, JobRecord, ListingPage, SalaryRange, compute_hash};
pub use orchestrator::{ConcurrentJobScraper, ScrapeOutcome, ScrapeStats};
pub use pool::{AutomationBackend, ResourcePool};
pub use rate_limit::{Limiter, RateLimitConfig, RateLimiter};
pub use retry::{RetryPolicy, TaskResult};
pub use scheduler::{ScrapeRequest, ScrapeScheduler, SchedulerHandle};
pub use source::PooledSourceScraper;
pub use traits::{JobSource, PageSession, SourceScraper};
