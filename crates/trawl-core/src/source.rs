//! Per-source scraper: rate limiter + resource pool + retrying fetcher.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};

use crate::challenge::ChallengeDetector;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use crate::config::FetchConfig;
use crate::error::AppError;
use crate::models::{Filters, JobQuery, JobRecord, ListingPage};
use crate::pool::{AutomationBackend, PoolStats, ResourcePool};
use crate::rate_limit::{Limiter, RateLimiter, RateLimiterStats};
use crate::retry::{RetryPolicy, TaskResult, run_with_retry};
use crate::traits::{JobSource, PageSession, SourceScraper};

/// Scrapes one [`JobSource`] through a pooled backend.
///
/// Listing pages are walked sequentially (each may carry the cursor for
/// the next); detail pages are fetched concurrently, at most
/// `max_concurrent` at a time, in discovery order.
pub struct PooledSourceScraper<B: AutomationBackend, S: JobSource> {
    source: S,
    pool: ResourcePool<B>,
    limiter: Limiter,
    breaker: CircuitBreaker,
    detector: ChallengeDetector,
    config: Arc<FetchConfig>,
    retry: RetryPolicy,
}

impl<B: AutomationBackend, S: JobSource> PooledSourceScraper<B, S> {
    /// Fails with `Config` if `config` does not validate.
    pub fn new(
        source: S,
        pool: ResourcePool<B>,
        limiter: Limiter,
        config: Arc<FetchConfig>,
    ) -> Result<Self, AppError> {
        config.validate()?;
        let breaker = CircuitBreaker::new(source.name(), CircuitBreakerConfig::default());
        Ok(Self {
            retry: RetryPolicy::from_config(&config),
            source,
            pool,
            limiter,
            breaker,
            detector: ChallengeDetector::default(),
            config,
        })
    }

    pub fn with_detector(mut self, detector: ChallengeDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = CircuitBreaker::new(self.source.name(), config);
        self
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn limiter_stats(&self) -> RateLimiterStats {
        self.limiter.stats()
    }

    pub fn breaker_stats(&self) -> CircuitBreakerStats {
        self.breaker.stats()
    }

    /// One paced, pooled page load with challenge handling.
    ///
    /// Reports the outcome to the limiter and the circuit breaker.
    async fn load(&self, url: &str) -> Result<String, AppError> {
        self.limiter.acquire(1).await;

        let timeout = self.config.timeout;
        let result = self
            .pool
            .with_context(|session| async move {
                let html = tokio::time::timeout(timeout, session.goto(url))
                    .await
                    .map_err(|_| AppError::Timeout(timeout.as_secs()))??;
                self.detector
                    .wait_for_clearance(
                        &session,
                        html,
                        self.config.challenge_timeout,
                        self.config.challenge_poll_interval,
                    )
                    .await
            })
            .await;

        match &result {
            Ok(_) => {
                self.limiter.report_success();
                self.breaker.record_success();
            }
            Err(e) => {
                if e.should_throttle() {
                    self.limiter.report_failure();
                }
                self.breaker.record_failure(e);
            }
        }
        result
    }

    async fn fetch_listing(&self, url: &str) -> TaskResult<ListingPage> {
        run_with_retry(&self.retry, url, |_| async {
            let html = self.load(url).await?;
            self.source.parse_listing(&html, url)
        })
        .await
    }

    async fn fetch_detail(&self, url: String) -> TaskResult<JobRecord> {
        // An open circuit fails fast instead of spending the retry budget.
        if let Err(e) = self.breaker.check() {
            return TaskResult::failure(&e, 0);
        }
        run_with_retry(&self.retry, &url, |_| async {
            let html = self.load(&url).await?;
            self.source.parse_detail(&html, &url)
        })
        .await
    }

    /// Walk listing pages until `limit` URLs are known, the source runs
    /// out of pages, or a later page fails.
    ///
    /// Cursor sources stop when a page has no next cursor; numbered sources
    /// stop at the first page that adds no new URLs.
    async fn collect_urls(&self, query: &JobQuery, filters: &Filters) -> Result<Vec<String>, AppError> {
        let mut seen = HashSet::new();
        let mut urls = Vec::new();
        let mut cursor: Option<String> = None;

        for page in 0..self.source.max_pages() {
            if urls.len() >= query.limit {
                break;
            }
            let page_url = self
                .source
                .listing_url(query, filters, page, cursor.as_deref())?;

            let listing = match self.fetch_listing(&page_url).await {
                TaskResult::Success(listing) => listing,
                failure if page == 0 || failure.is_fatal() => {
                    return failure.into_result().map(|_| Vec::new());
                }
                TaskResult::Failure { message, .. } => {
                    tracing::warn!(
                        source = %self.source.name(),
                        page,
                        error = %message,
                        "Listing page failed, keeping earlier pages"
                    );
                    break;
                }
            };

            let before = urls.len();
            for url in listing.job_urls {
                if seen.insert(url.clone()) {
                    urls.push(url);
                }
            }
            tracing::debug!(
                source = %self.source.name(),
                page,
                new_urls = urls.len() - before,
                "Listing page parsed"
            );

            if urls.len() == before {
                break;
            }
            match listing.next_cursor {
                Some(next) => cursor = Some(next),
                None if self.source.follows_cursor() => break,
                None => cursor = None,
            }
        }

        urls.truncate(query.limit);
        Ok(urls)
    }

    pub async fn run(&self, query: &JobQuery, filters: &Filters) -> Result<Vec<JobRecord>, AppError> {
        let name = self.source.name();
        self.pool.initialize().await?;

        let urls = self.collect_urls(query, filters).await?;
        tracing::info!(source = %name, candidates = urls.len(), "Fetching job details");

        let results: Vec<TaskResult<JobRecord>> = stream::iter(urls)
            .map(|url| self.fetch_detail(url))
            .buffered(self.config.max_concurrent)
            .collect()
            .await;

        let total = results.len();
        let mut records = Vec::with_capacity(total);
        let mut first_failure = None;
        for result in results {
            match result {
                TaskResult::Success(record) => records.push(record),
                failure if failure.is_fatal() => return failure.into_result().map(|_| Vec::new()),
                failure => {
                    first_failure.get_or_insert(failure);
                }
            }
        }

        let failed = total - records.len();
        if records.is_empty()
            && let Some(failure) = first_failure
        {
            tracing::warn!(source = %name, failed, "Every detail fetch failed");
            return failure.into_result().map(|_| Vec::new());
        }

        tracing::info!(source = %name, records = records.len(), failed, "Source finished");
        Ok(records)
    }
}

impl<B: AutomationBackend, S: JobSource> SourceScraper for PooledSourceScraper<B, S> {
    fn name(&self) -> &str {
        self.source.name()
    }

    fn scrape<'a>(
        &'a self,
        query: &'a JobQuery,
        filters: &'a Filters,
    ) -> BoxFuture<'a, Result<Vec<JobRecord>, AppError>> {
        Box::pin(self.run(query, filters))
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Err(e) = self.pool.close().await {
                tracing::warn!(source = %self.source.name(), error = %e, "Error closing pool");
            }
        })
    }
}
