use std::future::Future;

use futures::future::BoxFuture;

use crate::error::AppError;
use crate::models::{Filters, JobQuery, JobRecord, ListingPage};

/// One isolated working context handed out by the resource pool.
///
/// Clones refer to the same underlying context (cookies, page, proxy).
pub trait PageSession: Clone + Send + Sync + 'static {
    /// Navigate to `url` and return the loaded page content.
    fn goto(&self, url: &str) -> impl Future<Output = Result<String, AppError>> + Send;

    /// Reload the current page and return its content.
    fn refresh(&self) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// Site-specific page parsing for one job board.
///
/// Implementations are pure: they build URLs and parse HTML, and never
/// perform I/O themselves.
pub trait JobSource: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// URL of listing page `page` (0-based). `cursor` is the value returned
    /// by the previous page's [`ListingPage::next_cursor`].
    fn listing_url(
        &self,
        query: &JobQuery,
        filters: &Filters,
        page: usize,
        cursor: Option<&str>,
    ) -> Result<String, AppError>;

    fn parse_listing(&self, html: &str, page_url: &str) -> Result<ListingPage, AppError>;

    fn parse_detail(&self, html: &str, url: &str) -> Result<JobRecord, AppError>;

    /// Upper bound on listing pages walked per scrape.
    fn max_pages(&self) -> usize {
        10
    }

    /// Whether later listing pages are reached through
    /// [`ListingPage::next_cursor`]. When false, pages are numbered and
    /// walked until one adds no new URLs or `max_pages` is reached.
    fn follows_cursor(&self) -> bool {
        true
    }
}

/// A complete scraper for one source, as seen by the orchestrator.
///
/// Object-safe so heterogeneous sources can be registered side by side.
pub trait SourceScraper: Send + Sync {
    fn name(&self) -> &str;

    fn scrape<'a>(
        &'a self,
        query: &'a JobQuery,
        filters: &'a Filters,
    ) -> BoxFuture<'a, Result<Vec<JobRecord>, AppError>>;

    /// Release pooled resources. Idempotent.
    fn close(&self) -> BoxFuture<'_, ()>;
}
