//! Test utilities: mock backend, session and source.
//!
//! Handwritten mocks for dependency injection in unit tests. Shared state
//! lives behind `Arc`, so a test keeps a clone of the mock for assertions
//! while the pool or scraper owns another.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::FetchConfig;
use crate::error::AppError;
use crate::models::{Filters, JobQuery, JobRecord, ListingPage};
use crate::pool::AutomationBackend;
use crate::traits::{JobSource, PageSession};

// ---------------------------------------------------------------------------
// MockSite
// ---------------------------------------------------------------------------

/// Scripted web content shared by every session of a mock backend.
///
/// Lookup order for a URL: scripted responses (consumed one per visit),
/// then the unrouted queue, then fixed pages, then the default page.
#[derive(Default)]
pub struct MockSite {
    scripted: Mutex<HashMap<String, VecDeque<Result<String, AppError>>>>,
    queue: Mutex<VecDeque<Result<String, AppError>>>,
    fixed: Mutex<HashMap<String, String>>,
    default_page: Mutex<Option<String>>,
    delay: Mutex<Duration>,
    visits: Mutex<Vec<String>>,
    refreshes: AtomicUsize,
}

impl MockSite {
    /// Serve `html` for every visit of `url`.
    pub fn page(self, url: &str, html: impl Into<String>) -> Self {
        self.fixed.lock().unwrap().insert(url.to_string(), html.into());
        self
    }

    /// Serve `responses` in order for successive visits of `url`.
    pub fn script(self, url: &str, responses: Vec<Result<String, AppError>>) -> Self {
        self.scripted
            .lock()
            .unwrap()
            .insert(url.to_string(), responses.into());
        self
    }

    pub fn queue(self, responses: Vec<Result<String, AppError>>) -> Self {
        *self.queue.lock().unwrap() = responses.into();
        self
    }

    pub fn with_default(self, html: impl Into<String>) -> Self {
        *self.default_page.lock().unwrap() = Some(html.into());
        self
    }

    /// Simulated latency of each page load.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock().unwrap() = delay;
        self
    }

    pub fn visits(&self) -> Vec<String> {
        self.visits.lock().unwrap().clone()
    }

    pub fn visit_count(&self, url: &str) -> usize {
        self.visits.lock().unwrap().iter().filter(|v| *v == url).count()
    }

    fn serve(&self, url: &str) -> Result<String, AppError> {
        if let Some(responses) = self.scripted.lock().unwrap().get_mut(url)
            && let Some(response) = responses.pop_front()
        {
            return response;
        }
        if let Some(response) = self.queue.lock().unwrap().pop_front() {
            return response;
        }
        if let Some(html) = self.fixed.lock().unwrap().get(url) {
            return Ok(html.clone());
        }
        self.default_page
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| AppError::Fetch(format!("HTTP 404 for {url}")))
    }

    async fn load(&self, url: &str) -> Result<String, AppError> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.visits.lock().unwrap().push(url.to_string());
        self.serve(url)
    }
}

// ---------------------------------------------------------------------------
// MockSession
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MockSession {
    site: Arc<MockSite>,
    current: Arc<Mutex<Option<String>>>,
}

impl MockSession {
    /// A session whose loads and refreshes pop from `responses`.
    pub fn new(responses: Vec<Result<String, AppError>>) -> Self {
        Self::on_site(Arc::new(MockSite::default().queue(responses)))
    }

    pub fn on_site(site: Arc<MockSite>) -> Self {
        Self {
            site,
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// Fallback content once the scripted responses run out.
    pub fn with_default(self, html: &str) -> Self {
        *self.site.default_page.lock().unwrap() = Some(html.to_string());
        self
    }

    pub fn refresh_count(&self) -> usize {
        self.site.refreshes.load(Ordering::SeqCst)
    }
}

impl PageSession for MockSession {
    async fn goto(&self, url: &str) -> Result<String, AppError> {
        *self.current.lock().unwrap() = Some(url.to_string());
        self.site.load(url).await
    }

    async fn refresh(&self) -> Result<String, AppError> {
        self.site.refreshes.fetch_add(1, Ordering::SeqCst);
        let url = self.current.lock().unwrap().clone().unwrap_or_default();
        self.site.load(&url).await
    }
}

// ---------------------------------------------------------------------------
// MockBackend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BackendCounters {
    launches: AtomicUsize,
    shutdowns: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    contexts_closed: AtomicUsize,
    proxies: Mutex<Vec<Option<String>>>,
}

/// Backend whose handles are plain indices and whose contexts are
/// [`MockSession`]s over a shared [`MockSite`].
#[derive(Clone, Default)]
pub struct MockBackend {
    site: Arc<MockSite>,
    counters: Arc<BackendCounters>,
    fail_launch_at: Option<usize>,
}

impl MockBackend {
    pub fn new(site: MockSite) -> Self {
        Self {
            site: Arc::new(site),
            ..Self::default()
        }
    }

    /// Make the launch of handle `index` fail.
    pub fn fail_launch_at(mut self, index: usize) -> Self {
        self.fail_launch_at = Some(index);
        self
    }

    pub fn site(&self) -> &MockSite {
        &self.site
    }

    pub fn launches(&self) -> usize {
        self.counters.launches.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.counters.shutdowns.load(Ordering::SeqCst)
    }

    pub fn peak_active(&self) -> usize {
        self.counters.peak_active.load(Ordering::SeqCst)
    }

    pub fn contexts_closed(&self) -> usize {
        self.counters.contexts_closed.load(Ordering::SeqCst)
    }

    pub fn proxies_seen(&self) -> Vec<Option<String>> {
        self.counters.proxies.lock().unwrap().clone()
    }
}

impl AutomationBackend for MockBackend {
    type Handle = usize;
    type Context = MockSession;

    async fn launch(&self, _config: &FetchConfig, index: usize) -> Result<usize, AppError> {
        if self.fail_launch_at == Some(index) {
            return Err(AppError::Fetch(format!("handle {index} failed to launch")));
        }
        self.counters.launches.fetch_add(1, Ordering::SeqCst);
        Ok(index)
    }

    async fn new_context(
        &self,
        _handle: &usize,
        _config: &FetchConfig,
        proxy: Option<&str>,
    ) -> Result<MockSession, AppError> {
        let now = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak_active.fetch_max(now, Ordering::SeqCst);
        self.counters
            .proxies
            .lock()
            .unwrap()
            .push(proxy.map(str::to_string));
        Ok(MockSession::on_site(Arc::clone(&self.site)))
    }

    async fn close_context(&self, _context: MockSession) -> Result<(), AppError> {
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
        self.counters.contexts_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self, _handle: &usize) -> Result<(), AppError> {
        self.counters.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockSource
// ---------------------------------------------------------------------------

/// Line-oriented fake job board.
///
/// Listing pages hold `link:<url>` lines and an optional `next:<cursor>`;
/// detail pages hold `title:` and `company:` lines.
pub struct MockSource {
    name: String,
    max_pages: usize,
    numbered_pages: bool,
}

impl MockSource {
    pub const BASE: &'static str = "https://mock.example";

    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            max_pages: 10,
            numbered_pages: false,
        }
    }

    /// Walk pages by number instead of following `next:` cursors.
    pub fn with_numbered_pages(mut self) -> Self {
        self.numbered_pages = true;
        self
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn listing_page_url(query: &str, page: usize) -> String {
        format!("{}/search?q={query}&page={page}", Self::BASE)
    }

    pub fn detail_url(id: usize) -> String {
        format!("{}/jobs/{id}", Self::BASE)
    }

    pub fn listing_html(urls: &[String], next: Option<&str>) -> String {
        let mut html: Vec<String> = urls.iter().map(|u| format!("link:{u}")).collect();
        if let Some(next) = next {
            html.push(format!("next:{next}"));
        }
        html.join("\n")
    }

    pub fn detail_html(title: &str, company: &str) -> String {
        format!("title:{title}\ncompany:{company}")
    }
}

fn field<'a>(html: &'a str, key: &str) -> Option<&'a str> {
    html.lines()
        .find_map(|line| line.strip_prefix(key))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

impl JobSource for MockSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn listing_url(
        &self,
        query: &JobQuery,
        _filters: &Filters,
        page: usize,
        _cursor: Option<&str>,
    ) -> Result<String, AppError> {
        Ok(Self::listing_page_url(&query.query, page))
    }

    fn parse_listing(&self, html: &str, _page_url: &str) -> Result<ListingPage, AppError> {
        Ok(ListingPage {
            job_urls: html
                .lines()
                .filter_map(|l| l.strip_prefix("link:"))
                .map(str::to_string)
                .collect(),
            next_cursor: field(html, "next:").map(str::to_string),
        })
    }

    fn parse_detail(&self, html: &str, url: &str) -> Result<JobRecord, AppError> {
        let title = field(html, "title:").ok_or_else(|| AppError::Parsing(format!("no title on {url}")))?;
        let company =
            field(html, "company:").ok_or_else(|| AppError::Parsing(format!("no company on {url}")))?;
        Ok(JobRecord::new(url.rsplit('/').next().unwrap_or(url), title, company, url))
    }

    fn max_pages(&self) -> usize {
        self.max_pages
    }

    fn follows_cursor(&self) -> bool {
        !self.numbered_pages
    }
}

/// Build a minimal job record for tests.
pub fn make_test_job(id: usize, title: &str, company: &str) -> JobRecord {
    JobRecord::new(id.to_string(), title, company, MockSource::detail_url(id))
}
