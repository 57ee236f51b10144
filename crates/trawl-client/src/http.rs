//! Plain-HTTP automation backend.
//!
//! No JavaScript, no rendering: each working context is its own
//! `reqwest::Client`, so cookies and proxy identity never leak between
//! contexts. Good enough for boards that serve their listings as HTML.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use reqwest::{Client, StatusCode};
use trawl_core::{AppError, AutomationBackend, FetchConfig, PageSession};

use crate::guard::check_public_url;

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0 Safari/537.36";

/// Backend whose contexts are independent reqwest clients.
///
/// Private-network protection is **enabled** by default: requests to
/// loopback, private and link-local addresses are refused. Use
/// [`allow_private_urls`](Self::allow_private_urls) when scraping a local
/// fixture server.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    guard_private: bool,
}

impl HttpBackend {
    pub fn new() -> Self {
        Self {
            guard_private: true,
        }
    }

    pub fn allow_private_urls(mut self) -> Self {
        self.guard_private = false;
        self
    }
}

impl Default for HttpBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP has no process to keep alive; the handle only names its slot.
#[derive(Debug)]
pub struct HttpHandle {
    pub index: usize,
}

impl AutomationBackend for HttpBackend {
    type Handle = HttpHandle;
    type Context = HttpSession;

    async fn launch(&self, _config: &FetchConfig, index: usize) -> Result<HttpHandle, AppError> {
        tracing::debug!(index, "HTTP handle ready");
        Ok(HttpHandle { index })
    }

    async fn new_context(
        &self,
        _handle: &HttpHandle,
        config: &FetchConfig,
        proxy: Option<&str>,
    ) -> Result<HttpSession, AppError> {
        let user_agent = config.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT);
        let mut builder = Client::builder()
            .cookie_store(true)
            .user_agent(user_agent)
            .timeout(config.timeout);
        if let Some(proxy) = proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| AppError::Config(format!("Invalid proxy '{proxy}': {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(HttpSession {
            client,
            timeout: config.timeout,
            guard_private: self.guard_private,
            last_url: Arc::new(Mutex::new(None)),
        })
    }

    async fn close_context(&self, _context: HttpSession) -> Result<(), AppError> {
        Ok(())
    }

    async fn shutdown(&self, handle: &HttpHandle) -> Result<(), AppError> {
        tracing::debug!(index = handle.index, "HTTP handle released");
        Ok(())
    }
}

/// One isolated HTTP context: cookie jar, proxy and last visited URL.
#[derive(Debug, Clone)]
pub struct HttpSession {
    client: Client,
    timeout: Duration,
    guard_private: bool,
    last_url: Arc<Mutex<Option<String>>>,
}

impl HttpSession {
    fn remember(&self, url: &str) {
        let mut last = self.last_url.lock().unwrap_or_else(PoisonError::into_inner);
        *last = Some(url.to_string());
    }

    fn last(&self) -> Option<String> {
        self.last_url
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn get(&self, url: &str) -> Result<String, AppError> {
        if self.guard_private {
            check_public_url(url).await?;
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| map_send_error(&e, self.timeout))?;

        check_status(response.status(), url)?;

        response
            .text()
            .await
            .map_err(|e| AppError::Fetch(format!("Failed to read response body from {url}: {e}")))
    }
}

impl PageSession for HttpSession {
    async fn goto(&self, url: &str) -> Result<String, AppError> {
        self.remember(url);
        self.get(url).await
    }

    async fn refresh(&self) -> Result<String, AppError> {
        let url = self
            .last()
            .ok_or_else(|| AppError::InvalidState("refresh before any page was loaded".into()))?;
        self.get(&url).await
    }
}

fn map_send_error(e: &reqwest::Error, timeout: Duration) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(timeout.as_secs())
    } else if e.is_connect() {
        AppError::Network(format!("Connection failed: {e}"))
    } else {
        AppError::Fetch(e.to_string())
    }
}

/// Translate an HTTP status into the error taxonomy.
fn check_status(status: StatusCode, url: &str) -> Result<(), AppError> {
    if status.is_success() {
        return Ok(());
    }
    let code = status.as_u16();
    Err(match status {
        StatusCode::UNAUTHORIZED => AppError::Authentication(format!("HTTP 401 for {url}")),
        StatusCode::FORBIDDEN => AppError::Challenge(format!("HTTP 403 for {url}")),
        StatusCode::TOO_MANY_REQUESTS => AppError::RateLimitExceeded(format!("HTTP 429 for {url}")),
        _ => AppError::Fetch(format!("HTTP {code} for {url}")),
    })
}
