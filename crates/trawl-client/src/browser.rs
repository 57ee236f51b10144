//! Headless Chromium backend over the Chrome DevTools Protocol.
//!
//! Each pool handle is one Chromium process. Working contexts are CDP
//! browser contexts (incognito-like: separate cookies, storage and proxy)
//! holding a single page, so two tasks sharing a process never see each
//! other's session.

use std::path::PathBuf;
use std::sync::Arc;

use chromiumoxide::cdp::browser_protocol::browser::CloseParams;
use chromiumoxide::cdp::browser_protocol::emulation::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::target::{
    BrowserContextId, CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tokio::task::JoinHandle;
use trawl_core::{AppError, AutomationBackend, FetchConfig, PageSession};

#[derive(Debug, Clone, Default)]
pub struct BrowserBackend {
    executable: Option<PathBuf>,
}

impl BrowserBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use this Chrome/Chromium binary instead of searching for one.
    pub fn with_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }
}

pub struct BrowserHandle {
    index: usize,
    browser: Arc<Browser>,
    handler: JoinHandle<()>,
    profile_dir: PathBuf,
}

impl AutomationBackend for BrowserBackend {
    type Handle = BrowserHandle;
    type Context = BrowserSession;

    async fn launch(&self, config: &FetchConfig, index: usize) -> Result<BrowserHandle, AppError> {
        // Concurrent Chromium processes must not share a profile directory.
        let profile_dir =
            std::env::temp_dir().join(format!("trawl-chromium-{}-{index}", std::process::id()));

        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .disable_default_args()
            .user_data_dir(&profile_dir)
            .request_timeout(config.timeout)
            .args(launch_args(config.headless));
        if !config.headless {
            builder = builder.with_head();
        }
        if let Some(bin) = self.executable.clone().or_else(find_chrome_binary) {
            tracing::info!(index, binary = %bin.display(), "Using Chrome binary");
            builder = builder.chrome_executable(bin);
        }
        let browser_config = builder
            .build()
            .map_err(|e| AppError::Config(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| AppError::ResourceExhausted(format!("Failed to launch browser: {e}")))?;

        // The CDP connection only makes progress while its handler is polled.
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::warn!(index, error = %e, "Browser CDP handler error");
                    break;
                }
            }
        });

        tracing::info!(index, headless = config.headless, "Browser launched");
        Ok(BrowserHandle {
            index,
            browser: Arc::new(browser),
            handler,
            profile_dir,
        })
    }

    async fn new_context(
        &self,
        handle: &BrowserHandle,
        config: &FetchConfig,
        proxy: Option<&str>,
    ) -> Result<BrowserSession, AppError> {
        let params = CreateBrowserContextParams {
            dispose_on_detach: Some(true),
            proxy_server: proxy.map(str::to_string),
            ..Default::default()
        };

        let context_id = handle
            .browser
            .execute(params)
            .await
            .map_err(|e| AppError::ResourceExhausted(format!("Failed to create browser context: {e}")))?
            .result
            .browser_context_id;

        let target = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(context_id.clone())
            .build()
            .map_err(|e| AppError::Config(format!("Invalid target params: {e}")))?;

        let page = match handle.browser.new_page(target).await {
            Ok(page) => page,
            Err(e) => {
                dispose(&handle.browser, context_id).await;
                return Err(AppError::ResourceExhausted(format!("Failed to open page: {e}")));
            }
        };

        if let Some(user_agent) = &config.user_agent
            && let Err(e) = page
                .set_user_agent(SetUserAgentOverrideParams::new(user_agent.clone()))
                .await
        {
            tracing::warn!(index = handle.index, error = %e, "Could not override user agent");
        }

        Ok(BrowserSession {
            page,
            context_id,
            browser: Arc::clone(&handle.browser),
        })
    }

    async fn close_context(&self, context: BrowserSession) -> Result<(), AppError> {
        let BrowserSession {
            page,
            context_id,
            browser,
        } = context;
        if let Err(e) = page.close().await {
            tracing::debug!(error = %e, "Page already gone");
        }
        dispose(&browser, context_id).await;
        Ok(())
    }

    async fn shutdown(&self, handle: &BrowserHandle) -> Result<(), AppError> {
        if let Err(e) = handle.browser.execute(CloseParams::default()).await {
            tracing::warn!(index = handle.index, error = %e, "Browser did not close cleanly");
        }
        handle.handler.abort();
        if let Err(e) = tokio::fs::remove_dir_all(&handle.profile_dir).await {
            tracing::debug!(index = handle.index, error = %e, "Profile directory not removed");
        }
        tracing::info!(index = handle.index, "Browser closed");
        Ok(())
    }
}

async fn dispose(browser: &Browser, context_id: BrowserContextId) {
    if let Err(e) = browser
        .execute(DisposeBrowserContextParams::new(context_id))
        .await
    {
        tracing::debug!(error = %e, "Browser context already disposed");
    }
}

/// One browser context with its single page.
#[derive(Clone)]
pub struct BrowserSession {
    page: Page,
    context_id: BrowserContextId,
    browser: Arc<Browser>,
}

impl PageSession for BrowserSession {
    async fn goto(&self, url: &str) -> Result<String, AppError> {
        self.page
            .goto(url)
            .await
            .map_err(|e| AppError::Fetch(format!("Failed to navigate to {url}: {e}")))?;
        self.page
            .content()
            .await
            .map_err(|e| AppError::Fetch(format!("Failed to read page content from {url}: {e}")))
    }

    async fn refresh(&self) -> Result<String, AppError> {
        self.page
            .reload()
            .await
            .map_err(|e| AppError::Fetch(format!("Failed to reload page: {e}")))?;
        self.page
            .content()
            .await
            .map_err(|e| AppError::Fetch(format!("Failed to read page content: {e}")))
    }
}

fn launch_args(headless: bool) -> Vec<&'static str> {
    let mut args = vec![
        "--disable-gpu",
        "--disable-dev-shm-usage",
        "--disable-extensions",
        "--disable-popup-blocking",
        "--disable-translate",
        "--disable-blink-features=AutomationControlled",
        "--no-first-run",
    ];
    if headless {
        args.insert(0, "--headless=new");
    }
    args
}

/// Locate a real Chrome/Chromium binary.
///
/// `CHROME_BIN` wins when it points at an existing file. The snap wrapper
/// at `/snap/bin/chromium` drops unknown flags, so the binary inside the
/// snap is preferred over it. `None` leaves the lookup to chromiumoxide.
fn find_chrome_binary() -> Option<PathBuf> {
    if let Ok(bin) = std::env::var("CHROME_BIN") {
        let path = PathBuf::from(bin);
        if path.exists() {
            return Some(path);
        }
    }

    [
        "/snap/chromium/current/usr/lib/chromium-browser/chrome",
        "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
    ]
    .iter()
    .map(PathBuf::from)
    .find(|p| p.exists())
}
