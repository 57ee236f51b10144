use std::sync::Arc;
use std::time::Duration;

use trawl_core::scheduler::SchedulerConfig;
use trawl_core::{AppError, ConcurrentJobScraper, JobQuery, ScrapeRequest, ScrapeScheduler};

use crate::integration::common::{StubScraper, eventually, jobs, shared};

#[tokio::test]
async fn submitted_request_gets_outcome() {
    let source = shared(StubScraper::returning("board", jobs("board", 3)));
    let orchestrator = Arc::new(ConcurrentJobScraper::new().with_source(source).unwrap());
    let handle = ScrapeScheduler::new(orchestrator, SchedulerConfig::default()).start();

    let reply = handle
        .submit(ScrapeRequest::new(JobQuery::new("rust")))
        .await
        .unwrap();
    let outcome = reply.await.unwrap().unwrap();
    assert_eq!(outcome.all.len(), 3);

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn requests_run_one_at_a_time() {
    let source = shared(
        StubScraper::returning("board", jobs("board", 1)).with_delay(Duration::from_millis(20)),
    );
    let orchestrator = Arc::new(ConcurrentJobScraper::new().with_source(source.clone()).unwrap());
    let handle = ScrapeScheduler::new(orchestrator, SchedulerConfig::default()).start();

    let first = handle
        .submit(ScrapeRequest::new(JobQuery::new("rust")))
        .await
        .unwrap();
    let second = handle
        .submit(ScrapeRequest::new(JobQuery::new("go")))
        .await
        .unwrap();

    // Both succeed; a concurrent run would have been rejected by the orchestrator.
    assert!(first.await.unwrap().is_ok());
    assert!(second.await.unwrap().is_ok());
    assert_eq!(source.calls(), 2);

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn invalid_request_reports_error() {
    let source = shared(StubScraper::returning("board", Vec::new()));
    let orchestrator = Arc::new(ConcurrentJobScraper::new().with_source(source).unwrap());
    let handle = ScrapeScheduler::new(orchestrator, SchedulerConfig::default()).start();

    let reply = handle
        .submit(ScrapeRequest::new(JobQuery::new("rust").with_limit(0)))
        .await
        .unwrap();
    assert!(matches!(reply.await.unwrap(), Err(AppError::Config(_))));

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn stop_cancels_in_flight_and_rejects_queued() {
    let source = shared(StubScraper::hanging("board"));
    let orchestrator = Arc::new(ConcurrentJobScraper::new().with_source(source.clone()).unwrap());
    let handle = ScrapeScheduler::new(orchestrator, SchedulerConfig::default()).start();

    let in_flight = handle
        .submit(ScrapeRequest::new(JobQuery::new("rust")))
        .await
        .unwrap();
    eventually(|| source.calls() == 1).await;
    let queued = handle
        .submit(ScrapeRequest::new(JobQuery::new("go")))
        .await
        .unwrap();

    handle.stop().await.unwrap();

    let outcome = in_flight.await.unwrap().unwrap();
    assert!(outcome.cancelled);
    assert_eq!(outcome.errors["board"], "cancelled");
    assert!(matches!(queued.await.unwrap(), Err(AppError::Cancelled)));
    assert_eq!(source.calls(), 1);
    assert_eq!(source.closes(), 1);
}

#[tokio::test]
async fn submit_after_stop_is_rejected() {
    let orchestrator = Arc::new(ConcurrentJobScraper::new());
    let handle = ScrapeScheduler::new(orchestrator, SchedulerConfig::default()).start();

    handle.stop().await.unwrap();
    handle.stop().await.unwrap();
    assert!(handle.is_stopped());

    let err = handle
        .submit(ScrapeRequest::new(JobQuery::new("rust")))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));
}
