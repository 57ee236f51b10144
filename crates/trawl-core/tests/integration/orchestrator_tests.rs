use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use trawl_core::orchestrator::{RunState, SourceStatus};
use trawl_core::{AppError, ConcurrentJobScraper, Filters, JobQuery};

use crate::integration::common::{
    RecordingReporter, StubScraper, eventually, job, jobs, shared,
};

fn query() -> JobQuery {
    JobQuery::new("python developer").with_location("Remote")
}

#[tokio::test]
async fn failing_source_is_isolated() {
    let a = shared(StubScraper::failing("a", "HTTP 503"));
    let b = shared(StubScraper::returning("b", jobs("b", 5)));
    let orchestrator = ConcurrentJobScraper::new()
        .with_source(a)
        .unwrap()
        .with_source(b)
        .unwrap();

    let outcome = orchestrator
        .scrape(&query(), &BTreeMap::new(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.all.len(), 5);
    assert!(outcome.errors["a"].contains("HTTP 503"));
    assert_eq!(outcome.stats.errors, 1);
    assert_eq!(outcome.stats.found_per_source["a"], 0);
    assert_eq!(outcome.stats.found_per_source["b"], 5);
    assert_eq!(outcome.sources[0].status, SourceStatus::Failed);
    assert!(!outcome.cancelled);
    assert_eq!(orchestrator.state(), RunState::Done);
}

#[tokio::test]
async fn duplicates_across_sources_collapse() {
    let a = shared(StubScraper::returning(
        "a",
        vec![job("a-1", "Python Developer", "Acme Inc")],
    ));
    let b = shared(StubScraper::returning(
        "b",
        vec![
            job("b-7", "python developer", "ACME INC."),
            job("b-8", "Go Developer", "Acme Inc"),
        ],
    ));
    let orchestrator = ConcurrentJobScraper::new()
        .with_source(a)
        .unwrap()
        .with_source(b)
        .unwrap();

    let outcome = orchestrator
        .scrape(&query(), &BTreeMap::new(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.stats.total_found, 3);
    assert_eq!(outcome.stats.unique, 2);
    assert_eq!(outcome.stats.duplicates_removed, 1);
    assert_eq!(outcome.all[0].job_id, "a-1");
    assert_eq!(outcome.all[0].source.as_deref(), Some("a"));
    assert_eq!(outcome.by_source()["b"].len(), 2);
}

#[tokio::test]
async fn aggregate_follows_registration_order() {
    let slow = shared(StubScraper::returning("slow", jobs("slow", 2)).with_delay(Duration::from_millis(50)));
    let fast = shared(StubScraper::returning("fast", jobs("fast", 2)));
    let orchestrator = ConcurrentJobScraper::new()
        .with_source(slow)
        .unwrap()
        .with_source(fast)
        .unwrap();

    let outcome = orchestrator
        .scrape(&query(), &BTreeMap::new(), CancellationToken::new())
        .await
        .unwrap();

    let sources: Vec<_> = outcome
        .all
        .iter()
        .map(|r| r.source.as_deref().unwrap())
        .collect();
    assert_eq!(sources, ["slow", "slow", "fast", "fast"]);
}

#[tokio::test]
async fn panicking_source_becomes_error() {
    let boom = shared(StubScraper::panicking("boom"));
    let ok = shared(StubScraper::returning("ok", jobs("ok", 1)));
    let orchestrator = ConcurrentJobScraper::new()
        .with_source(boom)
        .unwrap()
        .with_source(ok)
        .unwrap();

    let outcome = orchestrator
        .scrape(&query(), &BTreeMap::new(), CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.errors["boom"].contains("panicked"));
    assert_eq!(outcome.all.len(), 1);
}

#[tokio::test]
async fn cancellation_returns_partial_results() {
    let quick = shared(StubScraper::returning("quick", jobs("quick", 3)));
    let stuck = shared(StubScraper::hanging("stuck"));
    let orchestrator = ConcurrentJobScraper::new()
        .with_source(quick)
        .unwrap()
        .with_source(stuck.clone())
        .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let outcome = orchestrator
        .scrape(&query(), &BTreeMap::new(), cancel)
        .await
        .unwrap();

    assert!(outcome.cancelled);
    assert_eq!(outcome.all.len(), 3);
    assert_eq!(outcome.errors["stuck"], "cancelled");
    assert_eq!(outcome.sources[1].status, SourceStatus::Cancelled);
    assert_eq!(outcome.stats.cancelled_sources, 1);
    assert_eq!(stuck.calls(), 1);
}

#[tokio::test]
async fn second_concurrent_scrape_is_rejected() {
    let stuck = shared(StubScraper::hanging("stuck"));
    let orchestrator = Arc::new(ConcurrentJobScraper::new().with_source(stuck).unwrap());

    let cancel = CancellationToken::new();
    let first = {
        let orchestrator = Arc::clone(&orchestrator);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            orchestrator
                .scrape(&query(), &BTreeMap::new(), cancel)
                .await
        })
    };
    eventually(|| orchestrator.state() == RunState::Running).await;

    let err = orchestrator
        .scrape(&query(), &BTreeMap::new(), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));

    cancel.cancel();
    let outcome = first.await.unwrap().unwrap();
    assert!(outcome.cancelled);

    // The orchestrator is reusable once the first run is done.
    assert_eq!(orchestrator.state(), RunState::Done);
}

#[tokio::test]
async fn disabled_source_is_skipped() {
    let on = shared(StubScraper::returning("on", jobs("on", 1)));
    let off = shared(StubScraper::returning("off", jobs("off", 1)));
    let mut orchestrator = ConcurrentJobScraper::new()
        .with_source(on)
        .unwrap()
        .with_source(off.clone())
        .unwrap();
    orchestrator.set_enabled("off", false).unwrap();

    let outcome = orchestrator
        .scrape(&query(), &BTreeMap::new(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(off.calls(), 0);
    assert_eq!(outcome.sources.len(), 1);
    assert!(orchestrator.set_enabled("missing", true).is_err());
}

#[tokio::test]
async fn filters_are_routed_per_source() {
    let a = shared(StubScraper::returning("a", Vec::new()));
    let b = shared(StubScraper::returning("b", Vec::new()));
    let orchestrator = ConcurrentJobScraper::new()
        .with_source(a.clone())
        .unwrap()
        .with_source(b.clone())
        .unwrap();

    let mut filters = BTreeMap::new();
    filters.insert(
        "a".to_string(),
        Filters::from([("remote".to_string(), "true".to_string())]),
    );

    orchestrator
        .scrape(&query(), &filters, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(a.seen_filters()[0]["remote"], "true");
    assert!(b.seen_filters()[0].is_empty());
}

#[tokio::test]
async fn duplicate_source_names_are_rejected() {
    let result = ConcurrentJobScraper::new()
        .with_source(shared(StubScraper::returning("a", Vec::new())))
        .unwrap()
        .with_source(shared(StubScraper::returning("a", Vec::new())));
    assert!(matches!(result, Err(AppError::Config(_))));
}

#[tokio::test]
async fn reporter_sees_lifecycle() {
    let reporter = Arc::new(RecordingReporter::default());
    let orchestrator = ConcurrentJobScraper::new()
        .with_reporter(reporter.clone())
        .with_source(shared(StubScraper::returning("a", jobs("a", 2))))
        .unwrap()
        .with_source(shared(StubScraper::failing("b", "down")))
        .unwrap();

    orchestrator
        .scrape(&query(), &BTreeMap::new(), CancellationToken::new())
        .await
        .unwrap();

    let events = reporter.events();
    assert_eq!(events.first().map(String::as_str), Some("started:2"));
    assert_eq!(events.last().map(String::as_str), Some("finished"));
    assert!(events.contains(&"completed:a:2".to_string()));
    assert!(events.contains(&"failed:b".to_string()));
}

#[tokio::test]
async fn close_reaches_every_source() {
    let a = shared(StubScraper::returning("a", Vec::new()));
    let b = shared(StubScraper::returning("b", Vec::new()));
    let orchestrator = ConcurrentJobScraper::new()
        .with_source(a.clone())
        .unwrap()
        .with_source(b.clone())
        .unwrap();

    orchestrator.close().await;
    assert_eq!(a.closes(), 1);
    assert_eq!(b.closes(), 1);
}
