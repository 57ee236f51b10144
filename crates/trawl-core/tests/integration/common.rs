use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use trawl_core::orchestrator::{ScrapeEvent, ScrapeReporter};
use trawl_core::{AppError, Filters, JobQuery, JobRecord, SourceScraper};

pub enum Behavior {
    Return(Vec<JobRecord>),
    Fail(String),
    Panic,
    Hang,
}

/// Source scraper with scripted behavior and recorded calls.
pub struct StubScraper {
    name: String,
    behavior: Behavior,
    delay: Duration,
    calls: AtomicUsize,
    closes: AtomicUsize,
    seen_filters: Mutex<Vec<Filters>>,
}

impl StubScraper {
    fn new(name: &str, behavior: Behavior) -> Self {
        Self {
            name: name.to_string(),
            behavior,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            seen_filters: Mutex::new(Vec::new()),
        }
    }

    pub fn returning(name: &str, records: Vec<JobRecord>) -> Self {
        Self::new(name, Behavior::Return(records))
    }

    pub fn failing(name: &str, message: &str) -> Self {
        Self::new(name, Behavior::Fail(message.to_string()))
    }

    pub fn panicking(name: &str) -> Self {
        Self::new(name, Behavior::Panic)
    }

    pub fn hanging(name: &str) -> Self {
        Self::new(name, Behavior::Hang)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn seen_filters(&self) -> Vec<Filters> {
        self.seen_filters.lock().unwrap().clone()
    }
}

impl SourceScraper for StubScraper {
    fn name(&self) -> &str {
        &self.name
    }

    fn scrape<'a>(
        &'a self,
        _query: &'a JobQuery,
        filters: &'a Filters,
    ) -> BoxFuture<'a, Result<Vec<JobRecord>, AppError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_filters.lock().unwrap().push(filters.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match &self.behavior {
                Behavior::Return(records) => Ok(records.clone()),
                Behavior::Fail(message) => Err(AppError::Fetch(message.clone())),
                Behavior::Panic => panic!("{} parser exploded", self.name),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Vec::new())
                }
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.closes.fetch_add(1, Ordering::SeqCst);
        })
    }
}

pub fn job(id: &str, title: &str, company: &str) -> JobRecord {
    JobRecord::new(id, title, company, format!("https://jobs.example/{id}"))
}

pub fn jobs(prefix: &str, n: usize) -> Vec<JobRecord> {
    (0..n)
        .map(|i| job(&format!("{prefix}-{i}"), &format!("Engineer {i}"), prefix))
        .collect()
}

/// Reporter that keeps a flat log of event names.
#[derive(Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<String>>,
}

impl RecordingReporter {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl ScrapeReporter for RecordingReporter {
    fn report(&self, event: ScrapeEvent<'_>) {
        let entry = match event {
            ScrapeEvent::RunStarted { sources, .. } => format!("started:{sources}"),
            ScrapeEvent::SourceCompleted { source, records } => format!("completed:{source}:{records}"),
            ScrapeEvent::SourceFailed { source, .. } => format!("failed:{source}"),
            ScrapeEvent::SourceCancelled { source } => format!("cancelled:{source}"),
            ScrapeEvent::RunCompleted { .. } => "finished".to_string(),
        };
        self.events.lock().unwrap().push(entry);
    }
}

/// Poll `condition` until it holds or a second passes.
pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

pub fn shared<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
