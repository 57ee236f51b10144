//! Multi-source orchestration.
//!
//! [`ConcurrentJobScraper`] runs every enabled source as its own task,
//! turns source errors and panics into per-source error entries, then
//! merges the results in registration order and removes cross-source
//! duplicates (first occurrence wins).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{Filters, JobQuery, JobRecord};
use crate::traits::SourceScraper;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Aggregating,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceOutcome {
    pub source: String,
    pub status: SourceStatus,
    /// Records as returned by the source, tagged, before deduplication.
    pub records: Vec<JobRecord>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScrapeStats {
    pub found_per_source: BTreeMap<String, usize>,
    pub total_found: usize,
    pub unique: usize,
    pub duplicates_removed: usize,
    /// Failed plus cancelled sources.
    pub errors: usize,
    pub cancelled_sources: usize,
    pub duration: Duration,
    pub jobs_per_second: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScrapeOutcome {
    pub run_id: Uuid,
    /// One entry per enabled source, in registration order.
    pub sources: Vec<SourceOutcome>,
    /// Deduplicated records across all sources.
    pub all: Vec<JobRecord>,
    pub errors: BTreeMap<String, String>,
    pub stats: ScrapeStats,
    pub cancelled: bool,
}

impl ScrapeOutcome {
    pub fn by_source(&self) -> BTreeMap<&str, &[JobRecord]> {
        self.sources
            .iter()
            .map(|s| (s.source.as_str(), s.records.as_slice()))
            .collect()
    }

    pub fn records_for(&self, source: &str) -> &[JobRecord] {
        self.sources
            .iter()
            .find(|s| s.source == source)
            .map(|s| s.records.as_slice())
            .unwrap_or_default()
    }
}

/// Events emitted during a run for monitoring/logging.
#[derive(Debug, Clone)]
pub enum ScrapeEvent<'a> {
    RunStarted { run_id: Uuid, sources: usize },
    SourceCompleted { source: &'a str, records: usize },
    SourceFailed { source: &'a str, error: &'a str },
    SourceCancelled { source: &'a str },
    RunCompleted { run_id: Uuid, stats: &'a ScrapeStats },
}

/// Receives orchestrator events (decoupled logging).
pub trait ScrapeReporter: Send + Sync {
    fn report(&self, event: ScrapeEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ScrapeReporter for TracingReporter {
    fn report(&self, event: ScrapeEvent<'_>) {
        match event {
            ScrapeEvent::RunStarted { run_id, sources } => {
                tracing::info!(%run_id, sources, "Scrape started");
            }
            ScrapeEvent::SourceCompleted { source, records } => {
                tracing::info!(%source, records, "Source completed");
            }
            ScrapeEvent::SourceFailed { source, error } => {
                tracing::warn!(%source, %error, "Source failed");
            }
            ScrapeEvent::SourceCancelled { source } => {
                tracing::warn!(%source, "Source cancelled");
            }
            ScrapeEvent::RunCompleted { run_id, stats } => {
                tracing::info!(
                    %run_id,
                    total_found = stats.total_found,
                    unique = stats.unique,
                    duplicates_removed = stats.duplicates_removed,
                    errors = stats.errors,
                    duration_ms = %stats.duration.as_millis(),
                    jobs_per_second = stats.jobs_per_second,
                    "Scrape completed"
                );
            }
        }
    }
}

struct Registered {
    scraper: Arc<dyn SourceScraper>,
    enabled: bool,
}

/// What a source task left behind: records, an error message, or nothing
/// (cancelled before finishing).
type SourceSlot = Option<Result<Vec<JobRecord>, String>>;

pub struct ConcurrentJobScraper {
    sources: Vec<Registered>,
    state: Mutex<RunState>,
    reporter: Arc<dyn ScrapeReporter>,
}

impl Default for ConcurrentJobScraper {
    fn default() -> Self {
        Self::new()
    }
}

impl ConcurrentJobScraper {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            state: Mutex::new(RunState::Idle),
            reporter: Arc::new(TracingReporter),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ScrapeReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Register a source. Names must be unique.
    pub fn add_source(&mut self, scraper: Arc<dyn SourceScraper>) -> Result<(), AppError> {
        if self.sources.iter().any(|s| s.scraper.name() == scraper.name()) {
            return Err(AppError::Config(format!(
                "source '{}' is already registered",
                scraper.name()
            )));
        }
        self.sources.push(Registered {
            scraper,
            enabled: true,
        });
        Ok(())
    }

    pub fn with_source(mut self, scraper: Arc<dyn SourceScraper>) -> Result<Self, AppError> {
        self.add_source(scraper)?;
        Ok(self)
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<(), AppError> {
        let source = self
            .sources
            .iter_mut()
            .find(|s| s.scraper.name() == name)
            .ok_or_else(|| AppError::Config(format!("unknown source '{name}'")))?;
        source.enabled = enabled;
        Ok(())
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.scraper.name()).collect()
    }

    fn lock_state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned orchestrator state");
            poisoned.into_inner()
        })
    }

    pub fn state(&self) -> RunState {
        *self.lock_state()
    }

    fn begin_run(&self) -> Result<RunGuard<'_>, AppError> {
        let mut state = self.lock_state();
        if matches!(*state, RunState::Running | RunState::Aggregating) {
            return Err(AppError::InvalidState(
                "a scrape is already running on this orchestrator".into(),
            ));
        }
        *state = RunState::Running;
        Ok(RunGuard { owner: self })
    }

    /// Scrape every enabled source concurrently.
    ///
    /// Only invalid input and a concurrent second run are returned as
    /// errors; everything a source does wrong ends up in
    /// [`ScrapeOutcome::errors`]. Cancelling `cancel` aborts outstanding
    /// sources and returns what had completed.
    pub async fn scrape(
        &self,
        query: &JobQuery,
        filters: &BTreeMap<String, Filters>,
        cancel: CancellationToken,
    ) -> Result<ScrapeOutcome, AppError> {
        if query.query.trim().is_empty() {
            return Err(AppError::Config("query must not be empty".into()));
        }
        if query.limit == 0 {
            return Err(AppError::Config("limit must be at least 1".into()));
        }
        for name in filters.keys() {
            if !self.sources.iter().any(|s| s.scraper.name() == name) {
                tracing::warn!(source = %name, "Filters given for unknown source");
            }
        }

        let _guard = self.begin_run()?;
        let run_id = Uuid::new_v4();
        let started = Instant::now();

        let active: Vec<Arc<dyn SourceScraper>> = self
            .sources
            .iter()
            .filter(|s| s.enabled)
            .map(|s| Arc::clone(&s.scraper))
            .collect();
        self.reporter.report(ScrapeEvent::RunStarted {
            run_id,
            sources: active.len(),
        });

        let mut slots: Vec<SourceSlot> = (0..active.len()).map(|_| None).collect();
        let mut tasks = JoinSet::new();
        let mut slot_of = HashMap::new();
        for (slot, scraper) in active.iter().enumerate() {
            let scraper = Arc::clone(scraper);
            let query = query.clone();
            let filters = filters.get(scraper.name()).cloned().unwrap_or_default();
            let handle = tasks.spawn(async move { scraper.scrape(&query, &filters).await });
            slot_of.insert(handle.id(), slot);
        }

        let mut cancelled = false;
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled(), if !cancelled => {
                    tracing::warn!(%run_id, outstanding = tasks.len(), "Scrape cancelled, aborting sources");
                    tasks.abort_all();
                    cancelled = true;
                }
                joined = tasks.join_next_with_id() => {
                    let Some(joined) = joined else { break };
                    let (id, outcome) = match joined {
                        Ok((id, Ok(records))) => (id, Some(Ok(records))),
                        Ok((id, Err(AppError::Cancelled))) => (id, None),
                        Ok((id, Err(e))) => (id, Some(Err(e.to_string()))),
                        Err(e) if e.is_cancelled() => (e.id(), None),
                        Err(e) => (e.id(), Some(Err(format!("source task panicked: {e}")))),
                    };
                    if let Some(&slot) = slot_of.get(&id) {
                        self.report_source(active[slot].name(), &outcome);
                        slots[slot] = outcome;
                    }
                }
            }
        }

        *self.lock_state() = RunState::Aggregating;
        let named = active
            .iter()
            .map(|s| s.name().to_string())
            .zip(slots)
            .collect();
        let mut outcome = merge(run_id, named, started.elapsed());
        outcome.cancelled = cancelled;

        self.reporter.report(ScrapeEvent::RunCompleted {
            run_id,
            stats: &outcome.stats,
        });
        Ok(outcome)
    }

    fn report_source(&self, source: &str, outcome: &SourceSlot) {
        match outcome {
            Some(Ok(records)) => self.reporter.report(ScrapeEvent::SourceCompleted {
                source,
                records: records.len(),
            }),
            Some(Err(error)) => self.reporter.report(ScrapeEvent::SourceFailed { source, error }),
            None => self.reporter.report(ScrapeEvent::SourceCancelled { source }),
        }
    }

    /// Close every registered source.
    pub async fn close(&self) {
        join_all(self.sources.iter().map(|s| s.scraper.close())).await;
    }
}

/// Resets the run state when a run ends, including when its future is
/// dropped mid-flight.
struct RunGuard<'a> {
    owner: &'a ConcurrentJobScraper,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        *self.owner.lock_state() = RunState::Done;
    }
}

/// Tag, concatenate and deduplicate per-source results in the given order.
fn merge(run_id: Uuid, results: Vec<(String, SourceSlot)>, duration: Duration) -> ScrapeOutcome {
    let mut seen = HashSet::new();
    let mut all = Vec::new();
    let mut sources = Vec::with_capacity(results.len());
    let mut errors = BTreeMap::new();
    let mut stats = ScrapeStats::default();

    for (name, slot) in results {
        let outcome = match slot {
            Some(Ok(records)) => {
                let records: Vec<JobRecord> =
                    records.into_iter().map(|r| r.with_source(name.as_str())).collect();
                for record in &records {
                    if seen.insert(record.dedup_key()) {
                        all.push(record.clone());
                    }
                }
                stats.found_per_source.insert(name.clone(), records.len());
                stats.total_found += records.len();
                SourceOutcome {
                    source: name,
                    status: SourceStatus::Completed,
                    records,
                    error: None,
                }
            }
            Some(Err(error)) => {
                stats.found_per_source.insert(name.clone(), 0);
                errors.insert(name.clone(), error.clone());
                SourceOutcome {
                    source: name,
                    status: SourceStatus::Failed,
                    records: Vec::new(),
                    error: Some(error),
                }
            }
            None => {
                stats.found_per_source.insert(name.clone(), 0);
                stats.cancelled_sources += 1;
                errors.insert(name.clone(), "cancelled".to_string());
                SourceOutcome {
                    source: name,
                    status: SourceStatus::Cancelled,
                    records: Vec::new(),
                    error: Some("cancelled".to_string()),
                }
            }
        };
        sources.push(outcome);
    }

    stats.unique = all.len();
    stats.duplicates_removed = stats.total_found - stats.unique;
    stats.errors = errors.len();
    stats.duration = duration;
    stats.jobs_per_second = match duration.as_secs_f64() {
        secs if secs > 0.0 => stats.unique as f64 / secs,
        _ => 0.0,
    };

    ScrapeOutcome {
        run_id,
        sources,
        all,
        errors,
        stats,
        cancelled: false,
    }
}
