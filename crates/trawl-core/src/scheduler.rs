//! Background runner that serializes scrape requests onto one orchestrator.
//!
//! Lifecycle: [`ScrapeScheduler::new`] → [`ScrapeScheduler::start`] →
//! [`SchedulerHandle::submit`]* → [`SchedulerHandle::stop`].

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{Filters, JobQuery};
use crate::orchestrator::{ConcurrentJobScraper, ScrapeOutcome};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Requests that may wait behind the running one before `submit` blocks.
    pub queue_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { queue_capacity: 16 }
    }
}

#[derive(Debug, Clone)]
pub struct ScrapeRequest {
    pub id: Uuid,
    pub query: JobQuery,
    pub filters: BTreeMap<String, Filters>,
}

impl ScrapeRequest {
    pub fn new(query: JobQuery) -> Self {
        Self {
            id: Uuid::new_v4(),
            query,
            filters: BTreeMap::new(),
        }
    }

    pub fn with_filters(mut self, source: impl Into<String>, filters: Filters) -> Self {
        self.filters.insert(source.into(), filters);
        self
    }
}

pub type ScrapeReply = oneshot::Receiver<Result<ScrapeOutcome, AppError>>;

struct Queued {
    request: ScrapeRequest,
    reply: oneshot::Sender<Result<ScrapeOutcome, AppError>>,
}

/// Events emitted by the scheduler loop.
#[derive(Debug, Clone)]
pub enum SchedulerEvent<'a> {
    Started,
    RequestAccepted { request_id: Uuid, query: &'a str },
    RunCompleted { request_id: Uuid, unique: usize, errors: usize },
    RunFailed { request_id: Uuid, error: &'a str },
    ShuttingDown { requests_rejected: usize },
    Stopped,
}

pub trait SchedulerReporter: Send + Sync {
    fn report(&self, event: SchedulerEvent<'_>) {
        let _ = event;
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSchedulerReporter;

impl SchedulerReporter for TracingSchedulerReporter {
    fn report(&self, event: SchedulerEvent<'_>) {
        match event {
            SchedulerEvent::Started => tracing::info!("Scheduler started"),
            SchedulerEvent::RequestAccepted { request_id, query } => {
                tracing::info!(%request_id, %query, "Scrape request accepted");
            }
            SchedulerEvent::RunCompleted {
                request_id,
                unique,
                errors,
            } => {
                tracing::info!(%request_id, unique, errors, "Scrape request completed");
            }
            SchedulerEvent::RunFailed { request_id, error } => {
                tracing::warn!(%request_id, %error, "Scrape request failed");
            }
            SchedulerEvent::ShuttingDown { requests_rejected } => {
                tracing::info!(requests_rejected, "Scheduler shutting down");
            }
            SchedulerEvent::Stopped => tracing::info!("Scheduler stopped"),
        }
    }
}

pub struct ScrapeScheduler {
    orchestrator: Arc<ConcurrentJobScraper>,
    config: SchedulerConfig,
    reporter: Arc<dyn SchedulerReporter>,
}

impl ScrapeScheduler {
    pub fn new(orchestrator: Arc<ConcurrentJobScraper>, config: SchedulerConfig) -> Self {
        Self {
            orchestrator,
            config,
            reporter: Arc::new(TracingSchedulerReporter),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn SchedulerReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Spawn the request loop on the current runtime.
    pub fn start(self) -> SchedulerHandle {
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let cancel = CancellationToken::new();
        let join = tokio::spawn(self.run(rx, cancel.clone()));
        SchedulerHandle {
            tx,
            cancel,
            join: AsyncMutex::new(Some(join)),
        }
    }

    async fn run(self, mut rx: mpsc::Receiver<Queued>, cancel: CancellationToken) {
        self.reporter.report(SchedulerEvent::Started);

        loop {
            let queued = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                queued = rx.recv() => match queued {
                    Some(queued) => queued,
                    None => break,
                },
            };

            let Queued { request, reply } = queued;
            self.reporter.report(SchedulerEvent::RequestAccepted {
                request_id: request.id,
                query: &request.query.query,
            });

            let result = self
                .orchestrator
                .scrape(&request.query, &request.filters, cancel.child_token())
                .await;

            match &result {
                Ok(outcome) => self.reporter.report(SchedulerEvent::RunCompleted {
                    request_id: request.id,
                    unique: outcome.stats.unique,
                    errors: outcome.stats.errors,
                }),
                Err(e) => {
                    let error = e.to_string();
                    self.reporter.report(SchedulerEvent::RunFailed {
                        request_id: request.id,
                        error: &error,
                    });
                }
            }
            if reply.send(result).is_err() {
                tracing::debug!(request_id = %request.id, "Submitter dropped before reply");
            }
        }

        // Reject whatever is still queued.
        rx.close();
        let mut rejected = 0;
        while let Some(Queued { reply, .. }) = rx.recv().await {
            let _ = reply.send(Err(AppError::Cancelled));
            rejected += 1;
        }

        self.reporter.report(SchedulerEvent::ShuttingDown {
            requests_rejected: rejected,
        });
        self.orchestrator.close().await;
        self.reporter.report(SchedulerEvent::Stopped);
    }
}

/// Handle to a running scheduler.
pub struct SchedulerHandle {
    tx: mpsc::Sender<Queued>,
    cancel: CancellationToken,
    join: AsyncMutex<Option<JoinHandle<()>>>,
}

impl SchedulerHandle {
    /// Queue a request; the returned receiver yields its outcome.
    ///
    /// Waits for queue space when the queue is full.
    pub async fn submit(&self, request: ScrapeRequest) -> Result<ScrapeReply, AppError> {
        if self.cancel.is_cancelled() {
            return Err(AppError::InvalidState("scheduler is stopped".into()));
        }
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Queued { request, reply })
            .await
            .map_err(|_| AppError::InvalidState("scheduler is stopped".into()))?;
        Ok(rx)
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel the in-flight run, reject queued requests, close the
    /// orchestrator and wait for the loop to exit. Idempotent.
    pub async fn stop(&self) -> Result<(), AppError> {
        self.cancel.cancel();
        let join = self.join.lock().await.take();
        if let Some(join) = join {
            join.await
                .map_err(|e| AppError::InvalidState(format!("scheduler loop panicked: {e}")))?;
        }
        Ok(())
    }
}
