//! Bounded pool of expensive automation resources.
//!
//! The pool owns `pool_size` long-lived handles (browser processes, HTTP
//! connection pools, ...) and lends out short-lived, isolated working
//! contexts through [`ResourcePool::with_context`]. A counting semaphore
//! is the only gate on resource use: at most `pool_size` contexts exist at
//! any instant, and every context is torn down before its slot is
//! released, whether the borrowing task succeeds, fails, panics or is
//! cancelled.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};

use crate::config::FetchConfig;
use crate::error::AppError;
use crate::proxy::ProxyRotator;
use crate::traits::PageSession;

/// Pluggable provider of handles and working contexts.
pub trait AutomationBackend: Send + Sync + 'static {
    /// Long-lived resource owned by the pool.
    type Handle: Send + Sync + 'static;
    /// Isolated context borrowed for a single task.
    type Context: PageSession;

    fn launch(
        &self,
        config: &FetchConfig,
        index: usize,
    ) -> impl Future<Output = Result<Self::Handle, AppError>> + Send;

    /// Open a context with its own cookies/state and optional proxy identity.
    fn new_context(
        &self,
        handle: &Self::Handle,
        config: &FetchConfig,
        proxy: Option<&str>,
    ) -> impl Future<Output = Result<Self::Context, AppError>> + Send;

    fn close_context(
        &self,
        context: Self::Context,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn shutdown(&self, handle: &Self::Handle) -> impl Future<Output = Result<(), AppError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Uninitialized,
    Ready,
    Closed,
}

struct Lifecycle<H> {
    phase: Phase,
    handles: Vec<Arc<H>>,
}

#[derive(Debug, Default)]
struct PoolCounters {
    in_use: AtomicUsize,
    peak_in_use: AtomicUsize,
    opened: AtomicU64,
    closed: AtomicU64,
}

impl PoolCounters {
    fn checkout(&self) {
        let now = self.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_use.fetch_max(now, Ordering::SeqCst);
        self.opened.fetch_add(1, Ordering::SeqCst);
    }

    fn checkin(&self) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub pool_size: usize,
    pub in_use: usize,
    pub peak_in_use: usize,
    pub contexts_opened: u64,
    pub contexts_closed: u64,
}

pub struct ResourcePool<B: AutomationBackend> {
    backend: Arc<B>,
    config: Arc<FetchConfig>,
    pool_size: usize,
    lifecycle: AsyncMutex<Lifecycle<B::Handle>>,
    semaphore: Arc<Semaphore>,
    next_handle: AtomicUsize,
    counters: Arc<PoolCounters>,
    proxies: Option<Arc<ProxyRotator>>,
}

impl<B: AutomationBackend> ResourcePool<B> {
    /// Fails with `Config` if `config` does not validate.
    pub fn new(backend: B, config: Arc<FetchConfig>) -> Result<Self, AppError> {
        config.validate()?;
        let pool_size = config.pool_size;
        Ok(Self {
            backend: Arc::new(backend),
            config,
            pool_size,
            lifecycle: AsyncMutex::new(Lifecycle {
                phase: Phase::Uninitialized,
                handles: Vec::with_capacity(pool_size),
            }),
            semaphore: Arc::new(Semaphore::new(pool_size)),
            next_handle: AtomicUsize::new(0),
            counters: Arc::new(PoolCounters::default()),
            proxies: None,
        })
    }

    /// Rotate contexts across the given proxies instead of `config.proxy`.
    pub fn with_proxy_rotator(mut self, rotator: Arc<ProxyRotator>) -> Self {
        self.proxies = Some(rotator);
        self
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Launch all handles. A second call is a no-op.
    ///
    /// If any launch fails, the handles launched so far are shut down and
    /// the error is returned; the pool stays uninitialized.
    pub async fn initialize(&self) -> Result<(), AppError> {
        let mut lifecycle = self.lifecycle.lock().await;
        match lifecycle.phase {
            Phase::Ready => return Ok(()),
            Phase::Closed => {
                return Err(AppError::InvalidState(
                    "cannot initialize a closed resource pool".into(),
                ));
            }
            Phase::Uninitialized => {}
        }

        let mut launched = Vec::with_capacity(self.pool_size);
        for index in 0..self.pool_size {
            match self.backend.launch(&self.config, index).await {
                Ok(handle) => launched.push(Arc::new(handle)),
                Err(e) => {
                    tracing::error!(index, error = %e, "Failed to launch pool handle");
                    for handle in &launched {
                        if let Err(e) = self.backend.shutdown(handle).await {
                            tracing::warn!(error = %e, "Failed to shut down handle after launch failure");
                        }
                    }
                    return Err(e);
                }
            }
        }

        tracing::info!(pool_size = self.pool_size, "Resource pool initialized");
        lifecycle.handles = launched;
        lifecycle.phase = Phase::Ready;
        Ok(())
    }

    async fn ensure_ready(&self) -> Result<(), AppError> {
        match self.lifecycle.lock().await.phase {
            Phase::Ready => Ok(()),
            Phase::Uninitialized => Err(AppError::PoolNotInitialized),
            Phase::Closed => Err(closed_error()),
        }
    }

    async fn pick_handle(&self) -> Result<Arc<B::Handle>, AppError> {
        let lifecycle = self.lifecycle.lock().await;
        if lifecycle.phase != Phase::Ready || lifecycle.handles.is_empty() {
            return Err(closed_error());
        }
        let idx = self.next_handle.fetch_add(1, Ordering::Relaxed) % lifecycle.handles.len();
        Ok(Arc::clone(&lifecycle.handles[idx]))
    }

    fn select_proxy(&self) -> Result<Option<String>, AppError> {
        let Some(rotator) = &self.proxies else {
            return Ok(self.config.proxy.clone());
        };
        match rotator.next_proxy() {
            Some(proxy) => Ok(Some(proxy)),
            None if rotator.is_strict() => Err(AppError::ResourceExhausted(
                "all proxy endpoints are excluded".into(),
            )),
            None => {
                tracing::warn!("All proxy endpoints excluded, continuing without proxy");
                Ok(None)
            }
        }
    }

    /// Only pushback-style errors count against a proxy.
    fn report_proxy(&self, proxy: Option<&str>, error: Option<&AppError>) {
        let (Some(rotator), Some(proxy)) = (&self.proxies, proxy) else {
            return;
        };
        match error {
            None => rotator.report_success(proxy),
            Some(e) if e.should_throttle() => rotator.report_failure(proxy),
            Some(_) => {}
        }
    }

    /// Borrow an isolated context for the duration of `f`.
    ///
    /// Suspends while all `pool_size` slots are taken.
    pub async fn with_context<T, F, Fut>(&self, f: F) -> Result<T, AppError>
    where
        F: FnOnce(B::Context) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        self.ensure_ready().await?;

        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| closed_error())?;

        let handle = self.pick_handle().await?;
        let proxy = self.select_proxy()?;

        let context = match self
            .backend
            .new_context(&handle, &self.config, proxy.as_deref())
            .await
        {
            Ok(context) => context,
            Err(e) => {
                self.report_proxy(proxy.as_deref(), Some(&e));
                return Err(e);
            }
        };
        drop(handle);

        self.counters.checkout();
        let lease = Lease::<B> {
            backend: Arc::clone(&self.backend),
            context: Some(context.clone()),
            permit: Some(permit),
            counters: Arc::clone(&self.counters),
        };

        let result = f(context).await;
        self.report_proxy(proxy.as_deref(), result.as_ref().err());
        lease.release().await;
        result
    }

    /// Close the semaphore and shut down every handle. Idempotent.
    pub async fn close(&self) -> Result<(), AppError> {
        let handles = {
            let mut lifecycle = self.lifecycle.lock().await;
            if lifecycle.phase == Phase::Closed {
                return Ok(());
            }
            lifecycle.phase = Phase::Closed;
            self.semaphore.close();
            std::mem::take(&mut lifecycle.handles)
        };

        let mut first_error = None;
        for handle in &handles {
            if let Err(e) = self.backend.shutdown(handle).await {
                tracing::warn!(error = %e, "Failed to shut down pool handle");
                first_error.get_or_insert(e);
            }
        }
        tracing::info!(handles = handles.len(), "Resource pool closed");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            pool_size: self.pool_size,
            in_use: self.counters.in_use.load(Ordering::SeqCst),
            peak_in_use: self.counters.peak_in_use.load(Ordering::SeqCst),
            contexts_opened: self.counters.opened.load(Ordering::SeqCst),
            contexts_closed: self.counters.closed.load(Ordering::SeqCst),
        }
    }
}

fn closed_error() -> AppError {
    AppError::ResourceExhausted("resource pool is closed".into())
}

/// A checked-out context plus its semaphore slot.
///
/// `release` tears the context down inline. If the lease is dropped
/// instead (panic or cancellation), the teardown is spawned and the slot
/// is freed once it completes.
struct Lease<B: AutomationBackend> {
    backend: Arc<B>,
    context: Option<B::Context>,
    permit: Option<OwnedSemaphorePermit>,
    counters: Arc<PoolCounters>,
}

impl<B: AutomationBackend> Lease<B> {
    async fn release(mut self) {
        if let Some(context) = self.context.take() {
            teardown(self.backend.as_ref(), context, &self.counters).await;
        }
        drop(self.permit.take());
    }
}

async fn teardown<B: AutomationBackend>(backend: &B, context: B::Context, counters: &PoolCounters) {
    if let Err(e) = backend.close_context(context).await {
        tracing::warn!(error = %e, "Failed to close working context");
    }
    counters.checkin();
}

impl<B: AutomationBackend> Drop for Lease<B> {
    fn drop(&mut self) {
        let Some(context) = self.context.take() else {
            return;
        };
        let backend = Arc::clone(&self.backend);
        let counters = Arc::clone(&self.counters);
        let permit = self.permit.take();

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    teardown(backend.as_ref(), context, &counters).await;
                    drop(permit);
                });
            }
            Err(_) => {
                tracing::warn!("No runtime available, dropping context without teardown");
                counters.checkin();
                drop(permit);
            }
        }
    }
}
