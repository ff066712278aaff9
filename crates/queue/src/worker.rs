use std::sync::Arc;

use ordin_core::Keyed;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{DispatchQueue, Lease, PipelineStats};

/// Why an item could not be handled.
#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    /// I/O or transport trouble; worth retrying with backoff.
    #[error("transient failure: {0:#}")]
    Transient(anyhow::Error),
    /// The item itself is bad; retrying cannot help.
    #[error("malformed item: {0:#}")]
    Malformed(anyhow::Error),
}

impl HandleError {
    pub fn transient(e: impl Into<anyhow::Error>) -> Self { Self::Transient(e.into()) }
    pub fn malformed(e: impl Into<anyhow::Error>) -> Self { Self::Malformed(e.into()) }
}

/// Per-item processing step run by the worker pool (publish, or apply to a mirror).
#[async_trait::async_trait]
pub trait Handler<T>: Send + Sync + 'static {
    async fn handle(&self, item: &T) -> Result<(), HandleError>;
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub workers: usize,
    /// Retries per key before a transiently failing item is dropped.
    pub max_retries: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self { Self { workers: 1, max_retries: 5 } }
}

/// Fixed set of tasks draining one [`DispatchQueue`] until it shuts down.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    /// Shuts the queue down on cancel; aborted once the workers are gone.
    shutdown_on_cancel: JoinHandle<()>,
}

impl WorkerPool {
    /// Spawn `cfg.workers` workers. Cancelling `cancel` shuts the queue down,
    /// which lets every worker finish its current item and exit.
    pub fn spawn<T, H>(
        queue: DispatchQueue<T>,
        handler: Arc<H>,
        cfg: WorkerConfig,
        stats: Arc<PipelineStats>,
        cancel: CancellationToken,
    ) -> Self
    where
        T: Keyed + Clone + Send + Sync + 'static,
        H: Handler<T> + ?Sized,
    {
        let workers = cfg.workers.max(1);
        let mut handles = Vec::with_capacity(workers);
        let shutdown_on_cancel = tokio::spawn({
            let queue = queue.clone();
            async move {
                cancel.cancelled().await;
                queue.shut_down();
            }
        });
        for id in 0..workers {
            let queue = queue.clone();
            let handler = Arc::clone(&handler);
            let stats = Arc::clone(&stats);
            handles.push(tokio::spawn(async move {
                debug!(queue = %queue.name(), worker = id, "worker started");
                while let Some(lease) = queue.get().await {
                    process(lease, handler.as_ref(), cfg.max_retries, &stats).await;
                }
                debug!(queue = %queue.name(), worker = id, "worker exiting");
            }));
        }
        info!(queue = %queue.name(), workers, max_retries = cfg.max_retries, "worker pool started");
        Self { handles, shutdown_on_cancel }
    }

    /// Wait for every worker to exit, which happens once the queue shuts down
    /// (on cancel or by a direct `shut_down`). Worker panics are logged, not propagated.
    pub async fn join(self) {
        for h in self.handles {
            if let Err(e) = h.await {
                if e.is_panic() {
                    error!(error = %e, "worker panicked");
                }
            }
        }
        self.shutdown_on_cancel.abort();
    }
}

async fn process<T, H>(lease: Lease<T>, handler: &H, max_retries: u32, stats: &PipelineStats)
where
    T: Keyed + Clone + Send + Sync + 'static,
    H: Handler<T> + ?Sized,
{
    match handler.handle(lease.item()).await {
        Ok(()) => {
            lease.forget();
            stats.record_processed();
        }
        Err(HandleError::Malformed(e)) => {
            warn!(key = ?lease.key(), error = %format!("{:#}", e), "dropping malformed item");
            lease.forget();
            stats.record_malformed();
        }
        Err(HandleError::Transient(e)) => {
            let attempt = lease.num_requeues();
            if attempt < max_retries {
                let key = lease.key().clone();
                let delay = lease.requeue_rate_limited();
                stats.record_retried();
                warn!(key = ?key, attempt = attempt + 1, delay_ms = %delay.as_millis(), error = %format!("{:#}", e), "retrying item");
            } else {
                error!(key = ?lease.key(), attempts = attempt, error = %format!("{:#}", e), "retries exhausted; dropping item");
                lease.forget();
                stats.record_dropped();
            }
        }
    }
}
