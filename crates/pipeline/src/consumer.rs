use std::sync::Arc;

use anyhow::{Context, Result};
use ordin_bus::{run_subscriber, subscribe_all, Bus};
use ordin_core::{partitions, Mirrored, WireEnvelope};
use ordin_queue::{DispatchQueue, PipelineStats, WorkerPool};
use ordin_store::{MirrorApplier, MirrorStore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::PipelineConfig;

/// Consumer role: bus partitions → dispatch queue → apply workers → mirror.
pub struct Consumer<K: Mirrored> {
    cfg: PipelineConfig,
    store: Arc<MirrorStore<K>>,
    stats: Arc<PipelineStats>,
}

impl<K: Mirrored> Consumer<K> {
    pub fn new(cfg: PipelineConfig, stats: Arc<PipelineStats>) -> Self {
        let store = Arc::new(MirrorStore::with_tombstone_cap(cfg.tombstone_cap));
        Self { cfg, store, stats }
    }

    pub fn store(&self) -> Arc<MirrorStore<K>> { self.store.clone() }

    /// Partitions to subscribe: the configured subset, else every action's partition.
    pub fn partitions(&self) -> Vec<String> {
        let all = partitions::<K>();
        match &self.cfg.partitions {
            Some(chosen) => {
                for p in chosen.iter().filter(|p| !all.contains(p)) {
                    warn!(partition = %p, "subscribing to a partition no producer of this kind publishes to");
                }
                chosen.clone()
            }
            None => all,
        }
    }

    /// Subscribe to every partition, then start subscribers and apply workers.
    ///
    /// A failed subscription aborts startup with nothing left running.
    pub async fn start(&self, bus: &dyn Bus, cancel: CancellationToken) -> Result<ConsumerHandle> {
        let parts = self.partitions();
        let subs = subscribe_all(bus, &parts).await.context("subscribing to bus partitions")?;
        info!(partitions = ?parts, workers = self.cfg.consumer_workers, "subscribed");

        let queue: DispatchQueue<WireEnvelope> = DispatchQueue::new("consumer");
        let applier = Arc::new(MirrorApplier::new(self.store.clone(), self.stats.clone()));
        let pool = WorkerPool::spawn(queue.clone(), applier, self.cfg.consumer(), self.stats.clone(), cancel.clone());
        let subscribers = subs
            .into_iter()
            .map(|sub| tokio::spawn(run_subscriber(sub, queue.clone(), self.stats.clone(), cancel.clone())))
            .collect();
        Ok(ConsumerHandle { subscribers, pool, queue })
    }
}

/// Running consumer tasks. Stops when the start token is cancelled.
pub struct ConsumerHandle {
    subscribers: Vec<JoinHandle<()>>,
    pool: WorkerPool,
    queue: DispatchQueue<WireEnvelope>,
}

impl ConsumerHandle {
    pub fn queue(&self) -> &DispatchQueue<WireEnvelope> { &self.queue }

    /// Wait for subscribers to stop, then for workers to finish in-flight applies.
    pub async fn join(self) {
        for h in self.subscribers {
            if let Err(e) = h.await {
                warn!(error = %e, "subscriber task failed");
            }
        }
        self.pool.join().await;
        info!("consumer stopped");
    }
}
