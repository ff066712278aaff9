use std::sync::Arc;

use anyhow::{bail, Result};
use ordin_bus::{Bus, Publisher};
use ordin_core::{ChangeEnvelope, Mirrored};
use ordin_kubehub::{EventHandler, WatchHandle};
use ordin_queue::{DispatchQueue, PipelineStats, WorkerPool};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{PipelineConfig, Sequencer};

/// Watcher callbacks: stamp a version and enqueue an envelope. No I/O here.
pub struct ChangeEnqueuer<K: Mirrored> {
    queue: DispatchQueue<ChangeEnvelope<K>>,
    sequencer: Sequencer,
    stats: Arc<PipelineStats>,
}

impl<K: Mirrored> ChangeEnqueuer<K> {
    pub fn new(queue: DispatchQueue<ChangeEnvelope<K>>, stats: Arc<PipelineStats>) -> Self {
        Self { queue, sequencer: Sequencer::new(), stats }
    }

    fn enqueue(&self, env: ChangeEnvelope<K>) {
        self.stats.record_received();
        debug!(action = %env.action(), object = %env.latest().display_name(), version = ?env.version, "change detected");
        if self.queue.add(env) {
            self.stats.record_enqueued();
        }
    }
}

impl<K: Mirrored> EventHandler<K> for ChangeEnqueuer<K> {
    fn on_add(&self, obj: K) {
        let Some(uid) = obj.uid() else { return };
        let v = self.sequencer.stamp(&uid, obj.revision());
        self.enqueue(ChangeEnvelope::add(obj).with_version(v));
    }

    fn on_update(&self, old: K, new: K) {
        let Some(uid) = new.uid() else { return };
        let v = self.sequencer.stamp(&uid, new.revision());
        self.enqueue(ChangeEnvelope::update(old, new).with_version(v));
    }

    fn on_delete(&self, obj: K) {
        let Some(uid) = obj.uid() else { return };
        let v = self.sequencer.stamp_final(&uid, obj.revision());
        self.enqueue(ChangeEnvelope::delete(obj).with_version(v));
    }
}

/// Producer role: watcher → dispatch queue → publish workers → bus.
pub struct Producer<K: Mirrored> {
    cfg: PipelineConfig,
    queue: DispatchQueue<ChangeEnvelope<K>>,
    enqueuer: Arc<ChangeEnqueuer<K>>,
    stats: Arc<PipelineStats>,
}

impl<K: Mirrored> Producer<K> {
    pub fn new(cfg: PipelineConfig, stats: Arc<PipelineStats>) -> Self {
        let queue = DispatchQueue::new("producer");
        let enqueuer = Arc::new(ChangeEnqueuer::new(queue.clone(), stats.clone()));
        Self { cfg, queue, enqueuer, stats }
    }

    /// Handler to pass to the watcher.
    pub fn handler(&self) -> Arc<dyn EventHandler<K>> { self.enqueuer.clone() }

    pub fn queue(&self) -> &DispatchQueue<ChangeEnvelope<K>> { &self.queue }

    /// Wait for the watcher's initial sync, then publish until `cancel` fires.
    ///
    /// Changes seen before the sync are held in the queue. Errors if the
    /// watcher stops before it ever synced.
    pub async fn run(self, mut watch: WatchHandle, bus: Arc<dyn Bus>, cancel: CancellationToken) -> Result<()> {
        info!("waiting for watcher sync");
        let synced = tokio::select! {
            synced = watch.wait_synced() => synced,
            _ = cancel.cancelled() => {
                self.queue.shut_down();
                watch.join().await;
                return Ok(());
            }
        };
        if !synced {
            self.queue.shut_down();
            bail!("watcher stopped before initial sync");
        }
        info!(pending = self.queue.len(), workers = self.cfg.producer_workers, "watcher synced; starting publishers");

        let publisher = Arc::new(Publisher::<K>::new(bus));
        let pool = WorkerPool::spawn(self.queue.clone(), publisher, self.cfg.producer(), self.stats.clone(), cancel.clone());
        cancel.cancelled().await;
        watch.join().await;
        pool.join().await;
        info!("producer stopped");
        Ok(())
    }
}
