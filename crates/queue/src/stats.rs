use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;
use serde::{Deserialize, Serialize};

/// Process-wide pipeline counters. Every `record_*` also bumps the matching
/// Prometheus counter so tests and `/stats` see the same numbers as scrapes.
#[derive(Debug, Default)]
pub struct PipelineStats {
    received: AtomicU64,
    enqueued: AtomicU64,
    processed: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
    malformed: AtomicU64,
    stale: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub enqueued: u64,
    pub processed: u64,
    pub retried: u64,
    pub dropped: u64,
    pub malformed: u64,
    pub stale: u64,
}

impl PipelineStats {
    pub fn new() -> Self { Self::default() }

    /// A message or watcher event arrived (before de-duplication).
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        counter!("ordin_received_total", 1);
    }

    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        counter!("ordin_enqueued_total", 1);
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        counter!("ordin_processed_total", 1);
    }

    pub fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
        counter!("ordin_retries_total", 1);
    }

    /// Retries exhausted; item given up.
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        counter!("ordin_dropped_total", 1);
    }

    /// Undecodable message or payload.
    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
        counter!("ordin_decode_failures_total", 1);
    }

    /// Apply rejected because a newer version was already seen.
    pub fn record_stale(&self) {
        self.stale.fetch_add(1, Ordering::Relaxed);
        counter!("ordin_stale_rejections_total", 1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
        }
    }
}
