use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use futures::StreamExt;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use crate::{Bus, BusError, BusMessage, Subscription};

/// In-process bus on top of tokio broadcast channels.
///
/// Like Redis pub/sub, messages published before a subscription exists are lost.
/// Failure injection hooks let tests exercise retry and startup-abort paths.
pub struct MemoryBus {
    capacity: usize,
    channels: Mutex<FxHashMap<String, broadcast::Sender<BusMessage>>>,
    failing_publishes: AtomicUsize,
    refused: Mutex<FxHashSet<String>>,
}

impl MemoryBus {
    pub fn new() -> Self { Self::with_capacity(1024) }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Mutex::new(FxHashMap::default()),
            failing_publishes: AtomicUsize::new(0),
            refused: Mutex::new(FxHashSet::default()),
        }
    }

    /// Make the next `n` publishes fail.
    pub fn fail_next_publishes(&self, n: usize) { self.failing_publishes.store(n, Ordering::SeqCst) }

    /// Refuse future subscriptions to `partition`.
    pub fn refuse_subscriptions(&self, partition: &str) {
        self.refused.lock().unwrap_or_else(PoisonError::into_inner).insert(partition.to_string());
    }

    /// Live subscribers on `partition`.
    pub fn subscribers(&self, partition: &str) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(partition)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Drop every channel; open subscriptions end.
    pub fn close(&self) { self.channels.lock().unwrap_or_else(PoisonError::into_inner).clear() }

    fn sender(&self, partition: &str) -> broadcast::Sender<BusMessage> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.entry(partition.to_string()).or_insert_with(|| broadcast::channel(self.capacity).0).clone()
    }

    fn take_failure(&self) -> bool {
        self.failing_publishes.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
    }
}

impl Default for MemoryBus {
    fn default() -> Self { Self::new() }
}

#[async_trait::async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, partition: &str, payload: &[u8]) -> Result<(), BusError> {
        if self.take_failure() {
            return Err(BusError::Publish { partition: partition.to_string(), reason: "injected failure".into() });
        }
        // no receivers is not an error, same as PUBLISH returning 0
        let _ = self.sender(partition).send(BusMessage { partition: partition.to_string(), payload: payload.to_vec() });
        Ok(())
    }

    async fn subscribe(&self, partition: &str) -> Result<Subscription, BusError> {
        if self.refused.lock().unwrap_or_else(PoisonError::into_inner).contains(partition) {
            return Err(BusError::Subscribe { partition: partition.to_string(), reason: "refused".into() });
        }
        let rx = self.sender(partition).subscribe();
        let name = partition.to_string();
        let stream = futures::stream::unfold((rx, name), |(mut rx, name)| async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => return Some((msg, (rx, name))),
                    Err(RecvError::Lagged(skipped)) => warn!(partition = %name, skipped, "memory bus subscriber lagged"),
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        Ok(Subscription::new(partition, stream.boxed()))
    }
}
