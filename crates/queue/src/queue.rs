use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::{counter, gauge};
use ordin_core::Keyed;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::ExponentialBackoff;

struct State<T: Keyed> {
    /// FIFO of keys ready to hand out; every key here also has an entry in `dirty`.
    queue: VecDeque<T::Key>,
    /// Pending items by key (queued, or parked behind an in-flight lease).
    dirty: FxHashMap<T::Key, T>,
    processing: FxHashSet<T::Key>,
    shutting_down: bool,
}

struct Inner<T: Keyed> {
    name: String,
    state: Mutex<State<T>>,
    ready: Notify,
    idle: Notify,
    limiter: ExponentialBackoff<T::Key>,
}

impl<T: Keyed> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }
}

/// De-duplicating, rate-limited work queue. Cheap to clone; clones share state.
pub struct DispatchQueue<T: Keyed> {
    inner: Arc<Inner<T>>,
}

impl<T: Keyed> Clone for DispatchQueue<T> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

impl<T> DispatchQueue<T>
where
    T: Keyed + Send + 'static,
{
    pub fn new(name: impl Into<String>) -> Self { Self::with_limiter(name, ExponentialBackoff::default()) }

    pub fn with_limiter(name: impl Into<String>, limiter: ExponentialBackoff<T::Key>) -> Self {
        let state = State { queue: VecDeque::new(), dirty: FxHashMap::default(), processing: FxHashSet::default(), shutting_down: false };
        Self { inner: Arc::new(Inner { name: name.into(), state: Mutex::new(state), ready: Notify::new(), idle: Notify::new(), limiter }) }
    }

    pub fn name(&self) -> &str { &self.inner.name }

    /// Enqueue `item`. Returns `false` when an item with the same key is already
    /// pending or the queue is shut down.
    pub fn add(&self, item: T) -> bool {
        let key = item.key();
        let mut st = self.inner.lock();
        if st.shutting_down {
            debug!(queue = %self.inner.name, key = ?key, "add after shutdown ignored");
            return false;
        }
        if st.dirty.contains_key(&key) {
            counter!("ordin_queue_dedup_total", 1, "queue" => self.inner.name.clone());
            return false;
        }
        st.dirty.insert(key.clone(), item);
        counter!("ordin_queue_adds_total", 1, "queue" => self.inner.name.clone());
        if st.processing.contains(&key) {
            // parked; `done` re-queues it
            return true;
        }
        st.queue.push_back(key);
        gauge!("ordin_queue_depth", st.queue.len() as f64, "queue" => self.inner.name.clone());
        drop(st);
        self.inner.ready.notify_one();
        true
    }

    /// Enqueue after `delay`. Needs a tokio runtime when `delay` is non-zero.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        if self.is_shutting_down() {
            return;
        }
        let q = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            q.add(item);
        });
    }

    /// Re-add with the per-key backoff delay; returns the delay chosen.
    pub fn add_rate_limited(&self, item: T) -> Duration {
        let delay = self.inner.limiter.when(&item.key());
        self.add_after(item, delay);
        delay
    }

    pub fn forget(&self, key: &T::Key) { self.inner.limiter.forget(key) }

    pub fn num_requeues(&self, key: &T::Key) -> u32 { self.inner.limiter.num_requeues(key) }

    /// Wait for the next item. `None` once the queue is shut down.
    pub async fn get(&self) -> Option<Lease<T>> {
        loop {
            let notified = self.inner.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.inner.lock();
                if st.shutting_down {
                    return None;
                }
                if let Some(key) = st.queue.pop_front() {
                    let Some(item) = st.dirty.remove(&key) else { continue };
                    st.processing.insert(key.clone());
                    gauge!("ordin_queue_depth", st.queue.len() as f64, "queue" => self.inner.name.clone());
                    return Some(Lease { queue: self.clone(), key, item });
                }
            }
            notified.await;
        }
    }

    /// Stop handing out work. Blocked and future `get` calls return `None`;
    /// leases already handed out stay valid. Queued items are discarded.
    pub fn shut_down(&self) {
        let mut st = self.inner.lock();
        if st.shutting_down {
            return;
        }
        st.shutting_down = true;
        let discarded = st.queue.len();
        let in_flight = st.processing.len();
        drop(st);
        info!(queue = %self.inner.name, discarded, in_flight, "dispatch queue shut down");
        self.inner.ready.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool { self.inner.lock().shutting_down }

    /// Wait until no lease is outstanding.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.lock().processing.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Number of items ready to be handed out.
    pub fn len(&self) -> usize { self.inner.lock().queue.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn in_flight(&self) -> usize { self.inner.lock().processing.len() }

    fn done(&self, key: &T::Key) {
        let mut st = self.inner.lock();
        st.processing.remove(key);
        let requeue = !st.shutting_down && st.dirty.contains_key(key);
        if requeue {
            st.queue.push_back(key.clone());
        }
        let idle = st.processing.is_empty();
        drop(st);
        if requeue {
            self.inner.ready.notify_one();
        }
        if idle {
            self.inner.idle.notify_waiters();
        }
    }
}

/// Exclusive claim on one dequeued item. Dropping the lease marks the key done,
/// on every exit path.
pub struct Lease<T>
where
    T: Keyed + Send + 'static,
{
    queue: DispatchQueue<T>,
    key: T::Key,
    item: T,
}

impl<T> Lease<T>
where
    T: Keyed + Clone + Send + 'static,
{
    /// Schedule a retry of this item with backoff, then release the lease.
    pub fn requeue_rate_limited(self) -> Duration { self.queue.add_rate_limited(self.item.clone()) }
}

impl<T> Lease<T>
where
    T: Keyed + Send + 'static,
{
    pub fn item(&self) -> &T { &self.item }
    pub fn key(&self) -> &T::Key { &self.key }

    /// Failures recorded by the rate limiter for this key.
    pub fn num_requeues(&self) -> u32 { self.queue.num_requeues(&self.key) }

    /// Clear backoff history for this key (after success or final give-up).
    pub fn forget(&self) { self.queue.forget(&self.key) }
}

impl<T> Drop for Lease<T>
where
    T: Keyed + Send + 'static,
{
    fn drop(&mut self) { self.queue.done(&self.key) }
}
