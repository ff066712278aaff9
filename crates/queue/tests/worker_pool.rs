#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ordin_core::Keyed;
use ordin_queue::{DispatchQueue, ExponentialBackoff, HandleError, Handler, PipelineStats, WorkerConfig, WorkerPool};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
struct Job(u32);

impl Keyed for Job {
    type Key = u32;
    fn key(&self) -> u32 { self.0 }
}

/// Fails `fail_first` times per job, rejects job 13 as malformed.
#[derive(Default)]
struct Flaky {
    fail_first: usize,
    attempts: Mutex<std::collections::HashMap<u32, usize>>,
    done: Mutex<Vec<u32>>,
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl Handler<Job> for Flaky {
    async fn handle(&self, job: &Job) -> Result<(), HandleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if job.0 == 13 {
            return Err(HandleError::malformed(anyhow::anyhow!("unlucky payload")));
        }
        let n = {
            let mut a = self.attempts.lock().unwrap();
            let n = a.entry(job.0).or_insert(0);
            *n += 1;
            *n
        };
        if n <= self.fail_first {
            return Err(HandleError::transient(anyhow::anyhow!("bus unavailable")));
        }
        self.done.lock().unwrap().push(job.0);
        Ok(())
    }
}

fn fast_queue() -> DispatchQueue<Job> {
    DispatchQueue::with_limiter("test", ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(4)))
}

async fn wait_until(mut f: impl FnMut() -> bool) {
    for _ in 0..200 {
        if f() { return; }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_failures_are_retried_then_succeed() {
    let queue = fast_queue();
    let handler = Arc::new(Flaky { fail_first: 2, ..Default::default() });
    let stats = Arc::new(PipelineStats::new());
    let cancel = CancellationToken::new();
    let pool = WorkerPool::spawn(queue.clone(), handler.clone(), WorkerConfig { workers: 2, max_retries: 5 }, stats.clone(), cancel.clone());

    for i in 0..4 { queue.add(Job(i)); }
    wait_until(|| handler.done.lock().unwrap().len() == 4).await;

    let s = stats.snapshot();
    assert_eq!(s.processed, 4);
    assert_eq!(s.retried, 8);
    assert_eq!(s.dropped, 0);
    // backoff history is cleared after success
    assert_eq!(queue.num_requeues(&0), 0);

    cancel.cancel();
    pool.join().await;
    assert!(queue.is_shutting_down());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_and_malformed_items_are_dropped_without_stopping_workers() {
    let queue = fast_queue();
    let handler = Arc::new(Flaky { fail_first: usize::MAX, ..Default::default() });
    let stats = Arc::new(PipelineStats::new());
    let cancel = CancellationToken::new();
    let pool = WorkerPool::spawn(queue.clone(), handler.clone(), WorkerConfig { workers: 1, max_retries: 3 }, stats.clone(), cancel.clone());

    queue.add(Job(1));
    queue.add(Job(13));
    wait_until(|| {
        let s = stats.snapshot();
        s.dropped == 1 && s.malformed == 1
    })
    .await;
    // initial attempt + 3 retries for job 1, one attempt for job 13
    assert_eq!(handler.calls.load(Ordering::SeqCst), 5);
    assert_eq!(stats.snapshot().retried, 3);

    cancel.cancel();
    pool.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_stops_idle_workers() {
    let queue = fast_queue();
    let cancel = CancellationToken::new();
    let pool = WorkerPool::spawn(queue.clone(), Arc::new(Flaky::default()), WorkerConfig { workers: 3, max_retries: 1 }, Arc::new(PipelineStats::new()), cancel.clone());
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), pool.join()).await.expect("workers exit after cancel");
    assert!(!queue.add(Job(99)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn direct_queue_shutdown_also_ends_the_pool() {
    let queue = fast_queue();
    let cancel = CancellationToken::new();
    let pool = WorkerPool::spawn(queue.clone(), Arc::new(Flaky::default()), WorkerConfig { workers: 2, max_retries: 1 }, Arc::new(PipelineStats::new()), cancel.clone());
    queue.shut_down();
    tokio::time::timeout(Duration::from_secs(2), pool.join()).await.expect("workers exit after queue shutdown");
    assert!(!cancel.is_cancelled());
}
