use ordin_queue::WorkerConfig;
use ordin_store::DEFAULT_TOMBSTONE_CAP;

/// Knobs for both pipeline roles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub producer_workers: usize,
    pub consumer_workers: usize,
    /// Attempts per envelope before a transiently failing one is dropped.
    pub max_retries: u32,
    pub tombstone_cap: usize,
    /// Restrict the watcher to one namespace.
    pub namespace: Option<String>,
    /// Partitions the consumer subscribes to; `None` means all of them.
    pub partitions: Option<Vec<String>>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            producer_workers: 1,
            consumer_workers: 2,
            max_retries: 5,
            tombstone_cap: DEFAULT_TOMBSTONE_CAP,
            namespace: None,
            partitions: None,
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden by `ORDIN_PRODUCER_WORKERS`, `ORDIN_CONSUMER_WORKERS`,
    /// `ORDIN_MAX_RETRIES`, `ORDIN_TOMBSTONE_CAP`, `ORDIN_NAMESPACE` and
    /// `ORDIN_PARTITIONS` (comma separated).
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            producer_workers: std::env::var("ORDIN_PRODUCER_WORKERS").ok().and_then(|s| s.parse().ok()).unwrap_or(d.producer_workers),
            consumer_workers: std::env::var("ORDIN_CONSUMER_WORKERS").ok().and_then(|s| s.parse().ok()).unwrap_or(d.consumer_workers),
            max_retries: std::env::var("ORDIN_MAX_RETRIES").ok().and_then(|s| s.parse().ok()).unwrap_or(d.max_retries),
            tombstone_cap: std::env::var("ORDIN_TOMBSTONE_CAP").ok().and_then(|s| s.parse().ok()).unwrap_or(d.tombstone_cap),
            namespace: std::env::var("ORDIN_NAMESPACE").ok().filter(|s| !s.is_empty()),
            partitions: std::env::var("ORDIN_PARTITIONS").ok().map(|s| split_list(&s)).filter(|v| !v.is_empty()),
        }
    }

    pub fn producer(&self) -> WorkerConfig { WorkerConfig { workers: self.producer_workers.max(1), max_retries: self.max_retries } }

    pub fn consumer(&self) -> WorkerConfig { WorkerConfig { workers: self.consumer_workers.max(1), max_retries: self.max_retries } }
}

pub(crate) fn split_list(s: &str) -> Vec<String> {
    s.split(',').map(str::trim).filter(|p| !p.is_empty()).map(str::to_string).collect()
}
