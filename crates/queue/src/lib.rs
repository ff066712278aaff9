//! Ordin dispatch queue: the in-process work queue that decouples event detection
//! from event handling, plus the worker pool draining it.
//!
//! Semantics follow the classic controller work queue:
//! - an item whose key is already pending is not queued twice;
//! - an item whose key is being processed is parked and re-queued once the
//!   in-flight lease is released;
//! - every `get` hands out a [`Lease`] whose `Drop` marks the key done.

#![forbid(unsafe_code)]

mod queue;
mod ratelimit;
mod stats;
mod worker;

pub use queue::{DispatchQueue, Lease};
pub use ratelimit::ExponentialBackoff;
pub use stats::{PipelineStats, StatsSnapshot};
pub use worker::{HandleError, Handler, WorkerConfig, WorkerPool};
