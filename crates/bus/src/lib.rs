//! Ordin bus: partition-scoped pub/sub between the producer and its mirrors.
//!
//! The [`Bus`] trait is the seam; [`RedisBus`] is the production transport and
//! [`MemoryBus`] an in-process stand-in for tests and single-process demos.

#![forbid(unsafe_code)]

use futures::stream::BoxStream;
use futures::StreamExt;

mod memory;
mod publisher;
mod redis_bus;
mod subscriber;

pub use memory::MemoryBus;
pub use publisher::Publisher;
pub use redis_bus::{connection_info, RedisBus};
pub use subscriber::{run_subscriber, subscribe_all};

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("publish to {partition} failed: {reason}")]
    Publish { partition: String, reason: String },
    #[error("subscribe to {partition} failed: {reason}")]
    Subscribe { partition: String, reason: String },
}

/// One delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub partition: String,
    pub payload: Vec<u8>,
}

/// Established subscription to a single partition. Dropping it unsubscribes.
pub struct Subscription {
    partition: String,
    stream: BoxStream<'static, BusMessage>,
}

impl Subscription {
    pub fn new(partition: impl Into<String>, stream: BoxStream<'static, BusMessage>) -> Self {
        Self { partition: partition.into(), stream }
    }

    pub fn partition(&self) -> &str { &self.partition }

    /// Next delivery; `None` when the transport closed the subscription.
    pub async fn next(&mut self) -> Option<BusMessage> { self.stream.next().await }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("partition", &self.partition).finish_non_exhaustive()
    }
}

/// Partitioned pub/sub transport.
#[async_trait::async_trait]
pub trait Bus: Send + Sync + 'static {
    /// Publish one message. Errors are reported synchronously so callers can retry.
    async fn publish(&self, partition: &str, payload: &[u8]) -> Result<(), BusError>;

    /// Establish a subscription; returns only once the transport confirmed it.
    async fn subscribe(&self, partition: &str) -> Result<Subscription, BusError>;
}
