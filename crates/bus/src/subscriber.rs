use std::sync::Arc;

use ordin_core::WireEnvelope;
use ordin_queue::{DispatchQueue, PipelineStats};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Bus, BusError, BusMessage, Subscription};

/// Subscribe to every partition or fail. A mirror missing a partition would
/// silently diverge, so the first failure aborts (already-open subscriptions
/// are dropped).
pub async fn subscribe_all(bus: &dyn Bus, partitions: &[String]) -> Result<Vec<Subscription>, BusError> {
    let mut subs = Vec::with_capacity(partitions.len());
    for p in partitions {
        subs.push(bus.subscribe(p).await?);
    }
    Ok(subs)
}

/// Pump one subscription into the dispatch queue until cancelled or the
/// transport ends the stream.
///
/// Cancellation is polled first on every turn and a delivery is handled
/// without yielding, so once `cancel` fires no further message is enqueued.
pub async fn run_subscriber(
    mut sub: Subscription,
    queue: DispatchQueue<WireEnvelope>,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
) {
    let partition = sub.partition().to_string();
    info!(partition = %partition, "subscriber started");
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(partition = %partition, "subscriber cancelled");
                break;
            }
            maybe = sub.next() => match maybe {
                Some(msg) => deliver(msg, &queue, &stats),
                None => {
                    warn!(partition = %partition, "subscription closed by transport");
                    break;
                }
            }
        }
    }
    drop(sub);
    info!(partition = %partition, "subscriber stopped");
}

fn deliver(msg: BusMessage, queue: &DispatchQueue<WireEnvelope>, stats: &PipelineStats) {
    stats.record_received();
    match WireEnvelope::decode(&msg.payload) {
        Ok(env) => {
            if !msg.partition.ends_with(env.action.as_str()) {
                debug!(partition = %msg.partition, action = %env.action, "envelope action differs from partition");
            }
            if queue.add(env) {
                stats.record_enqueued();
            }
        }
        Err(e) => {
            stats.record_malformed();
            warn!(partition = %msg.partition, bytes = msg.payload.len(), error = %e, "dropping undecodable message");
        }
    }
}
