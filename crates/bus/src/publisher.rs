use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use ordin_core::{partition, ChangeEnvelope, Mirrored};
use ordin_queue::{HandleError, Handler};
use tracing::debug;

use crate::Bus;

/// Serializes envelopes and publishes each on the partition for its action.
pub struct Publisher<K> {
    bus: Arc<dyn Bus>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: Mirrored> Publisher<K> {
    pub fn new(bus: Arc<dyn Bus>) -> Self { Self { bus, _kind: PhantomData } }
}

#[async_trait::async_trait]
impl<K: Mirrored> Handler<ChangeEnvelope<K>> for Publisher<K> {
    async fn handle(&self, env: &ChangeEnvelope<K>) -> Result<(), HandleError> {
        let payload = env.encode().map_err(HandleError::malformed)?;
        let partition = partition::<K>(env.action());
        let started = Instant::now();
        if let Err(e) = self.bus.publish(&partition, &payload).await {
            counter!("ordin_publish_failures_total", 1, "partition" => partition.clone());
            return Err(HandleError::transient(e));
        }
        histogram!("ordin_publish_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("ordin_publish_total", 1, "partition" => partition.clone());
        debug!(partition = %partition, object = %env.latest().display_name(), version = ?env.version, bytes = payload.len(), "published");
        Ok(())
    }
}
