use std::sync::Arc;

use ordin_core::{ChangeEnvelope, Mirrored, WireEnvelope};
use ordin_queue::{HandleError, Handler, PipelineStats};
use tracing::{debug, info};

use crate::{ApplyOutcome, MirrorStore};

/// Consumer-side handler: decodes wire envelopes into `K` and applies them.
///
/// Decoding and apply errors are malformed (retrying cannot fix them); a stale
/// envelope counts as handled.
pub struct MirrorApplier<K> {
    store: Arc<MirrorStore<K>>,
    stats: Arc<PipelineStats>,
}

impl<K: Mirrored> MirrorApplier<K> {
    pub fn new(store: Arc<MirrorStore<K>>, stats: Arc<PipelineStats>) -> Self { Self { store, stats } }
}

#[async_trait::async_trait]
impl<K: Mirrored> Handler<WireEnvelope> for MirrorApplier<K> {
    async fn handle(&self, wire: &WireEnvelope) -> Result<(), HandleError> {
        let env = ChangeEnvelope::<K>::from_wire(wire).map_err(HandleError::malformed)?;
        let action = env.action();
        let name = env.latest().display_name();
        match self.store.apply(env).map_err(HandleError::malformed)? {
            ApplyOutcome::Stale { current } => {
                self.stats.record_stale();
                debug!(action = %action, object = %name, version = ?wire.version, current, "stale envelope ignored");
            }
            ApplyOutcome::Absent => debug!(action = %action, object = %name, "delete of unknown object"),
            outcome => info!(action = %action, object = %name, outcome = ?outcome, "mirror updated"),
        }
        Ok(())
    }
}
