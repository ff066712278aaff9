use std::sync::{Mutex, PoisonError};

use ordin_core::Uid;
use rustc_hash::FxHashMap;

/// Per-UID monotonic version stamps.
///
/// The stamp follows `resourceVersion` when it parses as an integer, and is
/// forced strictly above the previous stamp for the UID otherwise, so a
/// consumer can order any two envelopes for one object.
#[derive(Default)]
pub struct Sequencer {
    last: Mutex<FxHashMap<Uid, u64>>,
}

impl Sequencer {
    pub fn new() -> Self { Self::default() }

    pub fn stamp(&self, uid: &Uid, revision: Option<u64>) -> u64 {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let prev = last.get(uid).copied().unwrap_or(0);
        let v = revision.unwrap_or(0).max(prev + 1);
        last.insert(uid.clone(), v);
        v
    }

    /// Stamp the final envelope for `uid` and stop tracking it; UIDs are never reused.
    pub fn stamp_final(&self, uid: &Uid, revision: Option<u64>) -> u64 {
        let v = self.stamp(uid, revision);
        self.last.lock().unwrap_or_else(PoisonError::into_inner).remove(uid);
        v
    }

    pub fn tracked(&self) -> usize { self.last.lock().unwrap_or_else(PoisonError::into_inner).len() }
}
