//! Ordin store: the mirror of current resource state, rebuilt from change events.
//!
//! All mutation goes through [`MirrorStore`]'s whole-operation methods under one
//! coarse mutex; readers get copy-on-write [`MirrorSnapshot`]s taken under the
//! same lock, so a snapshot never shows a half-applied change.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use ordin_core::{Action, Change, ChangeEnvelope, Mirrored, Uid};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

mod applier;
mod tombstones;

pub use applier::MirrorApplier;
use tombstones::Tombstones;

/// Tombstones kept for rejecting late updates of deleted UIDs.
pub const DEFAULT_TOMBSTONE_CAP: usize = 10_000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ApplyError {
    #[error("{0} representation has no metadata.uid")]
    MissingUid(Action),
}

/// What an apply did to the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    Replaced,
    Removed,
    /// Delete of a UID not in the mirror; nothing changed.
    Absent,
    /// Rejected: the mirror already reflects `current`, which is newer.
    Stale { current: u64 },
}

impl ApplyOutcome {
    pub fn changed(&self) -> bool { matches!(self, Self::Inserted | Self::Replaced | Self::Removed) }
}

#[derive(Debug, Clone, Serialize)]
pub struct MirrorEntry<K> {
    pub uid: Uid,
    pub version: Option<u64>,
    /// Unix millis of the apply that produced this entry.
    pub applied_at: i64,
    pub repr: K,
}

/// Immutable view of the mirror at one epoch. Entries are ordered by UID.
#[derive(Debug, Clone, Serialize)]
pub struct MirrorSnapshot<K> {
    pub epoch: u64,
    pub entries: Vec<MirrorEntry<K>>,
}

impl<K> Default for MirrorSnapshot<K> {
    fn default() -> Self { Self { epoch: 0, entries: Vec::new() } }
}

impl<K> MirrorSnapshot<K> {
    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
    pub fn contains(&self, uid: &Uid) -> bool { self.get(uid).is_some() }

    pub fn get(&self, uid: &Uid) -> Option<&MirrorEntry<K>> {
        self.entries.binary_search_by(|e| e.uid.cmp(uid)).ok().map(|i| &self.entries[i])
    }

    pub fn items(&self) -> impl Iterator<Item = &K> { self.entries.iter().map(|e| &e.repr) }

    pub fn uids(&self) -> Vec<&Uid> { self.entries.iter().map(|e| &e.uid).collect() }
}

struct State<K> {
    entries: FxHashMap<Uid, MirrorEntry<K>>,
    tombstones: Tombstones,
    epoch: u64,
    cached: Option<Arc<MirrorSnapshot<K>>>,
}

impl<K: Mirrored> State<K> {
    /// Version of what the mirror already holds for `uid` if `version` is older.
    fn newer_than(&self, uid: &Uid, version: Option<u64>) -> Option<u64> {
        let v = version?;
        if let Some(cur) = self.entries.get(uid).and_then(|e| e.version) {
            if v < cur {
                return Some(cur);
            }
        }
        match self.tombstones.get(uid) {
            Some(deleted_at) if v <= deleted_at => Some(deleted_at),
            _ => None,
        }
    }

    fn upsert(&mut self, uid: Uid, repr: K, version: Option<u64>) -> ApplyOutcome {
        let previous = self.entries.get(&uid).and_then(|e| e.version);
        let entry = MirrorEntry { uid: uid.clone(), version: version.or(previous), applied_at: chrono::Utc::now().timestamp_millis(), repr };
        self.tombstones.remove(&uid);
        match self.entries.insert(uid, entry) {
            Some(_) => ApplyOutcome::Replaced,
            None => ApplyOutcome::Inserted,
        }
    }

    fn bump(&mut self) -> u64 {
        self.epoch += 1;
        self.cached = None;
        self.epoch
    }
}

/// UID-keyed mirror. Share it behind an `Arc`.
pub struct MirrorStore<K> {
    state: Mutex<State<K>>,
    epoch_tx: watch::Sender<u64>,
}

impl<K: Mirrored> MirrorStore<K> {
    pub fn new() -> Self { Self::with_tombstone_cap(DEFAULT_TOMBSTONE_CAP) }

    pub fn with_tombstone_cap(cap: usize) -> Self {
        let state = State { entries: FxHashMap::default(), tombstones: Tombstones::with_capacity(cap), epoch: 0, cached: None };
        Self { state: Mutex::new(state), epoch_tx: watch::channel(0).0 }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Insert or overwrite the entry for `uid`.
    pub fn apply_add(&self, uid: Uid, repr: K, version: Option<u64>) -> ApplyOutcome {
        self.mutate(Action::Add, |st| match st.newer_than(&uid, version) {
            Some(current) => ApplyOutcome::Stale { current },
            None => st.upsert(uid, repr, version),
        })
    }

    /// Remove the entry for `uid` if present. A versioned delete leaves a
    /// tombstone so older updates arriving later are rejected.
    pub fn apply_delete(&self, uid: &Uid, version: Option<u64>) -> ApplyOutcome {
        self.mutate(Action::Delete, |st| {
            if let (Some(v), Some(cur)) = (version, st.entries.get(uid).and_then(|e| e.version)) {
                if v < cur {
                    return ApplyOutcome::Stale { current: cur };
                }
            }
            if let Some(v) = version {
                st.tombstones.record(uid.clone(), v);
            }
            match st.entries.remove(uid) {
                Some(_) => ApplyOutcome::Removed,
                None => ApplyOutcome::Absent,
            }
        })
    }

    /// Replace the entry at `old_uid` with `new_repr`, keyed by `new_repr`'s own UID.
    ///
    /// UIDs are immutable so the two normally match; if they do not, the old
    /// entry is removed and the new representation is still stored. A missing
    /// entry makes this an insert.
    pub fn apply_update(&self, old_uid: &Uid, new_repr: K, version: Option<u64>) -> Result<ApplyOutcome, ApplyError> {
        let new_uid = new_repr.uid().ok_or(ApplyError::MissingUid(Action::Update))?;
        Ok(self.mutate(Action::Update, |st| {
            if let Some(current) = st.newer_than(&new_uid, version) {
                return ApplyOutcome::Stale { current };
            }
            if *old_uid != new_uid && st.entries.remove(old_uid).is_some() {
                warn!(old = %old_uid, new = %new_uid, "update changed uid; old entry removed");
            }
            st.upsert(new_uid, new_repr, version)
        }))
    }

    /// Apply a decoded envelope.
    pub fn apply(&self, env: ChangeEnvelope<K>) -> Result<ApplyOutcome, ApplyError> {
        let version = env.version;
        match env.change {
            Change::Add(obj) => {
                let uid = obj.uid().ok_or(ApplyError::MissingUid(Action::Add))?;
                Ok(self.apply_add(uid, obj, version))
            }
            Change::Update { old, new } => {
                let old_uid = old.uid().ok_or(ApplyError::MissingUid(Action::Update))?;
                self.apply_update(&old_uid, new, version)
            }
            Change::Delete(obj) => {
                let uid = obj.uid().ok_or(ApplyError::MissingUid(Action::Delete))?;
                Ok(self.apply_delete(&uid, version))
            }
        }
    }

    fn mutate(&self, action: Action, f: impl FnOnce(&mut State<K>) -> ApplyOutcome) -> ApplyOutcome {
        let started = Instant::now();
        let mut st = self.lock();
        let outcome = f(&mut st);
        if outcome.changed() {
            let epoch = st.bump();
            let len = st.entries.len();
            // published under the lock so watchers see epochs in bump order
            self.epoch_tx.send_replace(epoch);
            drop(st);
            gauge!("ordin_mirror_entries", len as f64);
        } else {
            drop(st);
        }
        histogram!("ordin_mirror_apply_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("ordin_mirror_applies_total", 1, "action" => action.as_str());
        debug!(action = %action, outcome = ?outcome, "mirror apply");
        outcome
    }

    /// Consistent copy of the mirror. Repeated calls between mutations share one allocation.
    pub fn snapshot(&self) -> Arc<MirrorSnapshot<K>> {
        let mut st = self.lock();
        if let Some(snap) = &st.cached {
            return Arc::clone(snap);
        }
        let mut entries: Vec<MirrorEntry<K>> = st.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.uid.cmp(&b.uid));
        let snap = Arc::new(MirrorSnapshot { epoch: st.epoch, entries });
        st.cached = Some(Arc::clone(&snap));
        snap
    }

    pub fn get(&self, uid: &Uid) -> Option<K> { self.lock().entries.get(uid).map(|e| e.repr.clone()) }

    pub fn len(&self) -> usize { self.lock().entries.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn epoch(&self) -> u64 { self.lock().epoch }

    /// Epoch notifications; the value changes after every mutating apply.
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_tx.subscribe() }
}

impl<K: Mirrored> Default for MirrorStore<K> {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn deploy(uid: &str, replicas: i32) -> Deployment {
        let mut d = Deployment { metadata: ObjectMeta { uid: Some(uid.into()), name: Some(format!("d-{}", uid)), ..Default::default() }, ..Default::default() };
        d.spec = Some(k8s_openapi::api::apps::v1::DeploymentSpec { replicas: Some(replicas), ..Default::default() });
        d
    }

    fn replicas(store: &MirrorStore<Deployment>, uid: &str) -> Option<i32> {
        store.get(&Uid::from(uid)).and_then(|d| d.spec).and_then(|s| s.replicas)
    }

    #[test]
    fn epoch_watch_ends_on_the_latest_epoch_under_contention() {
        for _ in 0..20 {
            let store = Arc::new(MirrorStore::<Deployment>::new());
            let rx = store.subscribe_epoch();
            let writers: Vec<_> = (0..4)
                .map(|t| {
                    let store = store.clone();
                    std::thread::spawn(move || {
                        for i in 0..50 {
                            let uid = format!("t{}-{}", t, i);
                            store.apply_add(uid.as_str().into(), deploy(&uid, 1), None);
                        }
                    })
                })
                .collect();
            for w in writers {
                w.join().unwrap();
            }
            assert_eq!(store.epoch(), 200);
            assert_eq!(*rx.borrow(), store.epoch());
        }
    }

    #[test]
    fn update_with_mismatched_uid_keeps_new_representation() {
        let store = MirrorStore::new();
        store.apply_add("old".into(), deploy("old", 1), None);
        let out = store.apply_update(&"old".into(), deploy("new", 2), None).unwrap();
        assert_eq!(out, ApplyOutcome::Inserted);
        assert_eq!(store.len(), 1);
        assert_eq!(replicas(&store, "new"), Some(2));
        assert_eq!(replicas(&store, "old"), None);
    }

    #[test]
    fn update_of_unknown_uid_is_an_upsert() {
        let store = MirrorStore::new();
        assert_eq!(store.apply_update(&"x".into(), deploy("x", 3), None).unwrap(), ApplyOutcome::Inserted);
        assert_eq!(store.apply_update(&"x".into(), deploy("x", 4), None).unwrap(), ApplyOutcome::Replaced);
        assert_eq!(replicas(&store, "x"), Some(4));
    }

    #[test]
    fn update_without_uid_is_rejected_untouched() {
        let store: MirrorStore<Deployment> = MirrorStore::new();
        let err = store.apply_update(&"x".into(), Deployment::default(), None).unwrap_err();
        assert_eq!(err, ApplyError::MissingUid(Action::Update));
        assert_eq!(store.epoch(), 0);
    }

    #[test]
    fn older_versions_lose_to_newer_ones() {
        let store = MirrorStore::new();
        store.apply_add("a".into(), deploy("a", 1), Some(10));
        assert_eq!(store.apply_update(&"a".into(), deploy("a", 9), Some(9)).unwrap(), ApplyOutcome::Stale { current: 10 });
        assert_eq!(replicas(&store, "a"), Some(1));
        // equal version re-apply is accepted (redelivery)
        assert_eq!(store.apply_add("a".into(), deploy("a", 1), Some(10)), ApplyOutcome::Replaced);
        // unversioned envelopes keep the known version
        store.apply_update(&"a".into(), deploy("a", 5), None).unwrap();
        assert_eq!(store.snapshot().get(&"a".into()).unwrap().version, Some(10));
    }

    #[test]
    fn snapshot_is_cached_until_next_mutation() {
        let store = MirrorStore::new();
        store.apply_add("b".into(), deploy("b", 1), None);
        store.apply_add("a".into(), deploy("a", 1), None);
        let s1 = store.snapshot();
        let s2 = store.snapshot();
        assert!(Arc::ptr_eq(&s1, &s2));
        assert_eq!(s1.uids(), vec![&Uid::from("a"), &Uid::from("b")]);
        assert_eq!(store.apply_delete(&"zz".into(), None), ApplyOutcome::Absent);
        assert!(Arc::ptr_eq(&s1, &store.snapshot()));
        store.apply_delete(&"a".into(), None);
        let s3 = store.snapshot();
        assert_eq!(s3.epoch, s1.epoch + 1);
        assert_eq!(s1.len(), 2);
        assert_eq!(s3.len(), 1);
    }
}
