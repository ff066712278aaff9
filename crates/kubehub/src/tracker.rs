use kube::Resource as _;
use ordin_core::{Change, Mirrored, Uid};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::warn;

/// Last-seen state per UID, used to turn raw watch events into changes.
///
/// A watch `Applied` is an add or an update depending on whether the UID was
/// seen before; a relist also yields deletes for UIDs that disappeared while
/// the watch was down.
pub struct Tracker<K> {
    seen: FxHashMap<Uid, K>,
    listed: bool,
}

impl<K: Mirrored> Default for Tracker<K> {
    fn default() -> Self { Self::new() }
}

impl<K: Mirrored> Tracker<K> {
    pub fn new() -> Self { Self { seen: FxHashMap::default(), listed: false } }

    pub fn len(&self) -> usize { self.seen.len() }
    pub fn is_empty(&self) -> bool { self.seen.is_empty() }

    /// True after the first full list.
    pub fn listed(&self) -> bool { self.listed }

    pub fn applied(&mut self, obj: K) -> Option<Change<K>> {
        let Some(uid) = obj.uid() else {
            warn!(object = %obj.display_name(), "watched object has no uid; skipped");
            return None;
        };
        match self.seen.insert(uid, obj.clone()) {
            None => Some(Change::Add(obj)),
            // same resourceVersion: a resync, nothing changed
            Some(old) if old.meta().resource_version.is_some() && old.meta().resource_version == obj.meta().resource_version => None,
            Some(old) => Some(Change::Update { old, new: obj }),
        }
    }

    pub fn deleted(&mut self, obj: K) -> Option<Change<K>> {
        let Some(uid) = obj.uid() else {
            warn!(object = %obj.display_name(), "deleted object has no uid; skipped");
            return None;
        };
        self.seen.remove(&uid);
        Some(Change::Delete(obj))
    }

    /// Full relist: adds and updates for listed objects, then deletes for
    /// tracked objects missing from the list (in UID order).
    pub fn restarted(&mut self, objs: Vec<K>) -> Vec<Change<K>> {
        let mut listed = FxHashSet::default();
        let mut out = Vec::with_capacity(objs.len());
        for obj in objs {
            if let Some(uid) = obj.uid() {
                listed.insert(uid);
            }
            out.extend(self.applied(obj));
        }
        let mut gone: Vec<Uid> = self.seen.keys().filter(|u| !listed.contains(*u)).cloned().collect();
        gone.sort();
        for uid in gone {
            if let Some(last) = self.seen.remove(&uid) {
                out.push(Change::Delete(last));
            }
        }
        self.listed = true;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use ordin_core::Action;

    fn deploy(uid: &str, rv: &str) -> Deployment {
        Deployment { metadata: ObjectMeta { uid: Some(uid.into()), resource_version: Some(rv.into()), name: Some(uid.into()), ..Default::default() }, ..Default::default() }
    }

    fn action(c: &Change<Deployment>) -> Action {
        match c {
            Change::Add(_) => Action::Add,
            Change::Update { .. } => Action::Update,
            Change::Delete(_) => Action::Delete,
        }
    }

    #[test]
    fn applied_is_add_then_update() {
        let mut t = Tracker::new();
        assert!(matches!(t.applied(deploy("a", "1")), Some(Change::Add(_))));
        match t.applied(deploy("a", "2")) {
            Some(Change::Update { old, new }) => {
                assert_eq!(old.metadata.resource_version.as_deref(), Some("1"));
                assert_eq!(new.metadata.resource_version.as_deref(), Some("2"));
            }
            other => panic!("expected update, got {:?}", other),
        }
        assert!(t.applied(deploy("a", "2")).is_none());
        assert!(t.applied(Deployment::default()).is_none());
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn relist_diffs_against_last_seen() {
        let mut t = Tracker::new();
        t.applied(deploy("a", "1"));
        t.applied(deploy("b", "1"));
        t.applied(deploy("c", "1"));
        assert!(!t.listed());

        let changes = t.restarted(vec![deploy("a", "1"), deploy("b", "5"), deploy("d", "1")]);
        let got: Vec<(Action, String)> = changes.iter().map(|c| (action(c), c_uid(c))).collect();
        assert_eq!(got, vec![(Action::Update, "b".into()), (Action::Add, "d".into()), (Action::Delete, "c".into())]);
        assert!(t.listed());
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn delete_of_unseen_object_is_still_reported() {
        let mut t = Tracker::new();
        assert!(matches!(t.deleted(deploy("z", "9")), Some(Change::Delete(_))));
        assert!(t.is_empty());
    }

    fn c_uid(c: &Change<Deployment>) -> String {
        match c {
            Change::Add(o) | Change::Delete(o) | Change::Update { new: o, .. } => o.metadata.uid.clone().unwrap_or_default(),
        }
    }
}
