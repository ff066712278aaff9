use std::collections::VecDeque;

use ordin_core::Uid;
use rustc_hash::FxHashMap;

/// Delete versions per UID, bounded FIFO. Evicting the oldest only loses
/// protection against updates that arrive very late for long-gone objects.
pub(crate) struct Tombstones {
    cap: usize,
    versions: FxHashMap<Uid, u64>,
    order: VecDeque<Uid>,
}

impl Tombstones {
    pub(crate) fn with_capacity(cap: usize) -> Self {
        Self { cap, versions: FxHashMap::default(), order: VecDeque::new() }
    }

    pub(crate) fn get(&self, uid: &Uid) -> Option<u64> { self.versions.get(uid).copied() }

    pub(crate) fn record(&mut self, uid: Uid, version: u64) {
        if self.cap == 0 {
            return;
        }
        if let Some(v) = self.versions.get_mut(&uid) {
            *v = (*v).max(version);
            return;
        }
        while self.versions.len() >= self.cap {
            match self.order.pop_front() {
                Some(old) => {
                    self.versions.remove(&old);
                }
                None => break,
            }
        }
        self.order.push_back(uid.clone());
        self.versions.insert(uid, version);
    }

    pub(crate) fn remove(&mut self, uid: &Uid) {
        if self.versions.remove(uid).is_some() {
            self.order.retain(|u| u != uid);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize { self.versions.len() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_past_cap() {
        let mut t = Tombstones::with_capacity(2);
        t.record("a".into(), 1);
        t.record("b".into(), 2);
        t.record("a".into(), 7);
        t.record("c".into(), 3);
        assert_eq!(t.len(), 2);
        assert_eq!(t.get(&"a".into()), None);
        assert_eq!(t.get(&"b".into()), Some(2));
        assert_eq!(t.get(&"c".into()), Some(3));
    }

    #[test]
    fn keeps_highest_version_and_forgets_on_remove() {
        let mut t = Tombstones::with_capacity(4);
        t.record("a".into(), 9);
        t.record("a".into(), 4);
        assert_eq!(t.get(&"a".into()), Some(9));
        t.remove(&"a".into());
        assert_eq!(t.get(&"a".into()), None);
        t.record("b".into(), 1);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn zero_cap_records_nothing() {
        let mut t = Tombstones::with_capacity(0);
        t.record("a".into(), 1);
        assert_eq!(t.get(&"a".into()), None);
    }
}
