//! The working set of visible active calls, and the updates published for it.

use hashbrown::{HashMap, HashSet};
use livecall_core::{CallId, ClassifiedCall};
use serde::Serialize;

#[derive(Clone, Debug)]
struct Entry {
    call: ClassifiedCall,
    /// Payload keys learned from change events rather than the bulk snapshot
    incremental_keys: HashSet<String>,
}

/// Mapping `call_id -> ClassifiedCall` of the calls a viewer currently sees.
///
/// Every entry is ACTIVE and passed the viewer's permission check when it was
/// last evaluated; the store is responsible for upholding that.
#[derive(Clone, Debug, Default)]
pub struct WorkingSet {
    entries: HashMap<CallId, Entry>,
}

/// Difference between two working sets.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkingSetDiff {
    pub added: Vec<CallId>,
    pub removed: Vec<CallId>,
    pub modified: Vec<CallId>,
}

impl WorkingSetDiff {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

impl WorkingSet {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn contains(&self, id: &CallId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &CallId) -> Option<&ClassifiedCall> {
        self.entries.get(id).map(|e| &e.call)
    }

    /// Inserts a call as delivered by a snapshot, forgetting incremental keys.
    pub fn insert(&mut self, call: ClassifiedCall) -> Option<ClassifiedCall> {
        let id = call.call_id().clone();
        self.entries
            .insert(
                id,
                Entry {
                    call,
                    incremental_keys: HashSet::new(),
                },
            )
            .map(|e| e.call)
    }

    /// Replaces a tracked call with its merged version.
    ///
    /// `keys` are the payload keys the change event carried. Returns false if
    /// the call is not tracked or nothing changed.
    pub fn merge<'a>(&mut self, call: ClassifiedCall, keys: impl IntoIterator<Item = &'a str>) -> bool {
        let Some(entry) = self.entries.get_mut(call.call_id()) else {
            return false;
        };
        entry
            .incremental_keys
            .extend(keys.into_iter().map(str::to_string));
        if entry.call == call {
            return false;
        }
        entry.call = call;
        true
    }

    pub fn remove(&mut self, id: &CallId) -> Option<ClassifiedCall> {
        self.entries.remove(id).map(|e| e.call)
    }

    /// Copies payload fields that only change events delivered into `fresh`.
    ///
    /// Keys already present in `fresh` are left alone. Returns how many
    /// fields were carried over.
    pub fn carry_incremental(&self, fresh: &mut ClassifiedCall) -> usize {
        let Some(entry) = self.entries.get(fresh.call_id()) else {
            return 0;
        };
        let mut carried = 0;
        for key in &entry.incremental_keys {
            if fresh.record.payload.contains_key(key) {
                continue;
            }
            if let Some(value) = entry.call.record.payload.get(key) {
                fresh.record.payload.insert(key.clone(), value.clone());
                carried += 1;
            }
        }
        carried
    }

    /// Keeps the incremental keys of `id` from `previous` when re-inserting.
    pub(crate) fn inherit_keys(&mut self, previous: &WorkingSet, id: &CallId) {
        if let (Some(entry), Some(old)) = (self.entries.get_mut(id), previous.entries.get(id)) {
            entry
                .incremental_keys
                .extend(old.incremental_keys.iter().cloned());
        }
    }

    /// Returns the tracked call IDs.
    pub fn ids(&self) -> impl Iterator<Item = &CallId> {
        self.entries.keys()
    }

    /// Returns the calls, newest first.
    pub fn calls(&self) -> Vec<ClassifiedCall> {
        let mut calls: Vec<ClassifiedCall> = self.entries.values().map(|e| e.call.clone()).collect();
        calls.sort_by(|a, b| {
            b.record
                .created_at
                .cmp(&a.record.created_at)
                .then_with(|| a.call_id().cmp(b.call_id()))
        });
        calls
    }

    /// Computes what changed from `self` to `next`. Each list is sorted.
    pub fn diff(&self, next: &WorkingSet) -> WorkingSetDiff {
        let mut diff = WorkingSetDiff::default();
        for (id, entry) in &next.entries {
            match self.entries.get(id) {
                None => diff.added.push(id.clone()),
                Some(old) if old.call != entry.call => diff.modified.push(id.clone()),
                Some(_) => {}
            }
        }
        diff.removed = self
            .entries
            .keys()
            .filter(|id| !next.entries.contains_key(*id))
            .cloned()
            .collect();
        diff.added.sort();
        diff.removed.sort();
        diff.modified.sort();
        diff
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// A published change of the working set.
///
/// `calls` is the complete set after the change, newest first.
#[derive(Clone, Debug, Default, Serialize)]
pub struct WorkingSetUpdate {
    /// Monotonic per store; observers never see a lower version after a higher one.
    pub version: u64,
    pub added: Vec<CallId>,
    pub removed: Vec<CallId>,
    pub modified: Vec<CallId>,
    pub calls: Vec<ClassifiedCall>,
}

impl WorkingSetUpdate {
    pub(crate) fn new(version: u64, diff: WorkingSetDiff, set: &WorkingSet) -> Self {
        Self {
            version,
            added: diff.added,
            removed: diff.removed,
            modified: diff.modified,
            calls: set.calls(),
        }
    }

    /// Returns true if nothing was added, removed or modified.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livecall_core::{RawCallRecord, RawStatus, Timestamp};
    use serde_json::json;

    fn active(id: &str, created: i64) -> ClassifiedCall {
        ClassifiedCall::new(RawCallRecord::new(id, RawStatus::Active, Timestamp::from_millis(created)))
    }

    #[test]
    fn test_insert_get_remove() {
        let mut set = WorkingSet::new();
        assert!(set.insert(active("c-1", 1)).is_none());
        assert!(set.contains(&CallId::new("c-1")));
        assert_eq!(set.len(), 1);
        assert!(set.remove(&CallId::new("c-1")).is_some());
        assert!(set.is_empty());
    }

    #[test]
    fn test_calls_newest_first() {
        let mut set = WorkingSet::new();
        set.insert(active("c-old", 1));
        set.insert(active("c-new", 5));
        set.insert(active("c-mid", 3));

        let ids: Vec<_> = set.calls().iter().map(|c| c.call_id().to_string()).collect();
        assert_eq!(ids, vec!["c-new", "c-mid", "c-old"]);
    }

    #[test]
    fn test_merge_tracks_incremental_keys() {
        let mut set = WorkingSet::new();
        set.insert(active("c-1", 1));

        let mut merged = active("c-1", 1);
        merged.record.payload.insert("resumen_llamada".into(), json!("interesado"));
        assert!(set.merge(merged.clone(), ["resumen_llamada"]));
        assert!(!set.merge(merged, ["resumen_llamada"]));

        let mut fresh = active("c-1", 1);
        assert_eq!(set.carry_incremental(&mut fresh), 1);
        assert_eq!(fresh.record.payload.get("resumen_llamada"), Some(&json!("interesado")));
    }

    #[test]
    fn test_carry_incremental_prefers_snapshot_value() {
        let mut set = WorkingSet::new();
        set.insert(active("c-1", 1));
        let merged = ClassifiedCall::new(active("c-1", 1).record.with_field("resort_ofertado", json!("A")));
        set.merge(merged, ["resort_ofertado"]);

        let mut fresh = ClassifiedCall::new(active("c-1", 1).record.with_field("resort_ofertado", json!("B")));
        assert_eq!(set.carry_incremental(&mut fresh), 0);
        assert_eq!(fresh.record.payload.get("resort_ofertado"), Some(&json!("B")));
    }

    #[test]
    fn test_merge_untracked_is_noop() {
        let mut set = WorkingSet::new();
        assert!(!set.merge(active("c-1", 1), []));
        assert!(set.is_empty());
    }

    #[test]
    fn test_diff() {
        let mut before = WorkingSet::new();
        before.insert(active("c-1", 1));
        before.insert(active("c-2", 2));

        let mut after = WorkingSet::new();
        after.insert(ClassifiedCall::new(active("c-2", 2).record.with_duration(0).with_prospect("p")));
        after.insert(active("c-3", 3));

        let diff = before.diff(&after);
        assert_eq!(diff.added, vec![CallId::new("c-3")]);
        assert_eq!(diff.removed, vec![CallId::new("c-1")]);
        assert_eq!(diff.modified, vec![CallId::new("c-2")]);
        assert!(before.diff(&before).is_empty());
    }
}
