//! The normalized store: entity key -> entity record.
//!
//! Key invariants:
//! - Records are held behind `Arc` and never mutated in place once shared.
//!   A write builds a new record and swaps the `Arc`, so "did this entity
//!   change" is a pointer comparison (`Arc::ptr_eq`), not a deep comparison.
//! - Cloning a store is cheap (it clones `Arc`s) and the clone is fully
//!   independent: writes to either side never show through to the other.
//! - The store never fabricates a record for a dangling reference.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::key::EntityKey;
use crate::record::EntityRecord;

/// Flat mapping from [`EntityKey`] to [`EntityRecord`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizedStore {
    records: HashMap<EntityKey, Arc<EntityRecord>>,
}

impl NormalizedStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The record stored under `key`.
    #[must_use]
    pub fn get(&self, key: &EntityKey) -> Option<&EntityRecord> {
        self.records.get(key).map(AsRef::as_ref)
    }

    /// Returns the shared handle for a record, for identity comparisons.
    #[must_use]
    pub fn get_shared(&self, key: &EntityKey) -> Option<&Arc<EntityRecord>> {
        self.records.get(key)
    }

    /// True if a record is stored under `key`.
    #[must_use]
    pub fn contains(&self, key: &EntityKey) -> bool {
        self.records.contains_key(key)
    }

    /// Inserts a record unconditionally.
    pub fn insert(&mut self, key: EntityKey, record: EntityRecord) {
        self.records.insert(key, Arc::new(record));
    }

    /// Inserts an already shared record without copying it.
    pub fn insert_shared(&mut self, key: EntityKey, record: Arc<EntityRecord>) {
        self.records.insert(key, record);
    }

    /// Replaces the record at `key` only if its contents differ.
    ///
    /// Returns true if the store changed. Writing an identical record keeps
    /// the existing `Arc`, so repeated writes are invisible to patch collection.
    pub fn replace_if_changed(&mut self, key: EntityKey, record: EntityRecord) -> bool {
        match self.records.get(&key) {
            Some(existing) if **existing == record => false,
            _ => {
                self.records.insert(key, Arc::new(record));
                true
            }
        }
    }

    /// Removes and returns the record under `key`.
    pub fn remove(&mut self, key: &EntityKey) -> Option<Arc<EntityRecord>> {
        self.records.remove(key)
    }

    /// Removes every record.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if no records are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Keys in no particular order.
    pub fn keys(&self) -> impl Iterator<Item = &EntityKey> {
        self.records.keys()
    }

    /// Records in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&EntityKey, &EntityRecord)> {
        self.records.iter().map(|(k, v)| (k, v.as_ref()))
    }

    /// Keys in sorted order, for deterministic output.
    #[must_use]
    pub fn sorted_keys(&self) -> Vec<&EntityKey> {
        let mut keys: Vec<_> = self.records.keys().collect();
        keys.sort();
        keys
    }

    /// Overlays `patch` on top of this store at entity-key granularity.
    ///
    /// A record in the patch fully replaces the record with the same key;
    /// fields are never merged.
    pub fn apply_patch(&mut self, patch: &Self) {
        for (key, record) in &patch.records {
            self.records.insert(key.clone(), Arc::clone(record));
        }
    }

    /// Collects the records of `self` whose handle differs from `before`.
    ///
    /// Keys present only in `before` are not reported: removing a record is
    /// not something a patch can express.
    #[must_use]
    pub fn changed_since(&self, before: &Self) -> Self {
        let records = self
            .records
            .iter()
            .filter(|(key, record)| {
                before
                    .records
                    .get(*key)
                    .map_or(true, |prev| !Arc::ptr_eq(prev, record))
            })
            .map(|(key, record)| (key.clone(), Arc::clone(record)))
            .collect();
        Self { records }
    }

    /// Copies every record into a fresh allocation.
    ///
    /// The result shares nothing with `self`; every record compares unequal
    /// by identity.
    #[must_use]
    pub fn deep_copy(&self) -> Self {
        let records = self
            .records
            .iter()
            .map(|(key, record)| (key.clone(), Arc::new(EntityRecord::clone(record))))
            .collect();
        Self { records }
    }

    /// Stable content digest of the store.
    ///
    /// Equal stores always produce equal fingerprints, regardless of
    /// insertion order or record sharing.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for key in self.sorted_keys() {
            hasher.update(key.as_str().as_bytes());
            hasher.update(&[0]);
            if let Some(record) = self.records.get(key) {
                // Records serialize as sorted maps of plain data.
                let encoded = serde_json::to_vec(record.as_ref()).unwrap_or_default();
                hasher.update(&encoded);
            }
            hasher.update(&[0xff]);
        }
        hasher.finalize().to_hex().to_string()
    }
}

impl FromIterator<(EntityKey, EntityRecord)> for NormalizedStore {
    fn from_iter<I: IntoIterator<Item = (EntityKey, EntityRecord)>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().map(|(k, v)| (k, Arc::new(v))).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::StoreValue;

    fn record(name: &str) -> EntityRecord {
        [("name", StoreValue::from(name))].into_iter().collect()
    }

    #[test]
    fn replace_if_changed_keeps_identity_on_equal_record() {
        let mut store = NormalizedStore::new();
        let key = EntityKey::from("User:1");
        assert!(store.replace_if_changed(key.clone(), record("a")));
        let before = Arc::clone(store.get_shared(&key).unwrap());

        assert!(!store.replace_if_changed(key.clone(), record("a")));
        assert!(Arc::ptr_eq(&before, store.get_shared(&key).unwrap()));

        assert!(store.replace_if_changed(key.clone(), record("b")));
        assert!(!Arc::ptr_eq(&before, store.get_shared(&key).unwrap()));
    }

    #[test]
    fn clone_is_independent() {
        let mut a = NormalizedStore::new();
        a.insert(EntityKey::from("User:1"), record("a"));
        let mut b = a.clone();
        b.replace_if_changed(EntityKey::from("User:1"), record("b"));
        assert_eq!(a.get(&EntityKey::from("User:1")), Some(&record("a")));
        assert_eq!(b.get(&EntityKey::from("User:1")), Some(&record("b")));
    }

    #[test]
    fn changed_since_reports_replaced_and_new_records() {
        let mut before = NormalizedStore::new();
        before.insert(EntityKey::from("A"), record("a"));
        before.insert(EntityKey::from("B"), record("b"));

        let mut after = before.clone();
        after.replace_if_changed(EntityKey::from("B"), record("b2"));
        after.insert(EntityKey::from("C"), record("c"));
        after.remove(&EntityKey::from("A"));

        let patch = after.changed_since(&before);
        let mut keys: Vec<_> = patch.keys().map(EntityKey::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["B", "C"]);
    }

    #[test]
    fn deep_copy_breaks_identity() {
        let mut store = NormalizedStore::new();
        store.insert(EntityKey::from("A"), record("a"));
        let copy = store.deep_copy();
        assert_eq!(copy, store);
        assert_eq!(copy.changed_since(&store).len(), 1);
    }

    #[test]
    fn apply_patch_replaces_whole_records() {
        let mut base = NormalizedStore::new();
        let mut full = record("a");
        full.insert("age", StoreValue::from(3));
        base.insert(EntityKey::from("A"), full);

        let mut patch = NormalizedStore::new();
        patch.insert(EntityKey::from("A"), record("z"));
        base.apply_patch(&patch);

        let merged = base.get(&EntityKey::from("A")).unwrap();
        assert_eq!(merged, &record("z"));
        assert!(!merged.contains("age"));
    }

    #[test]
    fn fingerprint_is_content_based() {
        let mut a = NormalizedStore::new();
        a.insert(EntityKey::from("A"), record("a"));
        a.insert(EntityKey::from("B"), record("b"));

        let mut b = NormalizedStore::new();
        b.insert(EntityKey::from("B"), record("b"));
        b.insert(EntityKey::from("A"), record("a"));

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), a.deep_copy().fingerprint());

        b.replace_if_changed(EntityKey::from("B"), record("c"));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn serde_round_trip() {
        let mut store = NormalizedStore::new();
        store.insert(EntityKey::from("User:1"), record("a"));
        let json = serde_json::to_string(&store).unwrap();
        let back: NormalizedStore = serde_json::from_str(&json).unwrap();
        assert_eq!(back, store);
    }
}
