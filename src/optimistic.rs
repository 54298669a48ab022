//! Optimistic overlay: an ordered queue of speculative patches.
//!
//! Key invariants:
//! - The confirmed store is never written here; every patch is computed on
//!   a scratch copy.
//! - Patches apply in insertion order, and later patches replace earlier
//!   ones at entity-record granularity.
//! - Removing a patch replays every remaining transaction from scratch, in
//!   its original relative order, so the overlay reads as if the removed
//!   transaction never ran.

use std::borrow::Cow;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::CacheConfig;
use crate::error::{CacheResult, OptimisticError};
use crate::key::EntityKey;
use crate::store::NormalizedStore;
use crate::transaction::{collect_patch, TransactionFn};

/// Caller-chosen identifier of a pending optimistic transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OptimisticId(String);

impl OptimisticId {
    /// Wraps a caller-chosen id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random id, for callers that do not track their own.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The id as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OptimisticId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OptimisticId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for OptimisticId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// One pending speculative transaction and the records it produced.
#[derive(Clone)]
pub struct OptimisticPatch {
    /// Id the patch was recorded under.
    pub id: OptimisticId,
    /// Records the transaction replaced, relative to the effective store it ran on.
    pub data: NormalizedStore,
    /// Re-run whenever an earlier patch is removed.
    pub transaction: TransactionFn,
    /// When the transaction was first recorded. Replays keep this timestamp.
    pub recorded_at: DateTime<Utc>,
}

impl fmt::Debug for OptimisticPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimisticPatch")
            .field("id", &self.id)
            .field("keys", &self.data.sorted_keys())
            .field("recorded_at", &self.recorded_at)
            .finish_non_exhaustive()
    }
}

/// Ordered list of pending patches layered over a confirmed store.
#[derive(Debug, Clone, Default)]
pub struct OptimisticQueue {
    patches: Vec<OptimisticPatch>,
}

impl OptimisticQueue {
    /// An empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending patches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.patches.len()
    }

    /// True if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Pending patches, oldest first.
    #[must_use]
    pub fn patches(&self) -> &[OptimisticPatch] {
        &self.patches
    }

    /// True if `id` is pending.
    #[must_use]
    pub fn contains(&self, id: &OptimisticId) -> bool {
        self.patches.iter().any(|p| &p.id == id)
    }

    /// Looks up a pending patch.
    pub fn get(&self, id: &OptimisticId) -> Result<&OptimisticPatch, OptimisticError> {
        self.patches
            .iter()
            .find(|p| &p.id == id)
            .ok_or_else(|| OptimisticError::NotFound { id: id.to_string() })
    }

    /// `confirmed` with every pending patch applied in order.
    ///
    /// Borrows `confirmed` unchanged when nothing is pending.
    #[must_use]
    pub fn effective<'a>(&self, confirmed: &'a NormalizedStore) -> Cow<'a, NormalizedStore> {
        if self.patches.is_empty() {
            return Cow::Borrowed(confirmed);
        }
        let mut merged = confirmed.clone();
        for patch in &self.patches {
            merged.apply_patch(&patch.data);
        }
        Cow::Owned(merged)
    }

    /// Runs `transaction` on the current effective store and appends the result.
    ///
    /// Returns the keys the new patch carries.
    ///
    /// # Errors
    /// - `DuplicateId`: `id` is already pending
    /// - whatever `transaction` returns; nothing is recorded in that case
    pub fn record(
        &mut self,
        confirmed: &NormalizedStore,
        config: &CacheConfig,
        transaction: TransactionFn,
        id: OptimisticId,
    ) -> CacheResult<Vec<EntityKey>> {
        if self.contains(&id) {
            return Err(OptimisticError::DuplicateId { id: id.to_string() }.into());
        }

        let data = {
            let before = self.effective(confirmed);
            collect_patch(&before, config, &transaction)?
        };
        let keys: Vec<EntityKey> = data.sorted_keys().into_iter().cloned().collect();
        debug!(id = %id, keys = keys.len(), "optimistic patch recorded");

        self.patches.push(OptimisticPatch {
            id,
            data,
            transaction,
            recorded_at: Utc::now(),
        });
        Ok(keys)
    }

    /// Drops the patch with `id` and replays the rest on top of `confirmed`.
    ///
    /// Returns true if a patch was removed. A replay that fails keeps its
    /// slot with empty data so it can still be removed by id later.
    pub fn remove(&mut self, confirmed: &NormalizedStore, config: &CacheConfig, id: &OptimisticId) -> bool {
        let before = self.patches.len();
        let remaining: Vec<OptimisticPatch> = std::mem::take(&mut self.patches)
            .into_iter()
            .filter(|p| &p.id != id)
            .collect();
        let removed = remaining.len() != before;

        self.replay(confirmed, config, remaining);
        debug!(id = %id, removed, pending = self.patches.len(), "optimistic patch removed");
        removed
    }

    fn replay(&mut self, confirmed: &NormalizedStore, config: &CacheConfig, pending: Vec<OptimisticPatch>) {
        for mut patch in pending {
            let result = {
                let before = self.effective(confirmed);
                collect_patch(&before, config, &patch.transaction)
            };
            patch.data = match result {
                Ok(data) => data,
                Err(err) => {
                    warn!(id = %patch.id, error = %err, "optimistic transaction failed on replay");
                    NormalizedStore::new()
                }
            };
            self.patches.push(patch);
        }
    }

    /// Drops every pending patch.
    pub fn clear(&mut self) {
        self.patches.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Document, Field, Variables};
    use crate::error::{CacheError, CallbackError};
    use crate::transaction::{transaction_fn, CacheTransaction};
    use crate::value::StoreValue;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter_doc() -> Document {
        Document::builder()
            .field(Field::new("counter").select("__typename").select("id").select("n"))
            .build()
            .unwrap()
    }

    fn write_counter(tx: &mut CacheTransaction<'_>, n: i64) -> CacheResult<()> {
        tx.write_query(
            &counter_doc(),
            &Variables::new(),
            json!({"counter": {"__typename": "Counter", "id": 1, "n": n}}),
        )
    }

    /// Reads the current counter and adds `by`; depends on the effective store.
    fn increment(by: i64) -> TransactionFn {
        transaction_fn(move |tx| {
            let current = tx
                .read_query(&counter_doc(), &Variables::new())
                .ok()
                .and_then(|v| v["counter"]["n"].as_i64())
                .unwrap_or(0);
            write_counter(tx, current + by)
        })
    }

    fn counter(store: &NormalizedStore) -> Option<Value> {
        store
            .get(&EntityKey::from("Counter:1"))
            .and_then(|r| r.get("n"))
            .and_then(StoreValue::as_scalar)
            .cloned()
    }

    #[test]
    fn empty_queue_borrows_confirmed() {
        let confirmed = NormalizedStore::new();
        let queue = OptimisticQueue::new();
        assert!(matches!(queue.effective(&confirmed), Cow::Borrowed(_)));
    }

    #[test]
    fn later_patch_wins() {
        let config = CacheConfig::default();
        let confirmed = NormalizedStore::new();
        let mut queue = OptimisticQueue::new();
        queue
            .record(&confirmed, &config, transaction_fn(|tx| write_counter(tx, 1)), "m1".into())
            .unwrap();
        queue
            .record(&confirmed, &config, transaction_fn(|tx| write_counter(tx, 2)), "m2".into())
            .unwrap();

        assert_eq!(counter(&queue.effective(&confirmed)), Some(json!(2)));
        assert!(confirmed.is_empty());
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let config = CacheConfig::default();
        let confirmed = NormalizedStore::new();
        let mut queue = OptimisticQueue::new();
        queue.record(&confirmed, &config, increment(1), "m1".into()).unwrap();
        let err = queue.record(&confirmed, &config, increment(1), "m1".into()).unwrap_err();
        assert_eq!(
            err,
            CacheError::Optimistic(OptimisticError::DuplicateId { id: "m1".to_string() })
        );
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn remove_replays_remaining_in_order() {
        let config = CacheConfig::default();
        let confirmed = NormalizedStore::new();
        let mut queue = OptimisticQueue::new();
        queue.record(&confirmed, &config, increment(1), "a".into()).unwrap();
        queue.record(&confirmed, &config, increment(10), "b".into()).unwrap();
        queue.record(&confirmed, &config, increment(100), "c".into()).unwrap();
        assert_eq!(counter(&queue.effective(&confirmed)), Some(json!(111)));

        assert!(queue.remove(&confirmed, &config, &"a".into()));
        assert_eq!(counter(&queue.effective(&confirmed)), Some(json!(110)));
        let ids: Vec<_> = queue.patches().iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);

        assert!(!queue.remove(&confirmed, &config, &"zzz".into()));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn replay_reexecutes_transactions() {
        let config = CacheConfig::default();
        let confirmed = NormalizedStore::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&runs);
        let mut queue = OptimisticQueue::new();
        queue.record(&confirmed, &config, increment(1), "a".into()).unwrap();
        queue
            .record(
                &confirmed,
                &config,
                transaction_fn(move |tx| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    write_counter(tx, 5)
                }),
                "b".into(),
            )
            .unwrap();
        queue.remove(&confirmed, &config, &"a".into());
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_first_run_records_nothing() {
        let config = CacheConfig::default();
        let confirmed = NormalizedStore::new();
        let mut queue = OptimisticQueue::new();
        let err = queue
            .record(
                &confirmed,
                &config,
                transaction_fn(|_| Err(CallbackError::new("bad").into())),
                "x".into(),
            )
            .unwrap_err();
        assert!(err.is_callback());
        assert!(queue.is_empty());
    }

    #[test]
    fn failed_replay_keeps_empty_slot() {
        let config = CacheConfig::default();
        let confirmed = NormalizedStore::new();
        let mut queue = OptimisticQueue::new();
        queue
            .record(&confirmed, &config, transaction_fn(|tx| write_counter(tx, 1)), "a".into())
            .unwrap();
        // Succeeds only while "a" is visible.
        queue
            .record(
                &confirmed,
                &config,
                transaction_fn(|tx| {
                    tx.read_query(&counter_doc(), &Variables::new())?;
                    write_counter(tx, 9)
                }),
                "b".into(),
            )
            .unwrap();

        queue.remove(&confirmed, &config, &"a".into());
        let b = queue.get(&"b".into()).unwrap();
        assert!(b.data.is_empty());
        assert!(queue.remove(&confirmed, &config, &"b".into()));
        assert!(queue.is_empty());
    }

    #[test]
    fn patch_holds_only_changed_records() {
        let config = CacheConfig::default();
        let mut confirmed = NormalizedStore::new();
        {
            let mut tx = CacheTransaction::new(&mut confirmed, &config);
            write_counter(&mut tx, 1).unwrap();
        }
        let mut queue = OptimisticQueue::new();
        let keys = queue
            .record(&confirmed, &config, transaction_fn(|tx| write_counter(tx, 2)), "m".into())
            .unwrap();
        assert_eq!(keys, vec![EntityKey::from("Counter:1")]);
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(OptimisticId::generate(), OptimisticId::generate());
    }
}
