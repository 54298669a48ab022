//! The in-memory cache facade.
//!
//! [`InMemoryCache`] owns the confirmed store, the optimistic queue and the
//! event hub. It is an explicitly owned object: there is no global state, and
//! every operation runs to completion on the caller's thread.

use std::borrow::Cow;

use serde_json::Value;
use tracing::debug;

use crate::config::CacheConfig;
use crate::document::{Document, Variables};
use crate::error::CacheResult;
use crate::events::{CacheEvent, CacheEvents, EventHub};
use crate::key::EntityKey;
use crate::normalize::CacheWrite;
use crate::optimistic::{OptimisticId, OptimisticPatch, OptimisticQueue};
use crate::read::{diff_query_against_store, read_query_from_store, DiffResult, ReadRequest};
use crate::store::NormalizedStore;
use crate::transaction::{CacheTransaction, TransactionFn};

/// Normalized cache with an optimistic overlay.
#[derive(Debug)]
pub struct InMemoryCache {
    data: NormalizedStore,
    config: CacheConfig,
    optimistic: OptimisticQueue,
    events: EventHub,
}

impl InMemoryCache {
    /// Creates an empty cache.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if `config` does not validate.
    pub fn new(config: CacheConfig) -> CacheResult<Self> {
        Self::with_initial_store(config, NormalizedStore::new())
    }

    /// Creates a cache seeded with `store`, e.g. one restored from a snapshot.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if `config` does not validate.
    pub fn with_initial_store(config: CacheConfig, store: NormalizedStore) -> CacheResult<Self> {
        config.validate()?;
        let events = EventHub::new(config.event_capacity);
        Ok(Self {
            data: store,
            config,
            optimistic: OptimisticQueue::new(),
            events,
        })
    }

    /// The configuration the cache was built with.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The confirmed store.
    #[must_use]
    pub fn data(&self) -> &NormalizedStore {
        &self.data
    }

    /// Replaces the confirmed store. Pending optimistic patches are kept as they are.
    pub fn set_data(&mut self, data: NormalizedStore) {
        self.data = data;
        self.events.publish(&CacheEvent::Replaced);
    }

    /// Empties the confirmed store and drops every pending optimistic patch.
    pub fn reset(&mut self) {
        self.data.clear();
        self.optimistic.clear();
        debug!("cache reset");
        self.events.publish(&CacheEvent::Reset);
    }

    /// Replaces the confirmed store with `transform(store)`.
    pub fn apply_transformer<F>(&mut self, transform: F)
    where
        F: FnOnce(NormalizedStore) -> NormalizedStore,
    {
        let current = std::mem::take(&mut self.data);
        self.data = transform(current);
        self.events.publish(&CacheEvent::Replaced);
    }

    /// Normalizes one result into the confirmed store.
    ///
    /// # Errors
    /// Returns a write error if the result does not fit the document. The
    /// store is left exactly as it was.
    pub fn write_result(&mut self, write: &CacheWrite) -> CacheResult<()> {
        self.execute_writes(std::slice::from_ref(write))
    }

    /// Applies writes in order.
    ///
    /// Each write is all-or-nothing, but a failing write does not roll back
    /// the ones before it. Use [`InMemoryCache::perform_transaction`] for that.
    ///
    /// # Errors
    /// Returns the first write error; later writes are not attempted.
    pub fn execute_writes(&mut self, writes: &[CacheWrite]) -> CacheResult<()> {
        let mut tx = CacheTransaction::new(&mut self.data, &self.config);
        let result = tx.execute_writes(writes);
        let keys = tx.changed_keys();
        self.publish_written(keys);
        result
    }

    /// Runs `transaction` against the confirmed store.
    ///
    /// The transaction works on a copy-on-write scratch store that replaces
    /// the confirmed store only when the transaction succeeds.
    ///
    /// # Errors
    /// Whatever `transaction` returns; the confirmed store is untouched in that case.
    pub fn perform_transaction<F>(&mut self, transaction: F) -> CacheResult<()>
    where
        F: FnOnce(&mut CacheTransaction<'_>) -> CacheResult<()>,
    {
        let mut scratch = self.data.clone();
        let keys = {
            let mut tx = CacheTransaction::new(&mut scratch, &self.config);
            transaction(&mut tx)?;
            tx.changed_keys()
        };
        self.data = scratch;
        self.publish_written(keys);
        Ok(())
    }

    /// Runs `transaction` on the effective store and records its effect as
    /// an optimistic patch under `id`.
    ///
    /// # Errors
    /// - `DuplicateId` if `id` is already pending
    /// - whatever `transaction` returns; no patch is recorded in that case
    pub fn perform_optimistic_transaction(
        &mut self,
        transaction: TransactionFn,
        id: impl Into<OptimisticId>,
    ) -> CacheResult<()> {
        let id = id.into();
        let keys = self
            .optimistic
            .record(&self.data, &self.config, transaction, id.clone())?;
        self.events.publish(&CacheEvent::OptimisticRecorded { id, keys });
        Ok(())
    }

    /// Drops the optimistic patch `id` and replays the remaining ones.
    ///
    /// Unknown ids are ignored. Returns true if a patch was removed.
    pub fn remove_optimistic(&mut self, id: impl Into<OptimisticId>) -> bool {
        let id = id.into();
        let removed = self.optimistic.remove(&self.data, &self.config, &id);
        if removed {
            self.events.publish(&CacheEvent::OptimisticRemoved { id });
        }
        removed
    }

    /// The confirmed store with every pending patch applied in order.
    ///
    /// Borrows the confirmed store when nothing is pending.
    #[must_use]
    pub fn optimistic_data(&self) -> Cow<'_, NormalizedStore> {
        self.optimistic.effective(&self.data)
    }

    /// Pending optimistic patches, oldest first.
    #[must_use]
    pub fn optimistic_queue(&self) -> &OptimisticQueue {
        &self.optimistic
    }

    /// The pending patch recorded under `id`.
    ///
    /// # Errors
    /// `NotFound` if nothing is pending under `id`.
    pub fn optimistic_patch(&self, id: impl Into<OptimisticId>) -> CacheResult<&OptimisticPatch> {
        Ok(self.optimistic.get(&id.into())?)
    }

    /// Diffs a query against the confirmed store.
    ///
    /// # Errors
    /// A `Miss` when `return_partial_data` is false and something is missing,
    /// or a document error such as an unknown fragment.
    pub fn diff_query(
        &self,
        document: &Document,
        variables: &Variables,
        return_partial_data: bool,
    ) -> CacheResult<DiffResult> {
        let request = ReadRequest::new(document, variables).return_partial_data(return_partial_data);
        Ok(diff_query_against_store(&self.data, &self.config, &request)?)
    }

    /// Same as [`InMemoryCache::diff_query`] but against the effective store.
    pub fn diff_query_optimistic(
        &self,
        document: &Document,
        variables: &Variables,
        return_partial_data: bool,
    ) -> CacheResult<DiffResult> {
        let request = ReadRequest::new(document, variables).return_partial_data(return_partial_data);
        Ok(diff_query_against_store(&self.optimistic_data(), &self.config, &request)?)
    }

    /// Reads a complete result rooted at `root` from the confirmed store.
    ///
    /// # Errors
    /// A `Miss` if any selected field is absent.
    pub fn read_query(&self, root: EntityKey, document: &Document, variables: &Variables) -> CacheResult<Value> {
        let request = ReadRequest::new(document, variables).root(root);
        Ok(read_query_from_store(&self.data, &self.config, &request)?.unwrap_or(Value::Null))
    }

    /// Like [`InMemoryCache::read_query`], against the effective store.
    pub fn read_query_optimistic(
        &self,
        root: EntityKey,
        document: &Document,
        variables: &Variables,
    ) -> CacheResult<Value> {
        let request = ReadRequest::new(document, variables).root(root);
        let effective = self.optimistic_data();
        Ok(read_query_from_store(&effective, &self.config, &request)?.unwrap_or(Value::Null))
    }

    /// Reads one fragment of `document` from the record at `id` in the
    /// effective store. `None` when there is no such record.
    pub fn read_fragment(
        &self,
        id: EntityKey,
        document: &Document,
        fragment_name: Option<&str>,
        variables: &Variables,
    ) -> CacheResult<Option<Value>> {
        let fragment_doc = document.fragment_document(fragment_name)?;
        let request = ReadRequest::new(&fragment_doc, variables)
            .root(id)
            .null_if_id_not_found(true);
        let effective = self.optimistic_data();
        Ok(read_query_from_store(&effective, &self.config, &request)?)
    }

    /// Registers a new change subscriber.
    pub fn subscribe(&mut self) -> CacheEvents {
        self.events.subscribe()
    }

    fn publish_written(&mut self, keys: Vec<EntityKey>) {
        if keys.is_empty() {
            return;
        }
        debug!(keys = keys.len(), "confirmed records written");
        self.events.publish(&CacheEvent::Written { keys });
    }
}
