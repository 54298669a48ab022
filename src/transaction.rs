//! Transaction handles and patch collection.
//!
//! Caller-supplied logic never touches a store directly. It receives a
//! narrow capability handle: [`CacheTransaction`] for transactions (reads
//! and writes go straight to the store the transaction owns) and
//! [`DataProxy`] for update callbacks (writes are recorded as discrete
//! [`CacheWrite`]s and applied by the caller afterwards, in order).

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;

use crate::config::CacheConfig;
use crate::document::{Document, Variables};
use crate::error::CacheResult;
use crate::key::EntityKey;
use crate::normalize::{write_result_to_store, CacheWrite};
use crate::read::{diff_query_against_store, read_query_from_store, DiffResult, ReadRequest};
use crate::store::NormalizedStore;

/// A re-runnable transaction body.
///
/// Optimistic transactions are replayed whenever an earlier patch is
/// removed, so the body must only act through the handle it is given.
pub type TransactionFn = Arc<dyn Fn(&mut CacheTransaction<'_>) -> CacheResult<()> + Send + Sync>;

/// Wraps a closure as a [`TransactionFn`].
pub fn transaction_fn<F>(f: F) -> TransactionFn
where
    F: Fn(&mut CacheTransaction<'_>) -> CacheResult<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Write handle over one store, owned by a running transaction.
pub struct CacheTransaction<'a> {
    store: &'a mut NormalizedStore,
    config: &'a CacheConfig,
    changed: BTreeSet<EntityKey>,
}

impl<'a> CacheTransaction<'a> {
    /// Opens a handle over `store`.
    pub fn new(store: &'a mut NormalizedStore, config: &'a CacheConfig) -> Self {
        Self {
            store,
            config,
            changed: BTreeSet::new(),
        }
    }

    /// The store as this transaction currently sees it.
    #[must_use]
    pub fn store(&self) -> &NormalizedStore {
        self.store
    }

    /// Configuration the transaction runs with.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        self.config
    }

    /// Keys whose records this handle replaced so far.
    #[must_use]
    pub fn changed_keys(&self) -> Vec<EntityKey> {
        self.changed.iter().cloned().collect()
    }

    /// Normalizes one result into the store.
    pub fn write_result(&mut self, write: &CacheWrite) -> CacheResult<()> {
        let changed = write_result_to_store(
            self.store,
            &write.root,
            &write.result,
            &write.document,
            &write.variables,
            self.config,
        )?;
        self.changed.extend(changed);
        Ok(())
    }

    /// Applies writes in order. A failing write stops the batch; earlier
    /// writes stay applied.
    pub fn execute_writes(&mut self, writes: &[CacheWrite]) -> CacheResult<()> {
        for write in writes {
            self.write_result(write)?;
        }
        Ok(())
    }

    /// Writes `result` as the answer to `document` under the query root.
    pub fn write_query(&mut self, document: &Document, variables: &Variables, result: Value) -> CacheResult<()> {
        self.write_result(&CacheWrite::query(document.clone(), variables.clone(), result))
    }

    /// Writes `result` into the record at `id`, shaped by one fragment of `document`.
    pub fn write_fragment(
        &mut self,
        id: EntityKey,
        document: &Document,
        fragment_name: Option<&str>,
        variables: &Variables,
        result: Value,
    ) -> CacheResult<()> {
        let fragment_doc = document.fragment_document(fragment_name)?;
        self.write_result(&CacheWrite {
            root: id,
            result,
            document: fragment_doc,
            variables: variables.clone(),
        })
    }

    /// Reads a query that must be complete.
    pub fn read_query(&self, document: &Document, variables: &Variables) -> CacheResult<Value> {
        let request = ReadRequest::new(document, variables);
        let result = read_query_from_store(self.store, self.config, &request)?;
        Ok(result.unwrap_or(Value::Null))
    }

    /// Reads one fragment from the record at `id`; `None` if there is no such record.
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
        Ok(read_query_from_store(self.store, self.config, &request)?)
    }

    /// Diffs `document` against the transaction's store.
    pub fn diff_query(
        &self,
        document: &Document,
        variables: &Variables,
        return_partial_data: bool,
    ) -> CacheResult<DiffResult> {
        let request = ReadRequest::new(document, variables).return_partial_data(return_partial_data);
        Ok(diff_query_against_store(self.store, self.config, &request)?)
    }

    /// Swaps in a whole new store, e.g. the output of a reducer.
    pub(crate) fn replace_store(&mut self, next: NormalizedStore) {
        let changed = next.changed_since(self.store);
        self.changed.extend(changed.keys().cloned());
        *self.store = next;
    }
}

/// Runs `transaction` against a scratch copy of `before` and returns the
/// records it replaced.
///
/// The scratch copy shares records with `before` until the transaction
/// writes them, so an unchanged record keeps its identity and only the
/// records the transaction actually replaced end up in the patch. `before`
/// itself is never touched.
pub fn collect_patch(
    before: &NormalizedStore,
    config: &CacheConfig,
    transaction: &TransactionFn,
) -> CacheResult<NormalizedStore> {
    let mut scratch = before.clone();
    {
        let mut tx = CacheTransaction::new(&mut scratch, config);
        transaction(&mut tx)?;
    }
    Ok(scratch.changed_since(before))
}

/// Recording handle passed to update callbacks.
///
/// Reads see the underlying store plus every write made through this proxy.
/// Writes are recorded in order and handed back by [`DataProxy::finish`].
pub struct DataProxy<'a> {
    store: NormalizedStore,
    config: &'a CacheConfig,
    writes: Vec<CacheWrite>,
}

impl<'a> DataProxy<'a> {
    /// A proxy over a private copy of `store`.
    #[must_use]
    pub fn new(store: &NormalizedStore, config: &'a CacheConfig) -> Self {
        Self {
            store: store.clone(),
            config,
            writes: Vec::new(),
        }
    }

    /// Reads `document` from the query root.
    pub fn read_query(&self, document: &Document, variables: &Variables) -> CacheResult<Value> {
        let request = ReadRequest::new(document, variables);
        Ok(read_query_from_store(&self.store, self.config, &request)?.unwrap_or(Value::Null))
    }

    /// Reads a fragment rooted at `id`; `None` if `id` is absent.
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
        Ok(read_query_from_store(&self.store, self.config, &request)?)
    }

    /// Records a write under the query root.
    pub fn write_query(&mut self, document: &Document, variables: &Variables, result: Value) -> CacheResult<()> {
        self.record(CacheWrite::query(document.clone(), variables.clone(), result))
    }

    /// Records a fragment write rooted at `id`.
    pub fn write_fragment(
        &mut self,
        id: EntityKey,
        document: &Document,
        fragment_name: Option<&str>,
        variables: &Variables,
        result: Value,
    ) -> CacheResult<()> {
        let fragment_doc = document.fragment_document(fragment_name)?;
        self.record(CacheWrite {
            root: id,
            result,
            document: fragment_doc,
            variables: variables.clone(),
        })
    }

    fn record(&mut self, write: CacheWrite) -> CacheResult<()> {
        write_result_to_store(
            &mut self.store,
            &write.root,
            &write.result,
            &write.document,
            &write.variables,
            self.config,
        )?;
        self.writes.push(write);
        Ok(())
    }

    /// The recorded writes, in the order they were made.
    #[must_use]
    pub fn finish(self) -> Vec<CacheWrite> {
        self.writes
    }
}
