//! Result ingestion: query, subscription and mutation results.
//!
//! This is the layer a fetching client drives. It turns server results into
//! cache writes, runs the caller's reducers and update callbacks, and maps a
//! mutation's optimistic response onto an optimistic transaction keyed by
//! the mutation id.
//!
//! Caller-supplied reducers and callbacks never abort ingestion. A failing
//! one is logged and its effect is skipped for that invocation.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::InMemoryCache;
use crate::document::{Document, Variables};
use crate::error::{CacheResult, CallbackError};
use crate::key::EntityKey;
use crate::normalize::CacheWrite;
use crate::optimistic::OptimisticId;
use crate::store::NormalizedStore;
use crate::transaction::{transaction_fn, CacheTransaction, DataProxy};

/// A server response: data plus any errors it reported.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Result tree; `None` when the request failed outright.
    #[serde(default)]
    pub data: Option<Value>,
    /// Errors as the server reported them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<Value>,
}

impl ExecutionResult {
    /// A successful result carrying `data`.
    #[must_use]
    pub fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            errors: Vec::new(),
        }
    }

    /// Adds a reported error.
    #[must_use]
    pub fn with_error(mut self, error: Value) -> Self {
        self.errors.push(error);
        self
    }

    /// True if the server reported any error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// The event an extra reducer is reacting to.
#[derive(Debug, Clone, Copy)]
pub enum CacheAction<'a> {
    /// A query result arrived.
    QueryResult {
        /// Id of the watched query.
        query_id: &'a str,
        /// Request counter, for ordering results.
        request_id: u64,
        /// The server response.
        result: &'a ExecutionResult,
        /// The query document.
        document: &'a Document,
        /// Query variables.
        variables: &'a Variables,
    },
    /// A subscription pushed a result.
    SubscriptionResult {
        /// Id of the subscription.
        subscription_id: u64,
        /// The server response.
        result: &'a ExecutionResult,
        /// The subscription document.
        document: &'a Document,
        /// Subscription variables.
        variables: &'a Variables,
    },
    /// A mutation result arrived.
    MutationResult {
        /// Id of the mutation.
        mutation_id: &'a str,
        /// The server response.
        result: &'a ExecutionResult,
        /// The mutation document.
        document: &'a Document,
        /// Mutation variables.
        variables: &'a Variables,
    },
}

impl CacheAction<'_> {
    /// Operation name of the document behind this action.
    #[must_use]
    pub fn operation_name(&self) -> Option<&str> {
        match self {
            Self::QueryResult { document, .. }
            | Self::SubscriptionResult { document, .. }
            | Self::MutationResult { document, .. } => document.operation_name(),
        }
    }
}

/// Whole-store reducer run after a result has been written.
pub type CacheReducer =
    Arc<dyn Fn(&NormalizedStore, &CacheAction<'_>) -> Result<NormalizedStore, CallbackError> + Send + Sync>;

/// Wraps a closure as a [`CacheReducer`].
pub fn cache_reducer<F>(f: F) -> CacheReducer
where
    F: Fn(&NormalizedStore, &CacheAction<'_>) -> Result<NormalizedStore, CallbackError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// What a query reducer gets to see besides the current query result.
#[derive(Debug, Clone, Copy)]
pub struct QueryReducerContext<'a> {
    /// The mutation response.
    pub mutation_result: &'a ExecutionResult,
    /// Operation name of the query being updated.
    pub query_name: Option<&'a str>,
    /// Variables the query was watched with.
    pub query_variables: &'a Variables,
}

/// Maps a query's current result to its next one. `None` leaves it alone.
pub type QueryReducer =
    Arc<dyn Fn(&Value, &QueryReducerContext<'_>) -> Result<Option<Value>, CallbackError> + Send + Sync>;

/// Update callback run with a recording proxy after a mutation result lands.
pub type UpdateFn = Arc<dyn Fn(&mut DataProxy<'_>, &ExecutionResult) -> CacheResult<()> + Send + Sync>;

/// A watched query to rewrite when a mutation result arrives.
#[derive(Clone)]
pub struct QueryUpdate {
    /// Id of the watched query.
    pub query_id: String,
    /// The watched query's document.
    pub document: Document,
    /// The watched query's variables.
    pub variables: Variables,
    /// Computes the query's next result.
    pub reducer: QueryReducer,
}

impl QueryUpdate {
    /// A reducer for watched query `query_id`.
    pub fn new<F>(query_id: impl Into<String>, document: Document, variables: Variables, reducer: F) -> Self
    where
        F: Fn(&Value, &QueryReducerContext<'_>) -> Result<Option<Value>, CallbackError> + Send + Sync + 'static,
    {
        Self {
            query_id: query_id.into(),
            document,
            variables,
            reducer: Arc::new(reducer),
        }
    }
}

impl fmt::Debug for QueryUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryUpdate")
            .field("query_id", &self.query_id)
            .field("operation", &self.document.operation_name())
            .finish_non_exhaustive()
    }
}

/// A mutation and everything that reacts to its result.
#[derive(Clone)]
pub struct Mutation {
    /// Caller-assigned id, also used as the optimistic id.
    pub mutation_id: String,
    /// The mutation document.
    pub document: Document,
    /// Mutation variables.
    pub variables: Variables,
    /// Watched queries to rewrite with the result.
    pub update_queries: Vec<QueryUpdate>,
    /// Callback run against a recording proxy.
    pub update: Option<UpdateFn>,
    /// Reducers run over the whole store afterwards.
    pub extra_reducers: Vec<CacheReducer>,
}

impl Mutation {
    /// A mutation with no reactions attached.
    #[must_use]
    pub fn new(mutation_id: impl Into<String>, document: Document, variables: Variables) -> Self {
        Self {
            mutation_id: mutation_id.into(),
            document,
            variables,
            update_queries: Vec::new(),
            update: None,
            extra_reducers: Vec::new(),
        }
    }

    /// Rewrites a watched query when the result lands.
    #[must_use]
    pub fn update_query(mut self, update: QueryUpdate) -> Self {
        self.update_queries.push(update);
        self
    }

    /// Sets the update callback.
    #[must_use]
    pub fn update<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut DataProxy<'_>, &ExecutionResult) -> CacheResult<()> + Send + Sync + 'static,
    {
        self.update = Some(Arc::new(f));
        self
    }

    /// Adds a reducer run over the whole store.
    #[must_use]
    pub fn extra_reducer(mut self, reducer: CacheReducer) -> Self {
        self.extra_reducers.push(reducer);
        self
    }
}

impl fmt::Debug for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutation")
            .field("mutation_id", &self.mutation_id)
            .field("update_queries", &self.update_queries)
            .field("update", &self.update.is_some())
            .field("extra_reducers", &self.extra_reducers.len())
            .finish_non_exhaustive()
    }
}

/// Optimistic response for a mutation, fixed or computed from its variables.
#[derive(Clone)]
pub enum OptimisticResponse {
    /// A fixed response.
    Value(Value),
    /// A response computed from the mutation variables.
    Computed(Arc<dyn Fn(&Variables) -> Value + Send + Sync>),
}

impl OptimisticResponse {
    /// A response computed from the mutation variables.
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(&Variables) -> Value + Send + Sync + 'static,
    {
        Self::Computed(Arc::new(f))
    }

    /// The response for `variables`.
    #[must_use]
    pub fn resolve(&self, variables: &Variables) -> Value {
        match self {
            Self::Value(value) => value.clone(),
            Self::Computed(f) => f(variables),
        }
    }
}

impl fmt::Debug for OptimisticResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// A mutation that has been sent but not answered yet.
#[derive(Debug, Clone)]
pub struct MutationInit {
    /// The mutation being sent.
    pub mutation: Mutation,
    /// Written as an optimistic patch until the result arrives.
    pub optimistic_response: Option<OptimisticResponse>,
}

/// A mutation together with its server response.
#[derive(Debug, Clone)]
pub struct MutationResult {
    /// The mutation that was sent.
    pub mutation: Mutation,
    /// The server response.
    pub result: ExecutionResult,
}

/// A query response for a watched query.
#[derive(Clone)]
pub struct QueryResult {
    /// Id of the watched query.
    pub query_id: String,
    /// Request counter.
    pub request_id: u64,
    /// The server response.
    pub result: ExecutionResult,
    /// The query document.
    pub document: Document,
    /// Query variables.
    pub variables: Variables,
    /// Reducers run over the whole store afterwards.
    pub extra_reducers: Vec<CacheReducer>,
    /// Set when this result belongs to a fetch-more of another query. Such
    /// results are merged by the caller and never written here.
    pub fetch_more_for_query_id: Option<String>,
}

impl QueryResult {
    /// A result for `query_id` with no reducers and request id 0.
    #[must_use]
    pub fn new(query_id: impl Into<String>, document: Document, variables: Variables, result: ExecutionResult) -> Self {
        Self {
            query_id: query_id.into(),
            request_id: 0,
            result,
            document,
            variables,
            extra_reducers: Vec::new(),
            fetch_more_for_query_id: None,
        }
    }
}

impl fmt::Debug for QueryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryResult")
            .field("query_id", &self.query_id)
            .field("request_id", &self.request_id)
            .field("result", &self.result)
            .field("fetch_more_for_query_id", &self.fetch_more_for_query_id)
            .finish_non_exhaustive()
    }
}

/// A result pushed by a subscription.
#[derive(Clone)]
pub struct SubscriptionResult {
    /// Id of the subscription.
    pub subscription_id: u64,
    /// The server response.
    pub result: ExecutionResult,
    /// The subscription document.
    pub document: Document,
    /// Subscription variables.
    pub variables: Variables,
    /// Reducers run over the whole store afterwards.
    pub extra_reducers: Vec<CacheReducer>,
}

impl fmt::Debug for SubscriptionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionResult")
            .field("subscription_id", &self.subscription_id)
            .field("result", &self.result)
            .finish_non_exhaustive()
    }
}

fn run_reducers(tx: &mut CacheTransaction<'_>, reducers: &[CacheReducer], action: &CacheAction<'_>) {
    for reducer in reducers {
        match reducer(tx.store(), action) {
            Ok(next) => tx.replace_store(next),
            Err(err) => warn!(error = %err, operation = ?action.operation_name(), "extra reducer failed; skipped"),
        }
    }
}

/// Writes a mutation result and runs everything that reacts to it.
///
/// Order: the result under `ROOT_MUTATION` together with the rewritten
/// watched queries, then the update callback's recorded writes, then the
/// extra reducers. Watched queries are diffed before anything is written.
///
/// # Errors
/// Write errors from the result itself or from recorded writes.
pub fn apply_mutation_result(tx: &mut CacheTransaction<'_>, mutation_result: &MutationResult) -> CacheResult<()> {
    let MutationResult { mutation, result } = mutation_result;
    if result.has_errors() {
        return Ok(());
    }
    let Some(data) = &result.data else {
        return Ok(());
    };

    let mut writes = vec![CacheWrite {
        root: EntityKey::root_mutation(),
        result: data.clone(),
        document: mutation.document.clone(),
        variables: mutation.variables.clone(),
    }];

    for update in &mutation.update_queries {
        let diff = match tx.diff_query(&update.document, &update.variables, true) {
            Ok(diff) => diff,
            Err(err) => {
                warn!(query_id = %update.query_id, error = %err, "cannot diff watched query; skipped");
                continue;
            }
        };
        let current = match diff.result {
            Some(current) if !diff.is_missing => current,
            _ => continue,
        };

        let context = QueryReducerContext {
            mutation_result: result,
            query_name: update.document.operation_name(),
            query_variables: &update.variables,
        };
        match (update.reducer)(&current, &context) {
            Ok(Some(next)) => writes.push(CacheWrite::query(update.document.clone(), update.variables.clone(), next)),
            Ok(None) => {}
            Err(err) => warn!(query_id = %update.query_id, error = %err, "query reducer failed; skipped"),
        }
    }

    tx.execute_writes(&writes)?;

    if let Some(update) = &mutation.update {
        let mut proxy = DataProxy::new(tx.store(), tx.config());
        match update(&mut proxy, result) {
            Ok(()) => {
                let recorded = proxy.finish();
                tx.execute_writes(&recorded)?;
            }
            Err(err) => {
                warn!(mutation_id = %mutation.mutation_id, error = %err, "mutation update callback failed; skipped");
            }
        }
    }

    let action = CacheAction::MutationResult {
        mutation_id: &mutation.mutation_id,
        result,
        document: &mutation.document,
        variables: &mutation.variables,
    };
    run_reducers(tx, &mutation.extra_reducers, &action);
    Ok(())
}

impl InMemoryCache {
    /// Ingests a query result under `ROOT_QUERY`.
    ///
    /// Results with errors and fetch-more results are ignored.
    ///
    /// # Errors
    /// A write error if the data does not fit the document; nothing is committed.
    pub fn mark_query_result(&mut self, query: &QueryResult) -> CacheResult<()> {
        if query.fetch_more_for_query_id.is_some() || query.result.has_errors() {
            return Ok(());
        }
        let Some(data) = &query.result.data else {
            return Ok(());
        };
        debug!(query_id = %query.query_id, "query result");

        self.perform_transaction(|tx| {
            tx.write_result(&CacheWrite::query(query.document.clone(), query.variables.clone(), data.clone()))?;
            let action = CacheAction::QueryResult {
                query_id: &query.query_id,
                request_id: query.request_id,
                result: &query.result,
                document: &query.document,
                variables: &query.variables,
            };
            run_reducers(tx, &query.extra_reducers, &action);
            Ok(())
        })
    }

    /// Ingests a subscription result under `ROOT_SUBSCRIPTION`.
    ///
    /// # Errors
    /// A write error if the data does not fit the document; nothing is committed.
    pub fn mark_subscription_result(&mut self, subscription: &SubscriptionResult) -> CacheResult<()> {
        if subscription.result.has_errors() {
            return Ok(());
        }
        let Some(data) = &subscription.result.data else {
            return Ok(());
        };

        self.perform_transaction(|tx| {
            tx.write_result(&CacheWrite {
                root: EntityKey::root_subscription(),
                result: data.clone(),
                document: subscription.document.clone(),
                variables: subscription.variables.clone(),
            })?;
            let action = CacheAction::SubscriptionResult {
                subscription_id: subscription.subscription_id,
                result: &subscription.result,
                document: &subscription.document,
                variables: &subscription.variables,
            };
            run_reducers(tx, &subscription.extra_reducers, &action);
            Ok(())
        })
    }

    /// Records the optimistic response of a mutation, if it has one.
    ///
    /// The optimistic transaction replays the full mutation-result path with
    /// the optimistic response as data, under the mutation id.
    ///
    /// # Errors
    /// `DuplicateId` if the mutation id is already pending, or a write error
    /// from the optimistic data.
    pub fn mark_mutation_init(&mut self, init: &MutationInit) -> CacheResult<()> {
        let Some(response) = &init.optimistic_response else {
            return Ok(());
        };
        let optimistic = MutationResult {
            mutation: init.mutation.clone(),
            result: ExecutionResult::data(response.resolve(&init.mutation.variables)),
        };
        let id = OptimisticId::new(init.mutation.mutation_id.clone());
        self.perform_optimistic_transaction(
            transaction_fn(move |tx| apply_mutation_result(tx, &optimistic)),
            id,
        )
    }

    /// Ingests a mutation's server result into the confirmed store.
    ///
    /// # Errors
    /// A write error from the result or the update callback's writes; nothing
    /// is committed in that case.
    pub fn mark_mutation_result(&mut self, mutation: &MutationResult) -> CacheResult<()> {
        debug!(mutation_id = %mutation.mutation.mutation_id, "mutation result");
        self.perform_transaction(|tx| apply_mutation_result(tx, mutation))
    }

    /// Drops a mutation's optimistic patch once its result has been ingested.
    pub fn mark_mutation_complete(&mut self, mutation_id: &str) -> bool {
        self.remove_optimistic(mutation_id)
    }

    /// Replaces a query's cached result with `new_result`.
    ///
    /// # Errors
    /// A write error if `new_result` does not fit the document.
    pub fn mark_update_query_result(
        &mut self,
        document: &Document,
        variables: &Variables,
        new_result: Value,
    ) -> CacheResult<()> {
        self.write_result(&CacheWrite::query(document.clone(), variables.clone(), new_result))
    }
}
