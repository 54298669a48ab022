//! # kyrocache - Normalized Query Cache
//!
//! kyrocache is the client-side data cache of a query-based fetching client.
//! It flattens nested query results into entity records linked by key
//! references, answers whether a query can be satisfied from cache, and
//! layers speculative (optimistic) writes over confirmed data so they can be
//! committed or rolled back without disturbing it.
//!
//! ## Core Concepts
//!
//! - **EntityRecord**: the flat field map stored for one entity key
//! - **NormalizedStore**: all records by key, copy-on-write at record granularity
//! - **Optimistic patch**: the records one speculative transaction replaced
//! - **Effective store**: confirmed records with every pending patch applied in order
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kyrocache::{CacheConfig, CacheWrite, Document, EntityKey, InMemoryCache, Variables};
//! use serde_json::json;
//!
//! let mut cache = InMemoryCache::new(CacheConfig::default())?;
//! let doc = Document::builder().field("value").build()?;
//!
//! cache.write_result(&CacheWrite::query(doc.clone(), Variables::new(), json!({"value": 1})))?;
//! let value = cache.read_query(EntityKey::root_query(), &doc, &Variables::new())?;
//! assert_eq!(value, json!({"value": 1}));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Data model
pub mod error;
pub mod key;
pub mod record;
pub mod store;
pub mod value;

// Documents and policies
pub mod config;
pub mod document;
pub mod identity;

// Write and read paths
pub mod normalize;
pub mod read;

// Transactions and the optimistic overlay
pub mod optimistic;
pub mod transaction;

// Facade
pub mod cache;
pub mod events;
pub mod mutation;

// Re-export primary types at crate root for convenience
pub use cache::InMemoryCache;
pub use config::CacheConfig;
pub use document::{
    ArgValue, Directive, Document, DocumentBuilder, Field, FragmentDefinition, InlineFragment,
    Selection, SelectionSet, Variables,
};
pub use error::{
    CacheError, CacheResult, CallbackError, DocumentError, OptimisticError, ReadError, WriteError,
};
pub use events::{CacheEvent, CacheEvents};
pub use identity::{typename_matcher, FragmentMatcher, IdentityPolicy};
pub use key::{EntityKey, ROOT_MUTATION, ROOT_QUERY, ROOT_SUBSCRIPTION};
pub use record::EntityRecord;
pub use store::NormalizedStore;
pub use value::StoreValue;

pub use mutation::{
    cache_reducer, CacheAction, CacheReducer, ExecutionResult, Mutation, MutationInit,
    MutationResult, OptimisticResponse, QueryResult, QueryUpdate, SubscriptionResult,
};
pub use normalize::{write_result_to_store, CacheWrite};
pub use optimistic::{OptimisticId, OptimisticPatch, OptimisticQueue};
pub use read::{diff_query_against_store, read_query_from_store, DiffResult, MissingField, ReadRequest};
pub use transaction::{collect_patch, transaction_fn, CacheTransaction, DataProxy, TransactionFn};
