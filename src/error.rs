//! Error types for kyrocache.
//!
//! All errors are strongly typed using thiserror, one enum per concern,
//! gathered under [`CacheError`]. Read and write failures carry the entity
//! key and field that triggered them so callers can report precisely what
//! the cache could not satisfy.

use thiserror::Error;

use crate::key::EntityKey;

/// Failures on the read path (store reader / diff engine).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadError {
    /// A non-partial read hit a field that is not in the store.
    #[error("Can't find field '{field}' on object {key} (at {path})")]
    Miss {
        /// Record the field was looked up on.
        key: EntityKey,
        /// Store field name, arguments encoded.
        field: String,
        /// Dotted result path.
        path: String,
    },

    /// A directive condition names an unbound or non-boolean variable.
    #[error("Variable '${name}' is not bound")]
    UnboundVariable {
        /// Variable name without the `$`.
        name: String,
    },
}

/// Failures on the write path (store normalizer).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    /// Strict mode: a selected field is absent from the result object.
    #[error("Missing field '{field}' in result written to {key}")]
    MissingField {
        /// Record being written.
        key: EntityKey,
        /// Result key of the absent field.
        field: String,
    },

    /// The result has the wrong shape for the selection.
    #[error("Field '{field}' on {key}: expected {expected}, found {found}")]
    TypeMismatch {
        /// Record being written.
        key: EntityKey,
        /// Result key of the offending field.
        field: String,
        /// What the selection needs.
        expected: &'static str,
        /// What the result holds.
        found: &'static str,
    },

    /// A directive condition names an unbound or non-boolean variable.
    #[error("Variable '${name}' is not bound")]
    UnboundVariable {
        /// Variable name without the `$`.
        name: String,
    },
}

/// Failures managing the optimistic overlay.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptimisticError {
    /// The id is already in the queue.
    #[error("Optimistic transaction '{id}' is already pending")]
    DuplicateId {
        /// The rejected id.
        id: String,
    },

    /// The id is not in the queue.
    #[error("No pending optimistic transaction '{id}'")]
    NotFound {
        /// The id looked up.
        id: String,
    },
}

/// Failures building a query document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    /// Not a GraphQL name.
    #[error("'{name}' is not a valid name")]
    InvalidName {
        /// The rejected name.
        name: String,
    },

    /// Nothing selected at the top level or in any fragment.
    #[error("Document has no selection set")]
    EmptySelection,

    /// A spread names a fragment the document does not define.
    #[error("No fragment named '{name}' in document")]
    UnknownFragment {
        /// The undefined fragment.
        name: String,
    },

    /// A fragment reaches itself through spreads.
    #[error("Fragment '{name}' spreads itself")]
    FragmentCycle {
        /// The fragment met twice on one path.
        name: String,
    },
}

/// Error returned by caller-supplied transactions, reducers and update callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CallbackError {
    message: String,
}

impl CallbackError {
    /// Creates a callback error with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The message the callback reported.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Top-level error type for kyrocache.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// Read path failure.
    #[error("Read error: {0}")]
    Read(#[from] ReadError),

    /// Write path failure.
    #[error("Write error: {0}")]
    Write(#[from] WriteError),

    /// Optimistic overlay failure.
    #[error("Optimistic error: {0}")]
    Optimistic(#[from] OptimisticError),

    /// Invalid document.
    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    /// A caller-supplied callback failed.
    #[error("Callback error: {0}")]
    Callback(#[from] CallbackError),

    /// `CacheConfig::validate` rejected the configuration.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// What is wrong with it.
        reason: String,
    },
}

impl CacheError {
    /// Returns true if this is a cache miss from a non-partial read.
    #[must_use]
    pub const fn is_miss(&self) -> bool {
        matches!(self, Self::Read(ReadError::Miss { .. }))
    }

    /// Returns true if this is a write error.
    #[must_use]
    pub const fn is_write(&self) -> bool {
        matches!(self, Self::Write(_))
    }

    /// Returns true if this is an optimistic overlay error.
    #[must_use]
    pub const fn is_optimistic(&self) -> bool {
        matches!(self, Self::Optimistic(_))
    }

    /// Returns true if this error came from a caller-supplied callback.
    #[must_use]
    pub const fn is_callback(&self) -> bool {
        matches!(self, Self::Callback(_))
    }
}

/// Result type alias for kyrocache operations.
pub type CacheResult<T> = Result<T, CacheError>;
