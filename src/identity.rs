//! Identity-key resolution and fragment matching.
//!
//! Both hooks are supplied by the owning application. The cache trusts an
//! identity key as globally unique; avoiding collisions across types is the
//! caller's job.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::key::EntityKey;
use crate::record::{EntityRecord, TYPENAME_FIELD};

/// Caller-supplied identity function: object -> key, or `None` for "no identity".
pub type IdentityFn = Arc<dyn Fn(&Map<String, Value>) -> Option<String> + Send + Sync>;

/// Caller-supplied predicate: does `record` satisfy type condition `type_condition`?
pub type FragmentMatcher = Arc<dyn Fn(&EntityRecord, &str) -> bool + Send + Sync>;

/// How the normalizer derives an entity key for a result object.
#[derive(Clone, Default)]
pub enum IdentityPolicy {
    /// Never derive identity; every nested object gets a path key.
    None,
    /// `"{__typename}:{id}"`, falling back to `_id`.
    #[default]
    TypenameAndId,
    /// A caller-supplied function.
    Custom(IdentityFn),
}

impl IdentityPolicy {
    /// Wraps a closure as a custom policy.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Map<String, Value>) -> Option<String> + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    /// Resolves the identity key for `object`, if it has one.
    #[must_use]
    pub fn resolve(&self, object: &Map<String, Value>) -> Option<EntityKey> {
        match self {
            Self::None => None,
            Self::TypenameAndId => typename_and_id(object),
            Self::Custom(f) => f(object).map(EntityKey::from),
        }
    }
}

impl fmt::Debug for IdentityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "IdentityPolicy::None"),
            Self::TypenameAndId => write!(f, "IdentityPolicy::TypenameAndId"),
            Self::Custom(_) => write!(f, "IdentityPolicy::Custom(..)"),
        }
    }
}

fn id_fragment(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn typename_and_id(object: &Map<String, Value>) -> Option<EntityKey> {
    let typename = object.get(TYPENAME_FIELD)?.as_str()?;
    let id = object
        .get("id")
        .and_then(id_fragment)
        .or_else(|| object.get("_id").and_then(id_fragment))?;
    Some(EntityKey::new(format!("{typename}:{id}")))
}

/// Applies the configured matcher, or includes the fragment when there is none.
#[must_use]
pub fn fragment_matches(
    matcher: Option<&FragmentMatcher>,
    record: &EntityRecord,
    type_condition: &str,
) -> bool {
    match matcher {
        Some(m) => m(record, type_condition),
        None => true,
    }
}

/// A matcher that compares the recorded `__typename` against the type condition.
///
/// Records without a discriminator match optimistically.
#[must_use]
pub fn typename_matcher() -> FragmentMatcher {
    Arc::new(|record: &EntityRecord, type_condition: &str| {
        record.typename().map_or(true, |t| t == type_condition)
    })
}
