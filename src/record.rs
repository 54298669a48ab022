//! Entity records: the flat rows of a normalized store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value::StoreValue;

/// Field that carries an object's type discriminator.
pub const TYPENAME_FIELD: &str = "__typename";

/// A flat mapping from store field name to [`StoreValue`].
///
/// Field names may encode arguments (see [`store_field_name`](crate::key::store_field_name)).
/// Records are stored behind `Arc` in a [`NormalizedStore`](crate::NormalizedStore)
/// and are replaced wholesale on change, never edited in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityRecord {
    fields: BTreeMap<String, StoreValue>,
}

impl EntityRecord {
    /// Creates an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets a field value.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&StoreValue> {
        self.fields.get(field)
    }

    /// Sets a field value, returning the previous one.
    pub fn insert(&mut self, field: impl Into<String>, value: StoreValue) -> Option<StoreValue> {
        self.fields.insert(field.into(), value)
    }

    /// Removes a field.
    pub fn remove(&mut self, field: &str) -> Option<StoreValue> {
        self.fields.remove(field)
    }

    /// True if the record holds `field`.
    #[must_use]
    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True if the record holds no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterates fields in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &StoreValue)> {
        self.fields.iter()
    }

    /// The recorded type discriminator, if the record has one.
    #[must_use]
    pub fn typename(&self) -> Option<&str> {
        self.get(TYPENAME_FIELD)
            .and_then(StoreValue::as_scalar)
            .and_then(serde_json::Value::as_str)
    }
}

impl<K: Into<String>> FromIterator<(K, StoreValue)> for EntityRecord {
    fn from_iter<I: IntoIterator<Item = (K, StoreValue)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}
