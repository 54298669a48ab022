//! Values held in entity record fields.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::key::EntityKey;

/// One field value inside an [`EntityRecord`](crate::EntityRecord).
///
/// Nested objects never live inside a record directly: the normalizer
/// replaces them with a [`StoreValue::Reference`] to their own record. The
/// only exception is [`StoreValue::Json`], used for object-valued fields the
/// document selects as a leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum StoreValue {
    /// A scalar leaf (string, number, bool or null).
    Scalar(serde_json::Value),
    /// An ordered list of values.
    List(Vec<StoreValue>),
    /// A link to another record.
    Reference {
        /// Key of the referenced record.
        key: EntityKey,
        /// True when the key is a synthetic path key.
        generated: bool,
    },
    /// An embedded, non-normalized object.
    Json(serde_json::Value),
}

impl StoreValue {
    /// Creates a reference to `key`, flagging path keys as generated.
    #[must_use]
    pub fn reference(key: EntityKey) -> Self {
        let generated = key.is_generated();
        Self::Reference { key, generated }
    }

    /// Creates a null scalar.
    #[must_use]
    pub const fn null() -> Self {
        Self::Scalar(serde_json::Value::Null)
    }

    /// True for a JSON scalar.
    pub const fn is_scalar(&self) -> bool {
        matches!(self, Self::Scalar(_))
    }

    /// True for a list.
    pub const fn is_list(&self) -> bool {
        matches!(self, Self::List(_))
    }

    /// True for a reference to another record.
    pub const fn is_reference(&self) -> bool {
        matches!(self, Self::Reference { .. })
    }

    /// True for embedded JSON.
    pub const fn is_json(&self) -> bool {
        matches!(self, Self::Json(_))
    }

    /// True for a `null` scalar.
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Scalar(serde_json::Value::Null))
    }

    /// The scalar, if this is one.
    pub const fn as_scalar(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Scalar(v) => Some(v),
            _ => None,
        }
    }

    /// The referenced key, if this is a reference.
    pub const fn as_reference(&self) -> Option<&EntityKey> {
        match self {
            Self::Reference { key, .. } => Some(key),
            _ => None,
        }
    }

    /// The elements, if this is a list.
    pub fn as_list(&self) -> Option<&[StoreValue]> {
        match self {
            Self::List(v) => Some(v),
            _ => None,
        }
    }

    /// Collects every key this value references, depth first.
    pub fn references(&self) -> Vec<&EntityKey> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a EntityKey>) {
        match self {
            Self::Reference { key, .. } => out.push(key),
            Self::List(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            Self::Scalar(_) | Self::Json(_) => {}
        }
    }

    /// Returns a human-readable type name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Scalar(_) => "scalar",
            Self::List(_) => "list",
            Self::Reference { .. } => "reference",
            Self::Json(_) => "json",
        }
    }
}

impl Default for StoreValue {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Display for StoreValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(v) | Self::Json(v) => write!(f, "{v}"),
            Self::List(v) => write!(f, "list[{}]", v.len()),
            Self::Reference { key, .. } => write!(f, "ref:{key}"),
        }
    }
}

impl From<serde_json::Value> for StoreValue {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            serde_json::Value::Object(_) => Self::Json(v),
            scalar => Self::Scalar(scalar),
        }
    }
}

impl From<bool> for StoreValue {
    fn from(v: bool) -> Self {
        Self::Scalar(v.into())
    }
}

impl From<i32> for StoreValue {
    fn from(v: i32) -> Self {
        Self::Scalar(v.into())
    }
}

impl From<i64> for StoreValue {
    fn from(v: i64) -> Self {
        Self::Scalar(v.into())
    }
}

impl From<f64> for StoreValue {
    fn from(v: f64) -> Self {
        Self::Scalar(v.into())
    }
}

impl From<&str> for StoreValue {
    fn from(v: &str) -> Self {
        Self::Scalar(v.into())
    }
}

impl From<String> for StoreValue {
    fn from(v: String) -> Self {
        Self::Scalar(v.into())
    }
}
