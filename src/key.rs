//! Entity keys and store field names.
//!
//! An [`EntityKey`] names one record in a [`NormalizedStore`](crate::NormalizedStore).
//! Keys come from three places: the reserved operation roots, an identity
//! policy applied to a result object, or a synthetic path derived from the
//! parent key and the field the object was reached through.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Root key for top-level query results.
pub const ROOT_QUERY: &str = "ROOT_QUERY";

/// Root key for top-level mutation results.
pub const ROOT_MUTATION: &str = "ROOT_MUTATION";

/// Root key for top-level subscription results.
pub const ROOT_SUBSCRIPTION: &str = "ROOT_SUBSCRIPTION";

/// Stable identifier of one logical entity within a store.
///
/// # Examples
///
/// ```
/// use kyrocache::EntityKey;
///
/// let root = EntityKey::root_query();
/// assert!(root.is_root());
///
/// let child = root.child("viewer");
/// assert_eq!(child.as_str(), "$ROOT_QUERY.viewer");
/// assert!(child.is_generated());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(String);

impl EntityKey {
    /// Creates a key from any string.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The reserved query root.
    #[must_use]
    pub fn root_query() -> Self {
        Self::new(ROOT_QUERY)
    }

    /// The reserved mutation root.
    #[must_use]
    pub fn root_mutation() -> Self {
        Self::new(ROOT_MUTATION)
    }

    /// The reserved subscription root.
    #[must_use]
    pub fn root_subscription() -> Self {
        Self::new(ROOT_SUBSCRIPTION)
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for one of the three reserved operation roots.
    #[must_use]
    pub fn is_root(&self) -> bool {
        matches!(self.0.as_str(), ROOT_QUERY | ROOT_MUTATION | ROOT_SUBSCRIPTION)
    }

    /// Returns true for a synthetic path key.
    #[must_use]
    pub fn is_generated(&self) -> bool {
        self.0.starts_with('$')
    }

    /// Synthesizes the path key for an object reached through `store_field_name`.
    ///
    /// The object is owned by this key and only reachable through that field.
    #[must_use]
    pub fn child(&self, store_field_name: &str) -> Self {
        if self.is_generated() {
            Self(format!("{}.{store_field_name}", self.0))
        } else {
            Self(format!("${}.{store_field_name}", self.0))
        }
    }

    /// Synthesizes the path key for element `index` of a list-valued path.
    #[must_use]
    pub fn element(&self, index: usize) -> Self {
        Self(format!("{}.{index}", self.0))
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntityKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for EntityKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl AsRef<str> for EntityKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Encodes a field name plus its evaluated arguments into a store field name.
///
/// Two selections of the same field with different arguments land in
/// different store fields. Argument maps are serialized with sorted keys, so
/// the encoding does not depend on the order arguments were written in.
#[must_use]
pub fn store_field_name(field: &str, args: &serde_json::Map<String, serde_json::Value>) -> String {
    if args.is_empty() {
        return field.to_string();
    }

    let sorted: std::collections::BTreeMap<&String, &serde_json::Value> = args.iter().collect();
    // Serializing a map of JSON values cannot fail.
    let encoded = serde_json::to_string(&sorted).unwrap_or_default();
    format!("{field}({encoded})")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn root_keys_are_reserved() {
        assert!(EntityKey::root_query().is_root());
        assert!(EntityKey::root_mutation().is_root());
        assert!(EntityKey::root_subscription().is_root());
        assert!(!EntityKey::from("User:1").is_root());
    }

    #[test]
    fn child_keys_do_not_repeat_prefix() {
        let root = EntityKey::root_query();
        let viewer = root.child("viewer");
        assert_eq!(viewer.as_str(), "$ROOT_QUERY.viewer");

        let settings = viewer.child("settings");
        assert_eq!(settings.as_str(), "$ROOT_QUERY.viewer.settings");

        let item = root.child("items").element(2);
        assert_eq!(item.as_str(), "$ROOT_QUERY.items.2");
    }

    #[test]
    fn child_of_identified_entity_is_generated() {
        let user = EntityKey::from("User:1");
        assert!(!user.is_generated());
        assert_eq!(user.child("address").as_str(), "$User:1.address");
    }

    #[test]
    fn store_field_name_without_args_is_plain() {
        let args = serde_json::Map::new();
        assert_eq!(store_field_name("value", &args), "value");
    }

    #[test]
    fn store_field_name_is_order_independent() {
        let a = json!({"first": 10, "after": "x"});
        let b = json!({"after": "x", "first": 10});
        let a = a.as_object().unwrap();
        let b = b.as_object().unwrap();
        assert_eq!(store_field_name("items", a), store_field_name("items", b));
        assert_eq!(
            store_field_name("items", a),
            r#"items({"after":"x","first":10})"#
        );
    }
}
