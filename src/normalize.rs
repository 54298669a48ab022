//! Store normalizer: the write path.
//!
//! Walks a result tree in lockstep with the document's selection set and
//! flattens it into entity records linked by references.
//!
//! Key invariants:
//! - All-or-nothing per call: records are staged off to the side and only
//!   committed once the whole result has been walked without error.
//! - Last write wins per field. A nested object is never deep-merged into
//!   the object it replaces; the parent field is simply repointed.
//! - A record is only swapped in when its contents actually changed, which
//!   keeps repeated writes invisible to optimistic patch collection.

use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::debug;

use crate::config::CacheConfig;
use crate::document::{should_include, Document, Field, Selection, SelectionSet, Variables};
use crate::error::WriteError;
use crate::identity::fragment_matches;
use crate::key::EntityKey;
use crate::record::{EntityRecord, TYPENAME_FIELD};
use crate::store::NormalizedStore;
use crate::value::StoreValue;

/// A single result write: `result` is recorded under `root` shaped by `document`.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheWrite {
    /// Key the top-level fields are recorded under (usually a root key).
    pub root: EntityKey,
    /// Result tree, already deserialized.
    pub result: Value,
    /// Document the result is shaped by.
    pub document: Document,
    /// Variables for argument evaluation.
    pub variables: Variables,
}

impl CacheWrite {
    /// A write of `result` under the query root.
    #[must_use]
    pub fn query(document: Document, variables: Variables, result: Value) -> Self {
        Self {
            root: EntityKey::root_query(),
            result,
            document,
            variables,
        }
    }

    /// Redirects the write to another root key.
    #[must_use]
    pub fn with_root(mut self, root: EntityKey) -> Self {
        self.root = root;
        self
    }
}

const fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// Normalizes `result` into `store` under `root`.
///
/// Returns the keys whose records changed. On error the store is untouched.
///
/// # Errors
/// - `MissingField`: strict mode and a selected field is absent from the result
/// - `TypeMismatch`: a sub-selection was applied to a non-object value
/// - `UnboundVariable`: a directive condition refers to an unbound variable
pub fn write_result_to_store(
    store: &mut NormalizedStore,
    root: &EntityKey,
    result: &Value,
    document: &Document,
    variables: &Variables,
    config: &CacheConfig,
) -> Result<Vec<EntityKey>, WriteError> {
    let Some(object) = result.as_object() else {
        return Err(WriteError::TypeMismatch {
            key: root.clone(),
            field: String::new(),
            expected: "object",
            found: json_type_name(result),
        });
    };

    let staged = {
        let mut writer = Normalizer {
            base: store,
            document,
            variables,
            config,
            staged: HashMap::new(),
        };
        writer.record_mut(root);
        writer.write_selection_set(root, object, document.selection_set(), false)?;
        writer.staged
    };

    let mut changed = Vec::new();
    for (key, record) in staged {
        if store.replace_if_changed(key.clone(), record) {
            changed.push(key);
        }
    }
    changed.sort();
    debug!(root = %root, changed = changed.len(), "result normalized");
    Ok(changed)
}

struct Normalizer<'a> {
    base: &'a NormalizedStore,
    document: &'a Document,
    variables: &'a Variables,
    config: &'a CacheConfig,
    staged: HashMap<EntityKey, EntityRecord>,
}

impl Normalizer<'_> {
    fn record_mut(&mut self, key: &EntityKey) -> &mut EntityRecord {
        let base = self.base;
        self.staged
            .entry(key.clone())
            .or_insert_with(|| base.get(key).cloned().unwrap_or_default())
    }

    fn include(&self, selection: &Selection) -> Result<bool, WriteError> {
        should_include(selection.directives(), self.variables)
            .map_err(|name| WriteError::UnboundVariable { name })
    }

    fn type_matches(&self, object: &Map<String, Value>, type_condition: &str) -> bool {
        let mut candidate = EntityRecord::new();
        if let Some(Value::String(t)) = object.get(TYPENAME_FIELD) {
            candidate.insert(TYPENAME_FIELD, StoreValue::from(t.as_str()));
        }
        fragment_matches(self.config.fragment_matcher.as_ref(), &candidate, type_condition)
    }

    /// `tolerant` is set inside type-conditional fragments, whose fields may
    /// legitimately be absent for other concrete types.
    fn write_selection_set(
        &mut self,
        key: &EntityKey,
        object: &Map<String, Value>,
        selection_set: &SelectionSet,
        tolerant: bool,
    ) -> Result<(), WriteError> {
        for selection in selection_set.iter() {
            if !self.include(selection)? {
                continue;
            }
            match selection {
                Selection::Field(field) => self.write_field(key, object, field, tolerant)?,
                Selection::FragmentSpread(spread) => {
                    let document = self.document;
                    // Built documents never spread an undefined fragment.
                    let Some(fragment) = document.fragment(&spread.name) else {
                        continue;
                    };
                    if self.type_matches(object, &fragment.type_condition) {
                        self.write_selection_set(key, object, &fragment.selection_set, true)?;
                    }
                }
                Selection::InlineFragment(inline) => match &inline.type_condition {
                    Some(tc) => {
                        if self.type_matches(object, tc) {
                            self.write_selection_set(key, object, &inline.selection_set, true)?;
                        }
                    }
                    None => self.write_selection_set(key, object, &inline.selection_set, tolerant)?,
                },
            }
        }
        Ok(())
    }

    fn write_field(
        &mut self,
        key: &EntityKey,
        object: &Map<String, Value>,
        field: &Field,
        tolerant: bool,
    ) -> Result<(), WriteError> {
        let store_field = field.store_field_name(self.variables);
        let Some(value) = object.get(field.result_key()) else {
            if self.config.strict_writes && !tolerant {
                return Err(WriteError::MissingField {
                    key: key.clone(),
                    field: store_field,
                });
            }
            return Ok(());
        };

        let stored = match (&field.selection_set, value) {
            (_, Value::Null) => StoreValue::null(),
            (None, v) => StoreValue::from(v.clone()),
            (Some(set), Value::Object(child)) => self.write_object(key.child(&store_field), child, set)?,
            (Some(set), Value::Array(items)) => {
                self.write_list(key, &store_field, &key.child(&store_field), items, set)?
            }
            (Some(_), other) => {
                return Err(WriteError::TypeMismatch {
                    key: key.clone(),
                    field: store_field,
                    expected: "object",
                    found: json_type_name(other),
                })
            }
        };

        self.record_mut(key).insert(store_field, stored);
        Ok(())
    }

    fn write_object(
        &mut self,
        path_key: EntityKey,
        object: &Map<String, Value>,
        selection_set: &SelectionSet,
    ) -> Result<StoreValue, WriteError> {
        let key = self.config.identity.resolve(object).unwrap_or(path_key);
        self.record_mut(&key);
        self.write_selection_set(&key, object, selection_set, false)?;
        Ok(StoreValue::reference(key))
    }

    fn write_list(
        &mut self,
        parent: &EntityKey,
        store_field: &str,
        path_key: &EntityKey,
        items: &[Value],
        selection_set: &SelectionSet,
    ) -> Result<StoreValue, WriteError> {
        let mut out = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let element_key = path_key.element(index);
            let stored = match item {
                Value::Null => StoreValue::null(),
                Value::Object(child) => self.write_object(element_key, child, selection_set)?,
                Value::Array(inner) => {
                    self.write_list(parent, store_field, &element_key, inner, selection_set)?
                }
                other => {
                    return Err(WriteError::TypeMismatch {
                        key: parent.clone(),
                        field: store_field.to_string(),
                        expected: "object",
                        found: json_type_name(other),
                    })
                }
            };
            out.push(stored);
        }
        Ok(StoreValue::List(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{ArgValue, Directive, FragmentDefinition, InlineFragment};
    use crate::identity::IdentityPolicy;
    use serde_json::json;

    fn write(store: &mut NormalizedStore, doc: &Document, result: Value) -> Result<Vec<EntityKey>, WriteError> {
        write_result_to_store(
            store,
            &EntityKey::root_query(),
            &result,
            doc,
            &Variables::new(),
            &CacheConfig::default(),
        )
    }

    fn key(s: &str) -> EntityKey {
        EntityKey::from(s)
    }

    #[test]
    fn writes_scalar_under_root() {
        let doc = Document::builder().field("value").build().unwrap();
        let mut store = NormalizedStore::new();
        write(&mut store, &doc, json!({"value": 1})).unwrap();
        let root = store.get(&EntityKey::root_query()).unwrap();
        assert_eq!(root.get("value"), Some(&StoreValue::from(1)));
    }

    #[test]
    fn normalizes_identified_objects() {
        let doc = Document::builder()
            .field(
                Field::new("user")
                    .arg("id", 1)
                    .select("__typename")
                    .select("id")
                    .select("name"),
            )
            .build()
            .unwrap();
        let mut store = NormalizedStore::new();
        write(
            &mut store,
            &doc,
            json!({"user": {"__typename": "User", "id": 1, "name": "Ada"}}),
        )
        .unwrap();

        let root = store.get(&EntityKey::root_query()).unwrap();
        assert_eq!(
            root.get(r#"user({"id":1})"#),
            Some(&StoreValue::reference(key("User:1")))
        );
        let user = store.get(&key("User:1")).unwrap();
        assert_eq!(user.get("name"), Some(&StoreValue::from("Ada")));
        assert_eq!(user.typename(), Some("User"));
    }

    #[test]
    fn falls_back_to_path_keys() {
        let doc = Document::builder()
            .field(Field::new("viewer").select("name").select(Field::new("settings").select("theme")))
            .build()
            .unwrap();
        let mut store = NormalizedStore::new();
        write(
            &mut store,
            &doc,
            json!({"viewer": {"name": "a", "settings": {"theme": "dark"}}}),
        )
        .unwrap();

        let root = store.get(&EntityKey::root_query()).unwrap();
        assert_eq!(
            root.get("viewer"),
            Some(&StoreValue::Reference {
                key: key("$ROOT_QUERY.viewer"),
                generated: true
            })
        );
        let settings = store.get(&key("$ROOT_QUERY.viewer.settings")).unwrap();
        assert_eq!(settings.get("theme"), Some(&StoreValue::from("dark")));
    }

    #[test]
    fn lists_of_objects_preserve_order() {
        let doc = Document::builder()
            .field(Field::new("items").select("id").select("__typename"))
            .build()
            .unwrap();
        let mut store = NormalizedStore::new();
        write(
            &mut store,
            &doc,
            json!({"items": [
                {"__typename": "Item", "id": 2},
                null,
                {"id": 9}
            ]}),
        )
        .unwrap();

        let root = store.get(&EntityKey::root_query()).unwrap();
        let list = root.get("items").unwrap().as_list().unwrap();
        assert_eq!(list[0], StoreValue::reference(key("Item:2")));
        assert!(list[1].is_null());
        assert_eq!(list[2], StoreValue::reference(key("$ROOT_QUERY.items.2")));
    }

    #[test]
    fn nested_lists_extend_element_paths() {
        let doc = Document::builder()
            .field(Field::new("grid").select("v"))
            .build()
            .unwrap();
        let mut store = NormalizedStore::new();
        write(&mut store, &doc, json!({"grid": [[{"v": 1}], [{"v": 2}]]})).unwrap();
        assert!(store.contains(&key("$ROOT_QUERY.grid.1.0")));
    }

    #[test]
    fn leaf_objects_are_embedded() {
        let doc = Document::builder().field("meta").build().unwrap();
        let mut store = NormalizedStore::new();
        write(&mut store, &doc, json!({"meta": {"a": [1, 2]}})).unwrap();
        let root = store.get(&EntityKey::root_query()).unwrap();
        assert_eq!(root.get("meta"), Some(&StoreValue::Json(json!({"a": [1, 2]}))));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn last_write_wins_per_field() {
        let full = Document::builder()
            .field(Field::new("user").select("__typename").select("id").select("name").select("age"))
            .build()
            .unwrap();
        let partial = Document::builder()
            .field(Field::new("user").select("__typename").select("id").select("name"))
            .build()
            .unwrap();
        let mut store = NormalizedStore::new();
        write(
            &mut store,
            &full,
            json!({"user": {"__typename": "U", "id": 1, "name": "a", "age": 3}}),
        )
        .unwrap();
        write(
            &mut store,
            &partial,
            json!({"user": {"__typename": "U", "id": 1, "name": "b"}}),
        )
        .unwrap();

        let user = store.get(&key("U:1")).unwrap();
        assert_eq!(user.get("name"), Some(&StoreValue::from("b")));
        assert_eq!(user.get("age"), Some(&StoreValue::from(3)));
    }

    #[test]
    fn rewrite_reports_only_changed_records() {
        let doc = Document::builder()
            .field(Field::new("user").select("__typename").select("id").select("name"))
            .build()
            .unwrap();
        let mut store = NormalizedStore::new();
        let first = write(&mut store, &doc, json!({"user": {"__typename": "U", "id": 1, "name": "a"}})).unwrap();
        assert_eq!(first, vec![key("ROOT_QUERY"), key("U:1")]);

        let again = write(&mut store, &doc, json!({"user": {"__typename": "U", "id": 1, "name": "a"}})).unwrap();
        assert!(again.is_empty());

        let renamed = write(&mut store, &doc, json!({"user": {"__typename": "U", "id": 1, "name": "b"}})).unwrap();
        assert_eq!(renamed, vec![key("U:1")]);
    }

    #[test]
    fn strict_missing_field_aborts_whole_write() {
        let doc = Document::builder()
            .field("a")
            .field(Field::new("user").select("__typename").select("id").select("name"))
            .build()
            .unwrap();
        let mut store = NormalizedStore::new();
        let err = write(&mut store, &doc, json!({"a": 1, "user": {"__typename": "U", "id": 1}})).unwrap_err();
        assert_eq!(
            err,
            WriteError::MissingField {
                key: key("U:1"),
                field: "name".to_string()
            }
        );
        assert!(store.is_empty());
    }

    #[test]
    fn lenient_mode_skips_missing_fields() {
        let doc = Document::builder().field("a").field("b").build().unwrap();
        let mut store = NormalizedStore::new();
        write_result_to_store(
            &mut store,
            &EntityKey::root_query(),
            &json!({"a": 1}),
            &doc,
            &Variables::new(),
            &CacheConfig::default().with_strict_writes(false),
        )
        .unwrap();
        let root = store.get(&EntityKey::root_query()).unwrap();
        assert!(root.contains("a"));
        assert!(!root.contains("b"));
    }

    #[test]
    fn selection_on_scalar_is_type_mismatch() {
        let doc = Document::builder()
            .field(Field::new("user").select("name"))
            .build()
            .unwrap();
        let mut store = NormalizedStore::new();
        let err = write(&mut store, &doc, json!({"user": 5})).unwrap_err();
        assert!(matches!(err, WriteError::TypeMismatch { found: "number", .. }));

        let err = write(&mut store, &doc, json!({"user": [1]})).unwrap_err();
        assert!(matches!(err, WriteError::TypeMismatch { .. }));
        assert!(store.is_empty());
    }

    #[test]
    fn non_object_result_is_rejected() {
        let doc = Document::builder().field("a").build().unwrap();
        let mut store = NormalizedStore::new();
        assert!(write(&mut store, &doc, json!([1])).is_err());
    }

    #[test]
    fn skip_directive_omits_field() {
        let doc = Document::builder()
            .field("a")
            .field(Field::new("b").directive(Directive::skip(ArgValue::variable("skipB"))))
            .build()
            .unwrap();
        let mut store = NormalizedStore::new();
        let mut vars = Variables::new();
        vars.insert("skipB".to_string(), json!(true));
        write_result_to_store(
            &mut store,
            &EntityKey::root_query(),
            &json!({"a": 1}),
            &doc,
            &vars,
            &CacheConfig::default(),
        )
        .unwrap();
        assert!(!store.get(&EntityKey::root_query()).unwrap().contains("b"));

        let err = write(&mut store, &doc, json!({"a": 1})).unwrap_err();
        assert_eq!(
            err,
            WriteError::UnboundVariable {
                name: "skipB".to_string()
            }
        );
    }

    #[test]
    fn fragments_tolerate_missing_fields() {
        let doc = Document::builder()
            .field(
                Field::new("node")
                    .select("__typename")
                    .select("id")
                    .select(InlineFragment::on("User").select("name"))
                    .select(Selection::spread("PostFields")),
            )
            .fragment(FragmentDefinition::new("PostFields", "Post").select("title"))
            .build()
            .unwrap();
        let mut store = NormalizedStore::new();
        write(&mut store, &doc, json!({"node": {"__typename": "User", "id": 1, "name": "n"}})).unwrap();
        let user = store.get(&key("User:1")).unwrap();
        assert_eq!(user.get("name"), Some(&StoreValue::from("n")));
        assert!(!user.contains("title"));
    }

    #[test]
    fn identity_none_uses_paths_everywhere() {
        let doc = Document::builder()
            .field(Field::new("user").select("__typename").select("id"))
            .build()
            .unwrap();
        let mut store = NormalizedStore::new();
        write_result_to_store(
            &mut store,
            &EntityKey::root_query(),
            &json!({"user": {"__typename": "U", "id": 1}}),
            &doc,
            &Variables::new(),
            &CacheConfig::default().with_identity(IdentityPolicy::None),
        )
        .unwrap();
        assert!(store.contains(&key("$ROOT_QUERY.user")));
        assert!(!store.contains(&key("U:1")));
    }

    #[test]
    fn aliases_do_not_affect_storage() {
        let doc = Document::builder()
            .field(Field::new("name").alias("title"))
            .build()
            .unwrap();
        let mut store = NormalizedStore::new();
        write(&mut store, &doc, json!({"title": "x"})).unwrap();
        let root = store.get(&EntityKey::root_query()).unwrap();
        assert_eq!(root.get("name"), Some(&StoreValue::from("x")));
    }
}
