//! Store reader and diff engine: the read path.
//!
//! Reconstructs a result tree from a store snapshot by walking the same
//! selection set the normalizer walks, following references from record to
//! record. Reads are pure: the store is only ever borrowed immutably.
//!
//! Missing data is reported per field. A dangling reference, or a list
//! containing one, makes that field missing without disturbing its
//! siblings; the caller chooses between a partial tree and a
//! [`ReadError::Miss`].

use serde_json::{Map, Value};
use tracing::trace;

use crate::config::CacheConfig;
use crate::document::{should_include, Document, Field, Selection, SelectionSet, Variables};
use crate::error::ReadError;
use crate::identity::fragment_matches;
use crate::key::EntityKey;
use crate::record::{EntityRecord, TYPENAME_FIELD};
use crate::store::NormalizedStore;
use crate::value::StoreValue;

/// Parameters of a read or diff.
#[derive(Debug, Clone)]
pub struct ReadRequest<'a> {
    /// Document to read.
    pub document: &'a Document,
    /// Variables for argument evaluation.
    pub variables: &'a Variables,
    /// Record the top-level selection is read from.
    pub root: EntityKey,
    /// Return whatever resolves instead of failing on the first miss.
    pub return_partial_data: bool,
    /// Answer `None` rather than "all fields missing" when `root` is absent.
    pub null_if_id_not_found: bool,
}

impl<'a> ReadRequest<'a> {
    /// A non-partial read from the query root.
    #[must_use]
    pub fn new(document: &'a Document, variables: &'a Variables) -> Self {
        Self {
            document,
            variables,
            root: EntityKey::root_query(),
            return_partial_data: false,
            null_if_id_not_found: false,
        }
    }

    /// Reads from `root` instead of the query root.
    #[must_use]
    pub fn root(mut self, root: EntityKey) -> Self {
        self.root = root;
        self
    }

    /// Returns what resolves instead of failing on a miss.
    #[must_use]
    pub fn return_partial_data(mut self, partial: bool) -> Self {
        self.return_partial_data = partial;
        self
    }

    /// Answers `None` when the root record is absent.
    #[must_use]
    pub fn null_if_id_not_found(mut self, null: bool) -> Self {
        self.null_if_id_not_found = null;
        self
    }
}

/// One field the store could not supply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingField {
    /// Record the field was looked up on.
    pub key: EntityKey,
    /// Store field name (arguments encoded).
    pub field: String,
    /// Dotted result path, e.g. `user.friends.0.name`.
    pub path: String,
}

/// Outcome of diffing a query against a store.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffResult {
    /// The reconstructed tree; `None` only for an absent root under `null_if_id_not_found`.
    pub result: Option<Value>,
    /// True if any field anywhere in the tree was missing.
    pub is_missing: bool,
    /// Every field that could not be supplied.
    pub missing_fields: Vec<MissingField>,
}

/// Diffs `request` against `store`.
///
/// # Errors
/// - `Miss`: something was missing and `return_partial_data` is false
/// - `UnboundVariable`: a directive condition refers to an unbound variable
pub fn diff_query_against_store(
    store: &NormalizedStore,
    config: &CacheConfig,
    request: &ReadRequest<'_>,
) -> Result<DiffResult, ReadError> {
    let root = store.get(&request.root);
    if root.is_none() && request.null_if_id_not_found {
        return Ok(DiffResult {
            result: None,
            is_missing: false,
            missing_fields: Vec::new(),
        });
    }

    let empty = EntityRecord::new();
    let mut reader = Reader {
        store,
        config,
        document: request.document,
        variables: request.variables,
        missing: Vec::new(),
    };
    let object = reader.read_selection_set(
        &request.root,
        Source::Record(root.unwrap_or(&empty)),
        request.document.selection_set(),
        "",
    )?;

    if !request.return_partial_data {
        if let Some(first) = reader.missing.into_iter().next() {
            return Err(ReadError::Miss {
                key: first.key,
                field: first.field,
                path: first.path,
            });
        }
        return Ok(DiffResult {
            result: Some(Value::Object(object)),
            is_missing: false,
            missing_fields: Vec::new(),
        });
    }

    Ok(DiffResult {
        result: Some(Value::Object(object)),
        is_missing: !reader.missing.is_empty(),
        missing_fields: reader.missing,
    })
}

/// Reads a result that must be fully satisfiable from `store`.
///
/// `request.return_partial_data` is ignored. Returns `None` only when the
/// root is absent and `null_if_id_not_found` is set.
pub fn read_query_from_store(
    store: &NormalizedStore,
    config: &CacheConfig,
    request: &ReadRequest<'_>,
) -> Result<Option<Value>, ReadError> {
    let strict = ReadRequest {
        return_partial_data: false,
        ..request.clone()
    };
    Ok(diff_query_against_store(store, config, &strict)?.result)
}

#[derive(Clone, Copy)]
enum Source<'a> {
    Record(&'a EntityRecord),
    Json(&'a Map<String, Value>),
}

fn join(path: &str, segment: &str) -> String {
    if path.is_empty() {
        segment.to_string()
    } else {
        format!("{path}.{segment}")
    }
}

/// Merges `src` into `dst`, recursing into objects and element-wise into lists.
fn merge_objects(dst: &mut Map<String, Value>, src: Map<String, Value>) {
    for (k, v) in src {
        match (dst.get_mut(&k), v) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => merge_objects(existing, incoming),
            (Some(Value::Array(existing)), Value::Array(incoming)) if existing.len() == incoming.len() => {
                for (slot, item) in existing.iter_mut().zip(incoming) {
                    match (slot, item) {
                        (Value::Object(a), Value::Object(b)) => merge_objects(a, b),
                        (slot, item) => *slot = item,
                    }
                }
            }
            (_, v) => {
                dst.insert(k, v);
            }
        }
    }
}

struct Reader<'a> {
    store: &'a NormalizedStore,
    config: &'a CacheConfig,
    document: &'a Document,
    variables: &'a Variables,
    missing: Vec<MissingField>,
}

impl<'a> Reader<'a> {
    fn record_missing(&mut self, key: &EntityKey, field: &str, path: String) {
        trace!(key = %key, field, path = %path, "cache miss");
        self.missing.push(MissingField {
            key: key.clone(),
            field: field.to_string(),
            path,
        });
    }

    fn type_matches(&self, source: Source<'_>, type_condition: &str) -> bool {
        match source {
            Source::Record(record) => {
                fragment_matches(self.config.fragment_matcher.as_ref(), record, type_condition)
            }
            Source::Json(object) => {
                let mut candidate = EntityRecord::new();
                if let Some(Value::String(t)) = object.get(TYPENAME_FIELD) {
                    candidate.insert(TYPENAME_FIELD, StoreValue::from(t.as_str()));
                }
                fragment_matches(self.config.fragment_matcher.as_ref(), &candidate, type_condition)
            }
        }
    }

    fn read_selection_set(
        &mut self,
        key: &EntityKey,
        source: Source<'a>,
        selection_set: &'a SelectionSet,
        path: &str,
    ) -> Result<Map<String, Value>, ReadError> {
        let mut out = Map::new();
        for selection in selection_set.iter() {
            let include = should_include(selection.directives(), self.variables)
                .map_err(|name| ReadError::UnboundVariable { name })?;
            if !include {
                continue;
            }
            match selection {
                Selection::Field(field) => {
                    let path = join(path, field.result_key());
                    if let Some(value) = self.read_field(key, source, field, path)? {
                        match (out.get_mut(field.result_key()), value) {
                            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                                merge_objects(existing, incoming);
                            }
                            (_, value) => {
                                out.insert(field.result_key().to_string(), value);
                            }
                        }
                    }
                }
                Selection::FragmentSpread(spread) => {
                    let Some(fragment) = self.document.fragment(&spread.name) else {
                        continue;
                    };
                    if self.type_matches(source, &fragment.type_condition) {
                        let fields = self.read_selection_set(key, source, &fragment.selection_set, path)?;
                        merge_objects(&mut out, fields);
                    }
                }
                Selection::InlineFragment(inline) => {
                    let matches = inline
                        .type_condition
                        .as_deref()
                        .map_or(true, |tc| self.type_matches(source, tc));
                    if matches {
                        let fields = self.read_selection_set(key, source, &inline.selection_set, path)?;
                        merge_objects(&mut out, fields);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Returns `None` when the field is missing (already recorded).
    fn read_field(
        &mut self,
        key: &EntityKey,
        source: Source<'a>,
        field: &'a Field,
        path: String,
    ) -> Result<Option<Value>, ReadError> {
        match source {
            Source::Record(record) => {
                let store_field = field.store_field_name(self.variables);
                match record.get(&store_field) {
                    Some(value) => self.read_store_value(key, &store_field, value, field, &path),
                    None => {
                        self.record_missing(key, &store_field, path);
                        Ok(None)
                    }
                }
            }
            Source::Json(object) => match object.get(&field.name) {
                Some(value) => self.read_json(key, value, field, &path).map(Some),
                None => {
                    self.record_missing(key, &field.name, path);
                    Ok(None)
                }
            },
        }
    }

    fn read_store_value(
        &mut self,
        key: &EntityKey,
        store_field: &str,
        value: &'a StoreValue,
        field: &'a Field,
        path: &str,
    ) -> Result<Option<Value>, ReadError> {
        match value {
            StoreValue::Scalar(v) => Ok(Some(v.clone())),
            StoreValue::Json(v) => self.read_json(key, v, field, path).map(Some),
            StoreValue::Reference { key: target, .. } => {
                let Some(set) = &field.selection_set else {
                    return Ok(Some(Value::String(target.to_string())));
                };
                let Some(record) = self.store.get(target) else {
                    self.record_missing(key, store_field, path.to_string());
                    return Ok(None);
                };
                let object = self.read_selection_set(target, Source::Record(record), set, path)?;
                Ok(Some(Value::Object(object)))
            }
            StoreValue::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                let mut complete = true;
                for (index, item) in items.iter().enumerate() {
                    let item_path = join(path, &index.to_string());
                    match self.read_store_value(key, store_field, item, field, &item_path)? {
                        Some(v) => out.push(v),
                        None => complete = false,
                    }
                }
                Ok(complete.then_some(Value::Array(out)))
            }
        }
    }

    /// Embedded objects are traversed structurally; the key context stays
    /// on the record that holds them.
    fn read_json(
        &mut self,
        key: &EntityKey,
        value: &'a Value,
        field: &'a Field,
        path: &str,
    ) -> Result<Value, ReadError> {
        let Some(set) = &field.selection_set else {
            return Ok(value.clone());
        };
        match value {
            Value::Object(object) => {
                let fields = self.read_selection_set(key, Source::Json(object), set, path)?;
                Ok(Value::Object(fields))
            }
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    out.push(self.read_json(key, item, field, &join(path, &index.to_string()))?);
                }
                Ok(Value::Array(out))
            }
            scalar => Ok(scalar.clone()),
        }
    }
}
