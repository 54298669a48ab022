//! Query document model.
//!
//! The cache does not parse query text; it consumes an already-parsed
//! selection tree. This module defines that tree (fields, aliases, argument
//! expressions, fragment definitions and spreads, `@skip` / `@include`) and
//! the small amount of evaluation the cache needs: resolving argument
//! expressions against variables and deciding whether a selection is active.
//!
//! # Example
//! ```
//! use kyrocache::{ArgValue, Document, Field};
//!
//! let doc = Document::builder()
//!     .field(
//!         Field::new("user")
//!             .arg("id", ArgValue::variable("id"))
//!             .select(Field::new("id"))
//!             .select(Field::new("name")),
//!     )
//!     .build()
//!     .unwrap();
//! assert_eq!(doc.selection_set().len(), 1);
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::error::DocumentError;
use crate::key::store_field_name;

/// Variable bindings referenced by argument expressions.
pub type Variables = serde_json::Map<String, serde_json::Value>;

static NAME_RE: OnceLock<regex::Regex> = OnceLock::new();

fn name_regex() -> &'static regex::Regex {
    NAME_RE.get_or_init(|| {
        regex::Regex::new(r"^[_A-Za-z][_0-9A-Za-z]*$").unwrap_or_else(|_| unreachable!("static pattern"))
    })
}

fn check_name(name: &str) -> Result<(), DocumentError> {
    if name_regex().is_match(name) {
        Ok(())
    } else {
        Err(DocumentError::InvalidName {
            name: name.to_string(),
        })
    }
}

/// An argument expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ArgValue {
    /// `$name`, resolved against the variables.
    Variable(String),
    /// `null`
    Null,
    /// A boolean literal.
    Boolean(bool),
    /// An integer literal.
    Int(i64),
    /// A float literal.
    Float(f64),
    /// A string literal.
    String(String),
    /// An enum value, stored as its name.
    Enum(String),
    /// A list literal.
    List(Vec<ArgValue>),
    /// An object literal, in source order.
    Object(Vec<(String, ArgValue)>),
}

impl ArgValue {
    /// A reference to variable `name`.
    #[must_use]
    pub fn variable(name: impl Into<String>) -> Self {
        Self::Variable(name.into())
    }

    /// Evaluates the expression against `variables`.
    ///
    /// Returns `None` for an unbound variable at the top level. Inside a list
    /// an unbound variable becomes `null`; inside an object the entry is
    /// dropped.
    #[must_use]
    pub fn evaluate(&self, variables: &Variables) -> Option<serde_json::Value> {
        use serde_json::Value;

        match self {
            Self::Variable(name) => variables.get(name).cloned(),
            Self::Null => Some(Value::Null),
            Self::Boolean(b) => Some(Value::Bool(*b)),
            Self::Int(i) => Some(Value::from(*i)),
            Self::Float(f) => Some(Value::from(*f)),
            Self::String(s) | Self::Enum(s) => Some(Value::String(s.clone())),
            Self::List(items) => Some(Value::Array(
                items
                    .iter()
                    .map(|item| item.evaluate(variables).unwrap_or(Value::Null))
                    .collect(),
            )),
            Self::Object(entries) => Some(Value::Object(
                entries
                    .iter()
                    .filter_map(|(k, v)| v.evaluate(variables).map(|v| (k.clone(), v)))
                    .collect(),
            )),
        }
    }
}

impl From<bool> for ArgValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<i64> for ArgValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for ArgValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<&str> for ArgValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

/// A directive such as `@skip(if: $flag)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Directive {
    /// Directive name without the `@`.
    pub name: String,
    /// Directive arguments in source order.
    pub arguments: Vec<(String, ArgValue)>,
}

impl Directive {
    /// `@skip(if: <condition>)`.
    #[must_use]
    pub fn skip(condition: ArgValue) -> Self {
        Self {
            name: "skip".to_string(),
            arguments: vec![("if".to_string(), condition)],
        }
    }

    /// `@include(if: <condition>)`.
    #[must_use]
    pub fn include(condition: ArgValue) -> Self {
        Self {
            name: "include".to_string(),
            arguments: vec![("if".to_string(), condition)],
        }
    }
}

/// Decides whether a selection carrying `directives` is active.
///
/// Returns the name of the offending variable if an `if:` condition refers to
/// a variable that is unbound or not a boolean.
pub fn should_include(directives: &[Directive], variables: &Variables) -> Result<bool, String> {
    let mut include = true;
    for directive in directives {
        let negate = match directive.name.as_str() {
            "skip" => true,
            "include" => false,
            _ => continue,
        };
        let Some((_, condition)) = directive.arguments.iter().find(|(name, _)| name == "if") else {
            continue;
        };
        let value = match condition {
            ArgValue::Boolean(b) => *b,
            ArgValue::Variable(name) => match variables.get(name).and_then(serde_json::Value::as_bool) {
                Some(b) => b,
                None => return Err(name.clone()),
            },
            _ => continue,
        };
        if value == negate {
            include = false;
        }
    }
    Ok(include)
}

/// A selected field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    /// Schema field name.
    pub name: String,
    /// Result key override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Arguments in source order.
    #[serde(default)]
    pub arguments: Vec<(String, ArgValue)>,
    /// `@skip` / `@include` and any other directives.
    #[serde(default)]
    pub directives: Vec<Directive>,
    /// Sub-selection; `None` for leaf fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection_set: Option<SelectionSet>,
}

impl Field {
    /// Creates a leaf field.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            arguments: Vec::new(),
            directives: Vec::new(),
            selection_set: None,
        }
    }

    /// Sets the result key.
    #[must_use]
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Adds an argument.
    #[must_use]
    pub fn arg(mut self, name: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.arguments.push((name.into(), value.into()));
        self
    }

    /// Attaches a directive.
    #[must_use]
    pub fn directive(mut self, directive: Directive) -> Self {
        self.directives.push(directive);
        self
    }

    /// Adds a sub-selection, turning this field into an object field.
    #[must_use]
    pub fn select(mut self, selection: impl Into<Selection>) -> Self {
        self.selection_set
            .get_or_insert_with(SelectionSet::default)
            .push(selection.into());
        self
    }

    /// Key under which this field appears in a result object.
    #[must_use]
    pub fn result_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// Evaluated arguments, with unbound variables dropped.
    #[must_use]
    pub fn evaluate_arguments(&self, variables: &Variables) -> serde_json::Map<String, serde_json::Value> {
        self.arguments
            .iter()
            .filter_map(|(name, value)| value.evaluate(variables).map(|v| (name.clone(), v)))
            .collect()
    }

    /// Field name under which this field is stored in a record.
    #[must_use]
    pub fn store_field_name(&self, variables: &Variables) -> String {
        store_field_name(&self.name, &self.evaluate_arguments(variables))
    }
}

impl From<&str> for Field {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// `...Name`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentSpread {
    /// Name of the spread fragment.
    pub name: String,
    /// Directives on the spread.
    #[serde(default)]
    pub directives: Vec<Directive>,
}

/// `... on Type { ... }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineFragment {
    /// Type the fragment applies to; `None` applies everywhere.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_condition: Option<String>,
    /// Directives on the fragment.
    #[serde(default)]
    pub directives: Vec<Directive>,
    /// Selections applied when the type condition matches.
    pub selection_set: SelectionSet,
}

impl InlineFragment {
    /// Creates an inline fragment conditioned on `type_condition`.
    #[must_use]
    pub fn on(type_condition: impl Into<String>) -> Self {
        Self {
            type_condition: Some(type_condition.into()),
            directives: Vec::new(),
            selection_set: SelectionSet::default(),
        }
    }

    /// Adds a selection.
    #[must_use]
    pub fn select(mut self, selection: impl Into<Selection>) -> Self {
        self.selection_set.push(selection.into());
        self
    }
}

/// One entry of a selection set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Selection {
    /// A field.
    Field(Field),
    /// A named fragment spread.
    FragmentSpread(FragmentSpread),
    /// An inline fragment.
    InlineFragment(InlineFragment),
}

impl Selection {
    /// `...name`
    #[must_use]
    pub fn spread(name: impl Into<String>) -> Self {
        Self::FragmentSpread(FragmentSpread {
            name: name.into(),
            directives: Vec::new(),
        })
    }

    /// Directives attached to this selection.
    #[must_use]
    pub fn directives(&self) -> &[Directive] {
        match self {
            Self::Field(f) => &f.directives,
            Self::FragmentSpread(s) => &s.directives,
            Self::InlineFragment(i) => &i.directives,
        }
    }
}

impl From<Field> for Selection {
    fn from(field: Field) -> Self {
        Self::Field(field)
    }
}

impl From<InlineFragment> for Selection {
    fn from(fragment: InlineFragment) -> Self {
        Self::InlineFragment(fragment)
    }
}

impl From<&str> for Selection {
    fn from(name: &str) -> Self {
        Self::Field(Field::new(name))
    }
}

/// An ordered list of selections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SelectionSet {
    selections: Vec<Selection>,
}

impl SelectionSet {
    /// Wraps `selections` in order.
    #[must_use]
    pub fn new(selections: Vec<Selection>) -> Self {
        Self { selections }
    }

    /// Appends a selection.
    pub fn push(&mut self, selection: Selection) {
        self.selections.push(selection);
    }

    /// Selections in document order.
    pub fn iter(&self) -> impl Iterator<Item = &Selection> {
        self.selections.iter()
    }

    /// Number of selections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.selections.len()
    }

    /// True if nothing is selected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.selections.is_empty()
    }
}

/// `fragment Name on Type { ... }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentDefinition {
    /// Fragment name, unique within a document.
    pub name: String,
    /// Type the fragment applies to.
    pub type_condition: String,
    /// The fragment's selections.
    pub selection_set: SelectionSet,
}

impl FragmentDefinition {
    /// An empty fragment `name` on `type_condition`.
    #[must_use]
    pub fn new(name: impl Into<String>, type_condition: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_condition: type_condition.into(),
            selection_set: SelectionSet::default(),
        }
    }

    /// Adds a selection.
    #[must_use]
    pub fn select(mut self, selection: impl Into<Selection>) -> Self {
        self.selection_set.push(selection.into());
        self
    }
}

/// A parsed query document: one operation selection set plus fragments.
///
/// Deserialized documents go through the same checks as
/// [`DocumentBuilder::build`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DocumentParts")]
pub struct Document {
    #[serde(skip_serializing_if = "Option::is_none")]
    operation_name: Option<String>,
    selection_set: SelectionSet,
    #[serde(default)]
    fragments: HashMap<String, FragmentDefinition>,
}

impl Document {
    /// Starts building a document.
    #[must_use]
    pub fn builder() -> DocumentBuilder {
        DocumentBuilder::default()
    }

    /// Name of the operation, if it has one.
    #[must_use]
    pub fn operation_name(&self) -> Option<&str> {
        self.operation_name.as_deref()
    }

    /// The operation's top-level selection set.
    #[must_use]
    pub fn selection_set(&self) -> &SelectionSet {
        &self.selection_set
    }

    /// Looks up a fragment definition by name.
    #[must_use]
    pub fn fragment(&self, name: &str) -> Option<&FragmentDefinition> {
        self.fragments.get(name)
    }

    /// Returns a document whose root selection is a single fragment.
    ///
    /// Used for fragment reads and writes against an arbitrary entity key.
    /// With `fragment_name` absent the document must define exactly one
    /// fragment.
    pub fn fragment_document(&self, fragment_name: Option<&str>) -> Result<Self, DocumentError> {
        let name = match fragment_name {
            Some(name) => name.to_string(),
            None if self.fragments.len() == 1 => self
                .fragments
                .keys()
                .next()
                .cloned()
                .ok_or(DocumentError::EmptySelection)?,
            None => return Err(DocumentError::EmptySelection),
        };
        if !self.fragments.contains_key(&name) {
            return Err(DocumentError::UnknownFragment { name });
        }
        Ok(Self {
            operation_name: None,
            selection_set: SelectionSet::new(vec![Selection::spread(name)]),
            fragments: self.fragments.clone(),
        })
    }
}

/// Builder for [`Document`]. Names and fragment spreads are checked on `build`.
#[derive(Debug, Clone, Default)]
pub struct DocumentBuilder {
    operation_name: Option<String>,
    selections: Vec<Selection>,
    fragments: Vec<FragmentDefinition>,
}

impl DocumentBuilder {
    /// Names the operation.
    #[must_use]
    pub fn operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    /// Adds a top-level field.
    #[must_use]
    pub fn field(mut self, field: impl Into<Field>) -> Self {
        self.selections.push(Selection::Field(field.into()));
        self
    }

    /// Adds any top-level selection.
    #[must_use]
    pub fn selection(mut self, selection: impl Into<Selection>) -> Self {
        self.selections.push(selection.into());
        self
    }

    /// Adds a fragment definition.
    #[must_use]
    pub fn fragment(mut self, fragment: FragmentDefinition) -> Self {
        self.fragments.push(fragment);
        self
    }

    /// Validates names and produces the document.
    ///
    /// A document must select something, either at the top level or (for
    /// fragment documents) through at least one fragment definition.
    ///
    /// # Errors
    /// - `InvalidName`: a name is not a GraphQL name
    /// - `EmptySelection`: nothing is selected
    /// - `UnknownFragment`: a spread names an undefined fragment
    /// - `FragmentCycle`: a fragment reaches itself through spreads
    pub fn build(self) -> Result<Document, DocumentError> {
        if self.selections.is_empty() && self.fragments.is_empty() {
            return Err(DocumentError::EmptySelection);
        }
        if let Some(name) = &self.operation_name {
            check_name(name)?;
        }
        for selection in &self.selections {
            validate_selection(selection)?;
        }
        let mut fragments = HashMap::with_capacity(self.fragments.len());
        for fragment in self.fragments {
            check_name(&fragment.name)?;
            check_name(&fragment.type_condition)?;
            for selection in fragment.selection_set.iter() {
                validate_selection(selection)?;
            }
            fragments.insert(fragment.name.clone(), fragment);
        }
        let selection_set = SelectionSet::new(self.selections);
        check_spreads(&selection_set, &fragments)?;
        Ok(Document {
            operation_name: self.operation_name,
            selection_set,
            fragments,
        })
    }
}

/// Wire shape of [`Document`], validated on the way in.
#[derive(Deserialize)]
struct DocumentParts {
    #[serde(default)]
    operation_name: Option<String>,
    selection_set: SelectionSet,
    #[serde(default)]
    fragments: HashMap<String, FragmentDefinition>,
}

impl TryFrom<DocumentParts> for Document {
    type Error = DocumentError;

    fn try_from(parts: DocumentParts) -> Result<Self, Self::Error> {
        DocumentBuilder {
            operation_name: parts.operation_name,
            selections: parts.selection_set.selections,
            fragments: parts.fragments.into_values().collect(),
        }
        .build()
    }
}

/// Every spread must name a defined fragment, and no fragment may reach
/// itself through spreads.
fn check_spreads<'a>(
    selection_set: &'a SelectionSet,
    fragments: &'a HashMap<String, FragmentDefinition>,
) -> Result<(), DocumentError> {
    let mut done = HashSet::new();
    let mut roots = Vec::new();
    collect_spreads(selection_set, &mut roots);
    roots.extend(fragments.keys().map(String::as_str));
    for name in roots {
        visit_fragment(name, fragments, &mut Vec::new(), &mut done)?;
    }
    Ok(())
}

fn visit_fragment<'a>(
    name: &'a str,
    fragments: &'a HashMap<String, FragmentDefinition>,
    visiting: &mut Vec<&'a str>,
    done: &mut HashSet<&'a str>,
) -> Result<(), DocumentError> {
    if done.contains(name) {
        return Ok(());
    }
    if visiting.contains(&name) {
        return Err(DocumentError::FragmentCycle {
            name: name.to_string(),
        });
    }
    let fragment = fragments.get(name).ok_or_else(|| DocumentError::UnknownFragment {
        name: name.to_string(),
    })?;

    visiting.push(name);
    let mut spreads = Vec::new();
    collect_spreads(&fragment.selection_set, &mut spreads);
    for spread in spreads {
        visit_fragment(spread, fragments, visiting, done)?;
    }
    visiting.pop();
    done.insert(name);
    Ok(())
}

fn collect_spreads<'a>(selection_set: &'a SelectionSet, out: &mut Vec<&'a str>) {
    for selection in selection_set.iter() {
        match selection {
            Selection::Field(field) => {
                if let Some(set) = &field.selection_set {
                    collect_spreads(set, out);
                }
            }
            Selection::FragmentSpread(spread) => out.push(&spread.name),
            Selection::InlineFragment(inline) => collect_spreads(&inline.selection_set, out),
        }
    }
}

fn validate_directives(directives: &[Directive]) -> Result<(), DocumentError> {
    for directive in directives {
        check_name(&directive.name)?;
    }
    Ok(())
}

fn validate_selection(selection: &Selection) -> Result<(), DocumentError> {
    match selection {
        Selection::Field(field) => {
            check_name(&field.name)?;
            if let Some(alias) = &field.alias {
                check_name(alias)?;
            }
            for (name, _) in &field.arguments {
                check_name(name)?;
            }
            validate_directives(&field.directives)?;
            if let Some(set) = &field.selection_set {
                for s in set.iter() {
                    validate_selection(s)?;
                }
            }
        }
        Selection::FragmentSpread(spread) => {
            check_name(&spread.name)?;
            validate_directives(&spread.directives)?;
        }
        Selection::InlineFragment(inline) => {
            if let Some(tc) = &inline.type_condition {
                check_name(tc)?;
            }
            validate_directives(&inline.directives)?;
            for s in inline.selection_set.iter() {
                validate_selection(s)?;
            }
        }
    }
    Ok(())
}
