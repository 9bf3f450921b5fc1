use std::fmt;

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde_json::Value;

use crate::errors::SessionError;
use crate::filters::{FilterExpr, OffsetLimit, SortSpec};
use crate::model::{ModelDescriptor, TypeCode};

/// One entity's scalar attributes, as stored by the session.
pub type Row = serde_json::Map<String, Value>;

/// Characters escaped when rendering a key component into a path segment.
/// Commas must survive inside composite-key components.
const KEY_COMPONENT: &AsciiSet = &CONTROLS.add(b',').add(b'%').add(b'/').add(b'?').add(b'#');

/// A single identity key value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyValue {
    Int(i64),
    Str(String),
}

impl KeyValue {
    /// Coerce a JSON value into a key value of the attribute's type.
    /// Integer keys accept numeric strings, mirroring scalar field loads.
    pub fn from_value(value: &Value, type_code: TypeCode) -> Option<Self> {
        match type_code {
            TypeCode::Integer => match value {
                Value::Number(number) => number.as_i64().map(Self::Int),
                Value::String(raw) => raw.trim().parse::<i64>().ok().map(Self::Int),
                _ => None,
            },
            _ => match value {
                Value::String(raw) => Some(Self::Str(raw.clone())),
                Value::Number(number) => Some(Self::Str(number.to_string())),
                _ => None,
            },
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Int(value) => Value::from(*value),
            Self::Str(value) => Value::from(value.clone()),
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Str(value) => write!(f, "{}", utf8_percent_encode(value, KEY_COMPONENT)),
        }
    }
}

/// Ordered identity tuple for one entity, matching the model's `id_keys`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityKey(pub Vec<KeyValue>);

impl EntityKey {
    pub fn single(value: KeyValue) -> Self {
        Self(vec![value])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Extract the key from a row, if every id attribute is present.
    pub fn from_row(model: &ModelDescriptor, row: &Row) -> Option<Self> {
        let mut values = Vec::with_capacity(model.id_keys.len());
        for key in &model.id_keys {
            let attr = model.attribute(key)?;
            let value = row.get(key)?;
            values.push(KeyValue::from_value(value, attr.type_code)?);
        }
        Some(Self(values))
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{value}")?;
        }
        Ok(())
    }
}

/// Scope restricting a query to the members of one relationship.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationScope {
    pub model: String,
    pub key: EntityKey,
    pub relationship: String,
}

/// A fully-parsed collection query handed to the session.
#[derive(Debug, Clone, Default)]
pub struct QueryPlan {
    pub filters: Option<FilterExpr>,
    pub sorts: Vec<SortSpec>,
    pub window: OffsetLimit,
    pub scope: Option<RelationScope>,
}

impl QueryPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filters(mut self, filters: Option<FilterExpr>) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_sorts(mut self, sorts: Vec<SortSpec>) -> Self {
        self.sorts = sorts;
        self
    }

    pub fn with_window(mut self, window: OffsetLimit) -> Self {
        self.window = window;
        self
    }

    pub fn scoped(mut self, scope: RelationScope) -> Self {
        self.scope = Some(scope);
        self
    }
}

/// The database collaborator.
///
/// One session is bound to one router/resource call tree and is the unit
/// of transactional consistency; every method may block on the store.
/// The core never retains entity references between calls — rows are
/// fetched, mutated through this interface, and re-fetched for dumping.
pub trait ModelSession {
    fn get(&self, model: &str, key: &EntityKey) -> Result<Option<Row>, SessionError>;

    fn query(&self, model: &str, plan: &QueryPlan) -> Result<Vec<Row>, SessionError>;

    /// Insert a new row, assigning any absent id-key values, and return
    /// the resulting identity.
    fn insert(&mut self, model: &str, row: Row) -> Result<EntityKey, SessionError>;

    fn update(&mut self, model: &str, key: &EntityKey, changes: Row) -> Result<(), SessionError>;

    fn delete(&mut self, model: &str, key: &EntityKey) -> Result<(), SessionError>;

    fn related(&self, model: &str, key: &EntityKey, relationship: &str) -> Result<Vec<Row>, SessionError>;

    fn is_linked(
        &self,
        model: &str,
        key: &EntityKey,
        relationship: &str,
        child: &EntityKey,
    ) -> Result<bool, SessionError>;

    fn link(
        &mut self,
        model: &str,
        key: &EntityKey,
        relationship: &str,
        child: &EntityKey,
    ) -> Result<(), SessionError>;

    fn unlink(
        &mut self,
        model: &str,
        key: &EntityKey,
        relationship: &str,
        child: &EntityKey,
    ) -> Result<(), SessionError>;

    /// Drop every member of a relationship (used to null a to-one link).
    fn clear_related(&mut self, model: &str, key: &EntityKey, relationship: &str) -> Result<(), SessionError>;

    fn commit(&mut self) -> Result<(), SessionError>;

    fn rollback(&mut self) -> Result<(), SessionError>;
}
