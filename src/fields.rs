use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDateTime};
use rust_decimal::Decimal;
use serde_json::Value;

use crate::errors::FieldError;
use crate::model::TypeCode;

/// Sentinel key carried by relationship children to select an operation.
pub const OP_KEY: &str = "$op";

/// Relationship operation requested by a child document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RelOp {
    Add,
    Remove,
    /// Implicit upsert, used when a child carries no `$op`.
    Set,
}

impl RelOp {
    /// Classify a child document's `$op` value. Absence means `Set`.
    pub fn classify(child: &serde_json::Map<String, Value>) -> Result<Self, FieldError> {
        match child.get(OP_KEY) {
            None => Ok(Self::Set),
            Some(Value::String(op)) => match op.as_str() {
                "add" => Ok(Self::Add),
                "remove" => Ok(Self::Remove),
                other => Err(FieldError::new("unknown_op", "Not a valid operation.")
                    .with_param("op", other.to_string())),
            },
            Some(_) => Err(FieldError::new("unknown_op", "Not a valid operation.")),
        }
    }
}

/// Set of relationship operations a field permits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpSet(BTreeSet<RelOp>);

impl OpSet {
    pub fn all() -> Self {
        Self([RelOp::Add, RelOp::Remove, RelOp::Set].into_iter().collect())
    }

    pub fn none() -> Self {
        Self(BTreeSet::new())
    }

    pub fn only(ops: impl IntoIterator<Item = RelOp>) -> Self {
        Self(ops.into_iter().collect())
    }

    #[inline]
    pub fn allows(&self, op: RelOp) -> bool {
        self.0.contains(&op)
    }
}

impl Default for OpSet {
    fn default() -> Self {
        Self::all()
    }
}

/// Attributes shared by every field variant.
#[derive(Debug, Clone)]
pub struct FieldCommon {
    pub name: String,
    pub load_from: Option<String>,
    pub dump_to: Option<String>,
    pub required: bool,
    pub nullable: bool,
    pub read_only: bool,
    pub write_only: bool,
    pub description: Option<String>,
}

impl FieldCommon {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            load_from: None,
            dump_to: None,
            required: false,
            nullable: true,
            read_only: false,
            write_only: false,
            description: None,
        }
    }

    /// External name accepted on load; defaults to the canonical name.
    pub fn load_from(&self) -> &str {
        self.load_from.as_deref().unwrap_or(&self.name)
    }

    /// External name emitted on dump; defaults to the canonical name.
    pub fn dump_to(&self) -> &str {
        self.dump_to.as_deref().unwrap_or(&self.name)
    }
}

/// A typed projection of one scalar attribute.
#[derive(Debug, Clone)]
pub struct ScalarField {
    pub common: FieldCommon,
    pub type_code: TypeCode,
    pub length: Option<usize>,
}

impl ScalarField {
    pub fn new(name: impl Into<String>, type_code: TypeCode) -> Self {
        Self {
            common: FieldCommon::new(name),
            type_code,
            length: None,
        }
    }

    /// Parse the external form into the canonical stored value.
    ///
    /// Numeric strings coerce into integer fields; decimals canonicalize
    /// to their exact normalized string form; datetimes canonicalize to
    /// RFC 3339. Null passes only for nullable fields.
    pub fn load(&self, raw: &Value) -> Result<Value, FieldError> {
        if raw.is_null() {
            return if self.common.nullable {
                Ok(Value::Null)
            } else {
                Err(FieldError::new("null", "Field may not be null."))
            };
        }
        match self.type_code {
            TypeCode::Integer => match raw {
                Value::Number(number) if number.as_i64().is_some() => Ok(raw.clone()),
                Value::String(text) => text
                    .trim()
                    .parse::<i64>()
                    .map(Value::from)
                    .map_err(|_| FieldError::new("type", "Not a valid integer.")),
                _ => Err(FieldError::new("type", "Not a valid integer.")),
            },
            TypeCode::Decimal => {
                let parsed = match raw {
                    Value::Number(number) => number.to_string().parse::<Decimal>().ok(),
                    Value::String(text) => text.trim().parse::<Decimal>().ok(),
                    _ => None,
                };
                let decimal = parsed.ok_or_else(|| FieldError::new("type", "Not a valid number."))?;
                // Stored as the exact decimal string; a float would lose
                // the precision the parse just established.
                Ok(Value::String(decimal.normalize().to_string()))
            }
            TypeCode::String => match raw {
                Value::String(text) => {
                    if let Some(max) = self.length
                        && text.chars().count() > max
                    {
                        return Err(FieldError::new("length", format!("Longer than maximum length {max}."))
                            .with_param("length", max as i64));
                    }
                    Ok(raw.clone())
                }
                _ => Err(FieldError::new("type", "Not a valid string.")),
            },
            TypeCode::DateTime => match raw {
                Value::String(text) => parse_datetime(text)
                    .map(Value::from)
                    .ok_or_else(|| FieldError::new("type", "Not a valid datetime.")),
                _ => Err(FieldError::new("type", "Not a valid datetime.")),
            },
            TypeCode::Boolean => match raw {
                Value::Bool(_) => Ok(raw.clone()),
                Value::String(text) => match text.as_str() {
                    "true" | "True" | "1" => Ok(Value::Bool(true)),
                    "false" | "False" | "0" => Ok(Value::Bool(false)),
                    _ => Err(FieldError::new("type", "Not a valid boolean.")),
                },
                _ => Err(FieldError::new("type", "Not a valid boolean.")),
            },
        }
    }

    /// Project the canonical stored value back into the external form.
    /// Stored values are already canonical JSON, so this is a clone.
    pub fn dump(&self, value: Option<&Value>) -> Value {
        value.cloned().unwrap_or(Value::Null)
    }
}

fn parse_datetime(text: &str) -> Option<String> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.to_rfc3339());
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(text, format) {
            return Some(parsed.and_utc().to_rfc3339());
        }
        if format == "%Y-%m-%d"
            && let Ok(date) = chrono::NaiveDate::parse_from_str(text, format)
        {
            return Some(date.and_hms_opt(0, 0, 0)?.and_utc().to_rfc3339());
        }
    }
    None
}

/// A relationship field carrying another entity's schema, resolved by
/// target model name at use time so cycles are representable.
#[derive(Debug, Clone)]
pub struct NestedField {
    pub common: FieldCommon,
    pub target: String,
    pub many: bool,
    pub ops: OpSet,
}

impl NestedField {
    pub fn new(name: impl Into<String>, target: impl Into<String>, many: bool) -> Self {
        Self {
            common: FieldCommon::new(name),
            target: target.into(),
            many,
            ops: OpSet::all(),
        }
    }

    pub fn with_ops(mut self, ops: OpSet) -> Self {
        self.ops = ops;
        self
    }
}

/// One field of a schema: a scalar attribute or a nested relationship.
#[derive(Debug, Clone)]
pub enum Field {
    Scalar(ScalarField),
    Nested(NestedField),
}

impl Field {
    pub fn common(&self) -> &FieldCommon {
        match self {
            Field::Scalar(field) => &field.common,
            Field::Nested(field) => &field.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut FieldCommon {
        match self {
            Field::Scalar(field) => &mut field.common,
            Field::Nested(field) => &mut field.common,
        }
    }

    pub fn name(&self) -> &str {
        &self.common().name
    }

    pub fn load_from(&self) -> &str {
        self.common().load_from()
    }

    pub fn dump_to(&self) -> &str {
        self.common().dump_to()
    }

    pub fn as_scalar(&self) -> Option<&ScalarField> {
        match self {
            Field::Scalar(field) => Some(field),
            Field::Nested(_) => None,
        }
    }

    pub fn as_nested(&self) -> Option<&NestedField> {
        match self {
            Field::Nested(field) => Some(field),
            Field::Scalar(_) => None,
        }
    }

    pub fn is_nested(&self) -> bool {
        matches!(self, Field::Nested(_))
    }
}
