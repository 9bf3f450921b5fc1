use std::collections::BTreeMap;
use std::collections::BTreeSet;

use once_cell::sync::OnceCell;
use serde_json::{Map, Value};

use crate::errors::{Error, ErrorMessages, ValidationError};
use crate::fields::{Field, OP_KEY, OpSet, RelOp, ScalarField};
use crate::registry::Registry;
use crate::session::{EntityKey, KeyValue, ModelSession, Row};

const INVALID_TYPE: &str = "Invalid input type.";
const UNKNOWN_FIELD: &str = "Unknown field.";
const READ_ONLY_FIELD: &str = "Read-only field.";
const MISSING_REQUIRED: &str = "Missing data for required field.";
const NOT_NULLABLE: &str = "Field may not be null.";
const OP_NOT_PERMITTED: &str = "Operation not permitted on this field.";
const NOT_A_MEMBER: &str = "Entity is not a member of this collection.";
const ALREADY_A_MEMBER: &str = "Entity is already a member of this collection.";
const REMOVE_TARGET_MISSING: &str = "Could not find an entity matching the given identity.";

/// Per-call load settings. The schema itself stays immutable and shared;
/// everything request-scoped lives here.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Skip required-field validation for absent fields.
    pub partial: bool,
    /// Escalate a non-empty error map into `Error::Validation`.
    pub strict: bool,
    /// Mutate this entity instead of resolving one from the document.
    pub instance: Option<EntityKey>,
}

impl LoadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partial(mut self, partial: bool) -> Self {
        self.partial = partial;
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn instance(mut self, key: EntityKey) -> Self {
        self.instance = Some(key);
        self
    }
}

/// Outcome of a non-strict load: the resolved entity (when resolution
/// got that far) plus the nested error map mirroring the input shape.
#[derive(Debug, Clone)]
pub struct LoadReport {
    pub key: Option<EntityKey>,
    pub errors: Value,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        match &self.errors {
            Value::Object(map) => map.is_empty(),
            _ => false,
        }
    }
}

/// Per-call dump settings: field selection and embedded projections.
#[derive(Debug, Clone, Default)]
pub struct DumpOptions {
    /// When non-empty, only these canonical field names are dumped.
    pub only: BTreeSet<String>,
    pub exclude: BTreeSet<String>,
    /// Dotted paths of relationships to project beyond the default depth.
    pub embeds: Vec<String>,
}

impl DumpOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn only<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.only = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn exclude<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.exclude = names.into_iter().map(Into::into).collect();
        self
    }
}

/// A named group of fields projecting one entity type.
///
/// Schemas are values: built by the converter (or by hand), optionally
/// adjusted via `field_mut`, then registered and shared. All per-request
/// state travels in `LoadOptions`/`DumpOptions`.
#[derive(Debug, Clone)]
pub struct Schema {
    pub model: String,
    pub fields: Vec<Field>,
    pub id_keys: Vec<String>,
    pub error_messages: ErrorMessages,
    by_load_from: OnceCell<BTreeMap<String, usize>>,
}

impl Schema {
    pub fn new(model: impl Into<String>, fields: Vec<Field>, id_keys: Vec<String>) -> Self {
        Self {
            model: model.into(),
            fields,
            id_keys,
            error_messages: ErrorMessages::new(),
            by_load_from: OnceCell::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|field| field.name() == name)
    }

    /// Mutable field access for composition-time adjustments. Panics if
    /// the memoized external-name index was already built.
    pub fn field_mut(&mut self, name: &str) -> Option<&mut Field> {
        assert!(
            self.by_load_from.get().is_none(),
            "schema fields are read-only once bound"
        );
        self.fields.iter_mut().find(|field| field.name() == name)
    }

    /// Restrict the operations permitted on a relationship field.
    pub fn restrict_ops(mut self, field: &str, ops: OpSet) -> Self {
        if let Some(Field::Nested(nested)) = self.field_mut(field) {
            nested.ops = ops;
        }
        self
    }

    pub fn with_error_messages(mut self, messages: ErrorMessages) -> Self {
        self.error_messages = messages;
        self
    }

    fn load_from_index(&self) -> &BTreeMap<String, usize> {
        self.by_load_from.get_or_init(|| {
            self.fields
                .iter()
                .enumerate()
                .map(|(index, field)| (field.load_from().to_string(), index))
                .collect()
        })
    }

    /// Resolve a field by the external name it loads from.
    pub fn field_by_load_from(&self, name: &str) -> Option<&Field> {
        self.load_from_index().get(name).map(|&index| &self.fields[index])
    }

    /// External load names paired with their fields, in index order.
    pub fn fields_by_load_from(&self) -> impl Iterator<Item = (&str, &Field)> {
        self.load_from_index()
            .iter()
            .map(|(name, &index)| (name.as_str(), &self.fields[index]))
    }

    /// Add a dotted path to the dump projection. A nested top segment
    /// becomes an embedded relationship; a scalar top segment is a plain
    /// `only` inclusion. Unknown segments fail.
    pub fn embed(&self, options: &mut DumpOptions, path: &str) -> Result<(), Error> {
        let top = path.split('.').next().unwrap_or(path);
        let field = self
            .field(top)
            .or_else(|| self.field_by_load_from(top))
            .ok_or_else(|| self.error_messages.bad_request("invalid_embed", &[("field", path)]))?;
        if field.is_nested() {
            options.embeds.push(path.to_string());
        } else {
            options.only.insert(field.name().to_string());
        }
        Ok(())
    }

    /// Coerce the document's identity values into a key, if complete.
    pub fn id_key_values(&self, data: &Map<String, Value>) -> Option<EntityKey> {
        let mut values = Vec::with_capacity(self.id_keys.len());
        for key in &self.id_keys {
            let field = self.field(key)?.as_scalar()?;
            let raw = data.get(field.common.load_from()).or_else(|| data.get(key))?;
            let loaded = field.load(raw).ok()?;
            values.push(KeyValue::from_value(&loaded, field.type_code)?);
        }
        Some(EntityKey(values))
    }

    /// Construct a bare instance carrying whatever scalar values the
    /// document supplies, coerced through their fields. Values that fail
    /// coercion are left for the load pass to report.
    pub fn make_instance(&self, session: &mut dyn ModelSession, data: &Map<String, Value>) -> Result<EntityKey, Error> {
        let mut row = Row::new();
        for field in &self.fields {
            let Field::Scalar(scalar) = field else { continue };
            if scalar.common.read_only {
                continue;
            }
            if let Some(raw) = data.get(scalar.common.load_from())
                && let Ok(value) = scalar.load(raw)
                && !value.is_null()
            {
                row.insert(scalar.common.name.clone(), value);
            }
        }
        Ok(session.insert(&self.model, row)?)
    }

    /// Resolve the document to an entity: a session lookup when every id
    /// key is present and matches a row, a fresh instance otherwise.
    /// Returns the key and whether an existing row was found.
    pub fn get_instance(
        &self,
        session: &mut dyn ModelSession,
        data: &Map<String, Value>,
    ) -> Result<(EntityKey, bool), Error> {
        if let Some(key) = self.id_key_values(data)
            && session.get(&self.model, &key)?.is_some()
        {
            return Ok((key, true));
        }
        Ok((self.make_instance(session, data)?, false))
    }

    /// Deserialize a document into the entity graph.
    ///
    /// Application order is deterministic: scalars in input order, then
    /// to-one relationships, then to-many relationships (removes before
    /// adds within each list). Errors accumulate into a map mirroring
    /// the input; in strict mode a non-empty map escalates.
    pub fn load(
        &self,
        registry: &Registry,
        session: &mut dyn ModelSession,
        data: &Value,
        options: &LoadOptions,
    ) -> Result<LoadReport, Error> {
        let report = match data.as_object() {
            Some(map) => {
                let (key, errors) = self.load_inner(registry, session, map, options.partial, options.instance.as_ref(), false)?;
                LoadReport {
                    key,
                    errors: Value::Object(errors),
                }
            }
            None => {
                let mut errors = Map::new();
                errors.insert("_schema".into(), Value::from(vec![Value::from(INVALID_TYPE)]));
                LoadReport {
                    key: None,
                    errors: Value::Object(errors),
                }
            }
        };
        if options.strict && !report.is_clean() {
            return Err(Error::Validation(ValidationError::new(report.errors)));
        }
        Ok(report)
    }

    fn load_inner(
        &self,
        registry: &Registry,
        session: &mut dyn ModelSession,
        data: &Map<String, Value>,
        partial: bool,
        instance: Option<&EntityKey>,
        as_child: bool,
    ) -> Result<(Option<EntityKey>, Map<String, Value>), Error> {
        let mut errors = Map::new();

        let (key, found) = match instance {
            Some(key) => (key.clone(), true),
            None => self.get_instance(session, data)?,
        };
        // An existing child resolved through a relationship merges only
        // the supplied fields; the root keeps the caller's semantics.
        let effective_partial = if as_child && found { true } else { partial };

        let mut scalar_changes = Row::new();
        let mut to_one: Vec<(&crate::fields::NestedField, &str, &Value)> = Vec::new();
        let mut to_many: Vec<(&crate::fields::NestedField, &str, &Value)> = Vec::new();

        for (input_name, value) in data {
            if input_name == OP_KEY {
                continue;
            }
            let Some(field) = self.field_by_load_from(input_name) else {
                push_field_error(&mut errors, input_name, UNKNOWN_FIELD);
                continue;
            };
            if field.common().read_only {
                push_field_error(&mut errors, input_name, READ_ONLY_FIELD);
                continue;
            }
            match field {
                Field::Scalar(scalar) => match scalar.load(value) {
                    Ok(loaded) => {
                        scalar_changes.insert(scalar.common.name.clone(), loaded);
                    }
                    Err(err) => push_field_error(&mut errors, input_name, &err.message),
                },
                Field::Nested(nested) => {
                    if nested.many {
                        to_many.push((nested, input_name.as_str(), value));
                    } else {
                        to_one.push((nested, input_name.as_str(), value));
                    }
                }
            }
        }

        if !effective_partial {
            for field in &self.fields {
                let Field::Scalar(scalar) = field else { continue };
                let common = &scalar.common;
                if common.required && !common.read_only && !data.contains_key(common.load_from()) {
                    push_field_error(&mut errors, common.load_from(), MISSING_REQUIRED);
                }
            }
        }

        if !scalar_changes.is_empty() {
            session.update(&self.model, &key, scalar_changes)?;
        }

        for (nested, input_name, value) in to_one {
            self.apply_to_one(registry, session, &key, nested, input_name, value, partial, &mut errors)?;
        }
        for (nested, input_name, value) in to_many {
            self.apply_to_many(registry, session, &key, nested, input_name, value, partial, &mut errors)?;
        }

        Ok((Some(key), errors))
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_to_one(
        &self,
        registry: &Registry,
        session: &mut dyn ModelSession,
        key: &EntityKey,
        nested: &crate::fields::NestedField,
        input_name: &str,
        value: &Value,
        partial: bool,
        errors: &mut Map<String, Value>,
    ) -> Result<(), Error> {
        let child_schema = registry
            .schema(&nested.target)
            .ok_or_else(|| crate::errors::SessionError::UnknownModel(nested.target.clone()))?
            .clone();

        match value {
            Value::Null => {
                if nested.common.nullable {
                    session.clear_related(&self.model, key, &nested.common.name)?;
                } else {
                    push_field_error(errors, input_name, NOT_NULLABLE);
                }
            }
            Value::Object(child_map) => {
                let op = match RelOp::classify(child_map) {
                    Ok(op) => op,
                    Err(err) => {
                        push_op_error(errors, input_name, &err.message);
                        return Ok(());
                    }
                };
                if !nested.ops.allows(op) {
                    push_op_error(errors, input_name, OP_NOT_PERMITTED);
                    return Ok(());
                }
                match op {
                    RelOp::Remove => {
                        let Some(child_key) = child_schema.id_key_values(child_map) else {
                            push_op_error(errors, input_name, REMOVE_TARGET_MISSING);
                            return Ok(());
                        };
                        if session.get(&child_schema.model, &child_key)?.is_none() {
                            push_op_error(errors, input_name, REMOVE_TARGET_MISSING);
                            return Ok(());
                        }
                        if session.is_linked(&self.model, key, &nested.common.name, &child_key)? {
                            session.clear_related(&self.model, key, &nested.common.name)?;
                        } else {
                            push_op_error(errors, input_name, NOT_A_MEMBER);
                        }
                    }
                    RelOp::Add | RelOp::Set => {
                        let (child_key, child_errors) =
                            child_schema.load_inner(registry, session, child_map, partial, None, true)?;
                        if !child_errors.is_empty() {
                            errors.insert(input_name.to_string(), Value::Object(child_errors));
                        } else if let Some(child_key) = child_key {
                            session.clear_related(&self.model, key, &nested.common.name)?;
                            session.link(&self.model, key, &nested.common.name, &child_key)?;
                        }
                    }
                }
            }
            _ => push_field_error(errors, input_name, INVALID_TYPE),
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_to_many(
        &self,
        registry: &Registry,
        session: &mut dyn ModelSession,
        key: &EntityKey,
        nested: &crate::fields::NestedField,
        input_name: &str,
        value: &Value,
        partial: bool,
        errors: &mut Map<String, Value>,
    ) -> Result<(), Error> {
        let child_schema = registry
            .schema(&nested.target)
            .ok_or_else(|| crate::errors::SessionError::UnknownModel(nested.target.clone()))?
            .clone();

        let Some(items) = value.as_array() else {
            push_field_error(errors, input_name, INVALID_TYPE);
            return Ok(());
        };

        let mut child_errors: Vec<Map<String, Value>> = vec![Map::new(); items.len()];
        let mut removes: Vec<(usize, &Map<String, Value>)> = Vec::new();
        let mut upserts: Vec<(usize, RelOp, &Map<String, Value>)> = Vec::new();

        for (index, item) in items.iter().enumerate() {
            let Some(child_map) = item.as_object() else {
                child_errors[index].insert("_schema".into(), Value::from(vec![Value::from(INVALID_TYPE)]));
                continue;
            };
            let op = match RelOp::classify(child_map) {
                Ok(op) => op,
                Err(err) => {
                    push_op_error_map(&mut child_errors[index], &err.message);
                    continue;
                }
            };
            if !nested.ops.allows(op) {
                push_op_error_map(&mut child_errors[index], OP_NOT_PERMITTED);
                continue;
            }
            if op == RelOp::Remove {
                removes.push((index, child_map));
            } else {
                upserts.push((index, op, child_map));
            }
        }

        // Removes apply first so re-adding the same identity in one
        // document is legal.
        for (index, child_map) in removes {
            let Some(child_key) = child_schema.id_key_values(child_map) else {
                push_op_error_map(&mut child_errors[index], REMOVE_TARGET_MISSING);
                continue;
            };
            if session.get(&child_schema.model, &child_key)?.is_none() {
                push_op_error_map(&mut child_errors[index], REMOVE_TARGET_MISSING);
                continue;
            }
            if session.is_linked(&self.model, key, &nested.common.name, &child_key)? {
                session.unlink(&self.model, key, &nested.common.name, &child_key)?;
            } else {
                push_op_error_map(&mut child_errors[index], NOT_A_MEMBER);
            }
        }

        for (index, op, child_map) in upserts {
            let (child_key, child_errs) = child_schema.load_inner(registry, session, child_map, partial, None, true)?;
            if !child_errs.is_empty() {
                child_errors[index] = child_errs;
                continue;
            }
            let Some(child_key) = child_key else { continue };
            let linked = session.is_linked(&self.model, key, &nested.common.name, &child_key)?;
            match op {
                RelOp::Add if linked => push_op_error_map(&mut child_errors[index], ALREADY_A_MEMBER),
                RelOp::Add | RelOp::Set => {
                    if !linked {
                        session.link(&self.model, key, &nested.common.name, &child_key)?;
                    }
                }
                RelOp::Remove => unreachable!("removes were split out above"),
            }
        }

        if child_errors.iter().any(|map| !map.is_empty()) {
            errors.insert(
                input_name.to_string(),
                Value::Array(child_errors.into_iter().map(Value::Object).collect()),
            );
        }
        Ok(())
    }

    /// Serialize an entity per the schema's projection.
    ///
    /// Relationships dump one level deep by default (children as scalar
    /// objects); dotted `embeds` extend the projection. A visited stack
    /// cuts relationship cycles.
    pub fn dump(
        &self,
        registry: &Registry,
        session: &dyn ModelSession,
        key: &EntityKey,
        options: &DumpOptions,
    ) -> Result<Value, Error> {
        let mut stack = Vec::new();
        self.dump_inner(registry, session, key, options, 0, &mut stack)
    }

    fn dump_inner(
        &self,
        registry: &Registry,
        session: &dyn ModelSession,
        key: &EntityKey,
        options: &DumpOptions,
        depth: usize,
        stack: &mut Vec<(String, EntityKey)>,
    ) -> Result<Value, Error> {
        let row = session
            .get(&self.model, key)?
            .ok_or_else(|| Error::not_found(self.error_messages.render("resource_not_found", &[])))?;

        stack.push((self.model.clone(), key.clone()));
        let mut out = Map::new();
        for field in &self.fields {
            let common = field.common();
            if common.write_only {
                continue;
            }
            let name = &common.name;
            if options.exclude.contains(name) {
                continue;
            }
            let sub_embeds: Vec<String> = options
                .embeds
                .iter()
                .filter_map(|path| match path.split_once('.') {
                    Some((top, rest)) if top == name => Some(rest.to_string()),
                    None if path == name => Some(String::new()),
                    _ => None,
                })
                .collect();
            if !options.only.is_empty() && !options.only.contains(name) && sub_embeds.is_empty() {
                continue;
            }
            match field {
                Field::Scalar(scalar) => {
                    out.insert(common.dump_to().to_string(), scalar.dump(row.get(name)));
                }
                Field::Nested(nested) => {
                    if depth > 0 && sub_embeds.is_empty() {
                        continue;
                    }
                    let child_schema = registry
                        .schema(&nested.target)
                        .ok_or_else(|| crate::errors::SessionError::UnknownModel(nested.target.clone()))?;
                    let child_model = registry
                        .model(&nested.target)
                        .ok_or_else(|| crate::errors::SessionError::UnknownModel(nested.target.clone()))?
                        .clone();
                    let child_options = DumpOptions {
                        only: BTreeSet::new(),
                        exclude: BTreeSet::new(),
                        embeds: sub_embeds.into_iter().filter(|path| !path.is_empty()).collect(),
                    };
                    let related = session.related(&self.model, key, name)?;
                    if nested.many {
                        let mut children = Vec::with_capacity(related.len());
                        for child_row in &related {
                            let Some(child_key) = EntityKey::from_row(&child_model, child_row) else {
                                continue;
                            };
                            if stack.contains(&(nested.target.clone(), child_key.clone())) {
                                continue;
                            }
                            children.push(child_schema.dump_inner(
                                registry,
                                session,
                                &child_key,
                                &child_options,
                                depth + 1,
                                stack,
                            )?);
                        }
                        out.insert(common.dump_to().to_string(), Value::Array(children));
                    } else {
                        let child = related
                            .first()
                            .and_then(|child_row| EntityKey::from_row(&child_model, child_row));
                        match child {
                            Some(child_key) if !stack.contains(&(nested.target.clone(), child_key.clone())) => {
                                let dumped = child_schema.dump_inner(
                                    registry,
                                    session,
                                    &child_key,
                                    &child_options,
                                    depth + 1,
                                    stack,
                                )?;
                                out.insert(common.dump_to().to_string(), dumped);
                            }
                            Some(_) => {}
                            None => {
                                out.insert(common.dump_to().to_string(), Value::Null);
                            }
                        }
                    }
                }
            }
        }
        stack.pop();
        Ok(Value::Object(out))
    }

    /// Load a single scalar attribute value through its field.
    pub fn load_attr(&self, attr: &str, value: &Value) -> Result<Value, Error> {
        let field = self
            .field(attr)
            .or_else(|| self.field_by_load_from(attr))
            .ok_or_else(|| Error::not_found(self.error_messages.render("attr_not_found", &[("attr", attr)])))?;
        let Some(scalar) = field.as_scalar() else {
            return Err(Error::not_found(
                self.error_messages.render("attr_not_found", &[("attr", attr)]),
            ));
        };
        scalar.load(value).map_err(|err| {
            let mut map = Map::new();
            map.insert(
                scalar.common.load_from().to_string(),
                Value::from(vec![Value::from(err.message)]),
            );
            Error::Unprocessable {
                errors: Value::Object(map),
            }
        })
    }

    /// Scalar field lookup used by attribute routing; nested fields do
    /// not qualify.
    pub fn scalar_field(&self, attr: &str) -> Option<&ScalarField> {
        self.field(attr)
            .or_else(|| self.field_by_load_from(attr))
            .and_then(Field::as_scalar)
    }
}

fn push_field_error(errors: &mut Map<String, Value>, field: &str, message: &str) {
    match errors.get_mut(field) {
        Some(Value::Array(messages)) => messages.push(Value::from(message)),
        _ => {
            errors.insert(field.to_string(), Value::from(vec![Value::from(message)]));
        }
    }
}

fn push_op_error(errors: &mut Map<String, Value>, field: &str, message: &str) {
    let mut op_map = Map::new();
    push_op_error_map(&mut op_map, message);
    errors.insert(field.to_string(), Value::Object(op_map));
}

fn push_op_error_map(errors: &mut Map<String, Value>, message: &str) {
    match errors.get_mut(OP_KEY) {
        Some(Value::Array(messages)) => messages.push(Value::from(message)),
        _ => {
            errors.insert(OP_KEY.to_string(), Value::from(vec![Value::from(message)]));
        }
    }
}
