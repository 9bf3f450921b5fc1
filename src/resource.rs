use std::sync::Arc;

use percent_encoding::percent_decode_str;
use serde_json::{Map, Value};
use tracing::debug;

use crate::errors::{Error, ErrorMessages};
use crate::fields::OP_KEY;
use crate::filters::{FilterExpr, OffsetLimit, SortSpec};
use crate::model::ModelDescriptor;
use crate::registry::Registry;
use crate::schema::{DumpOptions, LoadOptions, Schema};
use crate::session::{EntityKey, KeyValue, ModelSession, QueryPlan, RelationScope};

/// Upper bound on collection page size: a fixed value or a function of
/// the resource.
#[derive(Debug, Clone, Copy)]
pub enum PageMaxSize {
    Fixed(u64),
    Fn(fn(&ResourceDef) -> u64),
}

/// Declarative binding of one schema to a routable collection.
#[derive(Debug, Clone)]
pub struct ResourceDef {
    pub model: String,
    /// Path segment this resource answers to (`"albums"`).
    pub collection: String,
    pub page_max_size: Option<PageMaxSize>,
    pub error_messages: ErrorMessages,
}

impl ResourceDef {
    pub fn new(model: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            collection: collection.into(),
            page_max_size: None,
            error_messages: ErrorMessages::new(),
        }
    }

    pub fn with_page_max_size(mut self, page_max_size: PageMaxSize) -> Self {
        self.page_max_size = Some(page_max_size);
        self
    }

    pub fn with_error_messages(mut self, messages: ErrorMessages) -> Self {
        self.error_messages = messages;
        self
    }

    /// Default collection limit when the query supplies none.
    pub fn resolved_page_max(&self) -> Option<u64> {
        match self.page_max_size {
            Some(PageMaxSize::Fixed(value)) => Some(value),
            Some(PageMaxSize::Fn(resolve)) => Some(resolve(self)),
            None => None,
        }
    }
}

/// Parsed collection query: everything `get_collection` needs.
#[derive(Debug, Clone, Default)]
pub struct CollectionQuery {
    pub filters: Option<FilterExpr>,
    pub sorts: Vec<SortSpec>,
    pub window: OffsetLimit,
    pub embeds: Vec<String>,
}

/// Runtime handle binding a resource definition, its schema and model.
///
/// Resources are cheap to construct per request; all state lives in the
/// registry and the session.
#[derive(Debug, Clone)]
pub struct Resource<'a> {
    registry: &'a Registry,
    pub def: Arc<ResourceDef>,
    pub schema: Arc<Schema>,
    pub model: Arc<ModelDescriptor>,
}

impl<'a> Resource<'a> {
    /// Resolve the resource answering to a collection path segment.
    pub fn new(registry: &'a Registry, collection: &str) -> Result<Self, Error> {
        let def = registry
            .resource(collection)
            .ok_or_else(|| Error::not_found(format!("No resource is registered for {collection}.")))?
            .clone();
        Self::from_def(registry, def)
    }

    /// Resolve the resource serving a model (subresource dispatch).
    pub fn for_model(registry: &'a Registry, model: &str) -> Result<Self, Error> {
        let def = registry
            .resource_for_model(model)
            .ok_or_else(|| Error::not_found(format!("No resource is registered for model {model}.")))?
            .clone();
        Self::from_def(registry, def)
    }

    fn from_def(registry: &'a Registry, def: Arc<ResourceDef>) -> Result<Self, Error> {
        let schema = registry
            .schema(&def.model)
            .ok_or_else(|| Error::not_found(format!("No schema is registered for model {}.", def.model)))?
            .clone();
        let model = registry
            .model(&def.model)
            .ok_or_else(|| Error::not_found(format!("Model {} is not registered.", def.model)))?
            .clone();
        Ok(Self {
            registry,
            def,
            schema,
            model,
        })
    }

    fn not_found(&self) -> Error {
        Error::not_found(self.def.error_messages.render("resource_not_found", &[]))
    }

    /// Parse a path id segment into an entity key. Composite components
    /// are comma-joined and individually percent-decoded.
    pub fn key_from_segment(&self, segment: &str) -> Result<EntityKey, Error> {
        let components: Vec<String> = segment
            .split(',')
            .map(|component| percent_decode_str(component).decode_utf8_lossy().into_owned())
            .collect();
        if components.len() != self.model.id_keys.len() {
            return Err(self.not_found());
        }
        let mut values = Vec::with_capacity(components.len());
        for (component, id_key) in components.iter().zip(&self.model.id_keys) {
            let attr = self.model.attribute(id_key).ok_or_else(|| self.not_found())?;
            let value = KeyValue::from_value(&Value::from(component.as_str()), attr.type_code)
                .ok_or_else(|| self.not_found())?;
            values.push(value);
        }
        Ok(EntityKey(values))
    }

    /// Dump options carrying the request's embed paths. Unknown embeds
    /// are errors in strict mode and ignored otherwise.
    fn dump_options(&self, embeds: &[String], strict: bool) -> Result<DumpOptions, Error> {
        let mut options = DumpOptions::new();
        for path in embeds {
            match self.schema.embed(&mut options, path) {
                Ok(()) => {}
                Err(err) if strict => return Err(err),
                Err(_) => {}
            }
        }
        Ok(options)
    }

    fn fetch(&self, session: &dyn ModelSession, key: &EntityKey) -> Result<crate::session::Row, Error> {
        session
            .get(&self.model.name, key)?
            .ok_or_else(|| self.not_found())
    }

    /// Look up one entity and dump it with the requested embeds.
    pub fn get(
        &self,
        session: &dyn ModelSession,
        key: &EntityKey,
        embeds: &[String],
        strict: bool,
    ) -> Result<Value, Error> {
        debug!(collection = %self.def.collection, key = %key, "get");
        let options = self.dump_options(embeds, strict)?;
        self.schema.dump(self.registry, session, key, &options)
    }

    /// Execute a collection query, optionally scoped to a relationship,
    /// and dump each row.
    pub fn get_collection(
        &self,
        session: &dyn ModelSession,
        query: &CollectionQuery,
        scope: Option<RelationScope>,
        strict: bool,
    ) -> Result<Value, Error> {
        debug!(collection = %self.def.collection, scoped = scope.is_some(), "get_collection");
        let options = self.dump_options(&query.embeds, strict)?;
        let plan = QueryPlan {
            filters: query.filters.clone(),
            sorts: query.sorts.clone(),
            window: query.window,
            scope,
        };
        let rows = session.query(&self.model.name, &plan)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(key) = EntityKey::from_row(&self.model, row) else {
                continue;
            };
            out.push(self.schema.dump(self.registry, session, &key, &options)?);
        }
        Ok(Value::Array(out))
    }

    /// Create one entity (object input, returns the dumped object) or a
    /// batch (list input, returns `None` — a deliberate shape difference
    /// the HTTP layer documents).
    pub fn post(&self, session: &mut dyn ModelSession, data: &Value) -> Result<Option<Value>, Error> {
        debug!(collection = %self.def.collection, batch = data.is_array(), "post");
        match data {
            Value::Array(items) => {
                let mut errors: Vec<Value> = Vec::with_capacity(items.len());
                let mut failed = false;
                for item in items {
                    let report = self
                        .schema
                        .load(self.registry, session, item, &LoadOptions::new())?;
                    failed |= !report.is_clean();
                    errors.push(report.errors);
                }
                if failed {
                    session.rollback()?;
                    return Err(Error::Unprocessable {
                        errors: Value::Array(errors),
                    });
                }
                Ok(None)
            }
            _ => {
                let report = self
                    .schema
                    .load(self.registry, session, data, &LoadOptions::new())?;
                if !report.is_clean() {
                    session.rollback()?;
                    return Err(Error::Unprocessable { errors: report.errors });
                }
                let key = report.key.ok_or_else(|| self.not_found())?;
                Ok(Some(self.schema.dump(self.registry, session, &key, &DumpOptions::new())?))
            }
        }
    }

    fn load_onto(
        &self,
        session: &mut dyn ModelSession,
        key: &EntityKey,
        data: &Value,
        partial: bool,
    ) -> Result<Value, Error> {
        self.fetch(session, key)?;
        let options = LoadOptions::new().partial(partial).instance(key.clone());
        let report = self.schema.load(self.registry, session, data, &options)?;
        if !report.is_clean() {
            session.rollback()?;
            return Err(Error::Unprocessable { errors: report.errors });
        }
        self.schema.dump(self.registry, session, key, &DumpOptions::new())
    }

    /// Apply a partial document to an existing entity.
    pub fn patch(&self, session: &mut dyn ModelSession, key: &EntityKey, data: &Value) -> Result<Value, Error> {
        debug!(collection = %self.def.collection, key = %key, "patch");
        self.load_onto(session, key, data, true)
    }

    /// Replace an existing entity with a full document.
    pub fn put(&self, session: &mut dyn ModelSession, key: &EntityKey, data: &Value) -> Result<Value, Error> {
        debug!(collection = %self.def.collection, key = %key, "put");
        self.load_onto(session, key, data, false)
    }

    pub fn delete(&self, session: &mut dyn ModelSession, key: &EntityKey) -> Result<(), Error> {
        debug!(collection = %self.def.collection, key = %key, "delete");
        self.fetch(session, key)?;
        session.delete(&self.model.name, key)?;
        Ok(())
    }

    /// Read one scalar attribute of an entity.
    pub fn get_attr(&self, session: &dyn ModelSession, key: &EntityKey, attr: &str) -> Result<Value, Error> {
        let row = self.fetch(session, key)?;
        let field = self.schema.scalar_field(attr).ok_or_else(|| {
            Error::not_found(self.def.error_messages.render("attr_not_found", &[("attr", attr)]))
        })?;
        Ok(field.dump(row.get(&field.common.name)))
    }

    /// Set one scalar attribute, validating through its field, and echo
    /// the stored value back.
    pub fn post_attr(
        &self,
        session: &mut dyn ModelSession,
        key: &EntityKey,
        attr: &str,
        value: &Value,
    ) -> Result<Value, Error> {
        self.fetch(session, key)?;
        if self.schema.scalar_field(attr).is_none() {
            return Err(Error::not_found(
                self.def.error_messages.render("attr_not_found", &[("attr", attr)]),
            ));
        }
        let loaded = self.schema.load_attr(attr, value).inspect_err(|_| {
            let _ = session.rollback();
        })?;
        let field_name = self
            .schema
            .scalar_field(attr)
            .map(|field| field.common.name.clone())
            .unwrap_or_else(|| attr.to_string());
        let mut changes = crate::session::Row::new();
        changes.insert(field_name, loaded.clone());
        session.update(&self.model.name, key, changes)?;
        Ok(loaded)
    }

    /// `PATCH` on an attribute shares `post_attr` semantics.
    pub fn patch_attr(
        &self,
        session: &mut dyn ModelSession,
        key: &EntityKey,
        attr: &str,
        value: &Value,
    ) -> Result<Value, Error> {
        self.post_attr(session, key, attr, value)
    }

    /// Add children to (or set the child of) a relationship of an
    /// identified parent. To-many input children become `$op: add`
    /// entries; the updated relationship projection is returned.
    pub fn post_subresource(
        &self,
        session: &mut dyn ModelSession,
        scope: &RelationScope,
        data: &Value,
    ) -> Result<Value, Error> {
        let nested = self
            .schema
            .field(&scope.relationship)
            .and_then(crate::fields::Field::as_nested)
            .ok_or_else(|| self.not_found())?;
        debug!(collection = %self.def.collection, relationship = %scope.relationship, "post_subresource");

        let wrapped = if nested.many {
            let items: Vec<Value> = match data {
                Value::Array(items) => items.clone(),
                other => vec![other.clone()],
            };
            let tagged: Vec<Value> = items
                .into_iter()
                .map(|item| match item {
                    Value::Object(mut map) => {
                        map.entry(OP_KEY.to_string()).or_insert_with(|| Value::from("add"));
                        Value::Object(map)
                    }
                    other => other,
                })
                .collect();
            wrap_relationship(&scope.relationship, Value::Array(tagged))
        } else {
            wrap_relationship(&scope.relationship, data.clone())
        };

        let options = LoadOptions::new().partial(true).instance(scope.key.clone());
        let report = self.schema.load(self.registry, session, &wrapped, &options)?;
        if !report.is_clean() {
            session.rollback()?;
            return Err(Error::Unprocessable {
                errors: report.errors.get(&scope.relationship).cloned().unwrap_or(report.errors),
            });
        }

        let target = Resource::for_model(self.registry, &nested.target)?;
        if nested.many {
            target.get_collection(session, &CollectionQuery::default(), Some(scope.clone()), true)
        } else {
            let related = session.related(&self.model.name, &scope.key, &scope.relationship)?;
            let child_key = related
                .first()
                .and_then(|row| EntityKey::from_row(&target.model, row))
                .ok_or_else(|| target.not_found())?;
            target.get(session, &child_key, &[], true)
        }
    }

    /// Apply a partial document to the single child of a to-one
    /// relationship.
    pub fn patch_subresource(
        &self,
        session: &mut dyn ModelSession,
        scope: &RelationScope,
        data: &Value,
        partial: bool,
    ) -> Result<Value, Error> {
        let nested = self
            .schema
            .field(&scope.relationship)
            .and_then(crate::fields::Field::as_nested)
            .ok_or_else(|| self.not_found())?;
        let target = Resource::for_model(self.registry, &nested.target)?;
        let related = session.related(&self.model.name, &scope.key, &scope.relationship)?;
        let child_key = related
            .first()
            .and_then(|row| EntityKey::from_row(&target.model, row))
            .ok_or_else(|| target.not_found())?;
        if partial {
            target.patch(session, &child_key, data)
        } else {
            target.put(session, &child_key, data)
        }
    }

    /// Resolve the relationship scope used for subresource dispatch.
    pub fn relation_scope(&self, key: &EntityKey, relationship: &str) -> RelationScope {
        RelationScope {
            model: self.model.name.clone(),
            key: key.clone(),
            relationship: relationship.to_string(),
        }
    }
}

fn wrap_relationship(relationship: &str, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(relationship.to_string(), value);
    Value::Object(map)
}
