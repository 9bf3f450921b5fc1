use std::collections::BTreeMap;
use std::sync::Arc;

use crate::convert::Converter;
use crate::model::{ModelDescriptor, ModelRegistry};
use crate::resource::ResourceDef;
use crate::schema::Schema;

/// Catalog of models, schemas and resources for one deployment.
///
/// Nested fields name their target schema; resolution happens here at
/// use time, so relationship cycles cost nothing at registration.
/// The registry is immutable once handed to a router and is shared
/// behind an `Arc` across requests.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    models: ModelRegistry,
    schemas: BTreeMap<String, Arc<Schema>>,
    resources: BTreeMap<String, Arc<ResourceDef>>,
}

impl Registry {
    pub fn new(models: ModelRegistry) -> Self {
        Self {
            models,
            schemas: BTreeMap::new(),
            resources: BTreeMap::new(),
        }
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    pub fn model(&self, name: &str) -> Option<&Arc<ModelDescriptor>> {
        self.models.get(name)
    }

    pub fn register_schema(&mut self, schema: Schema) {
        self.schemas.insert(schema.model.clone(), Arc::new(schema));
    }

    pub fn schema(&self, model: &str) -> Option<&Arc<Schema>> {
        self.schemas.get(model)
    }

    pub fn register_resource(&mut self, def: ResourceDef) {
        self.resources.insert(def.collection.clone(), Arc::new(def));
    }

    /// Look up a resource by its collection path segment (`"albums"`).
    pub fn resource(&self, collection: &str) -> Option<&Arc<ResourceDef>> {
        self.resources.get(collection)
    }

    /// Look up the resource serving a given model, if one is registered.
    pub fn resource_for_model(&self, model: &str) -> Option<&Arc<ResourceDef>> {
        self.resources.values().find(|def| def.model == model)
    }

    /// Register a model's default schema (built by the converter) and a
    /// resource serving it under `collection`.
    pub fn register_default(&mut self, model: &str, collection: &str) {
        let descriptor = self
            .models
            .get(model)
            .unwrap_or_else(|| panic!("model {model} is not registered"))
            .clone();
        let schema = Converter::new().schema(&descriptor);
        self.register_schema(schema);
        self.register_resource(ResourceDef::new(model, collection));
    }

    pub fn collections(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }
}
