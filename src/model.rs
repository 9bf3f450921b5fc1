use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Scalar type code for a model attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeCode {
    Integer,
    Decimal,
    String,
    DateTime,
    Boolean,
}

/// Metadata for one scalar attribute of a model.
#[derive(Debug, Clone)]
pub struct AttrMeta {
    pub name: String,
    pub type_code: TypeCode,
    pub nullable: bool,
    /// Maximum length for string attributes, where the store declares one.
    pub length: Option<usize>,
    /// Column doc string, surfaced as field `description` metadata.
    pub description: Option<String>,
}

impl AttrMeta {
    pub fn new(name: impl Into<String>, type_code: TypeCode) -> Self {
        Self {
            name: name.into(),
            type_code,
            nullable: true,
            length: None,
            description: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_length(mut self, length: usize) -> Self {
        self.length = Some(length);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Metadata for one relationship of a model.
#[derive(Debug, Clone)]
pub struct RelMeta {
    pub name: String,
    /// Target model name, resolved lazily so relationship cycles work.
    pub target: String,
    pub many: bool,
    /// Relationship name on the target model pointing back here, if any.
    pub backref: Option<String>,
}

impl RelMeta {
    pub fn to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            many: false,
            backref: None,
        }
    }

    pub fn to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            many: true,
            backref: None,
        }
    }

    pub fn with_backref(mut self, backref: impl Into<String>) -> Self {
        self.backref = Some(backref.into());
        self
    }
}

/// Introspection surface for one entity type: attributes, relationships
/// and identity keys, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct ModelDescriptor {
    pub name: String,
    pub attributes: Vec<AttrMeta>,
    pub relationships: Vec<RelMeta>,
    pub id_keys: Vec<String>,
}

impl ModelDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_attr(mut self, attr: AttrMeta) -> Self {
        self.attributes.push(attr);
        self
    }

    pub fn with_relationship(mut self, rel: RelMeta) -> Self {
        self.relationships.push(rel);
        self
    }

    pub fn with_id_keys<S: Into<String>>(mut self, keys: impl IntoIterator<Item = S>) -> Self {
        self.id_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&AttrMeta> {
        self.attributes.iter().find(|attr| attr.name == name)
    }

    pub fn relationship(&self, name: &str) -> Option<&RelMeta> {
        self.relationships.iter().find(|rel| rel.name == name)
    }

    /// True when `name` is one of the identity keys.
    pub fn is_id_key(&self, name: &str) -> bool {
        self.id_keys.iter().any(|key| key == name)
    }
}

/// Shared registry of model descriptors, keyed by model name.
///
/// Both the schema layer and session implementations consult this; it is
/// immutable once built and cheap to clone behind the `Arc`.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, Arc<ModelDescriptor>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, model: ModelDescriptor) {
        self.models.insert(model.name.clone(), Arc::new(model));
    }

    pub fn with_model(mut self, model: ModelDescriptor) -> Self {
        self.register(model);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ModelDescriptor>> {
        self.models.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ModelDescriptor>> {
        self.models.values()
    }
}
