use crate::fields::{Field, NestedField, OpSet, ScalarField};
use crate::model::ModelDescriptor;
use crate::schema::Schema;

/// Builds a model's default schema from its introspection metadata:
/// one scalar field per attribute, one nested field per relationship.
///
/// Overrides compose after the fact — callers take the converted schema
/// and replace or restrict individual fields rather than subclassing.
#[derive(Debug, Clone, Default)]
pub struct Converter {
    /// Operation set applied to every relationship field.
    pub relationship_ops: Option<OpSet>,
}

impl Converter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_relationship_ops(mut self, ops: OpSet) -> Self {
        self.relationship_ops = Some(ops);
        self
    }

    pub fn schema(&self, model: &ModelDescriptor) -> Schema {
        let mut fields = Vec::with_capacity(model.attributes.len() + model.relationships.len());
        for attr in &model.attributes {
            let mut field = ScalarField::new(&attr.name, attr.type_code);
            field.common.nullable = attr.nullable;
            // Identity keys are store-assigned when absent, so only
            // plain non-nullable columns are required on full loads.
            field.common.required = !attr.nullable && !model.is_id_key(&attr.name);
            field.length = attr.length;
            field.common.description = attr.description.clone();
            fields.push(Field::Scalar(field));
        }
        for rel in &model.relationships {
            let mut field = NestedField::new(&rel.name, &rel.target, rel.many);
            if let Some(ops) = &self.relationship_ops {
                field.ops = ops.clone();
            }
            fields.push(Field::Nested(field));
        }
        Schema::new(&model.name, fields, model.id_keys.clone())
    }
}
