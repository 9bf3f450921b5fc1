//! Resourcery: a relational resource layer.
//!
//! Projects rows from a relational store into nested JSON documents and
//! accepts nested documents that mutate rows and their relationships.
//! The moving parts compose as values:
//!
//! - [`model::ModelDescriptor`] describes an entity's attributes,
//!   relationships and identity keys.
//! - [`convert::Converter`] derives a default [`schema::Schema`] from a
//!   model; schemas load documents into the entity graph (honoring
//!   partial semantics, per-field permissions and `$op` relationship
//!   mutations) and dump entities back out.
//! - [`parser::QueryParamParser`] turns a query-parameter map into a
//!   typed filter tree, sort list, paging window and embed list.
//! - [`resource::Resource`] exposes per-entity CRUD against a
//!   [`session::ModelSession`] collaborator.
//! - [`router::Router`] walks paths like `/albums/1/tracks/14/name` and
//!   dispatches to the right resource operation.
//!
//! The store itself stays behind the [`session::ModelSession`] trait;
//! [`memory::MemorySession`] is a complete in-memory implementation used
//! by the test-suite.

pub mod convert;
pub mod errors;
pub mod fields;
pub mod filters;
pub mod memory;
pub mod model;
pub mod parser;
pub mod registry;
pub mod resource;
pub mod router;
pub mod schema;
pub mod session;

pub use convert::Converter;
pub use errors::{Error, ErrorMessages, FieldError, SessionError, ValidationError};
pub use fields::{Field, NestedField, OpSet, RelOp, ScalarField};
pub use filters::{FilterExpr, FilterOp, OffsetLimit, SortDirection, SortSpec};
pub use memory::MemorySession;
pub use model::{AttrMeta, ModelDescriptor, ModelRegistry, RelMeta, TypeCode};
pub use parser::{ParamValue, QueryParamParser, QueryParams};
pub use registry::Registry;
pub use resource::{CollectionQuery, PageMaxSize, Resource, ResourceDef};
pub use router::{Method, Router};
pub use schema::{DumpOptions, LoadOptions, LoadReport, Schema};
pub use session::{EntityKey, KeyValue, ModelSession, QueryPlan, RelationScope, Row};
