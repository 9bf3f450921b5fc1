use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

/// Top-level error type returned by resources and the router.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input at the protocol layer: unparseable paging values,
    /// an unknown filter operator, an undecodable `query` document.
    #[error("bad request: {message}")]
    BadRequest { code: String, message: String },

    /// Well-formed input that is semantically invalid. Carries the nested
    /// error map produced by a schema load, mirroring the input shape.
    #[error("unprocessable entity")]
    Unprocessable { errors: Value },

    /// A schema load escalated its error map in strict mode.
    #[error("validation failed")]
    Validation(#[from] ValidationError),

    /// Resource, subresource or attribute lookup came up empty.
    #[error("{message}")]
    NotFound { message: String },

    /// The path shape does not permit the requested verb.
    #[error("method {method} not allowed for this path")]
    MethodNotAllowed { method: String },

    /// Database collaborator failure, propagated unchanged.
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl Error {
    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Error::BadRequest {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound {
            message: message.into(),
        }
    }

    pub fn method_not_allowed(method: impl Into<String>) -> Self {
        Error::MethodNotAllowed {
            method: method.into(),
        }
    }
}

/// Errors surfaced by a `ModelSession` collaborator.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("unknown relationship {relationship} on {model}")]
    UnknownRelationship { model: String, relationship: String },

    /// Integrity violation reported by the store.
    #[error("integrity error: {message}")]
    Integrity { message: String },

    /// Any other backend failure.
    #[error("{message}")]
    Backend { message: String },
}

/// Nested error map accumulated during a schema load.
///
/// The tree mirrors the input document: scalar field failures are
/// `{"field": ["msg", …]}`, to-one failures nest one object deeper, and
/// to-many failures are arrays index-aligned with the input list (clean
/// children contribute `{}`).
#[derive(Debug, Error)]
#[error("validation errors: {errors}")]
pub struct ValidationError {
    pub errors: Value,
}

impl ValidationError {
    pub fn new(errors: Value) -> Self {
        Self { errors }
    }

    /// Convenience helper for a single-field error map.
    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut map = serde_json::Map::new();
        map.insert(field.into(), Value::Array(vec![Value::String(message.into())]));
        Self {
            errors: Value::Object(map),
        }
    }

    pub fn is_empty(&self) -> bool {
        match &self.errors {
            Value::Object(map) => map.is_empty(),
            Value::Array(items) => items.iter().all(|item| match item {
                Value::Object(map) => map.is_empty(),
                _ => false,
            }),
            _ => false,
        }
    }
}

/// Failure produced by a single field's load or validate step.
#[derive(Debug, Clone)]
pub struct FieldError {
    pub code: String,
    pub message: String,
    pub params: BTreeMap<String, Value>,
}

impl FieldError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Overridable message catalog keyed by error code.
///
/// Resources carry one of these; the built-in catalog covers every code
/// the parser and router emit, and per-resource overrides win.
#[derive(Debug, Clone, Default)]
pub struct ErrorMessages {
    overrides: BTreeMap<String, String>,
}

impl ErrorMessages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_override(mut self, code: impl Into<String>, template: impl Into<String>) -> Self {
        self.overrides.insert(code.into(), template.into());
        self
    }

    pub fn extend(&mut self, overrides: impl IntoIterator<Item = (String, String)>) {
        self.overrides.extend(overrides);
    }

    fn default_template(code: &str) -> &'static str {
        match code {
            "invalid_field" => "Unable to process the query parameter {field}.",
            "invalid_filter_value" => "Unable to parse the filter value {value} for {field}.",
            "invalid_filter_op" => "Unknown filter operator {op} on {field}.",
            "invalid_sort_field" => "Unable to sort by {field}.",
            "invalid_page" => "Page {page} requires a positive limit.",
            "invalid_page_value" => "Unable to parse page value {value}.",
            "invalid_limit_value" => "Unable to parse limit value {value}.",
            "invalid_offset_value" => "Unable to parse offset value {value}.",
            "invalid_subquery" => "Unable to decode the query document.",
            "invalid_embed" => "Unable to embed {field}.",
            "resource_not_found" => "The requested resource was not found.",
            "attr_not_found" => "The attribute {attr} was not found.",
            _ => "Unable to process the request.",
        }
    }

    /// Render the message for `code`, interpolating `{name}` placeholders.
    pub fn render(&self, code: &str, params: &[(&str, &str)]) -> String {
        let template = self
            .overrides
            .get(code)
            .map(String::as_str)
            .unwrap_or_else(|| Self::default_template(code));
        let mut message = template.to_string();
        for (key, value) in params {
            message = message.replace(&format!("{{{key}}}"), value);
        }
        message
    }

    /// Shorthand for building a `BadRequest` with a rendered message.
    pub fn bad_request(&self, code: &str, params: &[(&str, &str)]) -> Error {
        Error::bad_request(code, self.render(code, params))
    }
}
