use std::collections::BTreeMap;

use serde_json::Value;

use crate::errors::{Error, ErrorMessages};
use crate::fields::ScalarField;
use crate::filters::{FilterExpr, FilterOp, OffsetLimit, SortSpec};
use crate::model::ModelDescriptor;

/// Keys the parser consumes for paging, ordering and projection; every
/// other key is a filter predicate.
const RESERVED_KEYS: &[&str] = &["sort", "offset", "limit", "page", "embed"];

/// Free-text deep-filter key, JSON-decoded into `FilterExpr::Raw`.
const SUBQUERY_KEY: &str = "query";

/// One query-parameter value: a single string or a repeated list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Single(String),
    Many(Vec<String>),
}

impl ParamValue {
    pub fn first(&self) -> Option<&str> {
        match self {
            Self::Single(value) => Some(value),
            Self::Many(values) => values.first().map(String::as_str),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        match self {
            Self::Single(value) => std::slice::from_ref(value).iter(),
            Self::Many(values) => values.iter(),
        }
        .map(String::as_str)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Single(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Single(value)
    }
}

impl From<Vec<String>> for ParamValue {
    fn from(values: Vec<String>) -> Self {
        Self::Many(values)
    }
}

/// Flat string-to-string(-or-list) map, as an HTTP layer would hand over.
pub type QueryParams = BTreeMap<String, ParamValue>;

/// Translates a query-parameter map into typed filter, sort, paging and
/// embed values.
///
/// In strict mode (the default) malformed keys raise `BadRequest`; with
/// `strict(false)` the offending key is dropped and parsing continues.
/// A `None` map parses to empty results throughout.
#[derive(Debug, Clone)]
pub struct QueryParamParser<'a> {
    params: Option<&'a QueryParams>,
    strict: bool,
    messages: ErrorMessages,
}

impl<'a> QueryParamParser<'a> {
    pub fn new(params: Option<&'a QueryParams>) -> Self {
        Self {
            params,
            strict: true,
            messages: ErrorMessages::new(),
        }
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_error_messages(mut self, messages: ErrorMessages) -> Self {
        self.messages = messages;
        self
    }

    fn get(&self, key: &str) -> Option<&ParamValue> {
        self.params.and_then(|params| params.get(key))
    }

    /// Build the conjunction of every filter predicate in the map.
    ///
    /// Key forms: `attr` (equality), `attr-op` with op in
    /// eq/ne/lt/lte/gt/gte/like/in, and `query` (JSON deep filter).
    /// Dotted paths traverse relationships; only the top segment is
    /// validated against the model here.
    pub fn parse_filters(&self, model: &ModelDescriptor) -> Result<Option<FilterExpr>, Error> {
        let Some(params) = self.params else {
            return Ok(None);
        };
        let mut exprs = Vec::new();
        for (key, value) in params {
            if RESERVED_KEYS.contains(&key.as_str()) {
                continue;
            }
            if key == SUBQUERY_KEY {
                for raw in value.iter() {
                    match serde_json::from_str::<Value>(raw) {
                        Ok(document) => exprs.push(FilterExpr::Raw(document)),
                        Err(_) => {
                            if self.strict {
                                return Err(self.messages.bad_request("invalid_subquery", &[]));
                            }
                        }
                    }
                }
                continue;
            }
            match self.parse_filter_key(model, key, value) {
                Ok(Some(expr)) => exprs.push(expr),
                Ok(None) => {}
                Err(err) => {
                    if self.strict {
                        return Err(err);
                    }
                }
            }
        }
        Ok(FilterExpr::conjoin(exprs))
    }

    fn parse_filter_key(
        &self,
        model: &ModelDescriptor,
        key: &str,
        value: &ParamValue,
    ) -> Result<Option<FilterExpr>, Error> {
        let (path, op) = match key.rsplit_once('-') {
            Some((prefix, suffix)) => match FilterOp::from_suffix(suffix) {
                Some(op) if self.resolves(model, prefix) => (prefix, op),
                _ => (key, FilterOp::Eq),
            },
            None => (key, FilterOp::Eq),
        };
        if !self.resolves(model, path) {
            return Err(self.messages.bad_request("invalid_field", &[("field", key)]));
        }

        let leaf_type = leaf_attr(model, path);
        let parsed = if op == FilterOp::In {
            let mut items = Vec::new();
            for raw in value.iter() {
                items.push(self.coerce(leaf_type, path, raw)?);
            }
            Value::Array(items)
        } else {
            let raw = value
                .first()
                .ok_or_else(|| self.messages.bad_request("invalid_field", &[("field", key)]))?;
            if op == FilterOp::Like {
                Value::from(raw)
            } else {
                self.coerce(leaf_type, path, raw)?
            }
        };
        Ok(Some(FilterExpr::cond(path, op, parsed)))
    }

    /// Whether the top path segment names an attribute or relationship.
    fn resolves(&self, model: &ModelDescriptor, path: &str) -> bool {
        let top = path.split('.').next().unwrap_or(path);
        model.attribute(top).is_some() || model.relationship(top).is_some()
    }

    fn coerce(&self, leaf: Option<&crate::model::AttrMeta>, path: &str, raw: &str) -> Result<Value, Error> {
        let Some(attr) = leaf else {
            // Dotted path into a relationship; the collaborator compares
            // against the target attribute's stored representation.
            return Ok(Value::from(raw));
        };
        ScalarField::new(&attr.name, attr.type_code)
            .load(&Value::from(raw))
            .map_err(|_| {
                self.messages
                    .bad_request("invalid_filter_value", &[("field", path), ("value", raw)])
            })
    }

    /// Read the comma-separated `sort` list; a leading `-` means
    /// descending.
    pub fn parse_sorts(&self) -> Vec<SortSpec> {
        let Some(value) = self.get("sort") else {
            return Vec::new();
        };
        let mut sorts = Vec::new();
        for raw in value.iter() {
            for segment in raw.split(',') {
                let segment = segment.trim();
                if segment.is_empty() {
                    continue;
                }
                match segment.strip_prefix('-') {
                    Some(field) => sorts.push(SortSpec::desc(field)),
                    None => sorts.push(SortSpec::asc(segment)),
                }
            }
        }
        sorts
    }

    /// Resolve the paging window from `limit`/`offset`/`page`.
    ///
    /// `page` is 1-based and wins over an explicit offset; a page with no
    /// usable limit is always an error. Unparseable values error in
    /// strict mode and are ignored otherwise.
    pub fn parse_offset_limit(&self, default_limit: Option<u64>) -> Result<OffsetLimit, Error> {
        let limit = match self.parse_int("limit", "invalid_limit_value")? {
            Some(value) => Some(value),
            None => default_limit,
        };
        let offset = self.parse_int("offset", "invalid_offset_value")?.unwrap_or(0);
        let page = match self.parse_int("page", "invalid_page_value")? {
            Some(page) if page >= 1 => Some(page),
            Some(_) => {
                return Err(self.messages.bad_request("invalid_page_value", &[("value", "0")]));
            }
            None => None,
        };

        if let Some(page) = page {
            match limit {
                Some(limit) if limit > 0 => Ok(OffsetLimit::paged(page, limit)),
                _ => Err(self
                    .messages
                    .bad_request("invalid_page", &[("page", &page.to_string())])),
            }
        } else {
            Ok(OffsetLimit::new(offset, limit))
        }
    }

    fn parse_int(&self, key: &str, code: &str) -> Result<Option<u64>, Error> {
        let Some(raw) = self.get(key).and_then(ParamValue::first) else {
            return Ok(None);
        };
        match raw.trim().parse::<u64>() {
            Ok(value) => Ok(Some(value)),
            Err(_) => {
                if self.strict {
                    Err(self.messages.bad_request(code, &[("value", raw)]))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Read the comma-separated `embed` list of dotted field paths.
    pub fn parse_embeds(&self) -> Vec<String> {
        let Some(value) = self.get("embed") else {
            return Vec::new();
        };
        value
            .iter()
            .flat_map(|raw| raw.split(','))
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .collect()
    }
}

fn leaf_attr<'m>(model: &'m ModelDescriptor, path: &str) -> Option<&'m crate::model::AttrMeta> {
    if path.contains('.') {
        return None;
    }
    model.attribute(path)
}
