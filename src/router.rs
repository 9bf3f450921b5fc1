use std::sync::Arc;

use percent_encoding::percent_decode_str;
use serde_json::Value;
use tracing::debug;

use crate::errors::Error;
use crate::parser::{QueryParamParser, QueryParams};
use crate::registry::Registry;
use crate::resource::{CollectionQuery, Resource};
use crate::session::{EntityKey, ModelSession, RelationScope};

/// HTTP verb selecting the operation for a resolved path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Patch,
    Put,
    Delete,
}

impl Method {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Patch => "PATCH",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a path resolved to, before the verb picks an operation.
enum Target<'r> {
    Collection {
        resource: Resource<'r>,
    },
    Item {
        resource: Resource<'r>,
        key: EntityKey,
    },
    Attr {
        resource: Resource<'r>,
        key: EntityKey,
        attr: String,
    },
    SubCollection {
        parent: Resource<'r>,
        scope: RelationScope,
        child: Resource<'r>,
    },
    SubItem {
        parent: Resource<'r>,
        scope: RelationScope,
        child: Resource<'r>,
        key: EntityKey,
    },
    /// Unidentified to-one child (`/albums/1/artist`).
    SubToOne {
        parent: Resource<'r>,
        scope: RelationScope,
        child: Resource<'r>,
    },
    SubAttr {
        child: Resource<'r>,
        key: EntityKey,
        attr: String,
    },
}

/// Walks a slash-separated resource path and dispatches the verb to the
/// right resource operation with the right scoping.
///
/// Grammar: `/collection[/id[/relationship[/id][/attr]][/attr]]` — one
/// relationship level, ids comma-joined for composite keys. The `strict`
/// flag is forwarded to the query-parameter parser.
#[derive(Debug, Clone)]
pub struct Router {
    registry: Arc<Registry>,
}

impl Router {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn get(
        &self,
        session: &mut dyn ModelSession,
        path: &str,
        params: Option<&QueryParams>,
        strict: bool,
    ) -> Result<Value, Error> {
        self.dispatch(session, Method::Get, path, params, None, strict)
    }

    pub fn post(&self, session: &mut dyn ModelSession, path: &str, data: &Value) -> Result<Value, Error> {
        self.dispatch(session, Method::Post, path, None, Some(data), true)
    }

    pub fn patch(&self, session: &mut dyn ModelSession, path: &str, data: &Value) -> Result<Value, Error> {
        self.dispatch(session, Method::Patch, path, None, Some(data), true)
    }

    pub fn put(&self, session: &mut dyn ModelSession, path: &str, data: &Value) -> Result<Value, Error> {
        self.dispatch(session, Method::Put, path, None, Some(data), true)
    }

    pub fn delete(&self, session: &mut dyn ModelSession, path: &str) -> Result<Value, Error> {
        self.dispatch(session, Method::Delete, path, None, None, true)
    }

    /// Resolve `path` and run the verb's operation. Batch creates and
    /// deletes resolve to `Value::Null`.
    pub fn dispatch(
        &self,
        session: &mut dyn ModelSession,
        method: Method,
        path: &str,
        params: Option<&QueryParams>,
        data: Option<&Value>,
        strict: bool,
    ) -> Result<Value, Error> {
        debug!(%method, path, strict, "dispatch");
        let target = self.resolve(session, path)?;
        let body = || data.ok_or_else(|| Error::bad_request("missing_body", "A request body is required."));

        match target {
            Target::Collection { resource } => match method {
                Method::Get => {
                    let query = self.collection_query(&resource, params, strict)?;
                    resource.get_collection(session, &query, None, strict)
                }
                Method::Post => Ok(resource.post(session, body()?)?.unwrap_or(Value::Null)),
                _ => Err(Error::method_not_allowed(method.as_str())),
            },
            Target::Item { resource, key } => match method {
                Method::Get => {
                    let embeds = QueryParamParser::new(params).strict(strict).parse_embeds();
                    resource.get(session, &key, &embeds, strict)
                }
                Method::Patch => resource.patch(session, &key, body()?),
                Method::Put => resource.put(session, &key, body()?),
                Method::Delete => {
                    resource.delete(session, &key)?;
                    Ok(Value::Null)
                }
                Method::Post => Err(Error::method_not_allowed(method.as_str())),
            },
            Target::Attr { resource, key, attr } => match method {
                Method::Get => resource.get_attr(session, &key, &attr),
                Method::Post => resource.post_attr(session, &key, &attr, body()?),
                Method::Patch => resource.patch_attr(session, &key, &attr, body()?),
                _ => Err(Error::method_not_allowed(method.as_str())),
            },
            Target::SubCollection { parent, scope, child } => match method {
                Method::Get => {
                    let query = self.collection_query(&child, params, strict)?;
                    child.get_collection(session, &query, Some(scope), strict)
                }
                Method::Post => parent.post_subresource(session, &scope, body()?),
                _ => Err(Error::method_not_allowed(method.as_str())),
            },
            Target::SubItem {
                parent,
                scope,
                child,
                key,
            } => {
                self.check_membership(session, &parent, &scope, &key)?;
                match method {
                    Method::Get => {
                        let embeds = QueryParamParser::new(params).strict(strict).parse_embeds();
                        child.get(session, &key, &embeds, strict)
                    }
                    Method::Patch => child.patch(session, &key, body()?),
                    Method::Put => child.put(session, &key, body()?),
                    Method::Delete => {
                        child.delete(session, &key)?;
                        Ok(Value::Null)
                    }
                    Method::Post => Err(Error::method_not_allowed(method.as_str())),
                }
            }
            Target::SubToOne { parent, scope, child } => match method {
                Method::Get => {
                    let related = session.related(&scope.model, &scope.key, &scope.relationship)?;
                    let child_key = related
                        .first()
                        .and_then(|row| EntityKey::from_row(&child.model, row))
                        .ok_or_else(|| Error::not_found("The requested resource was not found."))?;
                    let embeds = QueryParamParser::new(params).strict(strict).parse_embeds();
                    child.get(session, &child_key, &embeds, strict)
                }
                Method::Post => parent.post_subresource(session, &scope, body()?),
                Method::Patch => parent.patch_subresource(session, &scope, body()?, true),
                Method::Put => parent.patch_subresource(session, &scope, body()?, false),
                Method::Delete => Err(Error::method_not_allowed(method.as_str())),
            },
            Target::SubAttr { child, key, attr } => match method {
                Method::Get => child.get_attr(session, &key, &attr),
                Method::Post => child.post_attr(session, &key, &attr, body()?),
                Method::Patch => child.patch_attr(session, &key, &attr, body()?),
                _ => Err(Error::method_not_allowed(method.as_str())),
            },
        }
    }

    fn collection_query(
        &self,
        resource: &Resource<'_>,
        params: Option<&QueryParams>,
        strict: bool,
    ) -> Result<CollectionQuery, Error> {
        let parser = QueryParamParser::new(params)
            .strict(strict)
            .with_error_messages(resource.def.error_messages.clone());
        Ok(CollectionQuery {
            filters: parser.parse_filters(&resource.model)?,
            sorts: parser.parse_sorts(),
            window: parser.parse_offset_limit(resource.def.resolved_page_max())?,
            embeds: parser.parse_embeds(),
        })
    }

    fn check_membership(
        &self,
        session: &dyn ModelSession,
        parent: &Resource<'_>,
        scope: &RelationScope,
        child_key: &EntityKey,
    ) -> Result<(), Error> {
        if session.is_linked(&parent.model.name, &scope.key, &scope.relationship, child_key)? {
            Ok(())
        } else {
            Err(Error::not_found("The requested resource was not found."))
        }
    }

    fn resolve(&self, session: &mut dyn ModelSession, path: &str) -> Result<Target<'_>, Error> {
        let segments: Vec<&str> = path.split('/').filter(|segment| !segment.is_empty()).collect();
        let mut segments = segments.into_iter();

        let collection = match segments.next() {
            Some(segment) => decode(segment),
            None => return Err(Error::not_found("Empty resource path.")),
        };
        let resource = Resource::new(&self.registry, &collection)?;

        let Some(id_segment) = segments.next() else {
            return Ok(Target::Collection { resource });
        };
        let key = resource.key_from_segment(id_segment)?;

        let Some(name_segment) = segments.next() else {
            return Ok(Target::Item { resource, key });
        };
        let name = decode(name_segment);

        if let Some(nested) = resource.schema.field(&name).and_then(crate::fields::Field::as_nested) {
            // Subresource dispatch resolves the parent exactly once.
            if session.get(&resource.model.name, &key)?.is_none() {
                return Err(Error::not_found("The requested resource was not found."));
            }
            let nested = nested.clone();
            let child = Resource::for_model(&self.registry, &nested.target)?;
            let scope = resource.relation_scope(&key, &nested.common.name);

            if nested.many {
                let Some(child_id_segment) = segments.next() else {
                    return Ok(Target::SubCollection {
                        parent: resource,
                        scope,
                        child,
                    });
                };
                let child_key = child.key_from_segment(child_id_segment)?;
                let Some(attr_segment) = segments.next() else {
                    return Ok(Target::SubItem {
                        parent: resource,
                        scope,
                        child,
                        key: child_key,
                    });
                };
                let attr = decode(attr_segment);
                if segments.next().is_some() {
                    return Err(Error::not_found("The requested path was not found."));
                }
                if child.schema.scalar_field(&attr).is_none() {
                    return Err(Error::not_found("The requested path was not found."));
                }
                self.check_membership(session, &resource, &scope, &child_key)?;
                Ok(Target::SubAttr {
                    child,
                    key: child_key,
                    attr,
                })
            } else {
                let Some(attr_segment) = segments.next() else {
                    return Ok(Target::SubToOne {
                        parent: resource,
                        scope,
                        child,
                    });
                };
                let attr = decode(attr_segment);
                if segments.next().is_some() {
                    return Err(Error::not_found("The requested path was not found."));
                }
                if child.schema.scalar_field(&attr).is_none() {
                    return Err(Error::not_found("The requested path was not found."));
                }
                let related = session.related(&scope.model, &scope.key, &scope.relationship)?;
                let child_key = related
                    .first()
                    .and_then(|row| EntityKey::from_row(&child.model, row))
                    .ok_or_else(|| Error::not_found("The requested resource was not found."))?;
                Ok(Target::SubAttr {
                    child,
                    key: child_key,
                    attr,
                })
            }
        } else if resource.schema.scalar_field(&name).is_some() {
            if segments.next().is_some() {
                return Err(Error::not_found("The requested path was not found."));
            }
            Ok(Target::Attr { resource, key, attr: name })
        } else {
            Err(Error::not_found("The requested path was not found."))
        }
    }
}

fn decode(segment: &str) -> String {
    percent_decode_str(segment).decode_utf8_lossy().into_owned()
}
