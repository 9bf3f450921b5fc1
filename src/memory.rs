use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use regex::RegexBuilder;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::errors::SessionError;
use crate::filters::{FilterExpr, FilterOp, SortDirection, SortSpec};
use crate::model::{ModelDescriptor, ModelRegistry, RelMeta};
use crate::session::{EntityKey, ModelSession, QueryPlan, Row};

type Edge = (EntityKey, EntityKey);

#[derive(Debug, Clone, Default)]
struct State {
    tables: BTreeMap<String, BTreeMap<EntityKey, Row>>,
    links: BTreeMap<(String, String), BTreeSet<Edge>>,
}

/// In-memory `ModelSession`: the reference collaborator used by the test
/// suite and for trying the layer without a database.
///
/// Rows live in per-model maps ordered by identity; relationship edges
/// are mirrored onto declared backrefs automatically. `commit` snapshots
/// the state, `rollback` restores the last snapshot.
#[derive(Debug, Clone)]
pub struct MemorySession {
    models: ModelRegistry,
    state: State,
    snapshot: State,
}

impl MemorySession {
    pub fn new(models: ModelRegistry) -> Self {
        Self {
            models,
            state: State::default(),
            snapshot: State::default(),
        }
    }

    fn model(&self, name: &str) -> Result<Arc<ModelDescriptor>, SessionError> {
        self.models
            .get(name)
            .cloned()
            .ok_or_else(|| SessionError::UnknownModel(name.to_string()))
    }

    fn relationship(&self, model: &str, name: &str) -> Result<RelMeta, SessionError> {
        self.model(model)?
            .relationship(name)
            .cloned()
            .ok_or_else(|| SessionError::UnknownRelationship {
                model: model.to_string(),
                relationship: name.to_string(),
            })
    }

    fn edges(&self, model: &str, relationship: &str) -> Option<&BTreeSet<Edge>> {
        self.state.links.get(&(model.to_string(), relationship.to_string()))
    }

    fn insert_edge(&mut self, model: &str, relationship: &str, parent: &EntityKey, child: &EntityKey) {
        self.state
            .links
            .entry((model.to_string(), relationship.to_string()))
            .or_default()
            .insert((parent.clone(), child.clone()));
    }

    fn remove_edge(&mut self, model: &str, relationship: &str, parent: &EntityKey, child: &EntityKey) {
        if let Some(set) = self
            .state
            .links
            .get_mut(&(model.to_string(), relationship.to_string()))
        {
            set.remove(&(parent.clone(), child.clone()));
        }
    }

    /// Remove every edge for `parent` under a to-one relationship, with
    /// backref mirrors, before a replacement link lands.
    fn displace_to_one(&mut self, model: &str, rel: &RelMeta, parent: &EntityKey) -> Result<(), SessionError> {
        let existing: Vec<EntityKey> = self
            .edges(model, &rel.name)
            .map(|set| {
                set.iter()
                    .filter(|(p, _)| p == parent)
                    .map(|(_, c)| c.clone())
                    .collect()
            })
            .unwrap_or_default();
        for child in existing {
            self.unlink(model, parent, &rel.name, &child)?;
        }
        Ok(())
    }

    fn child_keys(&self, model: &str, relationship: &str, parent: &EntityKey) -> Vec<EntityKey> {
        self.edges(model, relationship)
            .map(|set| {
                set.iter()
                    .filter(|(p, _)| p == parent)
                    .map(|(_, c)| c.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn matches(&self, model: &ModelDescriptor, row: &Row, expr: &FilterExpr) -> Result<bool, SessionError> {
        match expr {
            FilterExpr::Cond { path, op, value } => {
                let candidates = self.resolve_path(model, row, path)?;
                Ok(candidates
                    .iter()
                    .any(|candidate| compare_values(candidate, *op, value)))
            }
            FilterExpr::And(exprs) => {
                for expr in exprs {
                    if !self.matches(model, row, expr)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            FilterExpr::Or(exprs) => {
                for expr in exprs {
                    if self.matches(model, row, expr)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            FilterExpr::Not(expr) => Ok(!self.matches(model, row, expr)?),
            FilterExpr::Raw(document) => self.matches_raw(model, row, document),
        }
    }

    /// Deep filter object from a free-text `query` parameter:
    /// `{attr: value}` equality, `{attr: {"$lt": v}}` operators,
    /// `$and`/`$or`/`$not` boolean nodes.
    fn matches_raw(&self, model: &ModelDescriptor, row: &Row, document: &Value) -> Result<bool, SessionError> {
        let Some(entries) = document.as_object() else {
            return Ok(false);
        };
        for (key, spec) in entries {
            let holds = match key.as_str() {
                "$and" => match spec.as_array() {
                    Some(parts) => {
                        let mut all = true;
                        for part in parts {
                            all &= self.matches_raw(model, row, part)?;
                        }
                        all
                    }
                    None => false,
                },
                "$or" => match spec.as_array() {
                    Some(parts) => {
                        let mut any = false;
                        for part in parts {
                            any |= self.matches_raw(model, row, part)?;
                        }
                        any
                    }
                    None => false,
                },
                "$not" => !self.matches_raw(model, row, spec)?,
                path => {
                    let candidates = self.resolve_path(model, row, path)?;
                    match spec.as_object() {
                        Some(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                            let mut all = true;
                            for (op_key, operand) in ops {
                                let Some(op) = op_key.strip_prefix('$').and_then(FilterOp::from_suffix) else {
                                    all = false;
                                    break;
                                };
                                all &= candidates.iter().any(|candidate| compare_values(candidate, op, operand));
                            }
                            all
                        }
                        _ => candidates
                            .iter()
                            .any(|candidate| compare_values(candidate, FilterOp::Eq, spec)),
                    }
                }
            };
            if !holds {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Values reachable at a dotted path: attribute of the row itself, or
    /// attributes of related rows (ANY semantics across to-many hops).
    fn resolve_path(&self, model: &ModelDescriptor, row: &Row, path: &str) -> Result<Vec<Value>, SessionError> {
        match path.split_once('.') {
            None => Ok(row.get(path).cloned().into_iter().collect()),
            Some((head, rest)) => {
                let Some(rel) = model.relationship(head) else {
                    return Ok(Vec::new());
                };
                let Some(key) = EntityKey::from_row(model, row) else {
                    return Ok(Vec::new());
                };
                let target = self.model(&rel.target)?;
                let mut values = Vec::new();
                for child in self.related(&model.name, &key, head)? {
                    values.extend(self.resolve_path(&target, &child, rest)?);
                }
                Ok(values)
            }
        }
    }

    fn sort_rows(&self, model: &ModelDescriptor, rows: &mut [(EntityKey, Row)], sorts: &[SortSpec]) {
        rows.sort_by(|(_, a), (_, b)| {
            for spec in sorts {
                let left = self
                    .resolve_path(model, a, &spec.path)
                    .ok()
                    .and_then(|mut v| if v.is_empty() { None } else { Some(v.remove(0)) });
                let right = self
                    .resolve_path(model, b, &spec.path)
                    .ok()
                    .and_then(|mut v| if v.is_empty() { None } else { Some(v.remove(0)) });
                let ordering = order_values(left.as_ref(), right.as_ref());
                let ordering = match spec.direction {
                    SortDirection::Asc => ordering,
                    SortDirection::Desc => ordering.reverse(),
                };
                if ordering != std::cmp::Ordering::Equal {
                    return ordering;
                }
            }
            std::cmp::Ordering::Equal
        });
    }
}

impl ModelSession for MemorySession {
    fn get(&self, model: &str, key: &EntityKey) -> Result<Option<Row>, SessionError> {
        self.model(model)?;
        Ok(self.state.tables.get(model).and_then(|table| table.get(key)).cloned())
    }

    fn query(&self, model: &str, plan: &QueryPlan) -> Result<Vec<Row>, SessionError> {
        let descriptor = self.model(model)?;
        let mut rows: Vec<(EntityKey, Row)> = match &plan.scope {
            Some(scope) => {
                let mut scoped = Vec::new();
                for key in self.child_keys(&scope.model, &scope.relationship, &scope.key) {
                    if let Some(row) = self.state.tables.get(model).and_then(|table| table.get(&key)) {
                        scoped.push((key.clone(), row.clone()));
                    }
                }
                scoped
            }
            None => self
                .state
                .tables
                .get(model)
                .map(|table| table.iter().map(|(key, row)| (key.clone(), row.clone())).collect())
                .unwrap_or_default(),
        };

        if let Some(filters) = &plan.filters {
            let mut kept = Vec::with_capacity(rows.len());
            for (key, row) in rows {
                if self.matches(&descriptor, &row, filters)? {
                    kept.push((key, row));
                }
            }
            rows = kept;
        }

        if !plan.sorts.is_empty() {
            self.sort_rows(&descriptor, &mut rows, &plan.sorts);
        }

        let offset = plan.window.offset as usize;
        let rows = rows.into_iter().skip(offset);
        let rows: Vec<Row> = match plan.window.limit {
            Some(limit) => rows.take(limit as usize).map(|(_, row)| row).collect(),
            None => rows.map(|(_, row)| row).collect(),
        };
        Ok(rows)
    }

    fn insert(&mut self, model: &str, mut row: Row) -> Result<EntityKey, SessionError> {
        let descriptor = self.model(model)?;
        for id_key in &descriptor.id_keys {
            if row.contains_key(id_key) {
                continue;
            }
            let attr = descriptor
                .attribute(id_key)
                .ok_or_else(|| SessionError::Integrity {
                    message: format!("id key {id_key} is not an attribute of {model}"),
                })?;
            if attr.type_code != crate::model::TypeCode::Integer {
                return Err(SessionError::Integrity {
                    message: format!("cannot assign a value for id key {id_key} on {model}"),
                });
            }
            let next = self
                .state
                .tables
                .get(model)
                .map(|table| {
                    table
                        .values()
                        .filter_map(|existing| existing.get(id_key).and_then(Value::as_i64))
                        .max()
                        .unwrap_or(0)
                })
                .unwrap_or(0)
                + 1;
            row.insert(id_key.clone(), Value::from(next));
        }
        let key = EntityKey::from_row(&descriptor, &row).ok_or_else(|| SessionError::Integrity {
            message: format!("row for {model} is missing identity values"),
        })?;
        let table = self.state.tables.entry(model.to_string()).or_default();
        if table.contains_key(&key) {
            return Err(SessionError::Integrity {
                message: format!("duplicate identity {key} for {model}"),
            });
        }
        table.insert(key.clone(), row);
        Ok(key)
    }

    fn update(&mut self, model: &str, key: &EntityKey, changes: Row) -> Result<(), SessionError> {
        self.model(model)?;
        let row = self
            .state
            .tables
            .get_mut(model)
            .and_then(|table| table.get_mut(key))
            .ok_or_else(|| SessionError::Integrity {
                message: format!("no row {key} in {model}"),
            })?;
        for (name, value) in changes {
            row.insert(name, value);
        }
        Ok(())
    }

    fn delete(&mut self, model: &str, key: &EntityKey) -> Result<(), SessionError> {
        let descriptor = self.model(model)?;
        let removed = self
            .state
            .tables
            .get_mut(model)
            .and_then(|table| table.remove(key))
            .is_some();
        if !removed {
            return Err(SessionError::Integrity {
                message: format!("no row {key} in {model}"),
            });
        }
        // Purge edges where the deleted entity is the parent.
        for rel in &descriptor.relationships {
            if let Some(set) = self
                .state
                .links
                .get_mut(&(model.to_string(), rel.name.clone()))
            {
                set.retain(|(parent, _)| parent != key);
            }
        }
        // Purge edges from other models pointing at the deleted entity.
        let referrers: Vec<(String, String)> = self
            .models
            .iter()
            .flat_map(|m| {
                m.relationships
                    .iter()
                    .filter(|rel| rel.target == model)
                    .map(|rel| (m.name.clone(), rel.name.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        for link_key in referrers {
            if let Some(set) = self.state.links.get_mut(&link_key) {
                set.retain(|(_, child)| child != key);
            }
        }
        Ok(())
    }

    fn related(&self, model: &str, key: &EntityKey, relationship: &str) -> Result<Vec<Row>, SessionError> {
        let rel = self.relationship(model, relationship)?;
        let table = self.state.tables.get(&rel.target);
        Ok(self
            .child_keys(model, relationship, key)
            .into_iter()
            .filter_map(|child| table.and_then(|rows| rows.get(&child)).cloned())
            .collect())
    }

    fn is_linked(
        &self,
        model: &str,
        key: &EntityKey,
        relationship: &str,
        child: &EntityKey,
    ) -> Result<bool, SessionError> {
        self.relationship(model, relationship)?;
        Ok(self
            .edges(model, relationship)
            .is_some_and(|set| set.contains(&(key.clone(), child.clone()))))
    }

    fn link(
        &mut self,
        model: &str,
        key: &EntityKey,
        relationship: &str,
        child: &EntityKey,
    ) -> Result<(), SessionError> {
        let rel = self.relationship(model, relationship)?;
        if !rel.many {
            self.displace_to_one(model, &rel, key)?;
        }
        self.insert_edge(model, relationship, key, child);
        if let Some(backref) = &rel.backref {
            let mirror = self.relationship(&rel.target, backref)?;
            if !mirror.many {
                self.displace_to_one(&rel.target, &mirror, child)?;
            }
            self.insert_edge(&rel.target, backref, child, key);
        }
        Ok(())
    }

    fn unlink(
        &mut self,
        model: &str,
        key: &EntityKey,
        relationship: &str,
        child: &EntityKey,
    ) -> Result<(), SessionError> {
        let rel = self.relationship(model, relationship)?;
        self.remove_edge(model, relationship, key, child);
        if let Some(backref) = &rel.backref {
            self.remove_edge(&rel.target, backref, child, key);
        }
        Ok(())
    }

    fn clear_related(&mut self, model: &str, key: &EntityKey, relationship: &str) -> Result<(), SessionError> {
        for child in self.child_keys(model, relationship, key) {
            self.unlink(model, key, relationship, &child)?;
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<(), SessionError> {
        self.snapshot = self.state.clone();
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), SessionError> {
        self.state = self.snapshot.clone();
        Ok(())
    }
}

fn decimal_of(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(number) => number.to_string().parse().ok(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn compare_values(candidate: &Value, op: FilterOp, operand: &Value) -> bool {
    match op {
        FilterOp::Eq => loose_eq(candidate, operand),
        FilterOp::Ne => !loose_eq(candidate, operand),
        FilterOp::Lt | FilterOp::Lte | FilterOp::Gt | FilterOp::Gte => {
            let Some(ordering) = loose_cmp(candidate, operand) else {
                return false;
            };
            match op {
                FilterOp::Lt => ordering == std::cmp::Ordering::Less,
                FilterOp::Lte => ordering != std::cmp::Ordering::Greater,
                FilterOp::Gt => ordering == std::cmp::Ordering::Greater,
                FilterOp::Gte => ordering != std::cmp::Ordering::Less,
                _ => unreachable!(),
            }
        }
        FilterOp::Like => match (candidate, operand) {
            (Value::String(text), Value::String(pattern)) => like_matches(pattern, text),
            _ => false,
        },
        FilterOp::In => operand
            .as_array()
            .is_some_and(|items| items.iter().any(|item| loose_eq(candidate, item))),
    }
}

/// Equality across the stored and external representations: numbers
/// compare as decimals, numeric strings compare against numbers.
fn loose_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    if let (Some(left), Some(right)) = (decimal_of(a), decimal_of(b)) {
        return left == right;
    }
    false
}

fn loose_cmp(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(left), Some(right)) = (decimal_of(a), decimal_of(b)) {
        return Some(left.cmp(&right));
    }
    match (a, b) {
        (Value::String(left), Value::String(right)) => Some(left.cmp(right)),
        (Value::Bool(left), Value::Bool(right)) => Some(left.cmp(right)),
        _ => None,
    }
}

/// Null orders before every value; mismatched types order by type tag so
/// sorting stays total.
fn order_values(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    match (a, b) {
        (None, None) => std::cmp::Ordering::Equal,
        (None, Some(_)) => std::cmp::Ordering::Less,
        (Some(_), None) => std::cmp::Ordering::Greater,
        (Some(Value::Null), Some(Value::Null)) => std::cmp::Ordering::Equal,
        (Some(Value::Null), Some(_)) => std::cmp::Ordering::Less,
        (Some(_), Some(Value::Null)) => std::cmp::Ordering::Greater,
        (Some(left), Some(right)) => loose_cmp(left, right).unwrap_or_else(|| type_rank(left).cmp(&type_rank(right))),
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// SQL-style `like`: `%`/`_` wildcards when present, case-insensitive
/// containment otherwise.
fn like_matches(pattern: &str, text: &str) -> bool {
    if pattern.contains('%') || pattern.contains('_') {
        let mut regex = String::with_capacity(pattern.len() + 4);
        regex.push('^');
        for ch in pattern.chars() {
            match ch {
                '%' => regex.push_str(".*"),
                '_' => regex.push('.'),
                other => regex.push_str(&regex::escape(&other.to_string())),
            }
        }
        regex.push('$');
        RegexBuilder::new(&regex)
            .case_insensitive(true)
            .build()
            .map(|re| re.is_match(text))
            .unwrap_or(false)
    } else {
        text.to_lowercase().contains(&pattern.to_lowercase())
    }
}
