use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison operator for a filter leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    Like,
    In,
}

impl FilterOp {
    /// Parse the suffix form used in query-parameter keys (`album_id-lt`).
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "eq" => Some(Self::Eq),
            "ne" => Some(Self::Ne),
            "lt" => Some(Self::Lt),
            "lte" => Some(Self::Lte),
            "gt" => Some(Self::Gt),
            "gte" => Some(Self::Gte),
            "like" => Some(Self::Like),
            "in" => Some(Self::In),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Like => "like",
            Self::In => "in",
        }
    }
}

/// A composable filter expression handed to the session's query builder.
///
/// Leaves compare a dotted attribute path against a value; interior nodes
/// combine subexpressions. `Raw` carries the JSON-decoded free-text
/// `query` document for the collaborator to interpret as a deep filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterExpr {
    Cond {
        path: String,
        op: FilterOp,
        value: Value,
    },
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
    Not(Box<FilterExpr>),
    Raw(Value),
}

impl FilterExpr {
    #[inline]
    pub fn cond(path: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self::Cond {
            path: path.into(),
            op,
            value: value.into(),
        }
    }

    #[inline]
    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cond(path, FilterOp::Eq, value)
    }

    #[inline]
    pub fn and(exprs: impl IntoIterator<Item = FilterExpr>) -> Self {
        Self::And(exprs.into_iter().collect())
    }

    #[inline]
    pub fn or(exprs: impl IntoIterator<Item = FilterExpr>) -> Self {
        Self::Or(exprs.into_iter().collect())
    }

    #[inline]
    pub fn not(expr: FilterExpr) -> Self {
        Self::Not(Box::new(expr))
    }

    /// Collapse an `And` of zero or one expressions to its simplest form.
    pub fn conjoin(mut exprs: Vec<FilterExpr>) -> Option<Self> {
        match exprs.len() {
            0 => None,
            1 => exprs.pop(),
            _ => Some(Self::And(exprs)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// One entry of an ordered sort list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortSpec {
    pub path: String,
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn asc(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Paging window. When both `page` and an explicit offset are supplied,
/// `page` wins and the offset is derived as `(page - 1) * limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OffsetLimit {
    pub offset: u64,
    pub limit: Option<u64>,
    pub page: Option<u64>,
}

impl OffsetLimit {
    pub fn new(offset: u64, limit: Option<u64>) -> Self {
        Self {
            offset,
            limit,
            page: None,
        }
    }

    pub fn paged(page: u64, limit: u64) -> Self {
        Self {
            offset: page.saturating_sub(1) * limit,
            limit: Some(limit),
            page: Some(page),
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.offset == 0 && self.limit.is_none()
    }
}
