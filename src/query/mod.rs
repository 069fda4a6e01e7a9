//! Declarative queries over stored task records.
//!
//! An [`AggregationSpec`] describes a read: a Mongo-style `filter`, an
//! optional `projection`, `sort` keys, a `limit` and a list of
//! `(operator, field)` aggregations. [`planner::compile`] validates it and
//! produces a [`Plan`]; [`eval::execute`] runs a plan over a set of records,
//! which is what [`DocumentStore::execute`](crate::store::DocumentStore::execute)
//! does with the stored records.
//!
//! # Plan shapes
//!
//! - With aggregations: `match -> group -> sort -> limit -> project`. The
//!   group key is the single projection field, or a constant when there is
//!   no projection. Each aggregation yields a field named
//!   `{op}_{field with '.' replaced by '_'}`.
//! - Without aggregations: a direct filtered, sorted, limited read; `_id`
//!   and `timestamp` are stripped unless `include_internal` is set.
//!
//! # Examples
//!
//! ```
//! use flowtrace::query::{planner, AggregateOp, AggregationSpec, Plan};
//!
//! let spec = AggregationSpec::new()
//!     .with_projection(["workflow_id"])
//!     .aggregate(AggregateOp::Avg, "used.batch_size");
//! let plan = planner::compile(&spec).unwrap();
//! assert!(matches!(plan, Plan::Pipeline(_)));
//!
//! let too_wide = AggregationSpec::new()
//!     .with_projection(["workflow_id", "activity_id"])
//!     .aggregate(AggregateOp::Max, "used.epochs");
//! assert!(planner::compile(&too_wide).is_err());
//! ```

pub mod eval;
pub mod filter;
pub mod planner;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use filter::Filter;
pub use planner::{Plan, Stage};

use crate::store::StoreError;

/// Errors raised while compiling or executing a query.
#[derive(Debug, Error)]
pub enum QueryError {
    /// More than one projection field was combined with aggregations.
    #[error(
        "grouping supports at most one projection field, got {fields}; \
         drop the aggregation or project a single field"
    )]
    ProjectionTooWide {
        /// Number of projection fields requested.
        fields: usize,
    },

    /// The filter document is malformed.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// Some other part of the request is malformed.
    #[error("invalid query: {0}")]
    InvalidSpec(String),

    /// The records could not be read.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Aggregation operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateOp {
    /// Smallest non-null value.
    Min,
    /// Largest non-null value.
    Max,
    /// Mean of the numeric values.
    Avg,
    /// Sum of the numeric values.
    Sum,
    /// Number of records in the group.
    Count,
    /// Value in the first record of the group.
    First,
    /// Value in the last record of the group.
    Last,
}

impl AggregateOp {
    /// Returns the operator name used in output field names.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Min => "min",
            Self::Max => "max",
            Self::Avg => "avg",
            Self::Sum => "sum",
            Self::Count => "count",
            Self::First => "first",
            Self::Last => "last",
        }
    }
}

impl fmt::Display for AggregateOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregateOp {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim_start_matches('$').to_ascii_lowercase().as_str() {
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "avg" => Ok(Self::Avg),
            "sum" => Ok(Self::Sum),
            "count" => Ok(Self::Count),
            "first" => Ok(Self::First),
            "last" => Ok(Self::Last),
            other => Err(QueryError::InvalidSpec(format!(
                "unknown aggregation operator: {other}"
            ))),
        }
    }
}

/// One `(operator, field)` aggregation.
///
/// Deserializes from either `["avg", "used.batch_size"]` or
/// `{"op": "avg", "field": "used.batch_size"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "AggregateRepr")]
pub struct Aggregate {
    /// Operator.
    pub op: AggregateOp,
    /// Dotted field path the operator reads.
    pub field: String,
}

impl Aggregate {
    /// Creates an aggregation.
    pub fn new(op: AggregateOp, field: impl Into<String>) -> Self {
        Self {
            op,
            field: field.into(),
        }
    }

    /// Returns the synthesized output field name.
    ///
    /// # Examples
    ///
    /// ```
    /// use flowtrace::query::{Aggregate, AggregateOp};
    ///
    /// let agg = Aggregate::new(AggregateOp::Max, "used.epochs");
    /// assert_eq!(agg.output_field(), "max_used_epochs");
    /// ```
    pub fn output_field(&self) -> String {
        format!("{}_{}", self.op, flatten_path(&self.field))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AggregateRepr {
    Pair(AggregateOp, String),
    Named { op: AggregateOp, field: String },
}

impl From<AggregateRepr> for Aggregate {
    fn from(repr: AggregateRepr) -> Self {
        match repr {
            AggregateRepr::Pair(op, field) | AggregateRepr::Named { op, field } => {
                Self { op, field }
            },
        }
    }
}

/// Sort direction.
///
/// Deserializes from `"asc"`/`"desc"` or the numeric forms `1`/`-1`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "DirectionRepr")]
pub enum SortDirection {
    /// Smallest first.
    #[default]
    Asc,
    /// Largest first.
    Desc,
}

impl SortDirection {
    /// Returns the numeric form (`1` or `-1`).
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Asc => 1,
            Self::Desc => -1,
        }
    }
}

impl FromStr for SortDirection {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" | "ascending" | "1" => Ok(Self::Asc),
            "desc" | "descending" | "-1" => Ok(Self::Desc),
            other => Err(QueryError::InvalidSpec(format!(
                "unknown sort direction: {other}"
            ))),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DirectionRepr {
    Number(i64),
    Name(String),
}

impl TryFrom<DirectionRepr> for SortDirection {
    type Error = QueryError;

    fn try_from(repr: DirectionRepr) -> Result<Self, Self::Error> {
        match repr {
            DirectionRepr::Number(n) if n >= 0 => Ok(Self::Asc),
            DirectionRepr::Number(_) => Ok(Self::Desc),
            DirectionRepr::Name(name) => name.parse(),
        }
    }
}

/// One sort key.
///
/// Deserializes from either `["ended_at", -1]` or
/// `{"field": "ended_at", "direction": "desc"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SortRepr")]
pub struct SortSpec {
    /// Dotted field path.
    pub field: String,
    /// Direction.
    pub direction: SortDirection,
}

impl SortSpec {
    /// Creates a sort key.
    pub fn new(field: impl Into<String>, direction: SortDirection) -> Self {
        Self {
            field: field.into(),
            direction,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SortRepr {
    Pair(String, SortDirection),
    Named {
        field: String,
        #[serde(default)]
        direction: SortDirection,
    },
}

impl From<SortRepr> for SortSpec {
    fn from(repr: SortRepr) -> Self {
        match repr {
            SortRepr::Pair(field, direction) | SortRepr::Named { field, direction } => {
                Self { field, direction }
            },
        }
    }
}

/// Declarative read request.
///
/// # Examples
///
/// ```
/// use flowtrace::query::{AggregateOp, AggregationSpec};
/// use serde_json::json;
///
/// let spec: AggregationSpec = serde_json::from_value(json!({
///     "filter": {"campaign_id": "c1"},
///     "projection": ["workflow_id"],
///     "sort": [["avg_ended_at", -1]],
///     "aggregation": [["avg", "ended_at"]]
/// }))
/// .unwrap();
/// assert_eq!(spec.aggregation[0].op, AggregateOp::Avg);
/// assert_eq!(spec.limit, 0);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationSpec {
    /// Mongo-style filter document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<Value>,
    /// Projection fields; at most one when `aggregation` is non-empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projection: Option<Vec<String>>,
    /// Maximum number of results; `0` means no limit.
    pub limit: usize,
    /// Sort keys, applied in order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<SortSpec>,
    /// `(operator, field)` aggregations.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub aggregation: Vec<Aggregate>,
    /// Keep `_id` and `timestamp` in direct reads.
    pub include_internal: bool,
}

impl AggregationSpec {
    /// Creates an empty request (every record, unsorted).
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the filter document.
    pub fn with_filter(mut self, filter: Value) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Sets the projection fields.
    pub fn with_projection<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projection = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the result limit (`0` for none).
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Appends a sort key.
    pub fn sort_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort.push(SortSpec::new(field, direction));
        self
    }

    /// Appends an aggregation.
    pub fn aggregate(mut self, op: AggregateOp, field: impl Into<String>) -> Self {
        self.aggregation.push(Aggregate::new(op, field));
        self
    }

    /// Keeps internal fields in direct reads.
    pub fn include_internal(mut self, include: bool) -> Self {
        self.include_internal = include;
        self
    }
}

/// Replaces path separators with underscores (`used.epochs` -> `used_epochs`).
pub fn flatten_path(path: &str) -> String {
    path.replace('.', "_")
}
