//! Compilation of [`AggregationSpec`]s into executable plans.

use serde_json::{json, Map, Value};

use crate::query::filter::Filter;
use crate::query::{flatten_path, AggregateOp, AggregationSpec, QueryError, SortSpec};
use crate::store::{ID_FIELD, TIMESTAMP_FIELD};

/// A compiled query.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    /// Direct filtered, sorted, limited read.
    Find(FindPlan),
    /// Grouping pipeline.
    Pipeline(Vec<Stage>),
}

/// Direct read without grouping.
#[derive(Debug, Clone, PartialEq)]
pub struct FindPlan {
    /// Optional filter.
    pub filter: Option<Filter>,
    /// Fields to return; all fields when `None`.
    pub projection: Option<Vec<String>>,
    /// Sort keys.
    pub sort: Vec<SortSpec>,
    /// Result limit, `0` for none.
    pub limit: usize,
    /// Keep `_id` and `timestamp`.
    pub include_internal: bool,
}

/// One aggregation output inside a group stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Accumulator {
    /// Output field name (`{op}_{flattened field}`).
    pub output: String,
    /// Operator.
    pub op: AggregateOp,
    /// Dotted input field path.
    pub field: String,
}

/// One pipeline stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    /// Keep matching records.
    Match(Filter),
    /// Group by `key` (a constant when `None`) and compute accumulators.
    /// Each output record carries the group value under `_id`.
    Group {
        /// Dotted group-by path.
        key: Option<String>,
        /// Aggregations.
        accumulators: Vec<Accumulator>,
    },
    /// Sort.
    Sort(Vec<SortSpec>),
    /// Keep the first `n` records.
    Limit(usize),
    /// Rename `_id` to `group_field` (or drop it) and keep `fields`.
    Project {
        /// Output name of the group value.
        group_field: Option<String>,
        /// Aggregation outputs to keep.
        fields: Vec<String>,
    },
}

/// Compiles a declarative request.
///
/// # Errors
///
/// - [`QueryError::ProjectionTooWide`] when aggregations are combined with
///   more than one projection field.
/// - [`QueryError::InvalidFilter`] for a malformed filter.
/// - [`QueryError::InvalidSpec`] for empty field paths.
///
/// # Examples
///
/// ```
/// use flowtrace::query::{planner, AggregateOp, AggregationSpec};
/// use serde_json::json;
///
/// let spec = AggregationSpec::new().aggregate(AggregateOp::Max, "used.epochs");
/// let pipeline = planner::compile(&spec).unwrap().to_pipeline();
/// assert_eq!(
///     pipeline,
///     json!([
///         {"$group": {"_id": null, "max_used_epochs": {"$max": "$used.epochs"}}},
///         {"$project": {"_id": 0, "max_used_epochs": 1}}
///     ])
/// );
/// ```
pub fn compile(spec: &AggregationSpec) -> Result<Plan, QueryError> {
    let filter = spec.filter.as_ref().map(Filter::parse).transpose()?;
    let projection = spec.projection.clone().filter(|p| !p.is_empty());
    check_paths(projection.iter().flatten().map(String::as_str), "projection")?;
    check_paths(spec.sort.iter().map(|s| s.field.as_str()), "sort")?;
    check_paths(spec.aggregation.iter().map(|a| a.field.as_str()), "aggregation")?;

    if spec.aggregation.is_empty() {
        return Ok(Plan::Find(FindPlan {
            filter,
            projection,
            sort: spec.sort.clone(),
            limit: spec.limit,
            include_internal: spec.include_internal,
        }));
    }

    let group_key = match projection.as_deref() {
        None => None,
        Some([single]) => Some(single.clone()),
        Some(many) => return Err(QueryError::ProjectionTooWide { fields: many.len() }),
    };

    let accumulators: Vec<Accumulator> = spec
        .aggregation
        .iter()
        .map(|agg| Accumulator {
            output: agg.output_field(),
            op: agg.op,
            field: agg.field.clone(),
        })
        .collect();
    let outputs = accumulators.iter().map(|a| a.output.clone()).collect();

    let mut stages = Vec::with_capacity(5);
    if let Some(filter) = filter {
        stages.push(Stage::Match(filter));
    }
    stages.push(Stage::Group {
        key: group_key.clone(),
        accumulators,
    });
    if !spec.sort.is_empty() {
        stages.push(Stage::Sort(
            spec.sort
                .iter()
                .map(|s| group_sort_key(s, group_key.as_deref()))
                .collect(),
        ));
    }
    if spec.limit > 0 {
        stages.push(Stage::Limit(spec.limit));
    }
    stages.push(Stage::Project {
        group_field: group_key.as_deref().map(flatten_path),
        fields: outputs,
    });
    Ok(Plan::Pipeline(stages))
}

fn check_paths<'a>(
    paths: impl IntoIterator<Item = &'a str>,
    what: &str,
) -> Result<(), QueryError> {
    for path in paths {
        if path.is_empty() || path.split('.').any(str::is_empty) {
            return Err(QueryError::InvalidSpec(format!(
                "empty field path in {what}: {path:?}"
            )));
        }
    }
    Ok(())
}

/// Sorting happens before the final projection, while the group value still
/// lives under `_id`; callers name it by its projected field.
fn group_sort_key(sort: &SortSpec, group_key: Option<&str>) -> SortSpec {
    match group_key {
        Some(key) if sort.field == key || sort.field == flatten_path(key) => {
            SortSpec::new(ID_FIELD, sort.direction)
        },
        _ => sort.clone(),
    }
}

impl Plan {
    /// Renders the plan as a document-database aggregation pipeline.
    ///
    /// A [`Plan::Find`] renders as the equivalent `$match`, `$sort`,
    /// `$limit` and `$project` stages.
    pub fn to_pipeline(&self) -> Value {
        let stages: Vec<Value> = match self {
            Self::Find(find) => render_find(find),
            Self::Pipeline(stages) => stages.iter().map(render_stage).collect(),
        };
        Value::Array(stages)
    }
}

fn render_sort(keys: &[SortSpec]) -> Value {
    let mut sort = Map::new();
    for key in keys {
        sort.insert(key.field.clone(), json!(key.direction.as_i32()));
    }
    json!({ "$sort": sort })
}

fn render_find(find: &FindPlan) -> Vec<Value> {
    let mut stages = Vec::new();
    if let Some(filter) = &find.filter {
        stages.push(json!({ "$match": filter.source() }));
    }
    if !find.sort.is_empty() {
        stages.push(render_sort(&find.sort));
    }
    if find.limit > 0 {
        stages.push(json!({ "$limit": find.limit }));
    }
    let mut project = Map::new();
    if let Some(fields) = &find.projection {
        for field in fields {
            project.insert(field.clone(), json!(1));
        }
    }
    if !find.include_internal {
        project.insert(ID_FIELD.to_string(), json!(0));
        project.insert(TIMESTAMP_FIELD.to_string(), json!(0));
    }
    if !project.is_empty() {
        stages.push(json!({ "$project": project }));
    }
    stages
}

fn render_stage(stage: &Stage) -> Value {
    match stage {
        Stage::Match(filter) => json!({ "$match": filter.source() }),
        Stage::Group { key, accumulators } => {
            let mut group = Map::new();
            group.insert(
                ID_FIELD.to_string(),
                key.as_ref().map_or(Value::Null, |k| json!(format!("${k}"))),
            );
            for acc in accumulators {
                // Counting documents is a sum of ones in a `$group` stage.
                let expr = match acc.op {
                    AggregateOp::Count => json!({ "$sum": 1 }),
                    op => json!({ format!("${op}"): format!("${}", acc.field) }),
                };
                group.insert(acc.output.clone(), expr);
            }
            json!({ "$group": group })
        },
        Stage::Sort(keys) => render_sort(keys),
        Stage::Limit(n) => json!({ "$limit": n }),
        Stage::Project {
            group_field,
            fields,
        } => {
            let mut project = Map::new();
            project.insert(ID_FIELD.to_string(), json!(0));
            if let Some(name) = group_field {
                project.insert(name.clone(), json!(format!("${ID_FIELD}")));
            }
            for field in fields {
                project.insert(field.clone(), json!(1));
            }
            json!({ "$project": project })
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{AggregateOp, SortDirection};
    use pretty_assertions::assert_eq;

    #[test]
    fn direct_read_without_aggregation() {
        let spec = AggregationSpec::new()
            .with_filter(json!({"status": "finished"}))
            .with_projection(["workflow_id", "used.epochs"])
            .with_limit(3);
        let Plan::Find(find) = compile(&spec).unwrap() else {
            panic!("expected a find plan");
        };
        assert_eq!(find.limit, 3);
        assert_eq!(find.projection.as_ref().map(Vec::len), Some(2));
    }

    #[test]
    fn stage_order_with_everything() {
        let spec = AggregationSpec::new()
            .with_filter(json!({"campaign_id": "c"}))
            .with_projection(["workflow_id"])
            .sort_by("avg_ended_at", SortDirection::Desc)
            .with_limit(10)
            .aggregate(AggregateOp::Avg, "ended_at");
        let Plan::Pipeline(stages) = compile(&spec).unwrap() else {
            panic!("expected a pipeline");
        };
        let kinds: Vec<&str> = stages
            .iter()
            .map(|s| match s {
                Stage::Match(_) => "match",
                Stage::Group { .. } => "group",
                Stage::Sort(_) => "sort",
                Stage::Limit(_) => "limit",
                Stage::Project { .. } => "project",
            })
            .collect();
        assert_eq!(kinds, vec!["match", "group", "sort", "limit", "project"]);
    }

    #[test]
    fn projection_too_wide_is_rejected() {
        let spec = AggregationSpec::new()
            .with_projection(["a", "b"])
            .aggregate(AggregateOp::Sum, "x");
        assert!(matches!(
            compile(&spec),
            Err(QueryError::ProjectionTooWide { fields: 2 })
        ));
    }

    #[test]
    fn count_renders_as_sum_of_ones() {
        let spec = AggregationSpec::new()
            .with_projection(["workflow_id"])
            .aggregate(AggregateOp::Count, "task_id")
            .aggregate(AggregateOp::Max, "used.epochs");
        let pipeline = compile(&spec).unwrap().to_pipeline();
        assert_eq!(
            pipeline[0],
            json!({"$group": {
                "_id": "$workflow_id",
                "count_task_id": {"$sum": 1},
                "max_used_epochs": {"$max": "$used.epochs"}
            }})
        );
    }

    #[test]
    fn empty_projection_list_means_no_projection() {
        let spec = AggregationSpec::new()
            .with_projection(Vec::<String>::new())
            .aggregate(AggregateOp::Count, "task_id");
        let Plan::Pipeline(stages) = compile(&spec).unwrap() else {
            panic!("expected a pipeline");
        };
        assert!(matches!(&stages[0], Stage::Group { key: None, .. }));
    }

    #[test]
    fn invalid_filter_fails_compilation() {
        let spec = AggregationSpec::new().with_filter(json!({"x": {"$bogus": 1}}));
        assert!(matches!(compile(&spec), Err(QueryError::InvalidFilter(_))));
    }

    #[test]
    fn empty_paths_are_rejected() {
        let spec = AggregationSpec::new().aggregate(AggregateOp::Max, "used.");
        assert!(matches!(compile(&spec), Err(QueryError::InvalidSpec(_))));
    }

    #[test]
    fn sort_on_group_field_targets_group_id() {
        let spec = AggregationSpec::new()
            .with_projection(["used.batch_size"])
            .sort_by("used_batch_size", SortDirection::Asc)
            .aggregate(AggregateOp::Count, "task_id");
        let Plan::Pipeline(stages) = compile(&spec).unwrap() else {
            panic!("expected a pipeline");
        };
        assert_eq!(stages[1], Stage::Sort(vec![SortSpec::new("_id", SortDirection::Asc)]));
    }

    #[test]
    fn pipeline_rendering_with_projection() {
        let spec = AggregationSpec::new()
            .with_filter(json!({"campaign_id": "c"}))
            .with_projection(["used.batch_size"])
            .aggregate(AggregateOp::Avg, "generated.loss");
        assert_eq!(
            compile(&spec).unwrap().to_pipeline(),
            json!([
                {"$match": {"campaign_id": "c"}},
                {"$group": {"_id": "$used.batch_size", "avg_generated_loss": {"$avg": "$generated.loss"}}},
                {"$project": {"_id": 0, "used_batch_size": "$_id", "avg_generated_loss": 1}}
            ])
        );
    }

    #[test]
    fn find_rendering_excludes_internal_fields() {
        let spec = AggregationSpec::new()
            .sort_by("started_at", SortDirection::Desc)
            .with_limit(2);
        assert_eq!(
            compile(&spec).unwrap().to_pipeline(),
            json!([
                {"$sort": {"started_at": -1}},
                {"$limit": 2},
                {"$project": {"_id": 0, "timestamp": 0}}
            ])
        );
    }
}
