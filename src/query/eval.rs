//! In-process evaluation of compiled plans.
//!
//! Records are evaluated stage by stage in creation order. Value ordering
//! is total across types: missing/null < numbers < strings < objects <
//! arrays < booleans.

use std::cmp::Ordering;

use indexmap::IndexMap;
use serde_json::{Map, Number, Value};

use crate::message::Document;
use crate::query::planner::{Accumulator, FindPlan, Plan, Stage};
use crate::query::{AggregateOp, SortSpec, SortDirection};
use crate::store::{ID_FIELD, TIMESTAMP_FIELD};

/// Resolves a dotted path; numeric segments index into arrays.
///
/// # Examples
///
/// ```
/// use flowtrace::query::eval::lookup;
/// use serde_json::json;
///
/// let doc = json!({"used": {"shape": [32, 64]}});
/// let doc = doc.as_object().unwrap();
/// assert_eq!(lookup(doc, "used.shape.1"), Some(&json!(64)));
/// assert_eq!(lookup(doc, "used.missing"), None);
/// ```
pub fn lookup<'a>(document: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = document.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Rank of a value's type class in the cross-type ordering.
pub fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Number(_)) => 1,
        Some(Value::String(_)) => 2,
        Some(Value::Object(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Bool(_)) => 5,
    }
}

/// Total order over JSON values.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    compare_optional(Some(a), Some(b))
}

/// Total order over possibly-missing JSON values (missing sorts as null).
pub fn compare_optional(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let by_rank = type_rank(a).cmp(&type_rank(b));
    if by_rank != Ordering::Equal {
        return by_rank;
    }
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => compare_numbers(x, y),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Array(x)), Some(Value::Array(y))) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare_values(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        },
        (Some(Value::Object(x)), Some(Value::Object(y))) => {
            for ((lk, lv), (rk, rv)) in x.iter().zip(y.iter()) {
                let ord = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        },
        _ => Ordering::Equal,
    }
}

fn compare_numbers(x: &Number, y: &Number) -> Ordering {
    match (x.as_i64(), y.as_i64()) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => {
            let a = x.as_f64().unwrap_or(f64::NAN);
            let b = y.as_f64().unwrap_or(f64::NAN);
            a.total_cmp(&b)
        },
    }
}

/// Runs a plan over `documents` (expected in creation order).
pub fn execute(plan: &Plan, documents: Vec<Document>) -> Vec<Document> {
    match plan {
        Plan::Find(find) => execute_find(find, documents),
        Plan::Pipeline(stages) => stages
            .iter()
            .fold(documents, |docs, stage| apply_stage(stage, docs)),
    }
}

fn execute_find(plan: &FindPlan, documents: Vec<Document>) -> Vec<Document> {
    let mut docs: Vec<Document> = match &plan.filter {
        Some(filter) => documents.into_iter().filter(|d| filter.matches(d)).collect(),
        None => documents,
    };
    sort(&mut docs, &plan.sort);
    if plan.limit > 0 {
        docs.truncate(plan.limit);
    }
    docs.into_iter()
        .map(|doc| project_find(doc, plan.projection.as_deref(), plan.include_internal))
        .collect()
}

fn project_find(mut doc: Document, projection: Option<&[String]>, include_internal: bool) -> Document {
    let mut out = match projection {
        Some(fields) if !fields.is_empty() => {
            let mut out = Document::new();
            if include_internal {
                for internal in [ID_FIELD, TIMESTAMP_FIELD] {
                    if let Some(v) = doc.get(internal) {
                        out.insert(internal.to_string(), v.clone());
                    }
                }
            }
            for field in fields {
                if let Some(value) = lookup(&doc, field) {
                    insert_path(&mut out, field, value.clone());
                }
            }
            out
        },
        _ => {
            if !include_internal {
                doc.remove(ID_FIELD);
                doc.remove(TIMESTAMP_FIELD);
            }
            return doc;
        },
    };
    if !include_internal {
        out.remove(ID_FIELD);
        out.remove(TIMESTAMP_FIELD);
    }
    out
}

/// Writes `value` at a dotted path, creating intermediate objects.
fn insert_path(target: &mut Document, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            target.insert(path.to_string(), value);
        },
        Some((head, rest)) => {
            let entry = target
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(inner) = entry {
                insert_path(inner, rest, value);
            }
        },
    }
}

fn apply_stage(stage: &Stage, mut docs: Vec<Document>) -> Vec<Document> {
    match stage {
        Stage::Match(filter) => docs.into_iter().filter(|d| filter.matches(d)).collect(),
        Stage::Group { key, accumulators } => group(key.as_deref(), accumulators, docs),
        Stage::Sort(keys) => {
            sort(&mut docs, keys);
            docs
        },
        Stage::Limit(n) => {
            docs.truncate(*n);
            docs
        },
        Stage::Project { group_field, fields } => docs
            .into_iter()
            .map(|mut doc| {
                let mut out = Document::new();
                if let Some(name) = group_field {
                    out.insert(name.clone(), doc.remove(ID_FIELD).unwrap_or(Value::Null));
                }
                for field in fields {
                    if let Some(value) = doc.remove(field) {
                        out.insert(field.clone(), value);
                    }
                }
                out
            })
            .collect(),
    }
}

/// Stable multi-key sort.
fn sort(docs: &mut [Document], keys: &[SortSpec]) {
    if keys.is_empty() {
        return;
    }
    docs.sort_by(|a, b| {
        keys.iter()
            .map(|key| {
                let ord = compare_optional(lookup(a, &key.field), lookup(b, &key.field));
                match key.direction {
                    SortDirection::Asc => ord,
                    SortDirection::Desc => ord.reverse(),
                }
            })
            .find(|ord| *ord != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    });
}

fn group(key: Option<&str>, accumulators: &[Accumulator], docs: Vec<Document>) -> Vec<Document> {
    // Groups keep first-seen order; the canonical JSON text of the key
    // stands in for hashing.
    let mut groups: IndexMap<String, (Value, Vec<State>)> = IndexMap::new();
    for doc in &docs {
        let group_value = key
            .and_then(|path| lookup(doc, path))
            .cloned()
            .unwrap_or(Value::Null);
        let (_, states) = groups
            .entry(group_value.to_string())
            .or_insert_with(|| {
                (
                    group_value,
                    accumulators.iter().map(|a| State::new(a.op)).collect(),
                )
            });
        for (state, acc) in states.iter_mut().zip(accumulators) {
            state.feed(lookup(doc, &acc.field));
        }
    }

    groups
        .into_values()
        .map(|(group_value, states)| {
            let mut out = Document::new();
            out.insert(ID_FIELD.to_string(), group_value);
            for (state, acc) in states.into_iter().zip(accumulators) {
                out.insert(acc.output.clone(), state.finish());
            }
            out
        })
        .collect()
}

enum State {
    Extreme { want: Ordering, best: Option<Value> },
    Sum { int: i64, float: f64, is_float: bool },
    Avg { total: f64, n: u64 },
    Count(u64),
    First(Option<Value>),
    Last(Value),
}

impl State {
    fn new(op: AggregateOp) -> Self {
        match op {
            AggregateOp::Min => Self::Extreme {
                want: Ordering::Less,
                best: None,
            },
            AggregateOp::Max => Self::Extreme {
                want: Ordering::Greater,
                best: None,
            },
            AggregateOp::Sum => Self::Sum {
                int: 0,
                float: 0.0,
                is_float: false,
            },
            AggregateOp::Avg => Self::Avg { total: 0.0, n: 0 },
            AggregateOp::Count => Self::Count(0),
            AggregateOp::First => Self::First(None),
            AggregateOp::Last => Self::Last(Value::Null),
        }
    }

    fn feed(&mut self, value: Option<&Value>) {
        match self {
            Self::Extreme { want, best } => {
                let Some(value) = value.filter(|v| !v.is_null()) else {
                    return;
                };
                let replace = best
                    .as_ref()
                    .is_none_or(|current| compare_values(value, current) == *want);
                if replace {
                    *best = Some(value.clone());
                }
            },
            Self::Sum {
                int,
                float,
                is_float,
            } => {
                let Some(Value::Number(n)) = value else {
                    return;
                };
                match (n.as_i64(), *is_float) {
                    (Some(i), false) => match int.checked_add(i) {
                        Some(total) => *int = total,
                        None => {
                            *float = *int as f64 + i as f64;
                            *is_float = true;
                        },
                    },
                    _ => {
                        if !*is_float {
                            *float = *int as f64;
                            *is_float = true;
                        }
                        *float += n.as_f64().unwrap_or(0.0);
                    },
                }
            },
            Self::Avg { total, n } => {
                if let Some(x) = value.and_then(Value::as_f64) {
                    *total += x;
                    *n += 1;
                }
            },
            Self::Count(n) => *n += 1,
            Self::First(slot) => {
                if slot.is_none() {
                    *slot = Some(value.cloned().unwrap_or(Value::Null));
                }
            },
            Self::Last(slot) => *slot = value.cloned().unwrap_or(Value::Null),
        }
    }

    fn finish(self) -> Value {
        match self {
            Self::Extreme { best, .. } => best.unwrap_or(Value::Null),
            Self::Sum {
                int,
                float,
                is_float,
            } => {
                if is_float {
                    float_value(float)
                } else {
                    Value::from(int)
                }
            },
            Self::Avg { total, n } => {
                if n == 0 {
                    Value::Null
                } else {
                    float_value(total / n as f64)
                }
            },
            Self::Count(n) => Value::from(n),
            Self::First(slot) => slot.unwrap_or(Value::Null),
            Self::Last(value) => value,
        }
    }
}

fn float_value(x: f64) -> Value {
    Number::from_f64(x).map_or(Value::Null, Value::Number)
}
