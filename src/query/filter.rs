//! Mongo-style filter documents.
//!
//! A filter is a JSON object. Plain keys are dotted field paths; their value
//! is either a literal (implicit `$eq`) or an object of operators:
//!
//! | Operator | Meaning |
//! |----------|---------|
//! | `$eq`, `$ne` | equality / inequality |
//! | `$gt`, `$gte`, `$lt`, `$lte` | ordering within the same type class |
//! | `$in`, `$nin` | membership in a list |
//! | `$exists` | field presence |
//! | `$not` | negation of an operator object |
//!
//! Top-level `$and`, `$or` and `$nor` take arrays of filter documents.
//!
//! Filters are parsed once, at compile time, into a [`Filter`]; a malformed
//! document is rejected before anything executes. As in document databases,
//! a condition on a field holding an array matches if any element matches.

use std::cmp::Ordering;

use serde_json::{Map, Value};

use crate::message::Document;
use crate::query::eval::{compare_values, lookup, type_rank};
use crate::query::QueryError;

/// A parsed filter, keeping its source document for plan rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    source: Value,
    expr: Expr,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Nor(Vec<Expr>),
    Field { path: String, cond: Cond },
}

#[derive(Debug, Clone, PartialEq)]
enum Cond {
    Eq(Value),
    Ne(Value),
    Cmp(Ordering, bool, Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Not(Box<Cond>),
    All(Vec<Cond>),
}

impl Filter {
    /// Parses a filter document.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidFilter`] for non-object documents,
    /// unknown operators or operator arguments of the wrong type.
    ///
    /// # Examples
    ///
    /// ```
    /// use flowtrace::query::Filter;
    /// use serde_json::json;
    ///
    /// let filter = Filter::parse(&json!({"used.epochs": {"$gte": 10}})).unwrap();
    /// let doc = json!({"used": {"epochs": 12}});
    /// assert!(filter.matches(doc.as_object().unwrap()));
    ///
    /// assert!(Filter::parse(&json!({"x": {"$regex": "a"}})).is_err());
    /// ```
    pub fn parse(source: &Value) -> Result<Self, QueryError> {
        let Value::Object(map) = source else {
            return Err(invalid("filter must be an object"));
        };
        Ok(Self {
            source: source.clone(),
            expr: parse_document(map)?,
        })
    }

    /// Returns the filter document as given.
    pub fn source(&self) -> &Value {
        &self.source
    }

    /// Returns `true` if `document` satisfies the filter.
    pub fn matches(&self, document: &Document) -> bool {
        self.expr.matches(document)
    }
}

fn invalid(message: impl Into<String>) -> QueryError {
    QueryError::InvalidFilter(message.into())
}

fn parse_document(map: &Map<String, Value>) -> Result<Expr, QueryError> {
    let mut clauses = Vec::with_capacity(map.len());
    for (key, value) in map {
        let clause = match key.as_str() {
            "$and" => Expr::And(parse_list(key, value)?),
            "$or" => Expr::Or(parse_list(key, value)?),
            "$nor" => Expr::Nor(parse_list(key, value)?),
            op if op.starts_with('$') => {
                return Err(invalid(format!("unknown top-level operator {op}")))
            },
            path => Expr::Field {
                path: path.to_string(),
                cond: parse_condition(value)?,
            },
        };
        clauses.push(clause);
    }
    Ok(match clauses.len() {
        1 => clauses.remove(0),
        _ => Expr::And(clauses),
    })
}

fn parse_list(op: &str, value: &Value) -> Result<Vec<Expr>, QueryError> {
    let Value::Array(items) = value else {
        return Err(invalid(format!("{op} expects an array")));
    };
    if items.is_empty() {
        return Err(invalid(format!("{op} expects a non-empty array")));
    }
    items
        .iter()
        .map(|item| match item {
            Value::Object(map) => parse_document(map),
            _ => Err(invalid(format!("{op} entries must be objects"))),
        })
        .collect()
}

fn parse_condition(value: &Value) -> Result<Cond, QueryError> {
    match value {
        Value::Object(map) if !map.is_empty() && map.keys().all(|k| k.starts_with('$')) => {
            let mut conds = map
                .iter()
                .map(|(op, arg)| parse_operator(op, arg))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(match conds.len() {
                1 => conds.remove(0),
                _ => Cond::All(conds),
            })
        },
        Value::Object(map) if map.keys().any(|k| k.starts_with('$')) => Err(invalid(
            "operator objects cannot mix operators and plain keys",
        )),
        literal => Ok(Cond::Eq(literal.clone())),
    }
}

fn parse_operator(op: &str, arg: &Value) -> Result<Cond, QueryError> {
    let list = |arg: &Value| match arg {
        Value::Array(items) => Ok(items.clone()),
        _ => Err(invalid(format!("{op} expects an array"))),
    };
    Ok(match op {
        "$eq" => Cond::Eq(arg.clone()),
        "$ne" => Cond::Ne(arg.clone()),
        "$gt" => Cond::Cmp(Ordering::Greater, false, arg.clone()),
        "$gte" => Cond::Cmp(Ordering::Greater, true, arg.clone()),
        "$lt" => Cond::Cmp(Ordering::Less, false, arg.clone()),
        "$lte" => Cond::Cmp(Ordering::Less, true, arg.clone()),
        "$in" => Cond::In(list(arg)?),
        "$nin" => Cond::Nin(list(arg)?),
        "$exists" => match arg {
            Value::Bool(b) => Cond::Exists(*b),
            Value::Number(n) => Cond::Exists(n.as_f64() != Some(0.0)),
            _ => return Err(invalid("$exists expects a boolean")),
        },
        "$not" => match arg {
            Value::Object(map) if !map.is_empty() && map.keys().all(|k| k.starts_with('$')) => {
                Cond::Not(Box::new(parse_condition(arg)?))
            },
            _ => return Err(invalid("$not expects an operator object")),
        },
        other => return Err(invalid(format!("unknown operator {other}"))),
    })
}

impl Expr {
    fn matches(&self, doc: &Document) -> bool {
        match self {
            Self::And(all) => all.iter().all(|e| e.matches(doc)),
            Self::Or(any) => any.iter().any(|e| e.matches(doc)),
            Self::Nor(none) => !none.iter().any(|e| e.matches(doc)),
            Self::Field { path, cond } => cond.matches(lookup(doc, path)),
        }
    }
}

impl Cond {
    fn matches(&self, actual: Option<&Value>) -> bool {
        match self {
            Self::Eq(expected) => equals(actual, expected),
            Self::Ne(expected) => !equals(actual, expected),
            Self::Cmp(direction, inclusive, bound) => {
                any_element(actual, |v| ordered(v, bound, *direction, *inclusive))
            },
            Self::In(options) => options.iter().any(|o| equals(actual, o)),
            Self::Nin(options) => !options.iter().any(|o| equals(actual, o)),
            Self::Exists(wanted) => actual.is_some() == *wanted,
            Self::Not(inner) => !inner.matches(actual),
            Self::All(conds) => conds.iter().all(|c| c.matches(actual)),
        }
    }
}

/// Equality with null matching a missing field and arrays matching on any
/// element.
fn equals(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        None => expected.is_null(),
        Some(value) if value == expected => true,
        Some(Value::Array(items)) => items.iter().any(|item| values_equal(item, expected)),
        Some(value) => values_equal(value, expected),
    }
}

/// `1` and `1.0` are equal.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare_values(a, b) == Ordering::Equal,
        _ => a == b,
    }
}

fn any_element(actual: Option<&Value>, pred: impl Fn(&Value) -> bool) -> bool {
    match actual {
        None => false,
        Some(Value::Array(items)) => pred(&Value::Array(items.clone())) || items.iter().any(pred),
        Some(value) => pred(value),
    }
}

/// Ordering comparison only between values of the same type class.
fn ordered(value: &Value, bound: &Value, direction: Ordering, inclusive: bool) -> bool {
    if type_rank(Some(value)) != type_rank(Some(bound)) {
        return false;
    }
    let ord = compare_values(value, bound);
    ord == direction || (inclusive && ord == Ordering::Equal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check(filter: Value, doc: Value) -> bool {
        let filter = Filter::parse(&filter).unwrap();
        filter.matches(doc.as_object().unwrap())
    }

    #[test]
    fn implicit_equality_on_dotted_path() {
        let doc = json!({"used": {"lr": 0.01}, "status": "finished"});
        assert!(check(json!({"used.lr": 0.01}), doc.clone()));
        assert!(check(json!({"status": "finished", "used.lr": 0.01}), doc.clone()));
        assert!(!check(json!({"status": "running"}), doc));
    }

    #[test]
    fn integer_and_float_compare_equal() {
        assert!(check(json!({"n": 1}), json!({"n": 1.0})));
    }

    #[test]
    fn null_matches_missing_field() {
        assert!(check(json!({"ended_at": null}), json!({"task_id": "t"})));
        assert!(check(json!({"ended_at": {"$ne": null}}), json!({"ended_at": 3})));
    }

    #[test]
    fn ranges_do_not_cross_types() {
        assert!(check(json!({"x": {"$gt": 1, "$lte": 5}}), json!({"x": 5})));
        assert!(!check(json!({"x": {"$gt": 1}}), json!({"x": "9"})));
        assert!(!check(json!({"x": {"$lt": 1}}), json!({})));
    }

    #[test]
    fn membership_and_existence() {
        let doc = json!({"status": "error", "tags": ["gpu", "large"]});
        assert!(check(json!({"status": {"$in": ["error", "running"]}}), doc.clone()));
        assert!(check(json!({"status": {"$nin": ["finished"]}}), doc.clone()));
        assert!(check(json!({"tags": "gpu"}), doc.clone()));
        assert!(check(json!({"stderr": {"$exists": false}}), doc.clone()));
        assert!(!check(json!({"tags": {"$exists": false}}), doc));
    }

    #[test]
    fn logical_operators() {
        let doc = json!({"a": 1, "b": 2});
        assert!(check(json!({"$or": [{"a": 9}, {"b": 2}]}), doc.clone()));
        assert!(check(json!({"$and": [{"a": 1}, {"b": {"$gte": 2}}]}), doc.clone()));
        assert!(check(json!({"$nor": [{"a": 9}, {"b": 9}]}), doc.clone()));
        assert!(check(json!({"a": {"$not": {"$gt": 5}}}), doc));
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(check(json!({}), json!({"anything": true})));
    }

    #[test]
    fn malformed_filters_are_rejected() {
        for bad in [
            json!([1, 2]),
            json!({"$where": "1"}),
            json!({"$or": {"a": 1}}),
            json!({"$and": []}),
            json!({"x": {"$in": 3}}),
            json!({"x": {"$exists": "yes"}}),
            json!({"x": {"$not": 3}}),
            json!({"x": {"$gt": 1, "plain": 2}}),
        ] {
            assert!(
                matches!(Filter::parse(&bad), Err(QueryError::InvalidFilter(_))),
                "accepted {bad}"
            );
        }
    }

    #[test]
    fn source_is_preserved() {
        let source = json!({"workflow_id": "wf"});
        assert_eq!(Filter::parse(&source).unwrap().source(), &source);
    }
}
