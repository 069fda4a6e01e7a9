//! Curation of partial task observations.
//!
//! A task is usually reported several times: once when it is submitted,
//! again when it starts (with `used` populated) and once more when it ends
//! (with `generated`, `ended_at` and the final `status`). [`merge`] folds a
//! batch of such observations into one field set per correlation-key value.
//!
//! # Merge rules
//!
//! - Messages are applied in arrival order.
//! - Scalar (and array) fields are last-write-wins.
//! - Object-valued fields merge key-wise one level deep: a later
//!   `generated: {loss: 0.1}` keeps an earlier `generated: {accuracy: 0.9}`.
//!   Values below that level are replaced wholesale.
//! - Messages without a usable correlation-key value are dropped with a
//!   warning.
//!
//! The same [`merge_fields`] rule is applied by the document store when a
//! curated update lands on an existing record, so accumulation holds across
//! flushes as well as within one.

use indexmap::IndexMap;
use serde_json::Value;
use tracing::warn;

use crate::message::{Document, TaskMessage};

/// Curated updates for one flush.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Curated {
    /// One merged field set per correlation-key value, in first-seen order.
    pub updates: IndexMap<String, Document>,
    /// Number of messages dropped for lacking a correlation-key value.
    pub dropped: usize,
}

impl Curated {
    /// Returns the number of distinct correlation-key values.
    pub fn len(&self) -> usize {
        self.updates.len()
    }

    /// Returns `true` if nothing survived curation.
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

/// Merges a batch of task messages keyed by `correlation_key`.
///
/// # Examples
///
/// ```
/// use flowtrace::curator::merge;
/// use flowtrace::TaskMessage;
/// use serde_json::json;
///
/// let batch = vec![
///     TaskMessage::new("t1").with_generated("accuracy", json!(0.9)),
///     TaskMessage::new("t1").with_generated("loss", json!(0.1)),
/// ];
/// let curated = merge(&batch, "task_id");
/// let generated = &curated.updates["t1"]["generated"];
/// assert_eq!(generated["accuracy"], 0.9);
/// assert_eq!(generated["loss"], 0.1);
/// ```
pub fn merge(batch: &[TaskMessage], correlation_key: &str) -> Curated {
    merge_documents(batch.iter().map(TaskMessage::to_fields), correlation_key)
}

/// Merges raw field sets keyed by `correlation_key`.
pub fn merge_documents<I>(batch: I, correlation_key: &str) -> Curated
where
    I: IntoIterator<Item = Document>,
{
    let mut curated = Curated::default();
    for fields in batch {
        let Some(key) = correlation_value(&fields, correlation_key) else {
            warn!(
                correlation_key,
                "dropping message without a correlation key value"
            );
            curated.dropped += 1;
            continue;
        };
        match curated.updates.get_mut(&key) {
            Some(existing) => merge_fields(existing, fields),
            None => {
                curated.updates.insert(key, fields);
            },
        }
    }
    curated
}

/// Applies `update` onto `target` using the one-level merge rule.
///
/// # Examples
///
/// ```
/// use flowtrace::curator::merge_fields;
/// use serde_json::{json, Value};
///
/// let mut record = json!({"status": "running", "used": {"x": 1}});
/// let update = json!({"status": "finished", "used": {"y": 2}});
/// let (Value::Object(record_map), Value::Object(update_map)) = (&mut record, update) else {
///     unreachable!()
/// };
/// merge_fields(record_map, update_map);
/// assert_eq!(record, json!({"status": "finished", "used": {"x": 1, "y": 2}}));
/// ```
pub fn merge_fields(target: &mut Document, update: Document) {
    for (field, value) in update {
        match (target.get_mut(&field), value) {
            (Some(Value::Object(existing)), Value::Object(nested)) => {
                for (k, v) in nested {
                    existing.insert(k, v);
                }
            },
            (_, value) => {
                target.insert(field, value);
            },
        }
    }
}

/// Reads the correlation-key value from a field set.
///
/// Strings are used verbatim (empty strings count as absent); numbers use
/// their decimal rendering. Anything else counts as absent.
pub fn correlation_value(fields: &Document, correlation_key: &str) -> Option<String> {
    match fields.get(correlation_key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::TaskStatus;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("test documents must be objects"),
        }
    }

    #[test]
    fn scalars_are_last_write_wins() {
        let batch = vec![
            TaskMessage::new("t").with_status(TaskStatus::Running),
            TaskMessage::new("t").with_status(TaskStatus::Finished),
        ];
        let curated = merge(&batch, "task_id");
        assert_eq!(curated.updates["t"]["status"], json!("finished"));
    }

    #[test]
    fn nested_maps_accumulate() {
        let batch = vec![
            TaskMessage::new("t").with_used("x", json!(1)),
            TaskMessage::new("t").with_generated("y", json!(2)),
        ];
        let curated = merge(&batch, "task_id");
        let record = &curated.updates["t"];
        assert_eq!(record["used"], json!({"x": 1}));
        assert_eq!(record["generated"], json!({"y": 2}));
    }

    #[test]
    fn deeper_levels_are_replaced() {
        let batch = vec![
            doc(json!({"task_id": "t", "used": {"cfg": {"a": 1, "b": 2}}})),
            doc(json!({"task_id": "t", "used": {"cfg": {"c": 3}}})),
        ];
        let curated = merge_documents(batch, "task_id");
        assert_eq!(curated.updates["t"]["used"], json!({"cfg": {"c": 3}}));
    }

    #[test]
    fn object_replaces_scalar_and_vice_versa() {
        let mut target = doc(json!({"a": 1, "b": {"x": 1}}));
        merge_fields(&mut target, doc(json!({"a": {"k": true}, "b": 7})));
        assert_eq!(Value::Object(target), json!({"a": {"k": true}, "b": 7}));
    }

    #[test]
    fn messages_without_key_are_dropped() {
        let batch = vec![
            TaskMessage::default().with_status(TaskStatus::Running),
            TaskMessage::new("").with_status(TaskStatus::Running),
            TaskMessage::new("t1"),
        ];
        let curated = merge(&batch, "task_id");
        assert_eq!(curated.dropped, 2);
        assert_eq!(curated.len(), 1);
    }

    #[test]
    fn keys_keep_first_seen_order() {
        let batch = vec![
            TaskMessage::new("b"),
            TaskMessage::new("a"),
            TaskMessage::new("b"),
            TaskMessage::new("c"),
        ];
        let keys: Vec<_> = merge(&batch, "task_id").updates.into_keys().collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
    }

    #[test]
    fn alternative_correlation_key() {
        let batch = vec![
            doc(json!({"run": 7, "phase": "start"})),
            doc(json!({"run": 7, "phase": "end"})),
        ];
        let curated = merge_documents(batch, "run");
        assert_eq!(curated.updates["7"]["phase"], json!("end"));
    }

    #[test]
    fn merging_twice_is_idempotent() {
        let msg = TaskMessage::new("t")
            .with_used("x", json!(1))
            .with_status(TaskStatus::Running);
        let once = merge(std::slice::from_ref(&msg), "task_id");
        let twice = merge(&[msg.clone(), msg], "task_id");
        assert_eq!(once, twice);
    }

    #[test]
    fn empty_batch_is_empty() {
        let curated = merge(&[], "task_id");
        assert!(curated.is_empty());
        assert_eq!(curated.dropped, 0);
    }
}
