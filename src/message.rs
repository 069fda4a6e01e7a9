//! Task message shapes carried on the channel.
//!
//! A [`TaskMessage`] is one partial observation of a task. Producers may
//! report the same task several times (submission, start, completion),
//! each time with a different subset of fields populated; the
//! [`curator`](crate::curator) folds them into one record keyed by the
//! correlation key (`task_id` by default).
//!
//! Top-level keys without a dedicated field are kept in
//! [`TaskMessage::extra`] and persisted alongside the declared ones, so a
//! deployment can correlate on a producer-defined key such as `run_id`.
//! Absent optional fields are omitted when encoding so a later partial
//! message never overwrites an earlier value with `null`.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// A dynamically-shaped field set, as stored and returned by the document store.
pub type Document = Map<String, Value>;

/// Default correlation key used to merge partial task messages.
pub const DEFAULT_CORRELATION_KEY: &str = "task_id";

/// Reserved key of the control payload. No [`TaskMessage`] field uses it.
pub const CONTROL_KEY: &str = "__flowtrace_control__";

/// Lifecycle status reported by a producer.
///
/// Encoded in lowercase; the uppercase enum-name form (`"FINISHED"`) is
/// accepted on decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// The task was handed to an executor but has not started.
    #[serde(alias = "SUBMITTED")]
    Submitted,
    /// The task is executing.
    #[serde(alias = "RUNNING")]
    Running,
    /// The task completed successfully.
    #[serde(alias = "FINISHED")]
    Finished,
    /// The task failed.
    #[serde(alias = "ERROR")]
    Error,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Submitted => write!(f, "submitted"),
            Self::Running => write!(f, "running"),
            Self::Finished => write!(f, "finished"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One partial observation of a task.
///
/// All fields are optional; only `task_id` (or whichever field is configured
/// as the correlation key) is required for the message to ever be persisted.
///
/// # Examples
///
/// ```
/// use flowtrace::{TaskMessage, TaskStatus};
/// use serde_json::json;
///
/// let started = TaskMessage::new("t-1")
///     .with_workflow_id("wf-1")
///     .with_status(TaskStatus::Running)
///     .with_used("epochs", json!(10));
///
/// let fields = started.to_fields();
/// assert_eq!(fields["task_id"], "t-1");
/// assert_eq!(fields["used"]["epochs"], 10);
/// assert!(!fields.contains_key("generated"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    /// Correlation key shared by every observation of the same task.
    ///
    /// Integer ids are accepted on decode and kept in decimal form.
    #[serde(
        default,
        deserialize_with = "deserialize_task_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub task_id: Option<String>,

    /// Workflow the task belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,

    /// Human-readable workflow name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_name: Option<String>,

    /// Campaign grouping several workflows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,

    /// Activity (function, step) the task executes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<String>,

    /// Identifier of the producer adapter that observed the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter_id: Option<String>,

    /// User that launched the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Host the task ran on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Lifecycle status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,

    /// Input bindings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used: Option<Map<String, Value>>,

    /// Output bindings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated: Option<Map<String, Value>>,

    /// Producer-defined metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_metadata: Option<Map<String, Value>>,

    /// Submission time, epoch seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<f64>,

    /// Start time, epoch seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<f64>,

    /// End time, epoch seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<f64>,

    /// Resource telemetry captured when the task started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry_at_start: Option<Map<String, Value>>,

    /// Resource telemetry captured when the task ended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry_at_end: Option<Map<String, Value>>,

    /// Captured standard output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,

    /// Captured standard error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,

    /// Any other top-level fields sent by the producer.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn deserialize_task_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TaskId {
        Text(String),
        Signed(i64),
        Unsigned(u64),
    }

    Ok(Option::<TaskId>::deserialize(deserializer)?.map(|id| match id {
        TaskId::Text(s) => s,
        TaskId::Signed(n) => n.to_string(),
        TaskId::Unsigned(n) => n.to_string(),
    }))
}

impl TaskMessage {
    /// Creates a message carrying only a task id.
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: Some(task_id.into()),
            ..Self::default()
        }
    }

    /// Sets the workflow id.
    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    /// Sets the campaign id.
    pub fn with_campaign_id(mut self, campaign_id: impl Into<String>) -> Self {
        self.campaign_id = Some(campaign_id.into());
        self
    }

    /// Sets the activity id.
    pub fn with_activity_id(mut self, activity_id: impl Into<String>) -> Self {
        self.activity_id = Some(activity_id.into());
        self
    }

    /// Sets the status.
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Adds one input binding.
    pub fn with_used(mut self, key: impl Into<String>, value: Value) -> Self {
        self.used
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    /// Adds one output binding.
    pub fn with_generated(mut self, key: impl Into<String>, value: Value) -> Self {
        self.generated
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    /// Sets a producer-defined top-level field.
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Sets start and end times (epoch seconds).
    pub fn with_times(mut self, started_at: Option<f64>, ended_at: Option<f64>) -> Self {
        self.started_at = started_at;
        self.ended_at = ended_at;
        self
    }

    /// Converts the message into the field set handed to the curator.
    ///
    /// Absent fields are left out entirely.
    pub fn to_fields(&self) -> Document {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            // A struct of options and JSON maps always serializes to an object.
            _ => Document::new(),
        }
    }
}

/// Reserved control payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMessage {
    /// Ask every listener on the channel to flush and stop.
    Stop,
}

/// Anything that can be published on a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// A task observation.
    Task(TaskMessage),
    /// A control payload.
    Control(ControlMessage),
}

impl From<TaskMessage> for Envelope {
    fn from(message: TaskMessage) -> Self {
        Self::Task(message)
    }
}

impl From<ControlMessage> for Envelope {
    fn from(message: ControlMessage) -> Self {
        Self::Control(message)
    }
}

/// A decoded message delivered to a [`MessageHandler`](crate::channel::MessageHandler).
pub type Inbound = Envelope;
