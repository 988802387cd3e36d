//! Task descriptor types.
//!
//! Defines the JSON schema for annotator tasks: an instruction for the human
//! operator, an ordered list of declarative setup actions, and an optional
//! evaluator specification for the in-guest verdict round trip. Descriptors
//! are produced by the config/parsing layer and treated as immutable here.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

/// A single declarative step of a task's setup sequence.
///
/// `kind` is an open string, not a closed enum: new kinds appear over time
/// and unrecognized ones are routed to the generic fallback handler rather
/// than rejected at parse time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    /// Action kind (`launch`, `sleep`, `chrome_open_tabs`, ...).
    #[serde(rename = "type")]
    pub kind: String,

    /// Free-form parameters; each handler deserializes the shape it expects.
    #[serde(default)]
    pub parameters: serde_json::Map<String, Value>,
}

impl Action {
    /// Creates an action with no parameters.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            parameters: serde_json::Map::new(),
        }
    }

    /// Adds one parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

/// Evaluator specification for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorSpec {
    /// Evaluation function name. The source schema allows a string or a list
    /// of strings; `func_name` normalizes to the primary name.
    pub func: Value,

    /// Expected-result criteria, passed through to the guest evaluator.
    #[serde(default)]
    pub expected: Value,

    /// Result-extraction configuration, passed through to the guest evaluator.
    #[serde(default)]
    pub result: Value,

    /// Actions run through the task runner immediately before evaluation,
    /// e.g. to normalize browser state.
    #[serde(default)]
    pub postconfig: Vec<Action>,
}

impl EvaluatorSpec {
    /// The primary evaluation function name.
    pub fn func_name(&self) -> &str {
        match &self.func {
            Value::String(s) => s,
            Value::Array(items) => items.first().and_then(Value::as_str).unwrap_or("unknown"),
            _ => "unknown",
        }
    }
}

/// A complete annotator task.
///
/// Owned by the caller (the GUI layer); the orchestrator borrows it for the
/// duration of one run and persists the descriptor as given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: String,

    /// Human-readable instruction shown to the annotator.
    pub instruction: String,

    /// Snapshot name override; the configured default applies when absent.
    #[serde(default)]
    pub snapshot: Option<String>,

    /// Ordered setup actions. Later actions commonly depend on earlier ones.
    #[serde(default)]
    pub config: Vec<Action>,

    /// Optional evaluator; tasks without one cannot produce a verdict.
    #[serde(default)]
    pub evaluator: Option<EvaluatorSpec>,

    /// Source URL or reference, passed through to run artifacts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Applications the task touches, passed through to run artifacts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_apps: Vec<String>,

    /// Whether the task needs a proxied network.
    #[serde(default)]
    pub proxy: bool,
}

impl Task {
    /// Loads a task descriptor from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TaskError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let task: Self = serde_json::from_str(&content)?;
        task.validate()?;
        Ok(task)
    }

    /// Validates the descriptor defensively.
    ///
    /// The parsing layer is trusted for shape, but empty identifiers and
    /// empty action kinds would poison run naming and dispatch, so they are
    /// rejected here regardless.
    pub fn validate(&self) -> Result<(), TaskError> {
        if self.id.is_empty() {
            return Err(TaskError::MissingField("id".to_string()));
        }
        if self.instruction.is_empty() {
            return Err(TaskError::MissingField("instruction".to_string()));
        }
        for (i, action) in self.config.iter().enumerate() {
            if action.kind.is_empty() {
                return Err(TaskError::Validation(format!(
                    "action {i} has an empty kind"
                )));
            }
        }
        if let Some(evaluator) = &self.evaluator {
            for (i, action) in evaluator.postconfig.iter().enumerate() {
                if action.kind.is_empty() {
                    return Err(TaskError::Validation(format!(
                        "postconfig action {i} has an empty kind"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Snapshot to prepare for this task, given the configured default.
    pub fn snapshot_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.snapshot.as_deref().unwrap_or(default)
    }
}

/// Structured pass/fail outcome of evaluating a completed task.
///
/// A verdict is either fully absent or fully well-formed: `passed` has no
/// serde default on purpose, so a payload missing it fails to parse and is
/// reported as an evaluation failure instead of defaulting either way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    /// Whether the task passed.
    pub passed: bool,

    /// Free-form diagnostic details from the guest evaluator.
    pub details: Value,
}

/// Errors that can occur when loading or validating task descriptors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// IO error reading the descriptor file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parse error.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// Missing required field.
    #[error("missing required field: {0}")]
    MissingField(String),

    /// Validation error.
    #[error("validation error: {0}")]
    Validation(String),
}
