use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::dag_flow::trace::Trace;

/// A single structural or dependency problem found in a plan document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Location of the problem, e.g. `steps[2].depends_on[0]`
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Unified error type for plan validation, compilation and execution
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Plan validation failed: {}", join_issues(.0))]
    Validation(Vec<ValidationIssue>),

    #[error("Unknown tool '{tool}' referenced by step '{step_id}'")]
    UnknownTool { tool: String, step_id: String },

    #[error("Compilation error: {0}")]
    Compile(String),

    #[error("Deadlock detected: no ready nodes, unexecuted nodes remain: [{}]", .pending.join(", "))]
    Deadlock { pending: Vec<String> },

    #[error("Node '{node_id}' failed: {message}")]
    NodeFailed { node_id: String, message: String },

    #[error("Node '{node_id}' timed out after {timeout_ms}ms")]
    Timeout { node_id: String, timeout_ms: u64 },

    #[error("Input schema rejected: {0}")]
    SchemaRejected(String),

    #[error("Tool '{tool}' failed: {message}")]
    ToolFailed { tool: String, message: String },

    #[error("Condition error: {0}")]
    Condition(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PlanError {
    pub fn compile(msg: impl Into<String>) -> Self {
        Self::Compile(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn condition(msg: impl Into<String>) -> Self {
        Self::Condition(msg.into())
    }

    pub fn tool_failed(tool: impl Into<String>, error: &anyhow::Error) -> Self {
        Self::ToolFailed {
            tool: tool.into(),
            message: format!("{:#}", error),
        }
    }

    /// Errors raised before any node ran; the run never began.
    pub fn is_pre_execution(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::UnknownTool { .. } | Self::Compile(_) | Self::Configuration(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PlanError>;

/// Error returned by a run, carrying whatever trace was collected before the failure.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RunFailure {
    #[source]
    pub error: PlanError,
    /// `None` when the run failed before execution started
    pub trace: Option<Trace>,
}

impl RunFailure {
    pub fn before_start(error: PlanError) -> Self {
        Self { error, trace: None }
    }

    pub fn with_trace(error: PlanError, trace: Trace) -> Self {
        Self {
            error,
            trace: Some(trace),
        }
    }
}

impl From<PlanError> for RunFailure {
    fn from(error: PlanError) -> Self {
        Self::before_start(error)
    }
}
