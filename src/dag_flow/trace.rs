//! Execution trace: one entry per graph node, appended at start and updated
//! in place when the node settles.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::core::errors::Result;
use crate::plan::model::ExecutionMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Success,
    Failed,
    /// Reserved; the scheduler never skips a node
    Skipped,
    Cancelled,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEntry {
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub status: NodeStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl TraceEntry {
    pub fn running(node_id: impl Into<String>, step_id: Option<String>, tool_name: Option<String>) -> Self {
        Self {
            node_id: node_id.into(),
            step_id,
            status: NodeStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            error: None,
            output: None,
            retry_count: 0,
            tool_name,
        }
    }

    /// Settles the entry with a terminal status and stamps the end time.
    pub fn finish(&mut self, status: NodeStatus) {
        let end = Utc::now();
        self.status = status;
        self.duration_ms = Some((end - self.start_time).num_milliseconds().max(0) as u64);
        self.end_time = Some(end);
    }
}

/// Run summary counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
}

impl Statistics {
    pub fn from_entries(entries: &[TraceEntry]) -> Self {
        let mut stats = Self {
            total: entries.len(),
            ..Default::default()
        };
        for entry in entries {
            match entry.status {
                NodeStatus::Success => stats.successful += 1,
                NodeStatus::Failed => stats.failed += 1,
                NodeStatus::Skipped => stats.skipped += 1,
                NodeStatus::Cancelled => stats.cancelled += 1,
                NodeStatus::Pending | NodeStatus::Running => {}
            }
        }
        stats
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    pub plan_id: String,
    pub execution_mode: ExecutionMode,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_duration_ms: Option<u64>,
    pub entries: Vec<TraceEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<Statistics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_snapshot: Option<Value>,
}

impl Trace {
    pub fn new(plan_id: impl Into<String>, execution_mode: ExecutionMode) -> Self {
        Self {
            plan_id: plan_id.into(),
            execution_mode,
            started_at: Utc::now(),
            finished_at: None,
            total_duration_ms: None,
            entries: Vec::new(),
            statistics: None,
            context_snapshot: None,
        }
    }

    pub fn entry(&self, node_id: &str) -> Option<&TraceEntry> {
        self.entries.iter().find(|e| e.node_id == node_id)
    }

    pub fn entries_with_status(&self, status: NodeStatus) -> impl Iterator<Item = &TraceEntry> {
        self.entries.iter().filter(move |e| e.status == status)
    }

    /// Stamps the finish time and computes statistics.
    pub fn finish(&mut self, context_snapshot: Option<Value>) {
        let end = Utc::now();
        self.total_duration_ms = Some((end - self.started_at).num_milliseconds().max(0) as u64);
        self.finished_at = Some(end);
        self.statistics = Some(Statistics::from_entries(&self.entries));
        self.context_snapshot = context_snapshot;
    }

    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Shared handle the runner tasks record into
#[derive(Debug, Clone)]
pub struct TraceRecorder {
    inner: Arc<Mutex<Trace>>,
}

impl TraceRecorder {
    pub fn new(trace: Trace) -> Self {
        Self {
            inner: Arc::new(Mutex::new(trace)),
        }
    }

    /// Appends a `running` entry and returns its index.
    pub fn begin(&self, entry: TraceEntry) -> usize {
        let mut trace = self.inner.lock();
        trace.entries.push(entry);
        trace.entries.len() - 1
    }

    pub fn update<F>(&self, index: usize, f: F)
    where
        F: FnOnce(&mut TraceEntry),
    {
        if let Some(entry) = self.inner.lock().entries.get_mut(index) {
            f(entry);
        }
    }

    /// Fails the entry for `node_id` if it never settled.
    pub fn fail_unsettled(&self, node_id: &str, message: &str) {
        let mut trace = self.inner.lock();
        if let Some(entry) = trace
            .entries
            .iter_mut()
            .find(|e| e.node_id == node_id && !e.status.is_terminal())
        {
            entry.error = Some(message.to_string());
            entry.finish(NodeStatus::Failed);
        }
    }

    pub fn snapshot(&self) -> Trace {
        self.inner.lock().clone()
    }

    pub fn finish(&self, context_snapshot: Option<Value>) -> Trace {
        let mut trace = self.snapshot();
        trace.finish(context_snapshot);
        trace
    }
}
