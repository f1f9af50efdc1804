//! Node lifecycle callbacks for hosts that render progress incrementally.

use serde_json::Value;

/// Receives node lifecycle notifications during a run.
///
/// Callbacks run on the worker task executing the node, so they should be cheap.
pub trait NodeObserver: Send + Sync {
    fn on_node_start(&self, _node_id: &str) {}

    fn on_node_complete(&self, _node_id: &str, _result: &Value) {}

    fn on_node_error(&self, _node_id: &str, _error: &str) {}
}

/// Observer that forwards every callback to `tracing`
pub struct LoggingObserver;

impl NodeObserver for LoggingObserver {
    fn on_node_start(&self, node_id: &str) {
        tracing::debug!(node_id, "Node started");
    }

    fn on_node_complete(&self, node_id: &str, result: &Value) {
        tracing::debug!(node_id, result = %result, "Node completed");
    }

    fn on_node_error(&self, node_id: &str, error: &str) {
        tracing::debug!(node_id, error, "Node failed");
    }
}
