//! Node runner: drives one graph node through its attempts.

use serde_json::Value;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

use crate::core::config::RunOptions;
use crate::core::errors::{PlanError, Result};
use crate::dag_flow::node::{GraphNode, NodeEnv};
use crate::dag_flow::trace::{NodeStatus, TraceEntry, TraceRecorder};

/// Validates the live context against a step's input schema.
pub fn check_context_schema(node_id: &str, schema: &Value, context: &Value) -> Result<()> {
    let validator = jsonschema::validator_for(schema).map_err(|e| {
        PlanError::SchemaRejected(format!("node '{}' has an invalid input schema: {}", node_id, e))
    })?;
    validator.validate(context).map_err(|e| {
        PlanError::SchemaRejected(format!("context rejected for node '{}': {}", node_id, e))
    })
}

async fn attempt(node: &GraphNode, env: &NodeEnv, limit: Duration) -> Result<Value> {
    if let Some(schema) = &node.metadata.input_schema {
        check_context_schema(&node.id, schema, &env.context.snapshot())?;
    }
    match timeout(limit, node.run(env)).await {
        Ok(result) => result,
        Err(_) => Err(PlanError::Timeout {
            node_id: node.id.clone(),
            timeout_ms: limit.as_millis() as u64,
        }),
    }
}

/// Runs `node` with retries, recording its lifecycle in the trace.
///
/// Cancellation is checked at the top of every attempt only: a cancelled
/// node is marked `cancelled` and returns `Ok`. Exhausting all attempts marks
/// the node `failed` and returns [`PlanError::NodeFailed`].
pub async fn run_node(
    node: &GraphNode,
    env: &NodeEnv,
    trace: &TraceRecorder,
    options: &RunOptions,
) -> Result<()> {
    let index = trace.begin(TraceEntry::running(
        node.id.clone(),
        node.metadata.step_id.clone(),
        node.metadata.tool_name.clone(),
    ));
    if let Some(observer) = &options.observer {
        observer.on_node_start(&node.id);
    }

    let max_retries = node.metadata.max_retries.unwrap_or(env.config.max_retries);
    let limit = node
        .metadata
        .timeout
        .unwrap_or_else(|| env.config.default_timeout());
    let mut last_error = None;

    for attempt_no in 0..=max_retries {
        if options.is_cancelled() {
            info!(node_id = %node.id, attempt = attempt_no + 1, "Run cancelled, node not started");
            trace.update(index, |entry| {
                entry.retry_count = attempt_no;
                entry.finish(NodeStatus::Cancelled);
            });
            return Ok(());
        }

        info!(
            node_id = %node.id,
            attempt = attempt_no + 1,
            max_attempts = max_retries + 1,
            "Executing node"
        );
        match attempt(node, env, limit).await {
            Ok(output) => {
                info!(node_id = %node.id, retry_count = attempt_no, "Node succeeded");
                trace.update(index, |entry| {
                    entry.output = Some(output.clone());
                    entry.retry_count = attempt_no;
                    entry.finish(NodeStatus::Success);
                });
                if let Some(observer) = &options.observer {
                    observer.on_node_complete(&node.id, &output);
                }
                return Ok(());
            }
            Err(e) => {
                if attempt_no < max_retries {
                    let delay = env.config.backoff_delay(attempt_no + 1);
                    warn!(
                        node_id = %node.id,
                        attempt = attempt_no + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Node attempt failed, retrying"
                    );
                    sleep(delay).await;
                }
                last_error = Some(e);
            }
        }
    }

    let message = last_error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "no attempt was made".to_string());
    error!(node_id = %node.id, attempts = max_retries + 1, error = %message, "Node failed");
    trace.update(index, |entry| {
        entry.error = Some(message.clone());
        entry.retry_count = max_retries;
        entry.finish(NodeStatus::Failed);
    });
    if let Some(observer) = &options.observer {
        observer.on_node_error(&node.id, &message);
    }
    Err(PlanError::NodeFailed {
        node_id: node.id.clone(),
        message,
    })
}
