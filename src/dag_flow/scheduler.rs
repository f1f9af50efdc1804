//! Wavefront scheduler.
//!
//! Each round collects every unexecuted node whose dependencies have all
//! executed, runs that batch on a pool bounded by `concurrency`, and waits
//! for the whole batch to drain before looking for the next one. A failed
//! node still counts as executed, so its dependents run (and most likely
//! fail on missing inputs). The first failure is reported once every
//! reachable node has settled.

use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::core::config::RunOptions;
use crate::core::errors::{PlanError, Result};
use crate::dag_flow::compiler::CompiledGraph;
use crate::dag_flow::node::NodeEnv;
use crate::dag_flow::runner::run_node;
use crate::dag_flow::trace::TraceRecorder;

/// Indices of unexecuted nodes whose dependencies have all executed
fn ready_set(graph: &CompiledGraph) -> (Vec<usize>, Vec<String>) {
    let executed: HashSet<&str> = graph
        .nodes()
        .iter()
        .filter(|n| n.executed)
        .map(|n| n.id.as_str())
        .collect();

    let mut ready = Vec::new();
    let mut pending = Vec::new();
    for (i, node) in graph.nodes().iter().enumerate() {
        if node.executed {
            continue;
        }
        pending.push(node.id.clone());
        if node.deps.iter().all(|d| executed.contains(d.as_str())) {
            ready.push(i);
        }
    }
    (ready, pending)
}

pub async fn run_graph(
    graph: &mut CompiledGraph,
    env: Arc<NodeEnv>,
    trace: TraceRecorder,
    options: Arc<RunOptions>,
) -> Result<()> {
    let concurrency = options.config.concurrency.max(1);
    let mut first_failure: Option<PlanError> = None;
    let mut wave = 0usize;

    loop {
        let (ready, pending) = ready_set(graph);
        if pending.is_empty() {
            break;
        }
        if ready.is_empty() {
            error!(pending = ?pending, "No ready nodes, aborting run");
            return Err(PlanError::Deadlock { pending });
        }

        wave += 1;
        debug!(wave, ready = ready.len(), pending = pending.len(), "Launching wavefront");

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut in_flight = FuturesUnordered::new();
        for i in ready {
            let node = graph.nodes()[i].clone();
            let env = env.clone();
            let trace = trace.clone();
            let options = options.clone();
            let semaphore = semaphore.clone();
            let handle = tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| PlanError::Internal(format!("worker pool closed: {}", e)))?;
                run_node(&node, &env, &trace, &options).await
            });
            in_flight.push(async move { (i, handle.await) });
        }

        while let Some((i, joined)) = in_flight.next().await {
            let node = &mut graph.nodes_mut()[i];
            node.executed = true;
            let outcome = joined.unwrap_or_else(|e| {
                let message = format!("node task aborted: {}", e);
                trace.fail_unsettled(&node.id, &message);
                Err(PlanError::NodeFailed {
                    node_id: node.id.clone(),
                    message,
                })
            });
            if let Err(e) = outcome {
                if first_failure.is_none() {
                    first_failure = Some(e);
                }
            }
        }
    }

    info!(waves = wave, "All nodes executed");
    match first_failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::tool::{FnTool, Tool, ToolRegistry};
    use crate::core::config::EngineConfig;
    use crate::core::context::SharedContext;
    use crate::dag_flow::node::GraphNode;
    use crate::dag_flow::trace::{NodeStatus, Trace};
    use crate::plan::model::ExecutionMode;
    use serde_json::{json, Value};

    fn echo() -> Arc<dyn Tool> {
        Arc::new(FnTool::new("echo", |p: Value, _c| async move { Ok(p) }))
    }

    fn harness(config: EngineConfig) -> (Arc<NodeEnv>, TraceRecorder, Arc<RunOptions>) {
        (
            Arc::new(NodeEnv::new(
                SharedContext::new(json!({})),
                ToolRegistry::new(),
                config.clone(),
            )),
            TraceRecorder::new(Trace::new("t", ExecutionMode::Dag)),
            Arc::new(RunOptions::new().with_config(config)),
        )
    }

    #[tokio::test]
    async fn dangling_dependency_deadlocks() {
        let mut graph = CompiledGraph::from_nodes(vec![
            GraphNode::tool_call("a", vec![], echo(), json!(1)),
            GraphNode::tool_call("b", vec!["missing".into()], echo(), json!(2)),
        ])
        .unwrap();
        let (env, trace, options) = harness(EngineConfig::default());
        let err = run_graph(&mut graph, env, trace.clone(), options)
            .await
            .unwrap_err();
        match err {
            PlanError::Deadlock { pending } => assert_eq!(pending, vec!["b".to_string()]),
            other => panic!("expected deadlock, got {other}"),
        }
        assert_eq!(trace.snapshot().entries.len(), 1);
    }

    #[tokio::test]
    async fn failure_does_not_block_dependents() {
        let failing: Arc<dyn Tool> = Arc::new(FnTool::new("fail", |_p, _c| async move {
            Err::<Value, _>(anyhow::anyhow!("nope"))
        }));
        let mut graph = CompiledGraph::from_nodes(vec![
            GraphNode::tool_call("a", vec![], failing, json!({})),
            GraphNode::tool_call("b", vec!["a".into()], echo(), json!("independent")),
        ])
        .unwrap();
        let config = EngineConfig {
            max_retries: 0,
            ..Default::default()
        };
        let (env, trace, options) = harness(config);
        let err = run_graph(&mut graph, env.clone(), trace.clone(), options)
            .await
            .unwrap_err();
        assert!(matches!(err, PlanError::NodeFailed { ref node_id, .. } if node_id == "a"));
        assert!(graph.nodes().iter().all(|n| n.executed));

        let trace = trace.snapshot();
        assert_eq!(trace.entry("a").map(|e| e.status), Some(NodeStatus::Failed));
        assert_eq!(trace.entry("b").map(|e| e.status), Some(NodeStatus::Success));
        assert_eq!(env.context.get("b"), Some(json!("independent")));
    }
}
