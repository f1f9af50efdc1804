//! End-to-end properties of plan execution: ordering, bounds, retries and
//! failure surfacing.

use parking_lot::Mutex;
use planflow::{
    CompiledGraph, ExecutionMode, FnTool, GraphNode, NodeObserver, NodeStatus, Plan, PlanEngine,
    PlanError, RunOptions, ToolRegistry,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn sleeper(id: &str, ms: u64) -> FnTool {
    FnTool::new(id, move |params: Value, _ctx| async move {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(params)
    })
}

#[derive(Default)]
struct RecordingObserver {
    events: Mutex<Vec<String>>,
}

impl NodeObserver for RecordingObserver {
    fn on_node_start(&self, node_id: &str) {
        self.events.lock().push(format!("start:{}", node_id));
    }

    fn on_node_complete(&self, node_id: &str, _result: &Value) {
        self.events.lock().push(format!("complete:{}", node_id));
    }

    fn on_node_error(&self, node_id: &str, _error: &str) {
        self.events.lock().push(format!("error:{}", node_id));
    }
}

/// Every node starts no earlier than the end of each of its dependencies
#[tokio::test]
async fn test_topological_safety() {
    let tools = ToolRegistry::new()
        .with_tool(sleeper("work", 15))
        .with_tool(sleeper("final_answer", 1));
    let engine = PlanEngine::new(tools);
    let plan = Plan::from_value(json!({
        "version": "1",
        "execution_mode": "dag",
        "steps": [
            {"id": "a", "tool": "work"},
            {"id": "b", "tool": "work", "depends_on": ["a"]},
            {"id": "c", "tool": "work", "depends_on": ["a"]},
            {"id": "l", "type": "loop", "over": "items", "as": "i",
             "step": {"tool": "work", "input": {"i": "{{i}}"}}, "depends_on": ["b"]},
            {"id": "d", "type": "final", "depends_on": ["c", "l"]}
        ]
    }))
    .unwrap();
    let ctx = json!({"items": [1, 2, 3]});

    let graph = engine.compile(&plan, &ctx).unwrap();
    let out = engine.run(&plan, ctx, RunOptions::new()).await.unwrap();

    assert_eq!(out.trace.entries.len(), graph.len());
    for node in graph.nodes() {
        let entry = out.trace.entry(&node.id).expect("every node has a trace entry");
        assert_eq!(entry.status, NodeStatus::Success);
        for dep in &node.deps {
            let dep_end = out.trace.entry(dep).and_then(|e| e.end_time).unwrap();
            assert!(
                entry.start_time >= dep_end,
                "{} started before its dependency {} ended",
                node.id,
                dep
            );
        }
    }
}

/// A <-> B cycle is rejected before anything runs
#[tokio::test]
async fn test_cycle_rejection() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let tools = ToolRegistry::new().with_tool(FnTool::new("t", move |_p, _c| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Ok(json!(null)) }
    }));
    let doc = json!({
        "version": "1",
        "steps": [
            {"id": "A", "tool": "t", "depends_on": ["B"]},
            {"id": "B", "tool": "t", "depends_on": ["A"]}
        ]
    });

    let failure = PlanEngine::new(tools)
        .run_document(&doc, json!({}), RunOptions::new())
        .await
        .unwrap_err();
    match &failure.error {
        PlanError::Validation(issues) => {
            assert!(issues.iter().any(|i| i.message.contains("circular dependency")))
        }
        other => panic!("expected validation failure, got {other}"),
    }
    assert!(failure.trace.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

/// A cycle that runs through a parallel step's children is rejected up
/// front instead of deadlocking the scheduler
#[tokio::test]
async fn test_cycle_through_parallel_child_rejection() {
    let tools = ToolRegistry::new().with_tool(sleeper("t", 1));
    let doc = json!({
        "version": "1",
        "steps": [
            {"id": "x", "tool": "t", "depends_on": ["p"]},
            {"id": "p", "type": "parallel", "steps": [
                {"id": "p1", "tool": "t", "depends_on": ["x"]}
            ]}
        ]
    });

    let failure = PlanEngine::new(tools)
        .run_document(&doc, json!({}), RunOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(failure.error, PlanError::Validation(_)));
    assert!(failure.trace.is_none());
}

/// Never more than `concurrency` tool calls in flight
#[tokio::test]
async fn test_concurrency_bound() {
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (cur, pk) = (current.clone(), peak.clone());
    let tools = ToolRegistry::new().with_tool(FnTool::new("gauge", move |_p, _c| {
        let (cur, pk) = (cur.clone(), pk.clone());
        async move {
            let now = cur.fetch_add(1, Ordering::SeqCst) + 1;
            pk.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            cur.fetch_sub(1, Ordering::SeqCst);
            Ok(json!(now))
        }
    }));
    let steps: Vec<Value> = (0..8)
        .map(|i| json!({"id": format!("s{}", i), "tool": "gauge"}))
        .collect();
    let plan = Plan::from_value(json!({"version": "1", "steps": steps})).unwrap();

    let out = PlanEngine::new(tools)
        .run(&plan, json!({}), RunOptions::new().with_concurrency(3))
        .await
        .unwrap();

    assert_eq!(out.trace.statistics.map(|s| s.successful), Some(8));
    let peak = peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency was {}", peak);
    assert!(peak >= 2, "independent steps should overlap, peak was {}", peak);
}

/// Fails twice, succeeds on the third attempt after 100ms + 200ms of backoff
#[tokio::test]
async fn test_retry_with_backoff() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let tools = ToolRegistry::new().with_tool(FnTool::new("flaky", move |_p, _c| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                anyhow::bail!("upstream unavailable");
            }
            Ok(json!("recovered"))
        }
    }));
    let plan = Plan::from_value(json!({
        "version": "1",
        "steps": [{"id": "f", "tool": "flaky"}]
    }))
    .unwrap();

    let started = Instant::now();
    let out = PlanEngine::new(tools)
        .run(&plan, json!({}), RunOptions::new().with_max_retries(2))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    let entry = out.trace.entry("f").unwrap();
    assert_eq!(entry.status, NodeStatus::Success);
    assert_eq!(entry.retry_count, 2);
    assert!(elapsed >= Duration::from_millis(300), "elapsed {:?}", elapsed);
    assert_eq!(out.context["f"], json!("recovered"));
}

/// Static loop results keep input order even when items finish out of order
#[tokio::test]
async fn test_loop_order_preservation() {
    let tools = ToolRegistry::new().with_tool(FnTool::new("double", |params: Value, _ctx| async move {
        let n = params["n"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(n * 20)).await;
        Ok(json!(n * 2))
    }));
    let plan = Plan::from_value(json!({
        "version": "1",
        "steps": [{
            "id": "dbl", "type": "loop", "over": "items", "as": "x",
            "step": {"tool": "double", "input": {"n": "{{x}}"}},
            "output": "doubled"
        }]
    }))
    .unwrap();

    let out = PlanEngine::new(tools)
        .run(&plan, json!({"items": [3, 1, 2]}), RunOptions::new().with_concurrency(3))
        .await
        .unwrap();

    assert_eq!(out.context["doubled"], json!([6, 2, 4]));
    assert_eq!(out.context["dbl_iter_0"], json!(6));
    let ids: Vec<&str> = out.trace.entries.iter().map(|e| e.node_id.as_str()).collect();
    assert!(ids.contains(&"dbl_agg"));
    assert_eq!(ids.last(), Some(&"dbl_agg"));
}

/// Without `output`, a static loop collects into `{stepId}_agg`, and a
/// parallel aggregate reads the loop result from there
#[tokio::test]
async fn test_static_loop_without_output_uses_aggregator_key() {
    let tools = ToolRegistry::new().with_tool(FnTool::new("double", |params: Value, _ctx| async move {
        Ok(json!(params["n"].as_u64().unwrap_or(0) * 2))
    }));
    let plan = Plan::from_value(json!({
        "version": "1",
        "steps": [{
            "id": "p", "type": "parallel", "output": "all", "steps": [{
                "id": "l", "type": "loop", "over": "items", "as": "x",
                "step": {"tool": "double", "input": {"n": "{{x}}"}}
            }]
        }]
    }))
    .unwrap();

    let out = PlanEngine::new(tools)
        .run(&plan, json!({"items": [3, 1, 2]}), RunOptions::new())
        .await
        .unwrap();

    assert_eq!(out.context["l_agg"], json!([6, 2, 4]));
    assert!(out.context.get("l").is_none());
    assert_eq!(out.context["all"], json!({"l": [6, 2, 4]}));
}

/// A dangling dependency surfaces as a deadlock naming the stuck node
#[tokio::test]
async fn test_deadlock_detection() {
    let tool = Arc::new(sleeper("noop", 1));
    let graph = CompiledGraph::from_nodes(vec![
        GraphNode::tool_call("ok", vec![], tool.clone(), json!({})),
        GraphNode::tool_call("stuck", vec!["ghost".into()], tool, json!({})),
    ])
    .unwrap();

    let engine = PlanEngine::default();
    let run = engine.execute_graph(graph, json!({}), ExecutionMode::Dag, RunOptions::new());
    let failure = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run must not hang")
        .unwrap_err();

    match &failure.error {
        PlanError::Deadlock { pending } => assert_eq!(pending, &vec!["stuck".to_string()]),
        other => panic!("expected deadlock, got {other}"),
    }
    assert!(failure.error.to_string().contains("stuck"));
    let trace = failure.trace.expect("deadlock happens mid-run");
    assert_eq!(trace.entry("ok").map(|e| e.status), Some(NodeStatus::Success));
    assert!(trace.entry("stuck").is_none());
}

/// fetchA and fetchB share a wavefront; final waits for both
#[tokio::test]
async fn test_end_to_end_fan_in() {
    let tools = ToolRegistry::new()
        .with_tool(FnTool::new("fetch", |params: Value, _ctx| async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            Ok(json!({"output": params["source"].clone()}))
        }))
        .with_tool(FnTool::new("combine", |params: Value, _ctx| async move {
            Ok(json!(format!(
                "{}+{}",
                params["a"].as_str().unwrap_or_default(),
                params["b"].as_str().unwrap_or_default()
            )))
        }));
    let plan = Plan::from_value(json!({
        "version": "1",
        "steps": [
            {"id": "fetchA", "tool": "fetch", "input": {"source": "alpha"}},
            {"id": "fetchB", "tool": "fetch", "input": {"source": "beta"}},
            {"id": "final", "type": "final", "function": "combine",
             "input": {"a": "{{fetchA.output}}", "b": "{{fetchB.output}}"},
             "depends_on": ["fetchA", "fetchB"]}
        ]
    }))
    .unwrap();
    let observer = Arc::new(RecordingObserver::default());

    let out = PlanEngine::new(tools)
        .run(&plan, json!({}), RunOptions::new().with_observer(observer.clone()))
        .await
        .unwrap();

    assert_eq!(out.context["final"], json!("alpha+beta"));

    let events = observer.events.lock().clone();
    let first_complete = events.iter().position(|e| e.starts_with("complete:")).unwrap();
    let started_early: Vec<&String> = events[..first_complete].iter().collect();
    assert!(started_early.contains(&&"start:fetchA".to_string()));
    assert!(started_early.contains(&&"start:fetchB".to_string()));

    let a = out.trace.entry("fetchA").unwrap();
    let b = out.trace.entry("fetchB").unwrap();
    let fin = out.trace.entry("final").unwrap();
    assert!(a.start_time < b.end_time.unwrap() && b.start_time < a.end_time.unwrap());
    assert!(fin.start_time >= a.end_time.unwrap());
    assert!(fin.start_time >= b.end_time.unwrap());
    assert_eq!(fin.tool_name.as_deref(), Some("combine"));
}

/// A node that exhausts its retries fails the run, but unrelated work still completes
#[tokio::test]
async fn test_node_failure_surfaces_with_trace() {
    let tools = ToolRegistry::new()
        .with_tool(FnTool::new("boom", |_p, _c| async move {
            Err::<Value, _>(anyhow::anyhow!("tool exploded"))
        }))
        .with_tool(sleeper("ok", 1));
    let plan = Plan::from_value(json!({
        "version": "1",
        "steps": [
            {"id": "bad", "tool": "boom", "max_retries": 0},
            {"id": "good", "tool": "ok", "input": {"v": 1}}
        ]
    }))
    .unwrap();
    let observer = Arc::new(RecordingObserver::default());

    let failure = PlanEngine::new(tools)
        .run(&plan, json!({}), RunOptions::new().with_observer(observer.clone()))
        .await
        .unwrap_err();

    assert!(matches!(failure.error, PlanError::NodeFailed { ref node_id, .. } if node_id == "bad"));
    let trace = failure.trace.unwrap();
    let bad = trace.entry("bad").unwrap();
    assert_eq!(bad.status, NodeStatus::Failed);
    assert!(bad.error.as_deref().unwrap_or_default().contains("tool exploded"));
    assert_eq!(trace.entry("good").map(|e| e.status), Some(NodeStatus::Success));
    let stats = trace.statistics.unwrap();
    assert_eq!((stats.total, stats.successful, stats.failed), (2, 1, 1));
    assert!(observer.events.lock().contains(&"error:bad".to_string()));
}

/// Unknown tools are rejected before execution starts
#[tokio::test]
async fn test_unknown_tool_fails_before_start() {
    let plan = Plan::from_value(json!({
        "version": "1",
        "steps": [{"id": "x", "tool": "missing"}]
    }))
    .unwrap();
    let failure = PlanEngine::default()
        .run(&plan, json!({}), RunOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(failure.error, PlanError::UnknownTool { .. }));
    assert!(failure.error.is_pre_execution());
    assert!(failure.trace.is_none());
}
