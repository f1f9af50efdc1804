//! Compiled graph nodes and the closed set of work they can perform.

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt, TryStreamExt};
use futures::FutureExt;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::coord::tool::{check_tool_input, Tool, ToolRegistry};
use crate::core::config::EngineConfig;
use crate::core::context::{resolve_reference, substitute, with_binding, SharedContext};
use crate::core::errors::{PlanError, Result};
use crate::core::expr::evaluate_condition;
use crate::dag_flow::compiler::Compiler;
use crate::plan::model::{ConditionalStep, LoopStep, Reducer, ReduceStep, StepPolicy};

/// Everything a node needs at execution time
#[derive(Debug, Clone)]
pub struct NodeEnv {
    pub context: SharedContext,
    pub tools: ToolRegistry,
    pub config: EngineConfig,
}

impl NodeEnv {
    pub fn new(context: SharedContext, tools: ToolRegistry, config: EngineConfig) -> Self {
        Self {
            context,
            tools,
            config,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeMetadata {
    /// Plan step this node was compiled from
    pub step_id: Option<String>,
    pub tool_name: Option<String>,
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    /// Checked against the live context before every attempt
    pub input_schema: Option<Value>,
}

impl NodeMetadata {
    pub fn for_step(step_id: &str, tool_name: Option<&str>, policy: &StepPolicy) -> Self {
        Self {
            step_id: Some(step_id.to_string()),
            tool_name: tool_name.map(str::to_string),
            timeout: policy.timeout_ms.map(Duration::from_millis),
            max_retries: policy.max_retries,
            input_schema: policy.input_schema.clone(),
        }
    }
}

/// How an aggregator assembles the outputs it collects
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregation {
    /// Values read from each path, in order
    List(Vec<String>),
    /// `(key, path)` pairs assembled into an object
    Map(Vec<(String, String)>),
}

pub enum NodeTask {
    /// Substitute `input` (with an optional loop binding), call `tool`,
    /// write the result to `target`.
    ToolCall {
        tool: Arc<dyn Tool>,
        input: Value,
        target: String,
        binding: Option<(String, Value)>,
    },
    Aggregate {
        aggregation: Aggregation,
        target: String,
    },
    /// Loop whose `over` is only known once upstream nodes have run
    DynamicLoop { step: LoopStep, tool: Arc<dyn Tool> },
    Reduce { step: ReduceStep, tool: Arc<dyn Tool> },
    Conditional { step: ConditionalStep },
}

impl NodeTask {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ToolCall { .. } => "tool_call",
            Self::Aggregate { .. } => "aggregate",
            Self::DynamicLoop { .. } => "dynamic_loop",
            Self::Reduce { .. } => "reduce",
            Self::Conditional { .. } => "conditional",
        }
    }
}

impl fmt::Debug for NodeTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// One schedulable unit of a compiled plan
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub id: String,
    pub deps: Vec<String>,
    /// Set once by the scheduler when the node settles
    pub executed: bool,
    pub metadata: NodeMetadata,
    pub task: Arc<NodeTask>,
}

impl GraphNode {
    pub fn new(id: impl Into<String>, deps: Vec<String>, metadata: NodeMetadata, task: NodeTask) -> Self {
        Self {
            id: id.into(),
            deps,
            executed: false,
            metadata,
            task: Arc::new(task),
        }
    }

    /// A plain tool call writing its result under the node id
    pub fn tool_call(id: impl Into<String>, deps: Vec<String>, tool: Arc<dyn Tool>, input: Value) -> Self {
        let id = id.into();
        let metadata = NodeMetadata {
            step_id: Some(id.clone()),
            tool_name: Some(tool.id().to_string()),
            ..Default::default()
        };
        let task = NodeTask::ToolCall {
            tool,
            input,
            target: id.clone(),
            binding: None,
        };
        Self::new(id, deps, metadata, task)
    }

    /// Runs the node's work once and returns its output. The output has
    /// already been written to the context when this resolves.
    pub fn run<'a>(&'a self, env: &'a NodeEnv) -> BoxFuture<'a, Result<Value>> {
        run_task(&self.id, &self.task, env).boxed()
    }
}

async fn call_tool(tool: &Arc<dyn Tool>, template: &Value, scope: &Value) -> Result<Value> {
    call_tool_with(tool, substitute(template, scope), scope).await
}

async fn call_tool_with(tool: &Arc<dyn Tool>, params: Value, scope: &Value) -> Result<Value> {
    check_tool_input(tool.as_ref(), &params)?;
    tool.execute(params, scope)
        .await
        .map_err(|e| PlanError::tool_failed(tool.id(), &e))
}

fn resolve_items(node_id: &str, field: &str, reference: &Value, ctx: &Value) -> Result<Vec<Value>> {
    match resolve_reference(reference, ctx) {
        Some(Value::Array(items)) => Ok(items),
        Some(other) => Err(PlanError::compile(format!(
            "step '{}': '{}' resolved to {} instead of an array",
            node_id,
            field,
            json_kind(&other)
        ))),
        None => Err(PlanError::compile(format!(
            "step '{}': '{}' reference {} did not resolve",
            node_id, field, reference
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn fan_out_width(configured: Option<usize>, config: &EngineConfig) -> usize {
    configured.unwrap_or(config.loop_concurrency).max(1)
}

async fn run_task(node_id: &str, task: &NodeTask, env: &NodeEnv) -> Result<Value> {
    match task {
        NodeTask::ToolCall {
            tool,
            input,
            target,
            binding,
        } => {
            let snapshot = env.context.snapshot();
            let scope = match binding {
                Some((name, value)) => with_binding(&snapshot, name, value.clone()),
                None => snapshot,
            };
            let output = call_tool(tool, input, &scope).await?;
            env.context.set(target, output.clone())?;
            Ok(output)
        }

        NodeTask::Aggregate {
            aggregation,
            target,
        } => {
            let output = match aggregation {
                Aggregation::List(paths) => Value::Array(
                    paths
                        .iter()
                        .map(|p| env.context.get(p).unwrap_or(Value::Null))
                        .collect(),
                ),
                Aggregation::Map(entries) => Value::Object(
                    entries
                        .iter()
                        .map(|(key, path)| (key.clone(), env.context.get(path).unwrap_or(Value::Null)))
                        .collect::<Map<_, _>>(),
                ),
            };
            env.context.set(target, output.clone())?;
            Ok(output)
        }

        NodeTask::DynamicLoop { step, tool } => {
            let snapshot = env.context.snapshot();
            let items = resolve_items(node_id, "over", &step.over, &snapshot)?;
            let width = fan_out_width(step.concurrency, &env.config);
            info!(node_id, items = items.len(), concurrency = width, "Expanding loop at runtime");

            // `buffered` yields in input order whatever the completion order
            let results: Vec<Value> = stream::iter(items)
                .map(|item| {
                    let scope = with_binding(&snapshot, &step.bind, item);
                    let input = &step.step.input;
                    async move { call_tool(tool, input, &scope).await }
                })
                .buffered(width)
                .try_collect()
                .await?;

            let output = Value::Array(results);
            env.context.set(&step.output_key(), output.clone())?;
            Ok(output)
        }

        NodeTask::Reduce { step, tool } => {
            let snapshot = env.context.snapshot();
            let items = resolve_items(node_id, "input", &step.input, &snapshot)?;
            let width = fan_out_width(step.concurrency, &env.config);
            debug!(node_id, items = items.len(), concurrency = width, "Mapping reducer");

            let results: Vec<Value> = stream::iter(items)
                .map(|item| {
                    let snapshot = &snapshot;
                    async move {
                        match &step.reducer {
                            Reducer::Tool(_) => {
                                // element data is passed as-is, never as a template
                                let mut params = Map::new();
                                params.insert("item".to_string(), item);
                                call_tool_with(tool, Value::Object(params), snapshot).await
                            }
                            Reducer::Inline(inline) => {
                                let scope = with_binding(snapshot, &step.bind, item);
                                call_tool(tool, &inline.input, &scope).await
                            }
                        }
                    }
                })
                .buffered(width)
                .try_collect()
                .await?;

            let output = Value::Array(results);
            env.context.set(&step.output, output.clone())?;
            Ok(output)
        }

        NodeTask::Conditional { step } => run_conditional(node_id, step, env).await,
    }
}

/// Evaluates the condition and runs the chosen branch inline, one node at a
/// time in dependency order. Branch nodes get no trace entries or retries of
/// their own.
async fn run_conditional(node_id: &str, step: &ConditionalStep, env: &NodeEnv) -> Result<Value> {
    let snapshot = env.context.snapshot();
    let taken = evaluate_condition(&step.condition, &snapshot)?;
    let (branch, steps) = match (taken, step.otherwise.is_empty()) {
        (true, _) => (Value::from("then"), &step.then),
        (false, false) => (Value::from("otherwise"), &step.otherwise),
        (false, true) => (Value::Null, &step.otherwise),
    };
    info!(node_id, condition = %step.condition, taken, "Condition evaluated");

    let mut outputs = Map::new();
    if !steps.is_empty() {
        let graph = Compiler::new(&env.tools, &snapshot).compile_steps(steps)?;
        for id in graph.topological_order()? {
            if let Some(inner) = graph.node(&id) {
                debug!(node_id, branch_node = %inner.id, "Running branch node");
                inner.run(env).await?;
            }
        }
        for branch_step in steps {
            let key = branch_step.output_key();
            outputs.insert(
                branch_step.id().to_string(),
                env.context.get(&key).unwrap_or(Value::Null),
            );
        }
    }

    let mut result = Map::new();
    result.insert("branch".to_string(), branch);
    result.insert("outputs".to_string(), Value::Object(outputs));
    let output = Value::Object(result);
    env.context
        .set(step.output.as_deref().unwrap_or(&step.id), output.clone())?;
    Ok(output)
}
