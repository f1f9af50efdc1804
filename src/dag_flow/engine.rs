//! The public entry point: validate, compile, schedule, trace.

use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::coord::tool::ToolRegistry;
use crate::core::config::RunOptions;
use crate::core::context::{deep_clone, SharedContext};
use crate::core::errors::{Result, RunFailure};
use crate::dag_flow::compiler::{CompiledGraph, Compiler};
use crate::dag_flow::node::NodeEnv;
use crate::dag_flow::scheduler::run_graph;
use crate::dag_flow::trace::{Trace, TraceRecorder};
use crate::plan::model::{ExecutionMode, Plan};
use crate::plan::validate::validate_plan;

/// Final context and trace of a successful run
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub context: Value,
    pub trace: Trace,
}

/// Runs plans against a registry of tools.
///
/// The engine holds no per-run state; every [`run`](Self::run) gets its own
/// context copy, graph and trace.
#[derive(Debug, Clone, Default)]
pub struct PlanEngine {
    tools: ToolRegistry,
}

impl PlanEngine {
    pub fn new(tools: ToolRegistry) -> Self {
        Self { tools }
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Validates and compiles `plan` without running it.
    pub fn compile(&self, plan: &Plan, initial_context: &Value) -> Result<CompiledGraph> {
        let doc = serde_json::to_value(plan)?;
        validate_plan(&doc).into_result()?;
        Compiler::new(&self.tools, initial_context).compile(plan)
    }

    /// Executes `plan` and returns the mutated context with its trace.
    ///
    /// `initial_context` is deep-copied first; the caller's value is never
    /// touched. Validation, configuration and compilation problems fail
    /// before any node runs, with no trace. Node failures fail the run once
    /// every reachable node has settled, with the trace attached.
    pub async fn run(
        &self,
        plan: &Plan,
        initial_context: Value,
        options: RunOptions,
    ) -> std::result::Result<RunOutput, RunFailure> {
        options.config.validate()?;
        let context = deep_clone(&initial_context);
        let graph = self.compile(plan, &context)?;
        self.execute_graph(graph, context, plan.execution_mode, options)
            .await
    }

    /// Like [`run`](Self::run), for a raw plan document.
    pub async fn run_document(
        &self,
        plan: &Value,
        initial_context: Value,
        options: RunOptions,
    ) -> std::result::Result<RunOutput, RunFailure> {
        let plan = Plan::from_value(plan.clone())?;
        self.run(&plan, initial_context, options).await
    }

    /// Schedules an already compiled graph.
    pub async fn execute_graph(
        &self,
        mut graph: CompiledGraph,
        context: Value,
        execution_mode: ExecutionMode,
        options: RunOptions,
    ) -> std::result::Result<RunOutput, RunFailure> {
        options.config.validate()?;
        let plan_id = options
            .plan_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        info!(
            plan_id = %plan_id,
            nodes = graph.len(),
            concurrency = options.config.concurrency,
            "Starting plan run"
        );

        let trace = TraceRecorder::new(Trace::new(plan_id.clone(), execution_mode));
        let env = Arc::new(NodeEnv::new(
            SharedContext::new(context),
            self.tools.clone(),
            options.config.clone(),
        ));
        let enable_trace = options.config.enable_trace;
        let outcome = run_graph(&mut graph, env.clone(), trace.clone(), Arc::new(options)).await;

        let context = env.context.snapshot();
        let trace = trace.finish(enable_trace.then(|| context.clone()));
        let stats = trace.statistics.clone().unwrap_or_default();
        match outcome {
            Ok(()) => {
                info!(
                    plan_id = %plan_id,
                    successful = stats.successful,
                    cancelled = stats.cancelled,
                    duration_ms = trace.total_duration_ms.unwrap_or_default(),
                    "Plan run finished"
                );
                Ok(RunOutput { context, trace })
            }
            Err(error) => {
                warn!(
                    plan_id = %plan_id,
                    failed = stats.failed,
                    error = %error,
                    "Plan run failed"
                );
                Err(RunFailure::with_trace(error, trace))
            }
        }
    }
}
