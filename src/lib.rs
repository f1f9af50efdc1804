//! Plan-execute engine: declarative step plans compiled into dependency
//! graphs and run wavefront by wavefront against host-supplied tools.
//!
//! ```no_run
//! use planflow::{FnTool, Plan, PlanEngine, RunOptions, ToolRegistry};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let tools = ToolRegistry::new()
//!     .with_tool(FnTool::new("search", |params, _ctx| async move { Ok(json!([params])) }));
//! let plan = Plan::from_json_str(r#"{
//!     "version": "1",
//!     "steps": [{"id": "s", "tool": "search", "input": {"q": "{{question}}"}}]
//! }"#)?;
//! let out = PlanEngine::new(tools)
//!     .run(&plan, json!({"question": "rust"}), RunOptions::new())
//!     .await?;
//! println!("{}", out.trace.to_json()?);
//! # Ok(())
//! # }
//! ```

// Core infrastructure modules
pub mod core;

// Tools and host callbacks
pub mod coord;

// Plan documents
pub mod plan;

// Graph compilation and execution
pub mod dag_flow;

// Re-exports for convenience
pub use crate::coord::{check_tool_input, FnTool, LoggingObserver, NodeObserver, Tool, ToolRegistry};
pub use crate::core::config::{CancellationSignal, EngineConfig, RunOptions};
pub use crate::core::context::{deep_clone, resolve, set_path, substitute, SharedContext};
pub use crate::core::errors::{PlanError, Result, RunFailure, ValidationIssue};
pub use crate::core::expr::evaluate_condition;
pub use crate::core::logging::init_tracing;
pub use crate::dag_flow::{
    CompiledGraph, Compiler, GraphNode, NodeStatus, PlanEngine, RunOutput, Statistics, Trace,
    TraceEntry,
};
pub use crate::plan::{load_plan_file, validate_plan, ExecutionMode, Plan, Step, ValidationReport};
