pub mod compiler;
pub mod engine;
pub mod node;
pub mod runner;
pub mod scheduler;
pub mod trace;

pub use compiler::{aggregator_id, iteration_id, CompiledGraph, Compiler};
pub use engine::{PlanEngine, RunOutput};
pub use node::{Aggregation, GraphNode, NodeEnv, NodeMetadata, NodeTask};
pub use trace::{NodeStatus, Statistics, Trace, TraceEntry, TraceRecorder};
