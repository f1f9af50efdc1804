//! Plan compiler: turns plan steps into graph nodes.
//!
//! Dependencies are written against step ids. Compound steps do not produce
//! a node under their own id, so every step id is mapped to the node ids that
//! finish it (its "exits") and declared dependencies are resolved through that
//! map once all steps have been compiled. A dependency that resolves to
//! nothing is kept verbatim, which the scheduler reports as a deadlock.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::coord::tool::{Tool, ToolRegistry};
use crate::core::context::resolve_reference;
use crate::core::errors::{PlanError, Result};
use crate::dag_flow::node::{Aggregation, GraphNode, NodeMetadata, NodeTask};
use crate::plan::model::{
    ConditionalStep, FinalStep, LoopStep, ParallelStep, Plan, ReduceStep, Reducer, Step, StepPolicy,
    ToolStep,
};

/// Node id of the synthesized aggregator for a loop or parallel step
pub fn aggregator_id(step_id: &str) -> String {
    format!("{}_agg", step_id)
}

/// Node id of one statically expanded loop iteration
pub fn iteration_id(step_id: &str, index: usize) -> String {
    format!("{}_iter_{}", step_id, index)
}

/// The node set of one run
#[derive(Debug, Clone, Default)]
pub struct CompiledGraph {
    nodes: Vec<GraphNode>,
    index: HashMap<String, usize>,
}

impl CompiledGraph {
    pub fn from_nodes(nodes: Vec<GraphNode>) -> Result<Self> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(PlanError::compile(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
        }
        Ok(Self { nodes, index })
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub(crate) fn nodes_mut(&mut self) -> &mut [GraphNode] {
        &mut self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn node_ids(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node ids ordered so that every node follows its dependencies.
    /// Dependencies on ids outside this graph are ignored.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let indices: Vec<NodeIndex> = (0..self.nodes.len()).map(|i| graph.add_node(i)).collect();
        for (i, node) in self.nodes.iter().enumerate() {
            for dep in &node.deps {
                if let Some(&d) = self.index.get(dep) {
                    graph.add_edge(indices[d], indices[i], ());
                }
            }
        }
        let order = toposort(&graph, None).map_err(|cycle| {
            PlanError::compile(format!(
                "dependency cycle through node '{}'",
                self.nodes[graph[cycle.node_id()]].id
            ))
        })?;
        Ok(order
            .into_iter()
            .map(|ix| self.nodes[graph[ix]].id.clone())
            .collect())
    }
}

struct PendingNode {
    id: String,
    /// Step ids, resolved through the exit map
    declared: Vec<String>,
    /// Node ids, used as-is
    internal: Vec<String>,
    metadata: NodeMetadata,
    task: NodeTask,
}

fn merge_deps(inherited: &[String], declared: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    inherited
        .iter()
        .chain(declared.iter())
        .filter(|d| seen.insert(d.as_str()))
        .cloned()
        .collect()
}

/// Compiles plan steps against a tool registry and a context snapshot.
///
/// The snapshot decides loop expansion: a loop whose `over` already resolves
/// to an array is expanded into one node per element, otherwise it becomes a
/// single node that resolves the array when it runs.
pub struct Compiler<'a> {
    tools: &'a ToolRegistry,
    ctx: &'a Value,
    pending: Vec<PendingNode>,
    exits: HashMap<String, Vec<String>>,
}

impl<'a> Compiler<'a> {
    pub fn new(tools: &'a ToolRegistry, ctx: &'a Value) -> Self {
        Self {
            tools,
            ctx,
            pending: Vec::new(),
            exits: HashMap::new(),
        }
    }

    pub fn compile(self, plan: &Plan) -> Result<CompiledGraph> {
        info!(steps = plan.steps.len(), mode = %plan.execution_mode, "Compiling plan");
        self.compile_steps(&plan.steps)
    }

    pub fn compile_steps(mut self, steps: &[Step]) -> Result<CompiledGraph> {
        for step in steps {
            self.step(step, &[])?;
        }
        self.finish()
    }

    fn finish(self) -> Result<CompiledGraph> {
        let exits = self.exits;
        let nodes = self
            .pending
            .into_iter()
            .map(|p| {
                let mut seen = HashSet::new();
                let deps: Vec<String> = p
                    .declared
                    .iter()
                    .flat_map(|d| match exits.get(d) {
                        Some(targets) => targets.clone(),
                        None => vec![d.clone()],
                    })
                    .chain(p.internal)
                    .filter(|d| seen.insert(d.clone()))
                    .collect();
                debug!(node_id = %p.id, deps = ?deps, "Compiled node");
                GraphNode::new(p.id, deps, p.metadata, p.task)
            })
            .collect();
        CompiledGraph::from_nodes(nodes)
    }

    fn push(&mut self, node: PendingNode) {
        self.pending.push(node);
    }

    fn alias(&mut self, step_id: &str, exits: Vec<String>) {
        if !step_id.is_empty() {
            self.exits.insert(step_id.to_string(), exits);
        }
    }

    /// Compiles one step and returns its exit node ids.
    fn step(&mut self, step: &Step, inherited: &[String]) -> Result<Vec<String>> {
        let declared = merge_deps(inherited, step.depends_on());
        let exits = match step {
            Step::Tool(s) => self.tool_step(s, declared)?,
            Step::Final(s) => self.final_step(s, declared)?,
            Step::Loop(s) => self.loop_step(s, declared)?,
            Step::Parallel(s) => self.parallel_step(s, declared)?,
            Step::Reduce(s) => self.reduce_step(s, declared)?,
            Step::Conditional(s) => self.conditional_step(s, declared)?,
        };
        self.alias(step.id(), exits.clone());
        Ok(exits)
    }

    fn tool_step(&mut self, s: &ToolStep, declared: Vec<String>) -> Result<Vec<String>> {
        let tool = self.tools.require(&s.tool, &s.id)?;
        self.push(PendingNode {
            id: s.id.clone(),
            declared,
            internal: Vec::new(),
            metadata: NodeMetadata::for_step(&s.id, Some(&s.tool), &s.policy),
            task: NodeTask::ToolCall {
                tool,
                input: s.input.clone(),
                target: s.output_key().to_string(),
                binding: None,
            },
        });
        Ok(vec![s.id.clone()])
    }

    fn final_step(&mut self, s: &FinalStep, declared: Vec<String>) -> Result<Vec<String>> {
        let function = s.function();
        let tool = self.tools.require(function, &s.id)?;
        self.push(PendingNode {
            id: s.id.clone(),
            declared,
            internal: Vec::new(),
            metadata: NodeMetadata::for_step(&s.id, Some(function), &s.policy),
            task: NodeTask::ToolCall {
                tool,
                input: s.input.clone(),
                target: s.output.clone().unwrap_or_else(|| s.id.clone()),
                binding: None,
            },
        });
        Ok(vec![s.id.clone()])
    }

    fn loop_step(&mut self, s: &LoopStep, declared: Vec<String>) -> Result<Vec<String>> {
        let tool = self.tools.require(&s.step.tool, &s.id)?;
        let policy = effective_policy(&s.policy, &s.step.policy);
        let target = s.output_key();

        let exits = match resolve_reference(&s.over, self.ctx) {
            Some(Value::Array(items)) => {
                debug!(step_id = %s.id, iterations = items.len(), "Expanding loop statically");
                let mut iterations = Vec::with_capacity(items.len());
                for (i, item) in items.into_iter().enumerate() {
                    let id = iteration_id(&s.id, i);
                    self.push(PendingNode {
                        id: id.clone(),
                        declared: declared.clone(),
                        internal: Vec::new(),
                        metadata: NodeMetadata::for_step(&s.id, Some(&s.step.tool), &policy),
                        task: NodeTask::ToolCall {
                            tool: tool.clone(),
                            input: s.step.input.clone(),
                            target: id.clone(),
                            binding: Some((s.bind.clone(), item)),
                        },
                    });
                    iterations.push(id);
                }
                let agg = aggregator_id(&s.id);
                self.push(PendingNode {
                    id: agg.clone(),
                    declared,
                    internal: iterations.clone(),
                    metadata: NodeMetadata {
                        step_id: Some(s.id.clone()),
                        ..Default::default()
                    },
                    task: NodeTask::Aggregate {
                        aggregation: Aggregation::List(iterations),
                        target,
                    },
                });
                vec![agg]
            }
            _ => {
                debug!(step_id = %s.id, "Loop input not yet available, expanding at runtime");
                self.push(PendingNode {
                    id: s.id.clone(),
                    declared,
                    internal: Vec::new(),
                    metadata: NodeMetadata::for_step(&s.id, Some(&s.step.tool), &policy),
                    task: NodeTask::DynamicLoop {
                        step: s.clone(),
                        tool,
                    },
                });
                vec![s.id.clone()]
            }
        };
        self.alias(&s.step.id, exits.clone());
        Ok(exits)
    }

    fn parallel_step(&mut self, s: &ParallelStep, declared: Vec<String>) -> Result<Vec<String>> {
        let mut child_exits = Vec::new();
        for child in &s.steps {
            child_exits.extend(self.step(child, &declared)?);
        }
        let Some(output) = &s.output else {
            return Ok(child_exits);
        };

        let entries = s
            .steps
            .iter()
            .map(|c| (c.id().to_string(), c.output_key()))
            .collect();
        let agg = aggregator_id(&s.id);
        self.push(PendingNode {
            id: agg.clone(),
            declared,
            internal: child_exits,
            metadata: NodeMetadata {
                step_id: Some(s.id.clone()),
                timeout: s.policy.timeout_ms.map(std::time::Duration::from_millis),
                ..Default::default()
            },
            task: NodeTask::Aggregate {
                aggregation: Aggregation::Map(entries),
                target: output.clone(),
            },
        });
        Ok(vec![agg])
    }

    fn reduce_step(&mut self, s: &ReduceStep, declared: Vec<String>) -> Result<Vec<String>> {
        let tool = self.tools.require(s.reducer.tool_id(), &s.id)?;
        self.push(PendingNode {
            id: s.id.clone(),
            declared,
            internal: Vec::new(),
            metadata: NodeMetadata::for_step(&s.id, Some(s.reducer.tool_id()), &s.policy),
            task: NodeTask::Reduce {
                step: s.clone(),
                tool,
            },
        });
        if let Reducer::Inline(inline) = &s.reducer {
            self.alias(&inline.id, vec![s.id.clone()]);
        }
        Ok(vec![s.id.clone()])
    }

    /// Branches are compiled again when the condition is decided; here they
    /// are only checked for unknown tools, and their external dependencies
    /// are lifted onto the conditional node.
    fn conditional_step(&mut self, s: &ConditionalStep, declared: Vec<String>) -> Result<Vec<String>> {
        let nested: Vec<&Step> = s
            .then
            .iter()
            .chain(s.otherwise.iter())
            .flat_map(collect_nested)
            .collect();

        let mut inner_ids: HashSet<String> = HashSet::new();
        for step in &nested {
            self.check_tools(step)?;
            inner_ids.insert(step.id().to_string());
            if let Step::Loop(l) = step {
                inner_ids.insert(l.step.id.clone());
            }
        }
        let external: Vec<String> = nested
            .iter()
            .flat_map(|step| step.depends_on().iter())
            .filter(|d| !inner_ids.contains(*d))
            .cloned()
            .collect();
        let declared = merge_deps(&declared, &external);

        self.push(PendingNode {
            id: s.id.clone(),
            declared,
            internal: Vec::new(),
            metadata: NodeMetadata::for_step(&s.id, None, &s.policy),
            task: NodeTask::Conditional { step: s.clone() },
        });
        let exits = vec![s.id.clone()];
        for id in inner_ids {
            self.alias(&id, exits.clone());
        }
        Ok(exits)
    }

    fn check_tools(&self, step: &Step) -> Result<()> {
        let lookup = |tool: &str| -> Result<Arc<dyn Tool>> { self.tools.require(tool, step.id()) };
        match step {
            Step::Tool(s) => lookup(&s.tool).map(|_| ()),
            Step::Final(s) => lookup(s.function()).map(|_| ()),
            Step::Loop(s) => lookup(&s.step.tool).map(|_| ()),
            Step::Reduce(s) => lookup(s.reducer.tool_id()).map(|_| ()),
            Step::Parallel(_) | Step::Conditional(_) => Ok(()),
        }
    }
}

fn collect_nested(step: &Step) -> Vec<&Step> {
    let mut out = vec![step];
    for child in step.children() {
        out.extend(collect_nested(child));
    }
    out
}

/// The inner step's own settings win over the enclosing loop's.
fn effective_policy(outer: &StepPolicy, inner: &StepPolicy) -> StepPolicy {
    StepPolicy {
        timeout_ms: inner.timeout_ms.or(outer.timeout_ms),
        max_retries: inner.max_retries.or(outer.max_retries),
        input_schema: inner
            .input_schema
            .clone()
            .or_else(|| outer.input_schema.clone()),
    }
}
