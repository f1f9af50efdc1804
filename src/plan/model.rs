//! Plan documents: the declarative step grammar the engine is handed.
//!
//! Tool steps are recognised by their `tool` field; every other step kind
//! carries a `type` tag (`loop`, `parallel`, `reduce`, `conditional`,
//! `final`). Internally this is one closed enum, so adding a step kind forces
//! every match over [`Step`] to handle it.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

/// Tool invoked by a final step that does not name one
pub const DEFAULT_FINAL_FUNCTION: &str = "final_answer";

/// Advisory only: the engine always builds a dependency graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Sequential,
    #[default]
    Dag,
    Graph,
}

impl ExecutionMode {
    pub const ALLOWED: [&'static str; 3] = ["sequential", "dag", "graph"];
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sequential => "sequential",
            Self::Dag => "dag",
            Self::Graph => "graph",
        };
        f.write_str(s)
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number for version, got {}",
            other
        ))),
    }
}

/// Root plan document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(deserialize_with = "string_or_number")]
    pub version: String,
    #[serde(default, alias = "executionMode")]
    pub execution_mode: ExecutionMode,
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn new(version: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            version: version.into(),
            execution_mode: ExecutionMode::Dag,
            steps,
        }
    }

    /// Every step in the plan, depth-first, including steps nested in
    /// parallel and conditional bodies.
    pub fn all_steps(&self) -> Vec<&Step> {
        let mut out = Vec::new();
        for step in &self.steps {
            collect_steps(step, &mut out);
        }
        out
    }
}

fn collect_steps<'a>(step: &'a Step, out: &mut Vec<&'a Step>) {
    out.push(step);
    for child in step.children() {
        collect_steps(child, out);
    }
}

/// Step-level overrides of the run configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// JSON Schema the live context must satisfy before each attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolStep {
    /// May be empty for loop bodies and inline reducers
    #[serde(default)]
    pub id: String,
    pub tool: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(flatten)]
    pub policy: StepPolicy,
}

impl ToolStep {
    pub fn new(id: impl Into<String>, tool: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            tool: tool.into(),
            input,
            output: None,
            depends_on: Vec::new(),
            policy: StepPolicy::default(),
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn output_key(&self) -> &str {
        self.output.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopStep {
    pub id: String,
    /// Context path (or `{{path}}` template, or literal array) of the items
    pub over: Value,
    #[serde(rename = "as")]
    pub bind: String,
    pub step: Box<ToolStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(flatten)]
    pub policy: StepPolicy,
}

impl LoopStep {
    /// `output`, or `{id}_agg` when unset
    pub fn output_key(&self) -> String {
        match &self.output {
            Some(output) => output.clone(),
            None => format!("{}_agg", self.id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelStep {
    pub id: String,
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(flatten)]
    pub policy: StepPolicy,
}

/// Either a bare tool id (called with `{"item": element}`) or an inline tool step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reducer {
    Tool(String),
    Inline(Box<ToolStep>),
}

impl Reducer {
    pub fn tool_id(&self) -> &str {
        match self {
            Self::Tool(id) => id,
            Self::Inline(step) => &step.tool,
        }
    }
}

/// Element-wise map over an array: one result per input element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceStep {
    pub id: String,
    pub input: Value,
    #[serde(rename = "as")]
    pub bind: String,
    pub reducer: Reducer,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(flatten)]
    pub policy: StepPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalStep {
    pub id: String,
    pub condition: String,
    pub then: Vec<Step>,
    #[serde(default, alias = "else", skip_serializing_if = "Vec::is_empty")]
    pub otherwise: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(flatten)]
    pub policy: StepPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalStep {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(flatten)]
    pub policy: StepPolicy,
}

impl FinalStep {
    pub fn function(&self) -> &str {
        self.function.as_deref().unwrap_or(DEFAULT_FINAL_FUNCTION)
    }
}

/// One declarative unit of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StepRepr", into = "StepRepr")]
pub enum Step {
    Tool(ToolStep),
    Loop(LoopStep),
    Parallel(ParallelStep),
    Reduce(ReduceStep),
    Conditional(ConditionalStep),
    Final(FinalStep),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum StepRepr {
    Typed(TypedStep),
    Tool(ToolStep),
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum TypedStep {
    Tool(ToolStep),
    Loop(LoopStep),
    Parallel(ParallelStep),
    Reduce(ReduceStep),
    Conditional(ConditionalStep),
    Final(FinalStep),
}

impl From<StepRepr> for Step {
    fn from(repr: StepRepr) -> Self {
        match repr {
            StepRepr::Tool(step) => Step::Tool(step),
            StepRepr::Typed(typed) => match typed {
                TypedStep::Tool(step) => Step::Tool(step),
                TypedStep::Loop(step) => Step::Loop(step),
                TypedStep::Parallel(step) => Step::Parallel(step),
                TypedStep::Reduce(step) => Step::Reduce(step),
                TypedStep::Conditional(step) => Step::Conditional(step),
                TypedStep::Final(step) => Step::Final(step),
            },
        }
    }
}

impl From<Step> for StepRepr {
    fn from(step: Step) -> Self {
        match step {
            Step::Tool(step) => StepRepr::Tool(step),
            Step::Loop(step) => StepRepr::Typed(TypedStep::Loop(step)),
            Step::Parallel(step) => StepRepr::Typed(TypedStep::Parallel(step)),
            Step::Reduce(step) => StepRepr::Typed(TypedStep::Reduce(step)),
            Step::Conditional(step) => StepRepr::Typed(TypedStep::Conditional(step)),
            Step::Final(step) => StepRepr::Typed(TypedStep::Final(step)),
        }
    }
}

impl Step {
    pub fn id(&self) -> &str {
        match self {
            Self::Tool(s) => &s.id,
            Self::Loop(s) => &s.id,
            Self::Parallel(s) => &s.id,
            Self::Reduce(s) => &s.id,
            Self::Conditional(s) => &s.id,
            Self::Final(s) => &s.id,
        }
    }

    pub fn depends_on(&self) -> &[String] {
        match self {
            Self::Tool(s) => &s.depends_on,
            Self::Loop(s) => &s.depends_on,
            Self::Parallel(s) => &s.depends_on,
            Self::Reduce(s) => &s.depends_on,
            Self::Conditional(s) => &s.depends_on,
            Self::Final(s) => &s.depends_on,
        }
    }

    pub fn policy(&self) -> &StepPolicy {
        match self {
            Self::Tool(s) => &s.policy,
            Self::Loop(s) => &s.policy,
            Self::Parallel(s) => &s.policy,
            Self::Reduce(s) => &s.policy,
            Self::Conditional(s) => &s.policy,
            Self::Final(s) => &s.policy,
        }
    }

    /// Context key this step's result is written to
    pub fn output_key(&self) -> String {
        let output = match self {
            Self::Loop(s) => return s.output_key(),
            Self::Tool(s) => s.output.as_deref(),
            Self::Parallel(s) => s.output.as_deref(),
            Self::Reduce(s) => Some(s.output.as_str()),
            Self::Conditional(s) => s.output.as_deref(),
            Self::Final(s) => s.output.as_deref(),
        };
        output.unwrap_or_else(|| self.id()).to_string()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Tool(_) => "tool",
            Self::Loop(_) => "loop",
            Self::Parallel(_) => "parallel",
            Self::Reduce(_) => "reduce",
            Self::Conditional(_) => "conditional",
            Self::Final(_) => "final",
        }
    }

    /// Directly nested plan steps (parallel children, both conditional branches)
    pub fn children(&self) -> Vec<&Step> {
        match self {
            Self::Parallel(s) => s.steps.iter().collect(),
            Self::Conditional(s) => s.then.iter().chain(s.otherwise.iter()).collect(),
            Self::Tool(_) | Self::Loop(_) | Self::Reduce(_) | Self::Final(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn untagged_tool_and_typed_steps_deserialize() {
        let plan: Plan = serde_json::from_value(json!({
            "version": 1,
            "execution_mode": "graph",
            "steps": [
                {"id": "a", "tool": "search", "input": {"q": "{{query}}"}, "timeout_ms": 500},
                {"id": "b", "type": "loop", "over": "a.results", "as": "hit",
                 "step": {"tool": "fetch", "input": {"url": "{{hit.url}}"}}, "concurrency": 2},
                {"id": "c", "type": "parallel", "steps": [
                    {"id": "c1", "tool": "x"}, {"id": "c2", "type": "tool", "tool": "y"}
                ], "output": "both"},
                {"id": "d", "type": "reduce", "input": "{{b}}", "as": "page",
                 "reducer": "summarize", "output": "summaries"},
                {"id": "e", "type": "conditional", "condition": "summaries.length > 0",
                 "then": [{"id": "e1", "tool": "x"}], "else": [{"id": "e2", "tool": "y"}]},
                {"id": "f", "type": "final", "depends_on": ["e"]}
            ]
        }))
        .unwrap();

        assert_eq!(plan.version, "1");
        assert_eq!(plan.execution_mode, ExecutionMode::Graph);
        let kinds: Vec<&str> = plan.steps.iter().map(Step::kind).collect();
        assert_eq!(kinds, vec!["tool", "loop", "parallel", "reduce", "conditional", "final"]);
        assert_eq!(plan.steps[0].policy().timeout_ms, Some(500));
        assert_eq!(plan.steps[2].output_key(), "both");
        assert_eq!(plan.steps[3].output_key(), "summaries");
        assert_eq!(plan.steps[5].output_key(), "f");
        assert_eq!(plan.steps[1].output_key(), "b_agg");
        match &plan.steps[5] {
            Step::Final(f) => assert_eq!(f.function(), DEFAULT_FINAL_FUNCTION),
            other => panic!("expected final step, got {}", other.kind()),
        }
        match &plan.steps[4] {
            Step::Conditional(c) => assert_eq!(c.otherwise.len(), 1),
            other => panic!("expected conditional step, got {}", other.kind()),
        }

        let ids: Vec<&str> = plan.all_steps().iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "c1", "c2", "d", "e", "e1", "e2", "f"]);
    }

    #[test]
    fn serialization_omits_tag_for_tool_steps() {
        let step = Step::Tool(ToolStep::new("a", "search", json!({})));
        let value = serde_json::to_value(&step).unwrap();
        assert!(value.get("type").is_none());
        assert_eq!(value["tool"], json!("search"));

        let reduce = Step::Reduce(ReduceStep {
            id: "r".into(),
            input: json!("items"),
            bind: "it".into(),
            reducer: Reducer::Tool("double".into()),
            output: "out".into(),
            concurrency: None,
            depends_on: vec![],
            policy: StepPolicy::default(),
        });
        let value = serde_json::to_value(&reduce).unwrap();
        assert_eq!(value["type"], json!("reduce"));
        assert_eq!(value["as"], json!("it"));
        let back: Step = serde_json::from_value(value).unwrap();
        assert_eq!(back, reduce);
    }
}
