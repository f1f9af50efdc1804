//! Plan validation: structural shape checks plus a dependency graph check.
//!
//! Validation works on the raw JSON document rather than the typed [`Plan`]
//! so that every problem can be reported with its location, instead of
//! stopping at the first serde error.
//!
//! [`Plan`]: crate::plan::Plan

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::core::config::MAX_RETRIES_LIMIT;
use crate::core::errors::{PlanError, Result, ValidationIssue};
use crate::plan::model::ExecutionMode;

const STEP_TYPES: [&str; 6] = ["tool", "loop", "parallel", "reduce", "conditional", "final"];

/// Outcome of [`validate_plan`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ValidationIssue>,
}

impl ValidationReport {
    fn from_issues(errors: Vec<ValidationIssue>) -> Self {
        Self {
            success: errors.is_empty(),
            errors,
        }
    }

    pub fn into_result(self) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            Err(PlanError::Validation(self.errors))
        }
    }
}

/// Declared dependencies of one step, with the location they were declared at
struct DeclaredStep {
    id: String,
    path: String,
    depends_on: Vec<String>,
    /// Edges the compiler adds implicitly: dependencies inherited from an
    /// enclosing step, the step's own children, or the step that owns an
    /// embedded body
    implied: Vec<String>,
}

#[derive(Default)]
struct Walk {
    issues: Vec<ValidationIssue>,
    seen: HashMap<String, String>,
    steps: Vec<DeclaredStep>,
}

impl Walk {
    fn issue(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue::new(path, message));
    }

    fn record_id(&mut self, id: &str, path: &str) {
        if let Some(first) = self.seen.get(id) {
            let message = format!("duplicate step id '{}' (first declared at {})", id, first);
            self.issue(format!("{}.id", path), message);
        } else {
            self.seen.insert(id.to_string(), path.to_string());
        }
    }

    fn require_str<'a>(&mut self, step: &'a Map<String, Value>, path: &str, field: &str) -> Option<&'a str> {
        match step.get(field) {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
            Some(Value::String(_)) => {
                self.issue(format!("{}.{}", path, field), "must not be empty");
                None
            }
            Some(_) => {
                self.issue(format!("{}.{}", path, field), "must be a string");
                None
            }
            None => {
                self.issue(format!("{}.{}", path, field), "required field missing");
                None
            }
        }
    }

    fn optional_str(&mut self, step: &Map<String, Value>, path: &str, field: &str) {
        if let Some(value) = step.get(field) {
            if !value.is_string() {
                self.issue(format!("{}.{}", path, field), "must be a string");
            }
        }
    }

    fn optional_uint(&mut self, step: &Map<String, Value>, path: &str, field: &str, min: u64, max: Option<u64>) {
        let Some(value) = step.get(field) else {
            return;
        };
        let within = value
            .as_u64()
            .map(|n| n >= min && max.map_or(true, |max| n <= max))
            .unwrap_or(false);
        if !within {
            let message = match max {
                Some(max) => format!("must be an integer between {} and {}", min, max),
                None => format!("must be an integer >= {}", min),
            };
            self.issue(format!("{}.{}", path, field), message);
        }
    }

    /// `over` / `input` of loops and reduces: a path string or an array literal
    fn require_reference(&mut self, step: &Map<String, Value>, path: &str, field: &str) {
        match step.get(field) {
            Some(Value::String(s)) if !s.trim().is_empty() => {}
            Some(Value::Array(_)) => {}
            Some(_) => self.issue(
                format!("{}.{}", path, field),
                "must be a context path or an array",
            ),
            None => self.issue(format!("{}.{}", path, field), "required field missing"),
        }
    }

    /// Validates nested steps and returns the ids they declare.
    fn steps_array(
        &mut self,
        step: &Map<String, Value>,
        path: &str,
        field: &str,
        required: bool,
        inherited: &[String],
    ) -> Vec<String> {
        let mut ids = Vec::new();
        match step.get(field) {
            Some(Value::Array(children)) => {
                if required && children.is_empty() {
                    self.issue(format!("{}.{}", path, field), "must contain at least one step");
                }
                for (i, child) in children.iter().enumerate() {
                    ids.extend(self.step(child, &format!("{}.{}[{}]", path, field, i), inherited));
                }
            }
            Some(_) => self.issue(format!("{}.{}", path, field), "must be an array of steps"),
            None if required => {
                self.issue(format!("{}.{}", path, field), "required field missing")
            }
            None => {}
        }
        ids
    }

    /// Loop bodies and inline reducers: tool steps whose id is optional
    fn embedded_tool(&mut self, value: Option<&Value>, path: &str, owner: Option<&str>) {
        let Some(value) = value else {
            self.issue(path, "required field missing");
            return;
        };
        let Some(body) = value.as_object() else {
            self.issue(path, "must be a tool step object");
            return;
        };
        self.require_str(body, path, "tool");
        self.optional_str(body, path, "output");
        if let Some(Value::String(id)) = body.get("id") {
            if !id.is_empty() {
                self.record_id(id, path);
                // depending on the body means depending on its owner
                self.steps.push(DeclaredStep {
                    id: id.clone(),
                    path: path.to_string(),
                    depends_on: Vec::new(),
                    implied: owner.map(str::to_string).into_iter().collect(),
                });
            }
        }
    }

    /// Validates one step and returns its id, if it has a usable one.
    fn step(&mut self, value: &Value, path: &str, inherited: &[String]) -> Option<String> {
        let Some(step) = value.as_object() else {
            self.issue(path, "step must be an object");
            return None;
        };

        let id = self.require_str(step, path, "id").map(str::to_string);
        if let Some(id) = &id {
            self.record_id(id, path);
        }

        let kind = match step.get("type") {
            Some(Value::String(t)) if STEP_TYPES.contains(&t.as_str()) => Some(t.as_str()),
            Some(other) => {
                self.issue(
                    format!("{}.type", path),
                    format!("unknown step type {} (expected one of {})", other, STEP_TYPES.join(", ")),
                );
                None
            }
            None if step.contains_key("tool") => Some("tool"),
            None => {
                self.issue(path, "step must have a 'tool' field or a 'type'");
                None
            }
        };

        let depends_on = self.depends_on(step, path);
        let scope: Vec<String> = inherited
            .iter()
            .chain(depends_on.iter())
            .cloned()
            .collect();

        let mut children = Vec::new();
        match kind {
            Some("tool") => {
                self.require_str(step, path, "tool");
            }
            Some("loop") => {
                self.require_reference(step, path, "over");
                self.require_str(step, path, "as");
                self.embedded_tool(step.get("step"), &format!("{}.step", path), id.as_deref());
                self.optional_uint(step, path, "concurrency", 1, None);
            }
            Some("parallel") => {
                children = self.steps_array(step, path, "steps", true, &scope);
            }
            Some("reduce") => {
                self.require_reference(step, path, "input");
                self.require_str(step, path, "as");
                self.require_str(step, path, "output");
                self.optional_uint(step, path, "concurrency", 1, None);
                match step.get("reducer") {
                    Some(Value::String(s)) if !s.is_empty() => {}
                    Some(Value::Object(_)) => self.embedded_tool(
                        step.get("reducer"),
                        &format!("{}.reducer", path),
                        id.as_deref(),
                    ),
                    Some(_) => self.issue(
                        format!("{}.reducer", path),
                        "must be a tool id or an inline tool step",
                    ),
                    None => self.issue(format!("{}.reducer", path), "required field missing"),
                }
            }
            Some("conditional") => {
                self.require_str(step, path, "condition");
                children = self.steps_array(step, path, "then", true, &scope);
                children.extend(self.steps_array(step, path, "otherwise", false, &scope));
                children.extend(self.steps_array(step, path, "else", false, &scope));
            }
            Some("final") => self.optional_str(step, path, "function"),
            _ => {}
        }

        self.optional_str(step, path, "output");
        self.optional_uint(step, path, "timeout_ms", 1, None);
        self.optional_uint(step, path, "max_retries", 0, Some(MAX_RETRIES_LIMIT as u64));
        if let Some(schema) = step.get("input_schema") {
            if !schema.is_object() && !schema.is_boolean() {
                self.issue(format!("{}.input_schema", path), "must be a JSON Schema object");
            }
        }

        let id = id?;
        // a compound step waits on its children; children wait on whatever
        // their enclosing steps wait on
        let implied = inherited.iter().cloned().chain(children).collect();
        self.steps.push(DeclaredStep {
            id: id.clone(),
            path: path.to_string(),
            depends_on,
            implied,
        });
        Some(id)
    }

    fn depends_on(&mut self, step: &Map<String, Value>, path: &str) -> Vec<String> {
        match step.get("depends_on") {
            None => Vec::new(),
            Some(Value::Array(deps)) => {
                let mut names = Vec::with_capacity(deps.len());
                for (j, dep) in deps.iter().enumerate() {
                    match dep.as_str() {
                        Some(name) => names.push(name.to_string()),
                        None => self.issue(
                            format!("{}.depends_on[{}]", path, j),
                            "must be a step id string",
                        ),
                    }
                }
                names
            }
            Some(_) => {
                self.issue(format!("{}.depends_on", path), "must be an array of step ids");
                Vec::new()
            }
        }
    }
}

fn check_dependencies(walk: &mut Walk) {
    let mut unknown = Vec::new();
    for step in &walk.steps {
        for (j, dep) in step.depends_on.iter().enumerate() {
            if !walk.seen.contains_key(dep) {
                unknown.push(ValidationIssue::new(
                    format!("{}.depends_on[{}]", step.path, j),
                    format!("unknown dependency '{}'", dep),
                ));
            }
        }
    }
    walk.issues.extend(unknown);

    let edges: HashMap<&str, Vec<&str>> = walk
        .steps
        .iter()
        .map(|s| {
            let deps = s
                .depends_on
                .iter()
                .chain(s.implied.iter())
                .map(String::as_str)
                .filter(|d| walk.seen.contains_key(*d))
                .collect();
            (s.id.as_str(), deps)
        })
        .collect();
    let paths: HashMap<&str, &str> = walk
        .steps
        .iter()
        .map(|s| (s.id.as_str(), s.path.as_str()))
        .collect();

    let mut finished: HashSet<&str> = HashSet::new();
    let mut cycles = Vec::new();
    for step in &walk.steps {
        let mut stack = Vec::new();
        find_cycles(step.id.as_str(), &edges, &mut stack, &mut finished, &mut cycles);
    }
    for cycle in cycles {
        let start = cycle[0];
        let path = paths.get(start).copied().unwrap_or_default();
        walk.issues.push(ValidationIssue::new(
            format!("{}.depends_on", path),
            format!("circular dependency: {}", cycle.join(" -> ")),
        ));
    }
}

/// Depth-first search with an explicit recursion stack; a dependency that is
/// already on the stack closes a cycle.
fn find_cycles<'a>(
    id: &'a str,
    edges: &HashMap<&'a str, Vec<&'a str>>,
    stack: &mut Vec<&'a str>,
    finished: &mut HashSet<&'a str>,
    cycles: &mut Vec<Vec<&'a str>>,
) {
    if finished.contains(id) {
        return;
    }
    if let Some(pos) = stack.iter().position(|s| *s == id) {
        let mut cycle: Vec<&str> = stack[pos..].to_vec();
        cycle.push(id);
        cycles.push(cycle);
        return;
    }
    stack.push(id);
    if let Some(deps) = edges.get(id) {
        for dep in deps {
            find_cycles(*dep, edges, stack, finished, cycles);
        }
    }
    stack.pop();
    finished.insert(id);
}

/// Validates a raw plan document. Problems are collected, never raised.
pub fn validate_plan(doc: &Value) -> ValidationReport {
    let mut walk = Walk::default();
    let Some(plan) = doc.as_object() else {
        walk.issue("", "plan must be an object");
        return ValidationReport::from_issues(walk.issues);
    };

    match plan.get("version") {
        Some(Value::String(s)) if !s.trim().is_empty() => {}
        Some(Value::Number(_)) => {}
        Some(_) => walk.issue("version", "must be a non-empty string or a number"),
        None => walk.issue("version", "required field missing"),
    }

    let mode = plan.get("execution_mode").or_else(|| plan.get("executionMode"));
    if let Some(mode) = mode {
        let allowed = mode
            .as_str()
            .map(|m| ExecutionMode::ALLOWED.contains(&m))
            .unwrap_or(false);
        if !allowed {
            walk.issue(
                "execution_mode",
                format!("must be one of {}", ExecutionMode::ALLOWED.join(", ")),
            );
        }
    }

    match plan.get("steps") {
        Some(Value::Array(steps)) if steps.is_empty() => {
            walk.issue("steps", "plan must contain at least one step")
        }
        Some(Value::Array(steps)) => {
            for (i, step) in steps.iter().enumerate() {
                walk.step(step, &format!("steps[{}]", i), &[]);
            }
            check_dependencies(&mut walk);
        }
        Some(_) => walk.issue("steps", "must be an array of steps"),
        None => walk.issue("steps", "required field missing"),
    }

    debug!(issues = walk.issues.len(), "Plan validated");
    ValidationReport::from_issues(walk.issues)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn messages(report: &ValidationReport) -> Vec<String> {
        report.errors.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn accepts_well_formed_plan() {
        let report = validate_plan(&json!({
            "version": "1.0",
            "execution_mode": "dag",
            "steps": [
                {"id": "a", "tool": "search", "input": {}},
                {"id": "b", "type": "loop", "over": "a.items", "as": "x",
                 "step": {"tool": "fetch", "input": {"u": "{{x}}"}}, "depends_on": ["a"]},
                {"id": "c", "type": "final", "depends_on": ["b"]}
            ]
        }));
        assert_eq!(report, ValidationReport { success: true, errors: vec![] });
    }

    #[test]
    fn reports_structural_problems_with_paths() {
        let report = validate_plan(&json!({
            "execution_mode": "turbo",
            "steps": [
                {"tool": "x"},
                {"id": "l", "type": "loop", "over": 5},
                {"id": "r", "type": "reduce", "input": "xs", "as": "x", "reducer": 3, "output": "o"},
                {"id": "q", "type": "mystery"}
            ]
        }));
        assert!(!report.success);
        let msgs = messages(&report);
        assert!(msgs.contains(&"version: required field missing".to_string()));
        assert!(msgs.iter().any(|m| m.starts_with("execution_mode: must be one of")));
        assert!(msgs.contains(&"steps[0].id: required field missing".to_string()));
        assert!(msgs.contains(&"steps[1].over: must be a context path or an array".to_string()));
        assert!(msgs.contains(&"steps[1].as: required field missing".to_string()));
        assert!(msgs.contains(&"steps[1].step: required field missing".to_string()));
        assert!(msgs.contains(&"steps[2].reducer: must be a tool id or an inline tool step".to_string()));
        assert!(msgs.iter().any(|m| m.starts_with("steps[3].type: unknown step type")));
    }

    #[test]
    fn empty_plan_and_non_object_are_rejected() {
        let report = validate_plan(&json!({"version": 1, "steps": []}));
        assert_eq!(messages(&report), vec!["steps: plan must contain at least one step"]);
        assert!(!validate_plan(&json!([1, 2])).success);
    }

    #[test]
    fn detects_unknown_dependencies_and_duplicates() {
        let report = validate_plan(&json!({
            "version": "1",
            "steps": [
                {"id": "a", "tool": "t", "depends_on": ["ghost"]},
                {"id": "a", "tool": "t"}
            ]
        }));
        let msgs = messages(&report);
        assert!(msgs.contains(&"steps[0].depends_on[0]: unknown dependency 'ghost'".to_string()));
        assert!(msgs.iter().any(|m| m.contains("duplicate step id 'a'")));
    }

    #[test]
    fn detects_two_step_cycle() {
        let report = validate_plan(&json!({
            "version": "1",
            "steps": [
                {"id": "A", "tool": "t", "depends_on": ["B"]},
                {"id": "B", "tool": "t", "depends_on": ["A"]}
            ]
        }));
        assert!(!report.success);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].message.contains("circular dependency"));
        assert!(report.errors[0].message.contains("A -> B -> A"));
        assert!(matches!(report.into_result(), Err(PlanError::Validation(_))));
    }

    fn cycle_messages(doc: Value) -> Vec<String> {
        validate_plan(&doc)
            .errors
            .into_iter()
            .filter(|e| e.message.contains("circular dependency"))
            .map(|e| e.message)
            .collect()
    }

    #[test]
    fn detects_cycles_through_containment() {
        // a dependency on a parallel step waits for its children
        let through_parent = cycle_messages(json!({
            "version": "1",
            "steps": [
                {"id": "x", "tool": "t", "depends_on": ["p"]},
                {"id": "p", "type": "parallel", "steps": [
                    {"id": "p1", "tool": "t", "depends_on": ["x"]}
                ]}
            ]
        }));
        assert_eq!(through_parent.len(), 1);

        let own_parent = cycle_messages(json!({
            "version": "1",
            "steps": [
                {"id": "p", "type": "parallel", "steps": [
                    {"id": "p1", "tool": "t", "depends_on": ["p"]}
                ]}
            ]
        }));
        assert_eq!(own_parent, vec!["circular dependency: p1 -> p -> p1"]);
    }

    #[test]
    fn detects_cycles_through_inherited_dependencies() {
        let inherited = cycle_messages(json!({
            "version": "1",
            "steps": [
                {"id": "y", "tool": "t", "depends_on": ["c1"]},
                {"id": "c", "type": "conditional", "condition": "true", "depends_on": ["y"],
                 "then": [{"id": "c1", "tool": "t"}]}
            ]
        }));
        assert!(!inherited.is_empty());

        let loop_body = cycle_messages(json!({
            "version": "1",
            "steps": [
                {"id": "x", "tool": "t", "depends_on": ["body"]},
                {"id": "l", "type": "loop", "over": "xs", "as": "i", "depends_on": ["x"],
                 "step": {"id": "body", "tool": "t"}}
            ]
        }));
        assert!(!loop_body.is_empty());
    }

    #[test]
    fn siblings_and_shared_parent_dependencies_are_not_cycles() {
        let report = validate_plan(&json!({
            "version": "1",
            "steps": [
                {"id": "a", "tool": "t"},
                {"id": "p", "type": "parallel", "depends_on": ["a"], "steps": [
                    {"id": "p1", "tool": "t", "depends_on": ["a"]},
                    {"id": "p2", "tool": "t", "depends_on": ["p1"]}
                ]},
                {"id": "z", "tool": "t", "depends_on": ["p", "p2"]}
            ]
        }));
        assert_eq!(report, ValidationReport { success: true, errors: vec![] });
    }

    #[test]
    fn detects_long_and_self_cycles_through_nested_steps() {
        let report = validate_plan(&json!({
            "version": "1",
            "steps": [
                {"id": "p", "type": "parallel", "steps": [
                    {"id": "p1", "tool": "t", "depends_on": ["z"]}
                ]},
                {"id": "y", "tool": "t", "depends_on": ["p1"]},
                {"id": "z", "tool": "t", "depends_on": ["y"]},
                {"id": "s", "tool": "t", "depends_on": ["s"]}
            ]
        }));
        let cycles: Vec<_> = report
            .errors
            .iter()
            .filter(|e| e.message.contains("circular dependency"))
            .collect();
        assert_eq!(cycles.len(), 2);
    }
}
