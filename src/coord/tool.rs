//! Tools - the host-supplied capabilities a plan calls into.
//!
//! The engine never implements tool behaviour itself; it substitutes a step's
//! input template, hands the params (plus a read-only context snapshot) to
//! the tool and writes whatever comes back into the context.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

use crate::core::errors::{PlanError, Result};

/// A callable capability registered with the engine
#[async_trait]
pub trait Tool: Send + Sync {
    /// Identifier plans use in `tool` / `function` / `reducer` fields
    fn id(&self) -> &str;

    fn name(&self) -> Option<&str> {
        None
    }

    fn description(&self) -> Option<&str> {
        None
    }

    /// Optional JSON Schema the substituted params must satisfy
    fn input_schema(&self) -> Option<&Value> {
        None
    }

    /// Run the tool. `context` is a snapshot; context writes belong to the engine.
    async fn execute(&self, params: Value, context: &Value) -> anyhow::Result<Value>;
}

/// Validates `params` against the tool's input schema, if it has one.
pub fn check_tool_input(tool: &dyn Tool, params: &Value) -> Result<()> {
    let Some(schema) = tool.input_schema() else {
        return Ok(());
    };
    let validator = jsonschema::validator_for(schema).map_err(|e| {
        PlanError::SchemaRejected(format!(
            "tool '{}' has an invalid input schema: {}",
            tool.id(),
            e
        ))
    })?;
    if let Err(error) = validator.validate(params) {
        warn!(tool = tool.id(), error = %error, "Tool input validation failed");
        return Err(PlanError::SchemaRejected(format!(
            "invalid input for tool '{}': {}",
            tool.id(),
            error
        )));
    }
    Ok(())
}

type ToolFuture = std::pin::Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

/// Wraps an async closure as a [`Tool`].
///
/// The closure receives the params and an owned copy of the context snapshot.
pub struct FnTool {
    id: String,
    description: Option<String>,
    input_schema: Option<Value>,
    func: Box<dyn Fn(Value, Value) -> ToolFuture + Send + Sync>,
}

impl FnTool {
    pub fn new<F, Fut>(id: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            id: id.into(),
            description: None,
            input_schema: None,
            func: Box::new(move |params, ctx| Box::pin(func(params, ctx))),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = Some(schema);
        self
    }
}

impl fmt::Debug for FnTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTool").field("id", &self.id).finish()
    }
}

#[async_trait]
impl Tool for FnTool {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn input_schema(&self) -> Option<&Value> {
        self.input_schema.as_ref()
    }

    async fn execute(&self, params: Value, context: &Value) -> anyhow::Result<Value> {
        (self.func)(params, context.clone()).await
    }
}

/// Registry of tools, handed to the engine explicitly for each run
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<DashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its id, replacing any previous registration.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.id().to_string(), tool);
    }

    pub fn with_tool(self, tool: impl Tool + 'static) -> Self {
        self.register(Arc::new(tool));
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(id).map(|entry| entry.value().clone())
    }

    pub fn require(&self, id: &str, step_id: &str) -> Result<Arc<dyn Tool>> {
        self.get(id).ok_or_else(|| PlanError::UnknownTool {
            tool: id.to_string(),
            step_id: step_id.to_string(),
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tools.contains_key(id)
    }

    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tools.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.list())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo() -> FnTool {
        FnTool::new("echo", |params, _ctx| async move { Ok(params) })
    }

    #[tokio::test]
    async fn fn_tool_runs_closure() {
        let tool = echo();
        let out = tool.execute(json!({"x": 1}), &json!({})).await.unwrap();
        assert_eq!(out, json!({"x": 1}));
    }

    #[test]
    fn registry_lookup_and_unknown_tool() {
        let registry = ToolRegistry::new().with_tool(echo());
        assert!(registry.contains("echo"));
        assert_eq!(registry.list(), vec!["echo".to_string()]);
        assert!(registry.require("echo", "s1").is_ok());
        match registry.require("nope", "s2") {
            Err(PlanError::UnknownTool { tool, step_id }) => {
                assert_eq!(tool, "nope");
                assert_eq!(step_id, "s2");
            }
            other => panic!("unexpected: {:?}", other.map(|t| t.id().to_string())),
        }
    }

    #[test]
    fn schema_check_rejects_bad_params() {
        let tool = echo().with_input_schema(json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"]
        }));
        assert!(check_tool_input(&tool, &json!({"query": "rust"})).is_ok());
        assert!(matches!(
            check_tool_input(&tool, &json!({"query": 3})),
            Err(PlanError::SchemaRejected(_))
        ));
        assert!(check_tool_input(&echo(), &json!(null)).is_ok());
    }
}
