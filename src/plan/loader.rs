use serde_json::Value;
use std::path::Path;
use tracing::info;

use crate::core::errors::Result;
use crate::plan::model::Plan;
use crate::plan::validate::validate_plan;

impl Plan {
    /// Validates a raw document and converts it into a typed plan.
    pub fn from_value(doc: Value) -> Result<Self> {
        validate_plan(&doc).into_result()?;
        Ok(serde_json::from_value(doc)?)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let doc: Value = serde_json::from_str(text)?;
        Self::from_value(doc)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let doc: Value = serde_yaml::from_str(text)?;
        Self::from_value(doc)
    }

    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Reads a plan file; `.json` is parsed as JSON, anything else as YAML.
pub fn load_plan_file(path: impl AsRef<Path>) -> Result<Plan> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    let plan = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Plan::from_json_str(&text)?,
        _ => Plan::from_yaml_str(&text)?,
    };
    info!(path = %path.display(), steps = plan.steps.len(), "Loaded plan");
    Ok(plan)
}
