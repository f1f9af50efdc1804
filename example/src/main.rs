use anyhow::{anyhow, Result};
use planflow::{
    init_tracing, load_plan_file, FnTool, LoggingObserver, PlanEngine, RunOptions, ToolRegistry,
};
use serde_json::{json, Value};
use std::sync::Arc;

fn number(params: &Value, key: &str) -> Result<f64> {
    params[key]
        .as_f64()
        .ok_or_else(|| anyhow!("Input '{}' is missing or not a number.", key))
}

async fn add(params: Value, _ctx: Value) -> Result<Value> {
    Ok(json!(number(&params, "a")? + number(&params, "b")?))
}

async fn square(params: Value, _ctx: Value) -> Result<Value> {
    let value = number(&params, "value")?;
    Ok(json!(value * value))
}

async fn triple(params: Value, _ctx: Value) -> Result<Value> {
    Ok(json!(number(&params, "value")? * 3.0))
}

async fn final_answer(params: Value, _ctx: Value) -> Result<Value> {
    Ok(params)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(None);

    let tools = ToolRegistry::new()
        .with_tool(FnTool::new("add", add).with_description("Adds a and b"))
        .with_tool(FnTool::new("square", square))
        .with_tool(FnTool::new("triple", triple))
        .with_tool(FnTool::new("final_answer", final_answer));

    let plan = load_plan_file("pipeline.yaml")?;
    let context = json!({
        "inputs": {"num1": 10.0, "num2": 20.0, "series": [1, 2, 3]}
    });
    let options = RunOptions::new()
        .with_plan_id("example")
        .with_concurrency(2)
        .with_observer(Arc::new(LoggingObserver));

    let engine = PlanEngine::new(tools);
    match engine.run(&plan, context, options).await {
        Ok(out) => {
            println!("{:#}", out.context["report"]);
            println!("{}", serde_json::to_string_pretty(&out.trace.to_json()?)?);
        }
        Err(failure) => {
            eprintln!("run failed: {}", failure);
            if let Some(trace) = failure.trace {
                eprintln!("{}", serde_json::to_string_pretty(&trace.to_json()?)?);
            }
        }
    }

    Ok(())
}
