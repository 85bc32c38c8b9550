//! Params command implementation.

use anyhow::{Context, Result};
use meshforge_orchestrator::BatchOrchestrator;

/// Print a model's parameter schema as JSON.
pub fn execute(orchestrator: &BatchOrchestrator, model_type: &str) -> Result<()> {
    let schema = orchestrator
        .model_params(model_type)
        .with_context(|| format!("Model '{}' not found", model_type))?;
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}
