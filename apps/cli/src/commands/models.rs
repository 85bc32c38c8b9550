//! Models command implementation.

use anyhow::Result;
use colored::Colorize;
use meshforge_orchestrator::BatchOrchestrator;

/// List every registered model type.
pub fn execute(orchestrator: &BatchOrchestrator, json_output: bool) -> Result<()> {
    let models = orchestrator.available_models();

    if json_output {
        println!("{}", serde_json::to_string_pretty(&models)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Available Models ({})", models.len()).bold().cyan());
    println!();
    for model in &models {
        println!(
            "  {:<12} {:<28} {}",
            model.model_type.green(),
            model.display_name,
            format!("~{}s per file", model.estimated_seconds).dimmed()
        );
    }
    println!();

    Ok(())
}
