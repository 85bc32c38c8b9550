//! Engine configuration loading for the CLI.

use anyhow::{Context, Result};
use meshforge_orchestrator::EngineConfig;
use std::path::Path;
use tracing::{debug, warn};

/// Loads the engine configuration.
///
/// A missing path (or a path that does not exist) yields the defaults; a file
/// that exists but does not parse is an error.
pub fn load_engine_config(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        debug!("No config file given, using defaults");
        return Ok(EngineConfig::default());
    };

    if !path.exists() {
        warn!(path = %path.display(), "Config file not found, using defaults");
        return Ok(EngineConfig::default());
    }

    EngineConfig::load_from_file(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))
}
