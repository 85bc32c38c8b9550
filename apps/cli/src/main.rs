//! meshforge CLI - submit image-to-3D batches from the command line.
//!
//! Provides an `mforge` command for listing generation models, inspecting
//! their parameters, and running a batch to completion with live progress.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use meshforge_orchestrator::BatchOrchestrator;
use std::path::PathBuf;
use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use commands::{models, params, submit};

/// meshforge CLI - batch image-to-3D generation
#[derive(Parser, Debug)]
#[command(
    name = "mforge",
    author,
    version,
    about = "meshforge - batch image-to-3D generation",
    long_about = "mforge fans a batch of source images out to a 3D generation provider,\nretrying transient failures and reporting per-file results."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn", global = true)]
    log_level: String,

    /// Engine configuration file (TOML). Defaults apply when absent.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List available generation models
    Models {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the parameter schema of a model
    Params {
        /// Model type (e.g. trellis, hunyuan3d)
        model_type: String,
    },

    /// Submit a batch and wait for it to finish
    ///
    /// Progress is written to stderr and the final report to stdout as JSON.
    /// Exits non-zero unless every file completed.
    Submit(submit::SubmitArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    // RUST_LOG wins over --log-level.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(LevelFilter::from_level(level).into()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut engine_config = config::load_engine_config(args.config.as_deref())?;

    match args.command {
        Command::Models { json } => {
            let orchestrator = BatchOrchestrator::from_config(&engine_config)?;
            models::execute(&orchestrator, json)
        }
        Command::Params { model_type } => {
            let orchestrator = BatchOrchestrator::from_config(&engine_config)?;
            params::execute(&orchestrator, &model_type)
        }
        Command::Submit(submit_args) => {
            if let Some(concurrency) = submit_args.concurrency {
                engine_config.max_concurrency = concurrency.max(1);
            }
            let orchestrator = BatchOrchestrator::from_config(&engine_config)?;
            submit::execute(&orchestrator, submit_args).await
        }
    }
}
