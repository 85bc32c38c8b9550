//! Batch orchestration engine for meshforge.
//!
//! A batch of source images is fanned out into one task per item. Tasks run
//! on a bounded worker pool, each one staging its source, submitting to the
//! selected [`GenerationBackend`](meshforge_abstraction::GenerationBackend)
//! under a retry policy and a hard deadline, and recording its terminal state
//! in a [`JobStore`]. Once every task settles the batch status is computed
//! from the children:
//!
//! - all completed: `completed`
//! - all failed or timed out: `failed`
//! - anything else: `partially_completed`
//!
//! # Example
//!
//! ```no_run
//! use meshforge_orchestrator::{BatchItem, BatchOrchestrator, EngineConfig};
//! use meshforge_abstraction::ParamMap;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = BatchOrchestrator::from_config(&EngineConfig::default())?;
//! let items = vec![BatchItem::new("chair", "https://example.com/chair.png")];
//! let report = orchestrator.run_batch("trellis", items, ParamMap::new()).await?;
//! println!("{}", report.status);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod executor;
pub mod model;
pub mod orchestrator;
pub mod progress;
pub mod retry;
pub mod staging;
pub mod store;

pub use config::{ConfigError, EngineConfig, RetryConfig, StagingConfig, StoreConfig, StoreKind};
pub use executor::TaskExecutor;
pub use model::{BatchState, BatchStatus, TaskError, TaskState, TaskStatus, aggregate_status};
pub use orchestrator::{
    BatchItem, BatchOrchestrator, BatchReport, BatchTicket, FileResult, ModelSummary,
    OrchestratorError, OrchestratorResult,
};
pub use progress::{ProgressEvent, ProgressPublisher};
pub use retry::{ErrorClass, RetryPolicy};
pub use staging::{DataUriStager, PassthroughStager, SourceStager};
pub use store::{InMemoryJobStore, JobStore, SqliteJobStore, StoreError, StoreResult};
