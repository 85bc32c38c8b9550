//! Generation backend implementations for meshforge.
//!
//! This crate provides the concrete providers behind the
//! [`GenerationBackend`](meshforge_abstraction::GenerationBackend) trait:
//!
//! - **Trellis**: standard quality, prediction-style API with status polling.
//! - **Hunyuan3D**: max quality, queue-style API with status and result endpoints.
//! - **Mock**: scriptable in-process backend for tests.
//!
//! Backends are looked up by model type through [`BackendRegistry`].

pub mod factory;
pub mod http;
pub mod hunyuan;
pub mod mock;
pub mod settings;
pub mod trellis;

pub use factory::{BackendDescriptor, BackendFactory, BackendRegistry, ProviderKind};
pub use hunyuan::Hunyuan3dBackend;
pub use mock::{MockBackend, MockBehavior};
pub use settings::{BackendSettings, Hunyuan3dSettings, TrellisSettings};
pub use trellis::TrellisBackend;
