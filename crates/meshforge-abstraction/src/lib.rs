//! Generation backend abstraction for Meshforge.
//!
//! This crate defines the [`GenerationBackend`] trait implemented once per
//! external image-to-3D provider, together with the parameter schema, the
//! request/result value types and the error taxonomy the orchestrator relies on.

pub mod error;
pub mod schema;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use error::{BackendError, ErrorKind, ValidationError, describe_shape};
pub use schema::{ModelParamSchema, ParamDescriptor, ParamMap, ParamType};

/// One unit of work handed to a backend. Created at dispatch and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    /// Caller-chosen identifier of the item inside its batch.
    pub item_id: String,
    /// Registry identifier of the backend.
    pub model_type: String,
    /// Where the source image lives (URL, data URI or local path).
    pub source_ref: String,
    /// Caller parameters, already validated against the backend schema.
    pub params: ParamMap,
}

/// Backend-specific request payload produced by [`GenerationBackend::build_request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendRequest {
    /// Registry identifier of the backend that built the payload.
    pub model_type: String,
    /// JSON body in the provider's own format.
    pub payload: Value,
}

/// Canonical result extracted from a provider response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationOutput {
    /// Provider-hosted URL of the generated model.
    pub download_url: String,
    /// Optional preview (render video or thumbnail).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    /// Size of the model file when the provider reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

/// Human-facing description of a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayMeta {
    /// Name shown in model pickers.
    pub display_name: String,
    /// One-line description.
    pub description: String,
    /// Typical wall-clock time for one item.
    pub estimated_seconds: u64,
}

/// Receives provider-reported progress while a submission is in flight.
pub trait ProgressSink: Send + Sync {
    /// Reports `percent` (0-100, provider scale) with a short message.
    fn report(&self, percent: u8, message: &str);
}

/// A [`ProgressSink`] that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn report(&self, _percent: u8, _message: &str) {}
}

/// A trait for image-to-3D generation providers.
///
/// All backends must be `Send + Sync` so one instance can serve every task of
/// every batch concurrently.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Registry identifier (e.g. `"trellis"`).
    fn model_type(&self) -> &str;

    /// Display metadata for discovery.
    fn display_meta(&self) -> &DisplayMeta;

    /// The backend's immutable parameter schema.
    fn param_schema(&self) -> &ModelParamSchema;

    /// Checks provided keys against the schema; unknown keys are ignored.
    ///
    /// # Errors
    /// Returns the first [`ValidationError`] in schema order.
    fn validate_params(&self, params: &ParamMap) -> Result<(), ValidationError> {
        self.param_schema().validate(params)
    }

    /// Builds the provider payload for one source. Pure, performs no I/O.
    ///
    /// # Arguments
    /// * `source_url` - A location the provider can fetch (URL or data URI)
    /// * `params` - Caller parameters; merged over the schema defaults
    ///
    /// # Errors
    /// Returns [`BackendError::Validation`] when `params` violate the schema.
    fn build_request(&self, source_url: &str, params: &ParamMap)
    -> Result<BackendRequest, BackendError>;

    /// Sends the request and waits for the provider to finish.
    ///
    /// Dropping the returned future abandons the submission; the caller is
    /// responsible for enforcing a deadline.
    ///
    /// # Errors
    /// Returns a classified [`BackendError`].
    async fn submit(
        &self,
        request: &BackendRequest,
        progress: &dyn ProgressSink,
    ) -> Result<Value, BackendError>;

    /// Extracts the canonical output from a raw provider response.
    ///
    /// # Errors
    /// Returns [`BackendError::MalformedResponse`] when required fields are
    /// missing or mistyped. Missing optional fields are not an error.
    fn interpret_result(&self, raw: &Value) -> Result<GenerationOutput, BackendError>;

    /// Whether these parameters describe a job that needs the extended deadline.
    fn requires_extended_deadline(&self, _params: &ParamMap) -> bool {
        false
    }
}

/// Reads a non-empty string at `key` of an object.
///
/// Shared by backends when picking URLs out of provider responses.
pub fn non_empty_str<'a>(container: &'a Value, key: &str) -> Option<&'a str> {
    container.get(key).and_then(Value::as_str).filter(|s| !s.trim().is_empty())
}
