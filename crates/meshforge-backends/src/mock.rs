//! Scriptable in-process backend for tests and local development.
//!
//! Behaviour is chosen per source URL, falling back to a default. Every
//! `submit` call is counted so tests can assert retry bounds.

use async_trait::async_trait;
use meshforge_abstraction::{
    BackendError, BackendRequest, DisplayMeta, GenerationBackend, GenerationOutput,
    ModelParamSchema, ParamDescriptor, ParamMap, ProgressSink, non_empty_str,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// What a [`MockBackend`] does when a source is submitted.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Succeed with a generated download URL.
    Succeed,
    /// Sleep, then succeed.
    SucceedAfter(Duration),
    /// Return this raw body as the provider response (may be malformed).
    Respond(Value),
    /// Fail every attempt with this error.
    Fail(BackendError),
    /// Fail the first `n` attempts with the error, then succeed.
    FailTimes(usize, BackendError),
    /// Never complete.
    Hang,
}

/// A backend whose responses are scripted.
#[derive(Debug)]
pub struct MockBackend {
    model_type: String,
    meta: DisplayMeta,
    schema: ModelParamSchema,
    default_behavior: MockBehavior,
    by_source: HashMap<String, MockBehavior>,
    calls: Mutex<HashMap<String, usize>>,
    extended_deadline_param: Option<String>,
}

impl MockBackend {
    /// Creates a mock that succeeds for every source.
    pub fn new(model_type: &str) -> Self {
        Self {
            model_type: model_type.to_string(),
            meta: DisplayMeta {
                display_name: format!("Mock ({})", model_type),
                description: "Scripted backend for tests".to_string(),
                estimated_seconds: 1,
            },
            schema: ModelParamSchema::new(vec![
                ParamDescriptor::int("faceLimit", 10_000, 1_000, 100_000),
                ParamDescriptor::float("ssGuidanceStrength", 7.5, 0.0, 10.0),
                ParamDescriptor::boolean("large", false),
            ]),
            default_behavior: MockBehavior::Succeed,
            by_source: HashMap::new(),
            calls: Mutex::new(HashMap::new()),
            extended_deadline_param: Some("large".to_string()),
        }
    }

    /// Replaces the parameter schema.
    #[must_use]
    pub fn with_schema(mut self, schema: ModelParamSchema) -> Self {
        self.schema = schema;
        self
    }

    /// Sets the behaviour for sources without a specific script.
    #[must_use]
    pub fn with_default(mut self, behavior: MockBehavior) -> Self {
        self.default_behavior = behavior;
        self
    }

    /// Scripts the behaviour for one source URL.
    #[must_use]
    pub fn with_source(mut self, source_url: &str, behavior: MockBehavior) -> Self {
        self.by_source.insert(source_url.to_string(), behavior);
        self
    }

    /// Number of `submit` calls seen for `source_url`.
    pub fn calls_for(&self, source_url: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(source_url)
            .copied()
            .unwrap_or(0)
    }

    /// Total number of `submit` calls.
    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).values().sum()
    }

    fn record_call(&self, source_url: &str) -> usize {
        let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        let count = calls.entry(source_url.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    fn success_body(source_url: &str) -> Value {
        let name = source_url.rsplit('/').next().unwrap_or("model");
        json!({
            "status": "succeeded",
            "output": {
                "model_file": format!("https://mock.invalid/models/{}.glb", name),
                "preview": format!("https://mock.invalid/previews/{}.png", name),
            }
        })
    }
}

#[async_trait]
impl GenerationBackend for MockBackend {
    fn model_type(&self) -> &str {
        &self.model_type
    }

    fn display_meta(&self) -> &DisplayMeta {
        &self.meta
    }

    fn param_schema(&self) -> &ModelParamSchema {
        &self.schema
    }

    fn build_request(
        &self,
        source_url: &str,
        params: &ParamMap,
    ) -> Result<BackendRequest, BackendError> {
        let resolved = self.schema.resolve(params)?;
        Ok(BackendRequest {
            model_type: self.model_type.clone(),
            payload: json!({ "image": source_url, "input": resolved }),
        })
    }

    async fn submit(
        &self,
        request: &BackendRequest,
        progress: &dyn ProgressSink,
    ) -> Result<Value, BackendError> {
        let source = request.payload.get("image").and_then(Value::as_str).unwrap_or_default();
        let attempt = self.record_call(source);
        let behavior = self.by_source.get(source).unwrap_or(&self.default_behavior).clone();

        debug!(model_type = %self.model_type, source = %source, attempt, "MockBackend submit");

        progress.report(50, "mock generating");
        match behavior {
            MockBehavior::Succeed => Ok(Self::success_body(source)),
            MockBehavior::SucceedAfter(delay) => {
                tokio::time::sleep(delay).await;
                Ok(Self::success_body(source))
            }
            MockBehavior::Respond(raw) => Ok(raw),
            MockBehavior::Fail(err) => Err(err),
            MockBehavior::FailTimes(n, err) if attempt <= n => Err(err),
            MockBehavior::FailTimes(..) => Ok(Self::success_body(source)),
            MockBehavior::Hang => std::future::pending::<Result<Value, BackendError>>().await,
        }
    }

    fn interpret_result(&self, raw: &Value) -> Result<GenerationOutput, BackendError> {
        let output = raw
            .get("output")
            .filter(|o| o.is_object())
            .ok_or_else(|| BackendError::malformed("response has no output object", raw))?;
        let download_url = non_empty_str(output, "model_file")
            .ok_or_else(|| BackendError::malformed("output.model_file is missing or empty", raw))?;
        Ok(GenerationOutput {
            download_url: download_url.to_string(),
            preview_url: non_empty_str(output, "preview").map(str::to_string),
            size_bytes: output.get("size").and_then(Value::as_u64),
        })
    }

    fn requires_extended_deadline(&self, params: &ParamMap) -> bool {
        self.extended_deadline_param
            .as_ref()
            .and_then(|name| params.get(name))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}
