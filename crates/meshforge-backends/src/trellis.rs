//! Trellis (standard quality) backend.
//!
//! Talks to a prediction-style API: a prediction is created with
//! `POST {base}/predictions` and polled with `GET {base}/predictions/{id}`
//! until it reaches `succeeded`, `failed` or `canceled`. Sampling progress is
//! read from the prediction's free-form `logs`.

use crate::http::{classify_transport, last_percent, read_json};
use crate::settings::TrellisSettings;
use async_trait::async_trait;
use meshforge_abstraction::{
    BackendError, BackendRequest, DisplayMeta, GenerationBackend, GenerationOutput,
    ModelParamSchema, ParamDescriptor, ParamMap, ProgressSink, non_empty_str,
};
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, warn};

const PROVIDER: &str = "trellis";

/// Caller parameter name to provider input field.
const INPUT_FIELDS: &[(&str, &str)] = &[
    ("seed", "seed"),
    ("randomizeSeed", "randomize_seed"),
    ("ssGuidanceStrength", "ss_guidance_strength"),
    ("ssSamplingSteps", "ss_sampling_steps"),
    ("slatGuidanceStrength", "slat_guidance_strength"),
    ("slatSamplingSteps", "slat_sampling_steps"),
    ("meshSimplify", "mesh_simplify"),
    ("textureSize", "texture_size"),
];

/// Standard-quality image-to-3D backend.
#[derive(Debug, Clone)]
pub struct TrellisBackend {
    meta: DisplayMeta,
    schema: ModelParamSchema,
    settings: TrellisSettings,
    api_key: Option<String>,
    client: Client,
}

impl TrellisBackend {
    /// Registry identifier.
    pub const MODEL_TYPE: &'static str = "trellis";

    /// Creates the backend, resolving the API token from settings or environment.
    pub fn new(settings: TrellisSettings) -> Self {
        let api_key = settings.resolve_api_key();
        Self::build(settings, api_key)
    }

    /// Creates the backend with an explicit API token.
    pub fn with_api_key(settings: TrellisSettings, api_key: String) -> Self {
        Self::build(settings, Some(api_key))
    }

    fn build(settings: TrellisSettings, api_key: Option<String>) -> Self {
        Self {
            meta: DisplayMeta {
                display_name: "Trellis (standard quality)".to_string(),
                description: "Fast structured-latent reconstruction with baked textures".to_string(),
                estimated_seconds: 60,
            },
            schema: Self::param_schema_definition(),
            settings,
            api_key,
            client: Client::new(),
        }
    }

    /// The parameter schema this backend accepts.
    pub fn param_schema_definition() -> ModelParamSchema {
        ModelParamSchema::new(vec![
            ParamDescriptor::int("seed", 0, 0, 2_147_483_647)
                .with_description("Random seed; ignored when randomizeSeed is true"),
            ParamDescriptor::boolean("randomizeSeed", true)
                .with_description("Pick a fresh seed for every item"),
            ParamDescriptor::float("ssGuidanceStrength", 7.5, 0.0, 10.0)
                .with_description("Sparse-structure guidance strength"),
            ParamDescriptor::int("ssSamplingSteps", 12, 1, 50)
                .with_description("Sparse-structure sampling steps"),
            ParamDescriptor::float("slatGuidanceStrength", 3.0, 0.0, 10.0)
                .with_description("Structured-latent guidance strength"),
            ParamDescriptor::int("slatSamplingSteps", 12, 1, 50)
                .with_description("Structured-latent sampling steps"),
            ParamDescriptor::float("meshSimplify", 0.95, 0.9, 0.98)
                .with_description("Ratio of triangles removed during simplification"),
            ParamDescriptor::choice("textureSize", json!(1024), vec![json!(512), json!(1024), json!(2048)])
                .with_description("Baked texture resolution"),
        ])
    }

    fn bearer(&self) -> Result<String, BackendError> {
        self.api_key.as_ref().map(|k| format!("Bearer {}", k)).ok_or_else(|| {
            BackendError::Auth(format!(
                "no API token configured for trellis; set {}",
                self.settings.api_key_env
            ))
        })
    }

    async fn create_prediction(&self, payload: &Value, auth: &str) -> Result<Value, BackendError> {
        let url = format!("{}/predictions", self.settings.base_url);
        let response = self
            .client
            .post(&url)
            .header("authorization", auth)
            .json(payload)
            .send()
            .await
            .map_err(|e| classify_transport(PROVIDER, &e))?;
        read_json(PROVIDER, response).await
    }

    async fn fetch_prediction(&self, id: &str, auth: &str) -> Result<Value, BackendError> {
        let url = format!("{}/predictions/{}", self.settings.base_url, id);
        let response = self
            .client
            .get(&url)
            .header("authorization", auth)
            .send()
            .await
            .map_err(|e| classify_transport(PROVIDER, &e))?;
        read_json(PROVIDER, response).await
    }
}

#[async_trait]
impl GenerationBackend for TrellisBackend {
    fn model_type(&self) -> &str {
        Self::MODEL_TYPE
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

        let mut input = serde_json::Map::new();
        input.insert("images".to_string(), json!([source_url]));
        for (param, field) in INPUT_FIELDS {
            if let Some(value) = resolved.get(*param) {
                input.insert((*field).to_string(), value.clone());
            }
        }
        input.insert("generate_model".to_string(), Value::Bool(true));
        input.insert("generate_color".to_string(), Value::Bool(true));

        Ok(BackendRequest {
            model_type: Self::MODEL_TYPE.to_string(),
            payload: json!({
                "version": self.settings.version,
                "input": input,
            }),
        })
    }

    async fn submit(
        &self,
        request: &BackendRequest,
        progress: &dyn ProgressSink,
    ) -> Result<Value, BackendError> {
        let auth = self.bearer()?;
        let mut prediction = self.create_prediction(&request.payload, &auth).await?;
        let id = non_empty_str(&prediction, "id")
            .ok_or_else(|| BackendError::malformed("prediction has no id", &prediction))?
            .to_string();

        debug!(prediction_id = %id, "Trellis prediction created");

        loop {
            let status = prediction.get("status").and_then(Value::as_str).unwrap_or_default();
            match status {
                "succeeded" => return Ok(prediction),
                "failed" | "canceled" => {
                    let reason = prediction
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("no error detail")
                        .to_string();
                    warn!(prediction_id = %id, status = %status, reason = %reason, "Trellis prediction did not succeed");
                    return Err(BackendError::Server(format!(
                        "trellis prediction {} {}: {}",
                        id, status, reason
                    )));
                }
                "starting" => progress.report(0, "waiting for a worker"),
                "processing" => {
                    let logs = prediction.get("logs").and_then(Value::as_str).unwrap_or_default();
                    progress.report(last_percent(logs).unwrap_or(0), "generating");
                }
                other => {
                    return Err(BackendError::malformed(
                        format!("unknown prediction status '{}'", other),
                        &prediction,
                    ));
                }
            }

            tokio::time::sleep(self.settings.poll_interval()).await;
            prediction = self.fetch_prediction(&id, &auth).await?;
        }
    }

    fn interpret_result(&self, raw: &Value) -> Result<GenerationOutput, BackendError> {
        let output = match raw.get("output") {
            Some(output) if output.is_object() => output,
            Some(_) => return Err(BackendError::malformed("output is not an object", raw)),
            None => return Err(BackendError::malformed("response has no output", raw)),
        };

        let download_url = non_empty_str(output, "model_file")
            .ok_or_else(|| BackendError::malformed("output.model_file is missing or empty", raw))?;

        Ok(GenerationOutput {
            download_url: download_url.to_string(),
            preview_url: non_empty_str(output, "color_video").map(str::to_string),
            size_bytes: None,
        })
    }

    fn requires_extended_deadline(&self, params: &ParamMap) -> bool {
        params.get("textureSize").and_then(Value::as_u64) == Some(2048)
    }
}
