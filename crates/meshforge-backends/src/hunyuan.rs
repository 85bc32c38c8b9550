//! Hunyuan3D (max quality) backend.
//!
//! Uses a queue-style API. A request is enqueued with `POST {base}/{endpoint}`,
//! its state is polled at `{base}/{endpoint}/requests/{id}/status`, and the
//! result is fetched from `{base}/{endpoint}/requests/{id}` once the status
//! reads `COMPLETED`.

use crate::http::{classify_transport, last_percent, read_json};
use crate::settings::Hunyuan3dSettings;
use async_trait::async_trait;
use meshforge_abstraction::{
    BackendError, BackendRequest, DisplayMeta, GenerationBackend, GenerationOutput,
    ModelParamSchema, ParamDescriptor, ParamMap, ProgressSink, non_empty_str,
};
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, warn};

const PROVIDER: &str = "hunyuan3d";

/// Face counts above this need the extended deadline.
const LARGE_FACE_LIMIT: u64 = 200_000;

const INPUT_FIELDS: &[(&str, &str)] = &[
    ("seed", "seed"),
    ("numInferenceSteps", "num_inference_steps"),
    ("guidanceScale", "guidance_scale"),
    ("octreeResolution", "octree_resolution"),
    ("faceLimit", "face_limit"),
    ("texturedMesh", "textured_mesh"),
    ("removeBackground", "remove_background"),
];

/// Max-quality image-to-3D backend.
#[derive(Debug, Clone)]
pub struct Hunyuan3dBackend {
    meta: DisplayMeta,
    schema: ModelParamSchema,
    settings: Hunyuan3dSettings,
    api_key: Option<String>,
    client: Client,
}

impl Hunyuan3dBackend {
    /// Registry identifier.
    pub const MODEL_TYPE: &'static str = "hunyuan3d";

    /// Creates the backend, resolving the API key from settings or environment.
    pub fn new(settings: Hunyuan3dSettings) -> Self {
        let api_key = settings.resolve_api_key();
        Self::build(settings, api_key)
    }

    /// Creates the backend with an explicit API key.
    pub fn with_api_key(settings: Hunyuan3dSettings, api_key: String) -> Self {
        Self::build(settings, Some(api_key))
    }

    fn build(settings: Hunyuan3dSettings, api_key: Option<String>) -> Self {
        Self {
            meta: DisplayMeta {
                display_name: "Hunyuan3D (max quality)".to_string(),
                description: "High-fidelity geometry with PBR texturing".to_string(),
                estimated_seconds: 180,
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
            ParamDescriptor::int("seed", 0, 0, 2_147_483_647),
            ParamDescriptor::int("numInferenceSteps", 50, 1, 100)
                .with_description("Diffusion steps for shape generation"),
            ParamDescriptor::float("guidanceScale", 7.5, 0.0, 20.0)
                .with_description("Classifier-free guidance scale"),
            ParamDescriptor::choice("octreeResolution", json!(256), vec![json!(256), json!(384), json!(512)])
                .with_description("Marching-cubes octree resolution"),
            ParamDescriptor::int("faceLimit", 40_000, 1_000, 1_500_000)
                .with_description("Maximum number of faces in the output mesh"),
            ParamDescriptor::boolean("texturedMesh", true)
                .with_description("Generate PBR textures"),
            ParamDescriptor::boolean("removeBackground", true)
                .with_description("Strip the image background before reconstruction"),
        ])
    }

    fn request_url(&self, suffix: &str) -> String {
        let endpoint = self.settings.endpoint.trim_matches('/');
        if suffix.is_empty() {
            format!("{}/{}", self.settings.base_url, endpoint)
        } else {
            format!("{}/{}/{}", self.settings.base_url, endpoint, suffix)
        }
    }

    fn key_header(&self) -> Result<String, BackendError> {
        self.api_key.as_ref().map(|k| format!("Key {}", k)).ok_or_else(|| {
            BackendError::Auth(format!(
                "no API key configured for hunyuan3d; set {}",
                self.settings.api_key_env
            ))
        })
    }

    async fn get_json(&self, url: &str, auth: &str) -> Result<Value, BackendError> {
        let response = self
            .client
            .get(url)
            .header("authorization", auth)
            .send()
            .await
            .map_err(|e| classify_transport(PROVIDER, &e))?;
        read_json(PROVIDER, response).await
    }

    fn report_status(status: &Value, progress: &dyn ProgressSink) {
        match status.get("status").and_then(Value::as_str) {
            Some("IN_QUEUE") => {
                let message = status
                    .get("queue_position")
                    .and_then(Value::as_u64)
                    .map_or_else(|| "queued".to_string(), |p| format!("queued (position {})", p));
                progress.report(0, &message);
            }
            Some("IN_PROGRESS") => {
                let percent = status
                    .get("logs")
                    .and_then(Value::as_array)
                    .and_then(|logs| {
                        logs.iter()
                            .filter_map(|l| l.get("message").and_then(Value::as_str))
                            .filter_map(last_percent)
                            .last()
                    })
                    .unwrap_or(0);
                progress.report(percent, "generating");
            }
            _ => {}
        }
    }
}

#[async_trait]
impl GenerationBackend for Hunyuan3dBackend {
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
        input.insert("input_image_url".to_string(), Value::String(source_url.to_string()));
        for (param, field) in INPUT_FIELDS {
            if let Some(value) = resolved.get(*param) {
                input.insert((*field).to_string(), value.clone());
            }
        }

        Ok(BackendRequest { model_type: Self::MODEL_TYPE.to_string(), payload: Value::Object(input) })
    }

    async fn submit(
        &self,
        request: &BackendRequest,
        progress: &dyn ProgressSink,
    ) -> Result<Value, BackendError> {
        let auth = self.key_header()?;

        let response = self
            .client
            .post(self.request_url(""))
            .header("authorization", &auth)
            .json(&request.payload)
            .send()
            .await
            .map_err(|e| classify_transport(PROVIDER, &e))?;
        let queued = read_json(PROVIDER, response).await?;

        let id = non_empty_str(&queued, "request_id")
            .ok_or_else(|| BackendError::malformed("queue response has no request_id", &queued))?
            .to_string();

        debug!(request_id = %id, "Hunyuan3D request queued");

        let status_url = self.request_url(&format!("requests/{}/status?logs=1", id));
        loop {
            let status = self.get_json(&status_url, &auth).await?;
            match status.get("status").and_then(Value::as_str) {
                Some("COMPLETED") => {
                    if let Some(err) = status.get("error").filter(|e| !e.is_null()) {
                        warn!(request_id = %id, error = %err, "Hunyuan3D request failed");
                        return Err(BackendError::Server(format!(
                            "hunyuan3d request {} failed: {}",
                            id, err
                        )));
                    }
                    break;
                }
                Some("IN_QUEUE" | "IN_PROGRESS") => Self::report_status(&status, progress),
                _ => {
                    return Err(BackendError::malformed("unrecognized request status", &status));
                }
            }
            tokio::time::sleep(self.settings.poll_interval()).await;
        }

        self.get_json(&self.request_url(&format!("requests/{}", id)), &auth).await
    }

    fn interpret_result(&self, raw: &Value) -> Result<GenerationOutput, BackendError> {
        let mesh = match raw.get("model_mesh") {
            Some(mesh) if mesh.is_object() => mesh,
            Some(_) => return Err(BackendError::malformed("model_mesh is not an object", raw)),
            None => return Err(BackendError::malformed("response has no model_mesh", raw)),
        };

        let download_url = non_empty_str(mesh, "url")
            .ok_or_else(|| BackendError::malformed("model_mesh.url is missing or empty", raw))?;

        let preview_url = raw
            .get("thumbnail")
            .and_then(|t| non_empty_str(t, "url"))
            .map(str::to_string);

        Ok(GenerationOutput {
            download_url: download_url.to_string(),
            preview_url,
            size_bytes: mesh.get("file_size").and_then(Value::as_u64),
        })
    }

    fn requires_extended_deadline(&self, params: &ParamMap) -> bool {
        let octree = params.get("octreeResolution").and_then(Value::as_u64);
        let faces = params.get("faceLimit").and_then(Value::as_u64);
        octree == Some(512) || faces.is_some_and(|f| f > LARGE_FACE_LIMIT)
    }
}
