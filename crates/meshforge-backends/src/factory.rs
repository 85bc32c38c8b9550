//! Backend factory and registry.
//!
//! The registry maps model-type identifiers to constructed backends. It is
//! built once at startup; adding a provider means adding one entry here and
//! touching no orchestration code.

use crate::{BackendSettings, Hunyuan3dBackend, TrellisBackend};
use meshforge_abstraction::{BackendError, DisplayMeta, GenerationBackend, ModelParamSchema};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Built-in provider kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// Standard-quality Trellis backend.
    Trellis,
    /// Max-quality Hunyuan3D backend.
    Hunyuan3d,
}

impl ProviderKind {
    /// Every built-in provider, in registration order.
    pub const ALL: [Self; 2] = [Self::Trellis, Self::Hunyuan3d];

    /// Registry identifier of the provider.
    pub const fn model_type(self) -> &'static str {
        match self {
            Self::Trellis => TrellisBackend::MODEL_TYPE,
            Self::Hunyuan3d => Hunyuan3dBackend::MODEL_TYPE,
        }
    }
}

impl FromStr for ProviderKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trellis" => Ok(Self::Trellis),
            "hunyuan3d" => Ok(Self::Hunyuan3d),
            _ => Err(()),
        }
    }
}

/// Factory for creating backend instances.
pub struct BackendFactory;

impl BackendFactory {
    /// Creates a backend of the given kind. No network calls are made.
    pub fn create(kind: ProviderKind, settings: &BackendSettings) -> Arc<dyn GenerationBackend> {
        debug!(model_type = kind.model_type(), "Creating backend instance");
        match kind {
            ProviderKind::Trellis => Arc::new(TrellisBackend::new(settings.trellis.clone())),
            ProviderKind::Hunyuan3d => Arc::new(Hunyuan3dBackend::new(settings.hunyuan3d.clone())),
        }
    }
}

/// Discovery entry returned by [`BackendRegistry::list_available`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendDescriptor {
    /// Registry identifier.
    pub model_type: String,
    /// Display metadata.
    pub display_meta: DisplayMeta,
    /// Independent copy of the parameter schema.
    pub param_schema: ModelParamSchema,
}

/// Registry of generation backends keyed by model type.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn GenerationBackend>>,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("model_types", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl BackendRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding every built-in provider.
    pub fn from_settings(settings: &BackendSettings) -> Self {
        let mut registry = Self::new();
        for kind in ProviderKind::ALL {
            registry.register(BackendFactory::create(kind, settings));
        }
        registry
    }

    /// Registers a backend under its own model type.
    ///
    /// # Returns
    /// `true` if the model type was new, `false` if an existing backend was replaced.
    pub fn register(&mut self, backend: Arc<dyn GenerationBackend>) -> bool {
        let model_type = backend.model_type().to_string();
        let was_new = self.backends.insert(model_type.clone(), backend).is_none();
        if !was_new {
            warn!(model_type = %model_type, "Backend replaced in registry");
        }
        was_new
    }

    /// Resolves a model type to its backend.
    ///
    /// # Errors
    /// Returns [`BackendError::UnsupportedModel`] listing the valid types.
    pub fn resolve(&self, model_type: &str) -> Result<Arc<dyn GenerationBackend>, BackendError> {
        self.backends.get(model_type).cloned().ok_or_else(|| {
            debug!(model_type = %model_type, "Unsupported model type requested");
            BackendError::UnsupportedModel {
                model_type: model_type.to_string(),
                available: self.model_types(),
            }
        })
    }

    /// Describes every registered backend. Returned values are independent copies.
    pub fn list_available(&self) -> Vec<BackendDescriptor> {
        self.backends
            .iter()
            .map(|(model_type, backend)| BackendDescriptor {
                model_type: model_type.clone(),
                display_meta: backend.display_meta().clone(),
                param_schema: backend.param_schema().clone(),
            })
            .collect()
    }

    /// Registered model types in sorted order.
    pub fn model_types(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    /// Number of registered backends.
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Whether no backend is registered.
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
