//! Provider connection settings.
//!
//! Settings are plain data so they can be embedded in the engine's TOML
//! configuration. API keys may be given inline or looked up from an
//! environment variable when the backend is constructed.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for every built-in provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSettings {
    /// Standard-quality provider.
    #[serde(default)]
    pub trellis: TrellisSettings,
    /// Max-quality provider.
    #[serde(default)]
    pub hunyuan3d: Hunyuan3dSettings,
}

/// Connection settings for the Trellis prediction API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrellisSettings {
    /// API root, e.g. `https://api.replicate.com/v1`.
    #[serde(default = "default_trellis_base_url")]
    pub base_url: String,
    /// Model version reference sent with every prediction.
    #[serde(default = "default_trellis_version")]
    pub version: String,
    /// Inline API token (takes precedence over `api_key_env`).
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable holding the API token.
    #[serde(default = "default_trellis_key_env")]
    pub api_key_env: String,
    /// Delay between prediction status polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for TrellisSettings {
    fn default() -> Self {
        Self {
            base_url: default_trellis_base_url(),
            version: default_trellis_version(),
            api_key: None,
            api_key_env: default_trellis_key_env(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Connection settings for the Hunyuan3D queue API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunyuan3dSettings {
    /// Queue root, e.g. `https://queue.fal.run`.
    #[serde(default = "default_hunyuan_base_url")]
    pub base_url: String,
    /// Application path below the queue root.
    #[serde(default = "default_hunyuan_endpoint")]
    pub endpoint: String,
    /// Inline API key (takes precedence over `api_key_env`).
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default = "default_hunyuan_key_env")]
    pub api_key_env: String,
    /// Delay between request status polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for Hunyuan3dSettings {
    fn default() -> Self {
        Self {
            base_url: default_hunyuan_base_url(),
            endpoint: default_hunyuan_endpoint(),
            api_key: None,
            api_key_env: default_hunyuan_key_env(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl TrellisSettings {
    /// Inline key, falling back to the configured environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_key(self.api_key.as_ref(), &self.api_key_env)
    }

    /// Poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Hunyuan3dSettings {
    /// Inline key, falling back to the configured environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_key(self.api_key.as_ref(), &self.api_key_env)
    }

    /// Poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[allow(clippy::disallowed_methods)] // env::var is needed for API key loading
fn resolve_key(inline: Option<&String>, env_var: &str) -> Option<String> {
    inline
        .filter(|k| !k.trim().is_empty())
        .cloned()
        .or_else(|| std::env::var(env_var).ok().filter(|k| !k.trim().is_empty()))
}

fn default_trellis_base_url() -> String {
    "https://api.replicate.com/v1".to_string()
}

fn default_trellis_version() -> String {
    "firtoz/trellis".to_string()
}

fn default_trellis_key_env() -> String {
    "REPLICATE_API_TOKEN".to_string()
}

fn default_hunyuan_base_url() -> String {
    "https://queue.fal.run".to_string()
}

fn default_hunyuan_endpoint() -> String {
    "fal-ai/hunyuan3d/v2".to_string()
}

fn default_hunyuan_key_env() -> String {
    "FAL_KEY".to_string()
}

const fn default_poll_interval_ms() -> u64 {
    2_000
}
