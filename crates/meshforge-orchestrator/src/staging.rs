//! Making source images reachable by a provider.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use meshforge_abstraction::BackendError;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Turns a caller's `source_ref` into a URL a backend can fetch.
#[async_trait]
pub trait SourceStager: Send + Sync {
    /// Stages one source.
    ///
    /// # Errors
    /// Returns [`BackendError::Upload`] when the source cannot be made available.
    async fn stage(&self, source_ref: &str) -> Result<String, BackendError>;
}

fn is_remote(source_ref: &str) -> bool {
    let lower = source_ref.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://") || lower.starts_with("data:")
}

/// Accepts only references that are already fetchable URLs.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughStager;

#[async_trait]
impl SourceStager for PassthroughStager {
    async fn stage(&self, source_ref: &str) -> Result<String, BackendError> {
        if is_remote(source_ref) {
            Ok(source_ref.to_string())
        } else {
            Err(BackendError::Upload(format!(
                "'{}' is not an http(s) or data URL",
                source_ref
            )))
        }
    }
}

/// Inlines local image files as base64 data URIs.
#[derive(Debug, Clone)]
pub struct DataUriStager {
    max_file_bytes: u64,
}

impl DataUriStager {
    /// Creates a stager rejecting files larger than `max_file_bytes`.
    pub fn new(max_file_bytes: u64) -> Self {
        Self { max_file_bytes }
    }

    fn local_path(source_ref: &str) -> PathBuf {
        PathBuf::from(source_ref.strip_prefix("file://").unwrap_or(source_ref))
    }

    fn mime_for(path: &Path) -> Option<&'static str> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "png" => Some("image/png"),
            "jpg" | "jpeg" => Some("image/jpeg"),
            "webp" => Some("image/webp"),
            _ => None,
        }
    }
}

impl Default for DataUriStager {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_FILE_BYTES)
    }
}

#[async_trait]
impl SourceStager for DataUriStager {
    async fn stage(&self, source_ref: &str) -> Result<String, BackendError> {
        if is_remote(source_ref) {
            return Ok(source_ref.to_string());
        }

        let path = Self::local_path(source_ref);
        let mime = Self::mime_for(&path).ok_or_else(|| {
            BackendError::Upload(format!("unsupported image type: {}", path.display()))
        })?;

        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| BackendError::Upload(format!("{}: {}", path.display(), e)))?;
        if !metadata.is_file() {
            return Err(BackendError::Upload(format!("{} is not a file", path.display())));
        }
        if metadata.len() > self.max_file_bytes {
            return Err(BackendError::Upload(format!(
                "{} is {} bytes, limit is {}",
                path.display(),
                metadata.len(),
                self.max_file_bytes
            )));
        }

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| BackendError::Upload(format!("{}: {}", path.display(), e)))?;

        debug!(path = %path.display(), bytes = bytes.len(), "Staged local source as data URI");
        Ok(format!("data:{};base64,{}", mime, STANDARD.encode(bytes)))
    }
}
