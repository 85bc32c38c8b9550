//! Error taxonomy shared by every generation backend.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// A parameter failed its schema check.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("Invalid parameter '{field}': {reason}")]
pub struct ValidationError {
    /// Name of the offending parameter.
    pub field: String,
    /// Human-readable description of the violation.
    pub reason: String,
}

impl ValidationError {
    /// Creates a validation error for `field`.
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self { field: field.into(), reason: reason.into() }
    }
}

/// Represents an error that can occur when talking to a generation backend.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BackendError {
    /// Parameters did not satisfy the backend's schema.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The requested model type is not registered.
    #[error("Unsupported model type '{model_type}' (available: {})", available.join(", "))]
    UnsupportedModel {
        /// The identifier that was asked for.
        model_type: String,
        /// Every registered identifier.
        available: Vec<String>,
    },

    /// The provider rejected our credentials.
    #[error("Authentication rejected by provider: {0}")]
    Auth(String),

    /// The provider asked us to slow down.
    #[error("Rate limited by provider: {0}")]
    RateLimited(String),

    /// The provider (or the connection to it) timed out.
    #[error("Provider timed out: {0}")]
    Timeout(String),

    /// The provider failed on its side (5xx, failed prediction, connection reset).
    #[error("Provider server error: {0}")]
    Server(String),

    /// The provider answered with a body that does not match its documented shape.
    #[error("Malformed provider response: {reason} (shape: {shape})")]
    MalformedResponse {
        /// What was wrong.
        reason: String,
        /// Compact description of the body that was received.
        shape: String,
    },

    /// The source image could not be made available to the provider.
    #[error("Failed to stage source: {0}")]
    Upload(String),

    /// The provider rejected the request in a way a retry cannot fix.
    #[error("Request rejected by provider: {0}")]
    Permanent(String),
}

impl BackendError {
    /// Builds a [`BackendError::MalformedResponse`] with a shape diagnostic of `raw`.
    pub fn malformed(reason: impl Into<String>, raw: &Value) -> Self {
        Self::MalformedResponse { reason: reason.into(), shape: describe_shape(raw) }
    }

    /// The stable kind reported on task errors.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::UnsupportedModel { .. } => ErrorKind::UnsupportedModel,
            Self::Auth(_) => ErrorKind::Auth,
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Server(_) => ErrorKind::Server,
            Self::MalformedResponse { .. } => ErrorKind::MalformedResponse,
            Self::Upload(_) => ErrorKind::Upload,
            Self::Permanent(_) => ErrorKind::Permanent,
        }
    }

    /// Raw-shape diagnostic, present only for malformed responses.
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            Self::MalformedResponse { shape, .. } => Some(shape),
            _ => None,
        }
    }
}

/// Error kinds as they appear in task state and result payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "ValidationError")]
    Validation,
    #[serde(rename = "UnsupportedModelError")]
    UnsupportedModel,
    #[serde(rename = "AuthError")]
    Auth,
    #[serde(rename = "RateLimitedError")]
    RateLimited,
    #[serde(rename = "TimeoutError")]
    Timeout,
    #[serde(rename = "ServerError")]
    Server,
    #[serde(rename = "MalformedResponseError")]
    MalformedResponse,
    #[serde(rename = "UploadError")]
    Upload,
    #[serde(rename = "PermanentError")]
    Permanent,
    #[serde(rename = "CancelledError")]
    Cancelled,
    #[serde(rename = "InternalError")]
    Internal,
}

impl ErrorKind {
    /// Returns the wire name of the kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "ValidationError",
            Self::UnsupportedModel => "UnsupportedModelError",
            Self::Auth => "AuthError",
            Self::RateLimited => "RateLimitedError",
            Self::Timeout => "TimeoutError",
            Self::Server => "ServerError",
            Self::MalformedResponse => "MalformedResponseError",
            Self::Upload => "UploadError",
            Self::Permanent => "PermanentError",
            Self::Cancelled => "CancelledError",
            Self::Internal => "InternalError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const SHAPE_MAX_DEPTH: usize = 2;
const SHAPE_MAX_KEYS: usize = 12;

/// Renders a compact, value-free description of a JSON document.
///
/// Only keys and types are reported so that provider URLs and tokens never
/// end up in diagnostics.
pub fn describe_shape(value: &Value) -> String {
    let mut out = String::new();
    write_shape(value, 0, &mut out);
    out
}

fn write_shape(value: &Value, depth: usize, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(_) => out.push_str("bool"),
        Value::Number(_) => out.push_str("number"),
        Value::String(s) if s.is_empty() => out.push_str("string(empty)"),
        Value::String(_) => out.push_str("string"),
        Value::Array(items) => {
            out.push_str("array[");
            out.push_str(&items.len().to_string());
            out.push(']');
        }
        Value::Object(_) if depth >= SHAPE_MAX_DEPTH => out.push_str("object{..}"),
        Value::Object(map) => {
            out.push_str("object{");
            for (i, (key, child)) in map.iter().take(SHAPE_MAX_KEYS).enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(key);
                out.push_str(": ");
                write_shape(child, depth + 1, out);
            }
            if map.len() > SHAPE_MAX_KEYS {
                out.push_str(", ..");
            }
            out.push('}');
        }
    }
}
