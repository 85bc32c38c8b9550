//! HTTP plumbing shared by the provider backends.
//!
//! Maps transport failures and non-2xx statuses onto the [`BackendError`]
//! taxonomy so that every provider classifies errors the same way.

use meshforge_abstraction::BackendError;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Response, StatusCode};
use serde_json::Value;
use tracing::{debug, error};

// Provider bodies can be large HTML error pages; keep messages readable.
const MAX_ERROR_BODY: usize = 512;

static PERCENT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,3})(?:\.\d+)?\s*%").expect("percent regex should be valid"));

/// Classifies a non-success HTTP status.
pub fn classify_status(provider: &str, status: StatusCode, body: &str) -> BackendError {
    let body = truncate(body);
    let message = format!("{} returned {}: {}", provider, status, body);
    match status.as_u16() {
        401 | 403 => BackendError::Auth(message),
        429 => BackendError::RateLimited(message),
        408 | 504 => BackendError::Timeout(message),
        500..=599 => BackendError::Server(message),
        _ => BackendError::Permanent(message),
    }
}

/// Classifies a transport-level failure.
pub fn classify_transport(provider: &str, err: &reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout(format!("{} request timed out: {}", provider, err))
    } else if err.is_connect() || err.is_request() {
        BackendError::Server(format!("{} unreachable: {}", provider, err))
    } else if err.is_builder() {
        BackendError::Permanent(format!("invalid request to {}: {}", provider, err))
    } else {
        BackendError::Server(format!("{} transport error: {}", provider, err))
    }
}

/// Reads a response as JSON, classifying error statuses and non-JSON bodies.
pub async fn read_json(provider: &str, response: Response) -> Result<Value, BackendError> {
    let status = response.status();
    let text = response.text().await.map_err(|e| classify_transport(provider, &e))?;

    if !status.is_success() {
        error!(provider = %provider, status = %status, "Provider returned error status");
        return Err(classify_status(provider, status, &text));
    }

    serde_json::from_str(&text).map_err(|e| {
        debug!(provider = %provider, error = %e, "Provider body is not JSON");
        BackendError::MalformedResponse {
            reason: format!("{} returned a non-JSON body: {}", provider, e),
            shape: format!("text[{}]", text.len()),
        }
    })
}

/// Extracts the last percentage mentioned in free-form provider logs.
pub fn last_percent(logs: &str) -> Option<u8> {
    PERCENT_REGEX
        .captures_iter(logs)
        .last()
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u16>().ok())
        .map(|p| p.min(100) as u8)
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
