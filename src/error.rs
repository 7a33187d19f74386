//! Error taxonomy surfaced across the pipe boundary.
//!
//! Every variant renders to one descriptive message; the underlying
//! transport error type never leaks out of the crate.

use thiserror::Error;
use tracing::debug;

use crate::utils::truncate_chars;

/// Maximum number of characters of a raw error body embedded in a message.
pub const ERROR_SNIPPET_CHARS: usize = 800;

#[derive(Debug, Error)]
pub enum PipeError {
    /// Missing or unusable configuration. Raised before any network call.
    #[error("{0}")]
    Config(String),

    #[error("A 'model' must be provided.")]
    MissingModel,

    /// The host body or user mapping has the wrong shape.
    #[error("invalid chat request: {0}")]
    InvalidRequest(String),

    /// A header value that cannot be encoded on the wire.
    #[error("invalid value for header {name}: {reason}")]
    InvalidHeader { name: String, reason: String },

    /// The gateway answered with a status >= 400.
    #[error("Portkey HTTP {status}{}", detail_suffix(.detail))]
    Http { status: u16, detail: Option<String> },

    /// No response was received (connect, timeout, or broken stream).
    #[error("Network error talking to Portkey: {0}")]
    Network(String),

    /// A successful response whose body could not be decoded.
    #[error("Unexpected response from Portkey: {0}")]
    Decode(String),
}

fn detail_suffix(detail: &Option<String>) -> String {
    match detail {
        Some(d) if !d.is_empty() => format!(" — {d}"),
        _ => String::new(),
    }
}

impl PipeError {
    /// Build a [`PipeError::Http`] from a status code and the raw error body.
    ///
    /// When the body is JSON carrying an `error` object, its `message`,
    /// `type` and `request_id` fields are embedded (each only if present).
    /// Anything else is embedded as a bounded snippet of the raw body.
    pub fn from_http_body(status: u16, body: &str) -> Self {
        PipeError::Http {
            status,
            detail: describe_error_body(body),
        }
    }

    /// Read an error response's body and build a [`PipeError::Http`].
    ///
    /// A body that cannot be read leaves the message without detail; the
    /// read failure itself is logged at `debug`.
    pub async fn from_response(resp: reqwest::Response) -> Self {
        let status = resp.status().as_u16();
        let body = match resp.text().await {
            Ok(body) => body,
            Err(e) => {
                debug!(status, error = %e, "failed to read error body");
                String::new()
            }
        };
        Self::from_http_body(status, &body)
    }

    /// Wrap a transport-level failure, flattening its source chain.
    pub fn network(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut msg = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            let text = cause.to_string();
            if !msg.contains(&text) {
                msg.push_str(": ");
                msg.push_str(&text);
            }
            source = cause.source();
        }
        PipeError::Network(msg)
    }

    /// HTTP status of an upstream error, if this is one.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            PipeError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(self, PipeError::Config(_))
    }
}

fn describe_error_body(body: &str) -> Option<String> {
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(serde_json::Value::Object(err)) = map.get("error") {
            let mut parts = Vec::new();
            if let Some(message) = err.get("message") {
                parts.push(display_value(message));
            }
            if let Some(kind) = err.get("type") {
                parts.push(format!("type={}", display_value(kind)));
            }
            if let Some(request_id) = err.get("request_id") {
                parts.push(format!("request_id={}", display_value(request_id)));
            }
            return if parts.is_empty() {
                None
            } else {
                Some(parts.join(" | "))
            };
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(truncate_chars(trimmed, ERROR_SNIPPET_CHARS))
    }
}

/// Strings render bare; other JSON values render as compact JSON.
fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
