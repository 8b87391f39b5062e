//! Error taxonomy shared by the proxy and the job lifecycle client.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ToolError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolError {
    /// A required setting (endpoint URL, API key) is missing. Operator-facing,
    /// never retried.
    #[error("{0}")]
    Configuration(String),

    /// Non-success HTTP response from an external service. `message` is the
    /// upstream's own error text, or its raw body when it was not JSON.
    #[error("{message}")]
    Upstream { status: u16, message: String },

    /// A field the contract promises is absent from a successful response.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// None of the known aliases for a required field were present.
    #[error("{0}")]
    ResponseShape(String),

    #[error("upload failed: {0}")]
    Upload(String),

    /// The job succeeded but its output could not be recognized.
    #[error("{0}")]
    Decode(String),

    /// The upstream reported the job itself as failed.
    #[error("{0}")]
    JobFailed(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("{0}")]
    InvalidRequest(String),
}

impl ToolError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            message: message.into(),
        }
    }

    /// HTTP status of the upstream failure, when there was one.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Self::Upstream { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

impl From<reqwest::Error> for ToolError {
    fn from(err: reqwest::Error) -> Self {
        // reqwest includes the full URL in its Display output; signed URLs
        // carry credentials in the query string.
        let err = err.without_url();
        if let Some(status) = err.status() {
            return Self::Upstream {
                status: status.as_u16(),
                message: err.to_string(),
            };
        }
        Self::Network(err.to_string())
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("invalid JSON: {err}"))
    }
}

/// Pull a human-readable message out of an upstream error body.
///
/// JSON bodies with an `error` field yield that field (string, or the `detail`
/// of an error object); anything else is returned as the raw trimmed text.
pub fn upstream_error_text(body: &str) -> String {
    let trimmed = body.trim();
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(text) = error_field_text(&value) {
            return text;
        }
    }
    trimmed.to_string()
}

/// Text carried by an `error` field: a plain string, or `{detail}` /
/// `{message}` of an error object.
pub fn error_field_text(value: &serde_json::Value) -> Option<String> {
    match value.get("error")? {
        serde_json::Value::String(text) if !text.trim().is_empty() => Some(text.clone()),
        serde_json::Value::Object(object) => object
            .get("detail")
            .or_else(|| object.get("message"))
            .and_then(serde_json::Value::as_str)
            .map(ToString::to_string),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_error_text_prefers_json_error_field() {
        assert_eq!(upstream_error_text(r#"{"error":"worker OOM"}"#), "worker OOM");
        assert_eq!(
            upstream_error_text(r#"{"error":{"detail":"bad input"}}"#),
            "bad input"
        );
    }

    #[test]
    fn upstream_error_text_falls_back_to_raw_body() {
        assert_eq!(upstream_error_text("  gateway timeout \n"), "gateway timeout");
        assert_eq!(upstream_error_text(r#"{"status":"nope"}"#), r#"{"status":"nope"}"#);
    }

    #[test]
    fn upstream_status_only_for_upstream_variant() {
        assert_eq!(ToolError::upstream(404, "missing").upstream_status(), Some(404));
        assert_eq!(ToolError::Network("reset".into()).upstream_status(), None);
        assert!(ToolError::configuration("x").is_configuration());
    }
}
