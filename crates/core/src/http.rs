//! Shared reqwest plumbing for the upstream and proxy clients.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;
use url::Url;

use crate::error::{upstream_error_text, Result, ToolError};

/// Build a client, optionally carrying a bearer credential on every request.
pub fn build_client(timeout: Duration, bearer: Option<&str>) -> Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    if let Some(token) = bearer {
        let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| ToolError::configuration("API key contains invalid header characters."))?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }

    reqwest::Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .build()
        .map_err(|err| ToolError::Network(format!("failed to build HTTP client: {err}")))
}

/// Read a JSON body, turning non-success statuses into [`ToolError::Upstream`]
/// carrying the upstream's own error text prefixed with `context`.
pub async fn read_json(resp: reqwest::Response, context: &str) -> Result<Value> {
    let status = resp.status();
    let body = resp.text().await?;

    if !status.is_success() {
        let detail = upstream_error_text(&body);
        let message = if detail.is_empty() {
            format!("{context}: HTTP {}", status.as_u16())
        } else {
            format!("{context}: {detail}")
        };
        return Err(ToolError::upstream(status.as_u16(), message));
    }

    if body.trim().is_empty() {
        return Err(ToolError::Protocol(format!("{context}: empty response body")));
    }

    serde_json::from_str(&body)
        .map_err(|err| ToolError::Protocol(format!("{context}: response is not JSON ({err})")))
}

/// URL with its query string (signing parameters) replaced by a marker.
pub fn redacted_url_for_display(raw: &str) -> String {
    let Ok(url) = Url::parse(raw) else {
        return match raw.split_once('?') {
            Some((base, _)) => format!("{base}?<redacted>"),
            None => raw.to_string(),
        };
    };

    if url.query().is_none() {
        return url.to_string();
    }

    let mut no_query = url.clone();
    no_query.set_query(None);
    format!("{no_query}?<redacted>")
}

/// Join a path onto an endpoint base URL without losing the base's own path.
pub fn join_endpoint(base: &str, suffix: &str) -> String {
    format!("{}{suffix}", base.trim().trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacted_url_hides_signature() {
        assert_eq!(
            redacted_url_for_display("https://bucket.example/o.jpg?X-Goog-Signature=abc"),
            "https://bucket.example/o.jpg?<redacted>"
        );
        assert_eq!(
            redacted_url_for_display("https://bucket.example/o.jpg"),
            "https://bucket.example/o.jpg"
        );
        assert_eq!(redacted_url_for_display("not a url?k=v"), "not a url?<redacted>");
    }

    #[test]
    fn join_endpoint_keeps_base_path() {
        assert_eq!(
            join_endpoint("https://api.runpod.ai/v2/abc123/", "/runsync"),
            "https://api.runpod.ai/v2/abc123/runsync"
        );
        assert_eq!(
            join_endpoint("https://api.runpod.ai/v2/abc123", "/status/j-1"),
            "https://api.runpod.ai/v2/abc123/status/j-1"
        );
    }
}
