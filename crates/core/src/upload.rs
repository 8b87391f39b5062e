//! Signed-URL acquisition and direct blob upload.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{upstream_error_text, Result, ToolError};
use crate::fields::{FILE_URL, SIGNED_URL};
use crate::http::redacted_url_for_display;

/// A one-time write URL and the read URL of the same object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSlot {
    pub signed_url: String,
    pub file_url: String,
}

impl UploadSlot {
    /// Parse an upload-service response, whose key names vary by backend.
    /// Some backends wrap the payload in a `data` object.
    pub fn from_response(body: &Value) -> Result<Self> {
        let inner = body.get("data").filter(|data| data.is_object()).unwrap_or(body);

        let signed_url = SIGNED_URL.first_str(inner);
        let file_url = FILE_URL.first_str(inner);
        match (signed_url, file_url) {
            (Some(signed_url), Some(file_url)) => Ok(Self {
                signed_url: signed_url.to_string(),
                file_url: file_url.to_string(),
            }),
            (signed_url, _) => {
                let missing = if signed_url.is_none() { SIGNED_URL } else { FILE_URL };
                Err(ToolError::ResponseShape(format!(
                    "upload service response is missing '{}' (looked for: {})",
                    missing.name,
                    missing.describe()
                )))
            }
        }
    }
}

#[async_trait]
pub trait UploadBackend: Send + Sync {
    /// Request a fresh [`UploadSlot`] for a file about to be uploaded.
    async fn signed_url(&self, file_name: &str, mime_type: &str) -> Result<UploadSlot>;
}

/// Single-attempt PUT of file bytes to a signed URL.
#[derive(Debug, Clone, Default)]
pub struct BlobUploader {
    client: reqwest::Client,
}

impl BlobUploader {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub async fn put(&self, signed_url: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let size = bytes.len();
        debug!(
            url = %redacted_url_for_display(signed_url),
            size,
            content_type,
            "Uploading blob"
        );

        let resp = self
            .client
            .put(signed_url)
            .header(CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .map_err(|err| ToolError::Upload(err.without_url().to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let detail = upstream_error_text(&body);
            return Err(ToolError::Upload(if detail.is_empty() {
                format!("storage returned HTTP {}", status.as_u16())
            } else {
                format!("storage returned HTTP {}: {detail}", status.as_u16())
            }));
        }

        Ok(())
    }
}

/// Uploaded input file name, `input_<millis>.<ext>`.
pub fn input_file_name(original: &str, now: DateTime<Utc>) -> String {
    let ext = original
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && !ext.contains(['/', '\\']))
        .unwrap_or_else(|| "jpg".to_string());
    format!("input_{}.{ext}", now.timestamp_millis())
}

/// Name of a client-side patched image, `patched_<millis>.jpg`.
pub fn patched_file_name(now: DateTime<Utc>) -> String {
    format!("patched_{}.jpg", now.timestamp_millis())
}

/// Name of the object a job writes its result into, `output_<millis>.jpg`.
pub fn output_file_name(now: DateTime<Utc>) -> String {
    format!("output_{}.jpg", now.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn alias_sets_parse_identically() {
        let set_a = json!({"signed_url": "https://s/put?sig=1", "resource_url": "https://s/file.jpg"});
        let set_b = json!({"upload_url": "https://s/put?sig=1", "file_url": "https://s/file.jpg"});

        let a = UploadSlot::from_response(&set_a).expect("set A");
        let b = UploadSlot::from_response(&set_b).expect("set B");
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_value(&a).expect("serialize"),
            json!({"signedUrl": "https://s/put?sig=1", "fileUrl": "https://s/file.jpg"})
        );
    }

    #[test]
    fn data_wrapper_is_unwrapped() {
        let body = json!({"data": {"signedUrl": "https://w", "publicUrl": "https://r"}});
        let slot = UploadSlot::from_response(&body).expect("parse");
        assert_eq!(slot.signed_url, "https://w");
        assert_eq!(slot.file_url, "https://r");
    }

    #[test]
    fn missing_read_url_is_a_shape_error() {
        let body = json!({"signed_url": "https://w"});
        let err = UploadSlot::from_response(&body).expect_err("should fail");
        match err {
            ToolError::ResponseShape(message) => {
                assert!(message.contains("'file_url'"), "got: {message}");
                assert!(message.contains("publicUrl"), "got: {message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = UploadSlot::from_response(&json!({})).expect_err("should fail");
        assert!(err.to_string().contains("'signed_url'"));
    }

    #[test]
    fn file_names_follow_upload_conventions() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_123).single().expect("timestamp");
        assert_eq!(input_file_name("Room Photo.PNG", now), "input_1700000000123.png");
        assert_eq!(input_file_name("noext", now), "input_1700000000123.jpg");
        assert_eq!(patched_file_name(now), "patched_1700000000123.jpg");
        assert_eq!(output_file_name(now), "output_1700000000123.jpg");
    }

    #[tokio::test]
    async fn put_failure_is_an_upload_error() {
        use axum::http::StatusCode;
        use axum::routing::put;
        use axum::Router;

        let app = Router::new().route("/blob", put(|| async { (StatusCode::FORBIDDEN, "expired") }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        let uploader = BlobUploader::default();
        let err = uploader
            .put(&format!("http://{addr}/blob?sig=x"), b"img".to_vec(), "image/jpeg")
            .await
            .expect_err("should fail");
        match err {
            ToolError::Upload(message) => assert!(message.contains("403"), "got: {message}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
