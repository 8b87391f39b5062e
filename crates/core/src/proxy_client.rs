//! Client for the proxy's per-tool action routes.
//!
//! Speaks the action envelope and never sees upstream credentials; this is the
//! path the CLI uses by default.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::dispatch::ComputeBackend;
use crate::envelope::Action;
use crate::error::{Result, ToolError};
use crate::http::build_client;
use crate::job::JobMode;
use crate::livekit::{TokenRequest, TokenResponse};
use crate::tool::ToolKind;
use crate::upload::{UploadBackend, UploadSlot};

#[derive(Debug, Clone)]
pub struct ProxyClient {
    base_url: Url,
    /// Route used for signed-URL requests.
    upload_tool: ToolKind,
    client: reqwest::Client,
}

impl ProxyClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|err| ToolError::configuration(format!("invalid proxy URL '{base_url}': {err}")))?;
        Ok(Self {
            base_url,
            upload_tool: ToolKind::WallPainting,
            client: build_client(timeout, None)?,
        })
    }

    /// Send signed-URL requests through `tool`'s route.
    pub fn with_upload_tool(mut self, tool: ToolKind) -> Self {
        self.upload_tool = tool;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn route(&self, tool: ToolKind) -> Result<Url> {
        self.join(&format!("/api/{}", tool.slug()))
    }

    fn join(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|err| ToolError::configuration(format!("failed to build proxy URL: {err}")))
    }

    /// Ask the proxy for a real-time room access token.
    pub async fn livekit_token(&self, request: &TokenRequest) -> Result<TokenResponse> {
        let url = self.join("/api/livekit-token")?;
        debug!("Requesting real-time access token from proxy");
        let body = self.post_json(url, &serde_json::to_value(request)?).await?;
        Ok(serde_json::from_value(body)?)
    }

    async fn post(&self, tool: ToolKind, action: &Action) -> Result<Value> {
        let url = self.route(tool)?;
        debug!(%tool, action = action.name(), "Posting action to proxy");
        self.post_json(url, &action.to_envelope()).await
    }

    async fn post_json(&self, url: Url, body: &Value) -> Result<Value> {
        let resp = self.client.post(url).json(body).send().await?;

        let status = resp.status();
        let body = resp.text().await?;
        let value: Option<Value> = serde_json::from_str(&body).ok();

        if !status.is_success() {
            return Err(ToolError::upstream(
                status.as_u16(),
                proxy_error_text(value.as_ref(), &body),
            ));
        }

        value.ok_or_else(|| ToolError::Protocol("proxy returned a non-JSON response".to_string()))
    }
}

/// `error` (plus `details` when present) of a proxy error body.
fn proxy_error_text(value: Option<&Value>, raw: &str) -> String {
    let Some(value) = value else {
        return raw.trim().to_string();
    };
    let error = value.get("error").and_then(Value::as_str);
    let details = value.get("details").and_then(Value::as_str);
    match (error, details) {
        (Some(error), Some(details)) => format!("{error}: {details}"),
        (Some(error), None) => error.to_string(),
        _ => raw.trim().to_string(),
    }
}

#[async_trait]
impl ComputeBackend for ProxyClient {
    async fn submit(&self, tool: ToolKind, mode: JobMode, payload: &Value) -> Result<Value> {
        let action = Action::Run {
            mode: Some(mode),
            payload: payload.clone(),
        };
        self.post(tool, &action).await
    }

    async fn status(&self, tool: ToolKind, job_id: &str) -> Result<Value> {
        let action = Action::Status {
            job_id: job_id.to_string(),
        };
        self.post(tool, &action).await
    }
}

#[async_trait]
impl UploadBackend for ProxyClient {
    async fn signed_url(&self, file_name: &str, mime_type: &str) -> Result<UploadSlot> {
        let action = Action::GetSignedUrl {
            file_name: file_name.to_string(),
            file_type: mime_type.to_string(),
        };
        let body = self.post(self.upload_tool, &action).await?;
        UploadSlot::from_response(&body)
    }
}
