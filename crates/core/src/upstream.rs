//! Direct clients for the external compute and resource services.
//!
//! These hold the secrets and are what the proxy server forwards through.
//! Required settings are checked per request so a partially configured
//! deployment still serves the tools that are configured.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::{non_empty, UpstreamConfig};
use crate::dispatch::ComputeBackend;
use crate::error::{Result, ToolError};
use crate::http::{build_client, join_endpoint, read_json};
use crate::job::{checked_job_id, JobMode};
use crate::tool::ToolKind;
use crate::upload::{UploadBackend, UploadSlot};

/// Bearer-authenticated client for the GPU job runner.
#[derive(Debug, Clone)]
pub struct RunpodClient {
    config: UpstreamConfig,
    client: Option<reqwest::Client>,
}

impl RunpodClient {
    pub fn new(config: UpstreamConfig) -> Result<Self> {
        let client = match non_empty(&config.runpod_api_key) {
            Some(api_key) => Some(build_client(config.request_timeout(), Some(api_key))?),
            None => None,
        };
        Ok(Self { config, client })
    }

    /// Base URL and authenticated client for `tool`, or the configuration
    /// error to report.
    fn target(&self, tool: ToolKind) -> Result<(&str, &reqwest::Client)> {
        let base = self.config.endpoints.for_tool(tool).ok_or_else(|| {
            warn!(%tool, env = tool.endpoint_env(), "Compute endpoint is not configured");
            ToolError::configuration(format!(
                "{} endpoint is not configured on the server.",
                tool.title()
            ))
        })?;
        let client = self.client.as_ref().ok_or_else(|| {
            warn!(%tool, "RUNPOD_API_KEY is not configured");
            ToolError::configuration("Runpod API Key is not configured on the server.")
        })?;
        Ok((base, client))
    }
}

#[async_trait]
impl ComputeBackend for RunpodClient {
    async fn submit(&self, tool: ToolKind, mode: JobMode, payload: &Value) -> Result<Value> {
        let (base, client) = self.target(tool)?;
        let url = join_endpoint(base, mode.endpoint_suffix());
        debug!(%tool, ?mode, "Forwarding job to compute service");

        let resp = client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .json(payload)
            .send()
            .await?;
        read_json(resp, "Runpod API Error").await.map_err(empty_runpod_response)
    }

    async fn status(&self, tool: ToolKind, job_id: &str) -> Result<Value> {
        let job_id = checked_job_id(job_id)?;
        let (base, client) = self.target(tool)?;
        let url = join_endpoint(base, &format!("/status/{job_id}"));
        debug!(%tool, job_id, "Querying job status");

        let resp = client.get(&url).send().await?;
        read_json(resp, "Runpod API Error").await.map_err(empty_runpod_response)
    }
}

fn empty_runpod_response(err: ToolError) -> ToolError {
    match err {
        ToolError::Protocol(message) if message.contains("empty response body") => {
            ToolError::Protocol("Runpod returned an empty response.".to_string())
        }
        other => other,
    }
}

/// Client for the signed-URL issuing resource service.
#[derive(Debug, Clone)]
pub struct ResourceClient {
    endpoint: Option<String>,
    client: reqwest::Client,
}

impl ResourceClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        Ok(Self {
            endpoint: non_empty(&config.resource_api_url).map(ToString::to_string),
            client: build_client(Duration::from_secs(30), None)?,
        })
    }
}

#[async_trait]
impl UploadBackend for ResourceClient {
    async fn signed_url(&self, file_name: &str, mime_type: &str) -> Result<UploadSlot> {
        let endpoint = self.endpoint.as_deref().ok_or_else(|| {
            warn!("RESOURCE_API_URL is not configured");
            ToolError::configuration("Resource API URL is not configured on the server.")
        })?;
        if file_name.trim().is_empty() {
            return Err(ToolError::InvalidRequest("fileName is required.".to_string()));
        }
        debug!(file_name, mime_type, "Requesting signed upload URL");

        let resp = self
            .client
            .post(endpoint)
            .json(&json!({ "file_name": file_name, "type": mime_type }))
            .send()
            .await?;
        let body = read_json(resp, "Failed to get signed URL").await?;
        UploadSlot::from_response(&body)
    }
}
