//! The `{ "action": ... }` request envelope spoken between client and proxy.

use serde_json::{json, Value};

use crate::error::{Result, ToolError};
use crate::job::{checked_job_id, JobMode};
use crate::tool::ToolKind;

const DEFAULT_FILE_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    GetSignedUrl {
        file_name: String,
        file_type: String,
    },
    Run {
        /// `None` when the envelope named no endpoint; the tool default applies.
        mode: Option<JobMode>,
        payload: Value,
    },
    Status {
        job_id: String,
    },
}

impl Action {
    /// Parse an envelope posted to `tool`'s route.
    ///
    /// Accepts the action aliases seen in the field (`runpod`/`run`/`runpod_run`,
    /// `runpod_status`/`status`). Tools whose route only ever ran jobs accept
    /// an envelope with no action as a run.
    pub fn from_envelope(tool: ToolKind, body: &Value) -> Result<Self> {
        let action = body.get("action").and_then(Value::as_str).map(str::trim);

        match action {
            Some("getSignedUrl") => {
                let file_name = str_field(body, "fileName")
                    .ok_or_else(|| ToolError::InvalidRequest("fileName is required.".to_string()))?;
                let file_type = str_field(body, "fileType").unwrap_or(DEFAULT_FILE_TYPE);
                Ok(Action::GetSignedUrl {
                    file_name: file_name.to_string(),
                    file_type: file_type.to_string(),
                })
            }
            Some("runpod" | "run" | "runpod_run") => parse_run(body),
            None if accepts_bare_run(tool) => parse_run(body),
            Some("runpod_status" | "status") => {
                let job_id = str_field(body, "jobId")
                    .or_else(|| {
                        str_field(body, "endpoint")
                            .and_then(|endpoint| endpoint.trim().strip_prefix("/status/"))
                            .filter(|id| !id.is_empty())
                    })
                    .ok_or_else(|| ToolError::InvalidRequest("jobId is required.".to_string()))?;
                let job_id = checked_job_id(job_id)?;
                Ok(Action::Status {
                    job_id: job_id.to_string(),
                })
            }
            Some(other) => Err(ToolError::InvalidRequest(format!("Invalid action: {other}"))),
            None => Err(ToolError::InvalidRequest("Invalid action: undefined".to_string())),
        }
    }

    pub fn to_envelope(&self) -> Value {
        match self {
            Action::GetSignedUrl {
                file_name,
                file_type,
            } => json!({
                "action": "getSignedUrl",
                "fileName": file_name,
                "fileType": file_type,
            }),
            Action::Run { mode, payload } => {
                let mut envelope = json!({ "action": "runpod", "payload": payload });
                if let Some(mode) = mode {
                    envelope["endpoint"] = Value::String(mode.endpoint_suffix().to_string());
                }
                envelope
            }
            Action::Status { job_id } => json!({
                "action": "runpod_status",
                "jobId": job_id,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::GetSignedUrl { .. } => "getSignedUrl",
            Action::Run { .. } => "runpod",
            Action::Status { .. } => "runpod_status",
        }
    }
}

fn accepts_bare_run(tool: ToolKind) -> bool {
    matches!(tool, ToolKind::ClothesSwapper | ToolKind::ImageComposition)
}

fn parse_run(body: &Value) -> Result<Action> {
    let mode = match str_field(body, "endpoint") {
        Some(endpoint) => Some(JobMode::from_endpoint(endpoint).ok_or_else(|| {
            ToolError::InvalidRequest(format!(
                "Unsupported endpoint '{endpoint}'; expected /run or /runsync."
            ))
        })?),
        None => None,
    };

    // The v2 wall-painting page posts its inputs bare under `data_from_frontend`.
    let payload = match (body.get("payload"), body.get("data_from_frontend")) {
        (Some(payload), _) if payload.is_object() => payload.clone(),
        (_, Some(inputs)) if inputs.is_object() => json!({ "input": inputs }),
        _ => return Err(ToolError::InvalidRequest("payload is required.".to_string())),
    };

    Ok(Action::Run { mode, payload })
}

fn str_field<'a>(body: &'a Value, key: &str) -> Option<&'a str> {
    body.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
