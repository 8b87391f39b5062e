use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::decode::Artifact;
use crate::error::{error_field_text, Result, ToolError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    Sync,
    Async,
}

impl JobMode {
    /// Path suffix of the compute endpoint for this mode.
    pub fn endpoint_suffix(self) -> &'static str {
        match self {
            JobMode::Sync => "/runsync",
            JobMode::Async => "/run",
        }
    }

    /// Parse the `endpoint` field of a run envelope (`/run`, `/runsync`).
    pub fn from_endpoint(endpoint: &str) -> Option<Self> {
        match endpoint.trim().trim_end_matches('/') {
            "/runsync" | "runsync" => Some(JobMode::Sync),
            "/run" | "run" => Some(JobMode::Async),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Map an upstream status string onto the canonical states.
///
/// Total: strings nobody has been seen to send are treated as still running,
/// so an unfamiliar status never ends a job early.
pub fn map_upstream_status(raw: &str) -> JobStatus {
    match raw.trim().to_ascii_uppercase().as_str() {
        "COMPLETED" | "SUCCESS" => JobStatus::Completed,
        "FAILED" => JobStatus::Failed,
        "IN_QUEUE" => JobStatus::Queued,
        _ => JobStatus::Running,
    }
}

/// Whether the raw status is one of the known vocabulary entries.
pub fn is_known_status(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_uppercase().as_str(),
        "COMPLETED" | "SUCCESS" | "FAILED" | "IN_QUEUE" | "IN_PROGRESS"
    )
}

/// A job id safe to place as one path segment of a status URL.
///
/// Ids come from callers of the proxy, and the status request carries the
/// server's credential, so anything that could leave the segment is refused.
pub fn checked_job_id(raw: &str) -> Result<&str> {
    let id = raw.trim();
    if id.is_empty() {
        return Err(ToolError::InvalidRequest("Job ID is required.".to_string()));
    }
    let escapes = id.contains("..")
        || id
            .chars()
            .any(|c| matches!(c, '/' | '\\' | '?' | '#' | '%') || c.is_whitespace() || c.is_control());
    if escapes {
        return Err(ToolError::InvalidRequest(format!("Invalid job ID: {id}")));
    }
    Ok(id)
}

/// Body of a compute status (or `runsync`) response.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl StatusReport {
    /// Read the report field by field so one oddly typed field never hides
    /// the others. A body with error text and no status counts as `FAILED`.
    pub fn from_value(value: Value) -> Self {
        let error = error_field_text(&value).map(Value::String);
        let id = match value.get("id") {
            Some(Value::String(id)) => Some(id.clone()),
            Some(Value::Number(id)) => Some(id.to_string()),
            _ => None,
        };
        let status = match value.get("status").and_then(Value::as_str) {
            Some(status) => status.to_string(),
            None if error.is_some() => "FAILED".to_string(),
            None => String::new(),
        };
        let output = value.get("output").filter(|output| !output.is_null()).cloned();

        StatusReport {
            id,
            status,
            output,
            error,
        }
    }

    pub fn canonical(&self) -> JobStatus {
        map_upstream_status(&self.status)
    }

    pub fn error_text(&self) -> Option<&str> {
        self.error.as_ref().and_then(Value::as_str)
    }

    /// The report as the JSON document the decoder walks (`output.*` paths).
    pub fn to_document(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Client-side view of one submitted job. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: Option<String>,
    pub mode: JobMode,
    pub status: JobStatus,
    /// Advisory 0..=100, assigned from the pipeline stage.
    pub progress: u8,
    pub raw_status: Option<String>,
    pub result: Option<Artifact>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(mode: JobMode) -> Self {
        Self {
            id: None,
            mode,
            status: JobStatus::Queued,
            progress: 0,
            raw_status: None,
            result: None,
            error: None,
            created_at: Utc::now(),
        }
    }

    pub fn set_progress(&mut self, progress: u8) {
        self.progress = progress.min(100);
    }

    pub fn complete(&mut self, artifact: Artifact) {
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.result = Some(artifact);
        self.error = None;
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.progress = 0;
        self.error = Some(message.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_mapping_covers_observed_vocabulary() {
        assert_eq!(map_upstream_status("COMPLETED"), JobStatus::Completed);
        assert_eq!(map_upstream_status("success"), JobStatus::Completed);
        assert_eq!(map_upstream_status("FAILED"), JobStatus::Failed);
        assert_eq!(map_upstream_status("IN_QUEUE"), JobStatus::Queued);
        assert_eq!(map_upstream_status("IN_PROGRESS"), JobStatus::Running);
    }

    #[test]
    fn status_mapping_is_total() {
        for raw in ["", "   ", "TIMED_OUT", "cancelled", "???", "completed\n", "Failed"] {
            let mapped = map_upstream_status(raw);
            assert!(matches!(
                mapped,
                JobStatus::Queued | JobStatus::Running | JobStatus::Completed | JobStatus::Failed
            ));
            assert_eq!(mapped, map_upstream_status(raw));
        }
        assert_eq!(map_upstream_status("TIMED_OUT"), JobStatus::Running);
        assert!(!is_known_status("TIMED_OUT"));
        assert!(is_known_status("in_progress"));
    }

    #[test]
    fn mode_endpoint_round_trip() {
        assert_eq!(JobMode::from_endpoint("/runsync"), Some(JobMode::Sync));
        assert_eq!(JobMode::from_endpoint("/run"), Some(JobMode::Async));
        assert_eq!(JobMode::from_endpoint("/status/abc"), None);
        assert_eq!(JobMode::Async.endpoint_suffix(), "/run");
    }

    #[test]
    fn status_report_normalizes_error_shapes() {
        let report = StatusReport::from_value(json!({
            "id": "j1",
            "status": "FAILED",
            "error": {"detail": "CUDA out of memory"}
        }));
        assert_eq!(report.canonical(), JobStatus::Failed);
        assert_eq!(report.error_text(), Some("CUDA out of memory"));

        let report = StatusReport::from_value(json!({"status": "FAILED", "error": 12}));
        assert_eq!(report.error_text(), None);
    }

    #[test]
    fn numeric_id_keeps_the_rest_of_the_report() {
        let report = StatusReport::from_value(json!({
            "id": 42,
            "status": "COMPLETED",
            "output": {"output_url": "https://x/y.jpg?sig=abc"}
        }));
        assert_eq!(report.id.as_deref(), Some("42"));
        assert_eq!(report.canonical(), JobStatus::Completed);
        assert_eq!(
            report.output,
            Some(json!({"output_url": "https://x/y.jpg?sig=abc"}))
        );
    }

    #[test]
    fn error_without_status_is_a_failure() {
        let report = StatusReport::from_value(json!({"id": "j", "status": null, "error": "boom"}));
        assert_eq!(report.canonical(), JobStatus::Failed);
        assert_eq!(report.error_text(), Some("boom"));

        let report = StatusReport::from_value(json!({"id": "j", "status": "IN_PROGRESS", "error": "retrying"}));
        assert_eq!(report.canonical(), JobStatus::Running);

        let report = StatusReport::from_value(json!({"id": true, "status": 7}));
        assert_eq!(report.id, None);
        assert_eq!(report.canonical(), JobStatus::Running);
    }

    #[test]
    fn job_ids_must_stay_one_path_segment() {
        assert_eq!(checked_job_id("  sync-3f2a-u1 ").expect("plain id"), "sync-3f2a-u1");
        for bad in [
            "",
            "../../other-endpoint/purge-queue?x=1",
            "a/b",
            "..",
            "id#frag",
            "id%2F..",
            "a\\b",
            "two words",
        ] {
            assert!(
                matches!(checked_job_id(bad), Err(ToolError::InvalidRequest(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn job_transitions_update_progress() {
        let mut job = Job::new(JobMode::Async);
        job.set_progress(250);
        assert_eq!(job.progress, 100);
        job.fail("boom");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.progress, 0);
        assert_eq!(job.error.as_deref(), Some("boom"));
    }
}
