//! Job submission against a compute backend.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::decode::{decode_output, Artifact, DecodeOptions};
use crate::error::{Result, ToolError};
use crate::job::{JobMode, JobStatus, StatusReport};
use crate::tool::ToolKind;

/// A compute service that runs tool jobs. Both calls return the raw upstream
/// JSON body; interpretation happens in [`interpret`].
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// POST `payload` to the tool's `/run` (async) or `/runsync` (sync) endpoint.
    async fn submit(&self, tool: ToolKind, mode: JobMode, payload: &Value) -> Result<Value>;

    /// GET the tool's `/status/{job_id}`.
    async fn status(&self, tool: ToolKind, job_id: &str) -> Result<Value>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// A synchronous run finished and its output decoded.
    Completed {
        job_id: Option<String>,
        artifact: Artifact,
    },
    /// An asynchronous run was accepted; poll `job_id`.
    Submitted { job_id: String },
    /// A synchronous run came back unfinished (upstream sync timeout) but
    /// with an id that can still be polled.
    Pending { job_id: String, raw_status: String },
}

impl DispatchOutcome {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            DispatchOutcome::Completed { job_id, .. } => job_id.as_deref(),
            DispatchOutcome::Submitted { job_id } | DispatchOutcome::Pending { job_id, .. } => {
                Some(job_id)
            }
        }
    }
}

/// Turn a submit response body into an outcome.
pub fn interpret(
    tool: ToolKind,
    mode: JobMode,
    body: Value,
    options: &DecodeOptions,
) -> Result<DispatchOutcome> {
    let report = StatusReport::from_value(body);

    if mode == JobMode::Async {
        let job_id = report
            .id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                ToolError::Protocol("compute service accepted the job but returned no 'id'".to_string())
            })?;
        return Ok(DispatchOutcome::Submitted { job_id });
    }

    match report.canonical() {
        JobStatus::Completed => {
            let artifact = decode_output(tool, &report.to_document(), options)?;
            Ok(DispatchOutcome::Completed {
                job_id: report.id,
                artifact,
            })
        }
        JobStatus::Failed => Err(job_failure(&report)),
        JobStatus::Queued | JobStatus::Running => match report.id.clone() {
            Some(job_id) if !job_id.trim().is_empty() => Ok(DispatchOutcome::Pending {
                job_id,
                raw_status: report.status,
            }),
            _ => Err(job_failure(&report)),
        },
    }
}

/// Failure carried by a terminal or unusable report.
pub fn job_failure(report: &StatusReport) -> ToolError {
    let message = match report.error_text() {
        Some(text) => text.to_string(),
        None if report.status.trim().is_empty() => {
            "Processing failed: response carried no status".to_string()
        }
        None => format!("Processing failed with status: {}", report.status),
    };
    ToolError::JobFailed(message)
}

/// Submits jobs through a [`ComputeBackend`]. Never starts polling itself.
#[derive(Clone)]
pub struct JobDispatcher {
    backend: Arc<dyn ComputeBackend>,
}

impl JobDispatcher {
    pub fn new(backend: Arc<dyn ComputeBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> Arc<dyn ComputeBackend> {
        Arc::clone(&self.backend)
    }

    pub async fn dispatch(
        &self,
        tool: ToolKind,
        mode: JobMode,
        payload: &Value,
        options: &DecodeOptions,
    ) -> Result<DispatchOutcome> {
        debug!(%tool, ?mode, "Dispatching job");
        let body = self.backend.submit(tool, mode, payload).await?;
        let outcome = interpret(tool, mode, body, options)?;
        if let Some(job_id) = outcome.job_id() {
            info!(%tool, ?mode, job_id, "Job dispatched");
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use serde_json::json;

    struct CannedBackend {
        response: Result<Value>,
        calls: Mutex<Vec<(ToolKind, JobMode, Value)>>,
    }

    impl CannedBackend {
        fn new(response: Result<Value>) -> Self {
            Self {
                response,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ComputeBackend for CannedBackend {
        async fn submit(&self, tool: ToolKind, mode: JobMode, payload: &Value) -> Result<Value> {
            self.calls
                .lock()
                .expect("calls lock")
                .push((tool, mode, payload.clone()));
            self.response.clone()
        }

        async fn status(&self, _tool: ToolKind, _job_id: &str) -> Result<Value> {
            unreachable!("dispatcher never polls")
        }
    }

    fn dispatcher(response: Result<Value>) -> (JobDispatcher, Arc<CannedBackend>) {
        let backend = Arc::new(CannedBackend::new(response));
        (JobDispatcher::new(backend.clone()), backend)
    }

    #[tokio::test]
    async fn async_submit_returns_job_id() {
        let (dispatcher, backend) = dispatcher(Ok(json!({"id": "job-1", "status": "IN_QUEUE"})));
        let payload = json!({"input": {"color": "#aabbcc"}});
        let outcome = dispatcher
            .dispatch(ToolKind::WallPainting, JobMode::Async, &payload, &DecodeOptions::default())
            .await
            .expect("dispatch");
        assert_eq!(
            outcome,
            DispatchOutcome::Submitted {
                job_id: "job-1".to_string()
            }
        );
        let calls = backend.calls.lock().expect("calls lock");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].2, payload);
    }

    #[tokio::test]
    async fn async_submit_without_id_is_protocol_error() {
        let (dispatcher, _) = dispatcher(Ok(json!({"status": "IN_QUEUE"})));
        let err = dispatcher
            .dispatch(ToolKind::WallPainting, JobMode::Async, &json!({}), &DecodeOptions::default())
            .await
            .expect_err("should fail");
        assert!(matches!(err, ToolError::Protocol(_)));
    }

    #[tokio::test]
    async fn sync_completion_is_decoded() {
        let (dispatcher, _) = dispatcher(Ok(json!({
            "id": "sync-1",
            "status": "COMPLETED",
            "output": {"processed_image": "aGVsbG8="}
        })));
        let outcome = dispatcher
            .dispatch(
                ToolKind::ImageComposition,
                JobMode::Sync,
                &json!({"input": {}}),
                &DecodeOptions::default(),
            )
            .await
            .expect("dispatch");
        match outcome {
            DispatchOutcome::Completed { job_id, artifact } => {
                assert_eq!(job_id.as_deref(), Some("sync-1"));
                assert!(artifact.data_url().is_some());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn upstream_errors_propagate_unchanged() {
        let (dispatcher, _) = dispatcher(Err(ToolError::upstream(502, "Runpod API Error: bad gateway")));
        let err = dispatcher
            .dispatch(ToolKind::ClothesSwapper, JobMode::Sync, &json!({}), &DecodeOptions::default())
            .await
            .expect_err("should fail");
        assert_eq!(err.upstream_status(), Some(502));
    }

    #[test]
    fn sync_failures_carry_upstream_text() {
        let err = interpret(
            ToolKind::PbrMapGenerator,
            JobMode::Sync,
            json!({"status": "FAILED", "error": {"detail": "bad texture"}}),
            &DecodeOptions::default(),
        )
        .expect_err("should fail");
        assert_eq!(err, ToolError::JobFailed("bad texture".to_string()));

        let err = interpret(
            ToolKind::ClothesSwapper,
            JobMode::Sync,
            json!({"status": "IN_PROGRESS"}),
            &DecodeOptions::default(),
        )
        .expect_err("should fail");
        assert_eq!(
            err,
            ToolError::JobFailed("Processing failed with status: IN_PROGRESS".to_string())
        );
    }

    #[test]
    fn unfinished_sync_run_with_id_is_pending() {
        let outcome = interpret(
            ToolKind::WallPainting,
            JobMode::Sync,
            json!({"id": "slow-1", "status": "IN_PROGRESS"}),
            &DecodeOptions::default(),
        )
        .expect("interpret");
        assert_eq!(
            outcome,
            DispatchOutcome::Pending {
                job_id: "slow-1".to_string(),
                raw_status: "IN_PROGRESS".to_string()
            }
        );
    }
}
