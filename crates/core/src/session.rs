//! The job lifecycle pipeline: upload, dispatch, poll, decode.
//!
//! A [`JobSession`] drives one job at a time and keeps a single status-message
//! slot that every stage overwrites, plus an advisory stage progress.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::decode::{strip_query, DecodeOptions};
use crate::dispatch::{ComputeBackend, DispatchOutcome, JobDispatcher};
use crate::error::{Result, ToolError};
use crate::job::{Job, JobMode, JobStatus};
use crate::poller::{PollEvent, StatusPoller};
use crate::tool::ToolKind;
use crate::upload::{
    input_file_name, output_file_name, patched_file_name, BlobUploader, UploadBackend,
};

/// Progress values assigned per pipeline stage.
pub mod progress {
    pub const REQUEST_UPLOAD_URL: u8 = 10;
    pub const UPLOADING: u8 = 30;
    pub const ENCODING: u8 = 35;
    pub const RESERVING_OUTPUT: u8 = 50;
    pub const DISPATCHING: u8 = 70;
    pub const AWAITING: u8 = 90;
    pub const POLLING: u8 = 95;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Info,
    Submitted,
    Pending,
    Success,
    Warning,
    Unknown,
    Error,
}

impl StatusKind {
    fn glyph(self) -> Option<&'static str> {
        match self {
            StatusKind::Info => None,
            StatusKind::Submitted => Some("🚀"),
            StatusKind::Pending => Some("⏳"),
            StatusKind::Success => Some("✅"),
            StatusKind::Warning => Some("⚠️"),
            StatusKind::Unknown => Some("❓"),
            StatusKind::Error => Some("❌"),
        }
    }
}

/// The one human-readable status line of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub kind: StatusKind,
    pub text: String,
}

impl StatusMessage {
    pub fn new(kind: StatusKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == StatusKind::Error
    }
}

impl fmt::Display for StatusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind.glyph() {
            Some(glyph) => write!(f, "{glyph} {}", self.text),
            None => f.write_str(&self.text),
        }
    }
}

/// One input image of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFile {
    pub name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl InputFile {
    pub fn new(name: impl Into<String>, mime: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime: mime.into(),
            bytes,
        }
    }

    pub async fn from_path(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await.map_err(|err| {
            ToolError::InvalidRequest(format!("failed to read {}: {err}", path.display()))
        })?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "input.jpg".to_string());
        let mime = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        Ok(Self { name, mime, bytes })
    }

    fn base64(&self) -> String {
        STANDARD.encode(&self.bytes)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub tool: ToolKind,
    /// Overrides the tool's default mode.
    pub mode: Option<JobMode>,
    pub inputs: Vec<InputFile>,
    /// Extra fields merged into the payload's `input` object.
    pub params: Map<String, Value>,
    pub options: DecodeOptions,
}

impl RunRequest {
    pub fn new(tool: ToolKind, inputs: Vec<InputFile>) -> Self {
        Self {
            tool,
            mode: None,
            inputs,
            params: Map::new(),
            options: DecodeOptions::default(),
        }
    }

    pub fn mode(&self) -> JobMode {
        self.mode.unwrap_or_else(|| self.tool.default_mode())
    }

    fn required_inputs(&self) -> usize {
        match self.tool {
            ToolKind::ClothesSwapper => 2,
            _ => 1,
        }
    }
}

/// Called with the job and the status line after every update.
pub type SessionObserver = Box<dyn Fn(&Job, &StatusMessage) + Send + Sync>;

pub struct JobSession {
    uploads: Arc<dyn UploadBackend>,
    uploader: BlobUploader,
    dispatcher: JobDispatcher,
    poller: StatusPoller,
    events: mpsc::UnboundedReceiver<PollEvent>,
    generation: Option<u64>,
    job: Option<Job>,
    status: StatusMessage,
    observer: Option<SessionObserver>,
}

impl JobSession {
    pub fn new(
        compute: Arc<dyn ComputeBackend>,
        uploads: Arc<dyn UploadBackend>,
        poll_interval: Duration,
    ) -> Result<Self> {
        let (poller, events) = StatusPoller::new(Arc::clone(&compute), poll_interval)?;
        Ok(Self {
            uploads,
            uploader: BlobUploader::default(),
            dispatcher: JobDispatcher::new(compute),
            poller,
            events,
            generation: None,
            job: None,
            status: StatusMessage::new(StatusKind::Info, "Ready."),
            observer: None,
        })
    }

    pub fn with_uploader(mut self, uploader: BlobUploader) -> Self {
        self.uploader = uploader;
        self
    }

    pub fn on_update(mut self, observer: SessionObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn job(&self) -> Option<&Job> {
        self.job.as_ref()
    }

    pub fn status_message(&self) -> &StatusMessage {
        &self.status
    }

    pub fn is_polling(&self) -> bool {
        self.poller.is_polling()
    }

    /// Run the whole pipeline and wait for a terminal state.
    pub async fn run(&mut self, request: RunRequest) -> Result<Job> {
        match self.submit(request).await? {
            DispatchOutcome::Completed { .. } => self.finished(),
            DispatchOutcome::Submitted { .. } | DispatchOutcome::Pending { .. } => self.wait().await,
        }
    }

    /// Upload inputs and dispatch. Asynchronous jobs (and synchronous ones
    /// that came back unfinished) are handed to the poller; call [`wait`]
    /// to follow them.
    ///
    /// [`wait`]: JobSession::wait
    pub async fn submit(&mut self, request: RunRequest) -> Result<DispatchOutcome> {
        self.reset(request.mode());
        match self.submit_inner(&request).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.fail_with(StatusMessage::new(StatusKind::Error, format!("Error: {err}")), &err);
                Err(err)
            }
        }
    }

    async fn submit_inner(&mut self, request: &RunRequest) -> Result<DispatchOutcome> {
        let tool = request.tool;
        let mode = request.mode();
        if request.inputs.len() < request.required_inputs() {
            return Err(ToolError::InvalidRequest(format!(
                "{} needs {} input image(s), got {}",
                tool.title(),
                request.required_inputs(),
                request.inputs.len()
            )));
        }

        let input = if tool.needs_upload() {
            self.upload_input(request).await?
        } else {
            self.encode_inputs(request)
        };

        let payload = build_payload(request, input);

        self.update(progress::DISPATCHING, StatusKind::Info, "Dispatching job to AI core...");
        let outcome = self
            .dispatcher
            .dispatch(tool, mode, &payload, &request.options)
            .await?;

        match &outcome {
            DispatchOutcome::Completed { job_id, artifact } => {
                let job = self.job_mut();
                job.id = job_id.clone();
                job.raw_status = Some("COMPLETED".to_string());
                job.complete(artifact.clone());
                self.set_status(StatusMessage::new(
                    StatusKind::Success,
                    "Success! Processing complete.",
                ));
            }
            DispatchOutcome::Submitted { job_id } => {
                self.job_mut().id = Some(job_id.clone());
                self.update(
                    progress::AWAITING,
                    StatusKind::Submitted,
                    format!("Job submitted! ID: {job_id}. Checking status..."),
                );
                self.arm(tool, job_id.clone(), request.options.clone())?;
            }
            DispatchOutcome::Pending { job_id, raw_status } => {
                warn!(%tool, job_id = %job_id, raw_status = %raw_status, "Synchronous run returned unfinished; polling instead");
                let job = self.job_mut();
                job.id = Some(job_id.clone());
                job.raw_status = Some(raw_status.clone());
                job.status = JobStatus::Running;
                self.update(
                    progress::AWAITING,
                    StatusKind::Pending,
                    format!("Job {job_id} is still {}; polling...", humanize_status(raw_status)),
                );
                self.arm(tool, job_id.clone(), request.options.clone())?;
            }
        }

        Ok(outcome)
    }

    /// Follow an existing job by id.
    pub async fn watch(&mut self, tool: ToolKind, job_id: &str, options: DecodeOptions) -> Result<Job> {
        self.reset(JobMode::Async);
        self.job_mut().id = Some(job_id.to_string());
        self.update(
            progress::POLLING,
            StatusKind::Pending,
            format!("Polling job: {job_id}..."),
        );
        if let Err(err) = self.arm(tool, job_id.to_string(), options) {
            self.fail_with(StatusMessage::new(StatusKind::Error, format!("Error: {err}")), &err);
            return Err(err);
        }
        self.wait().await
    }

    /// Consume poll events until the armed job reaches a terminal state.
    pub async fn wait(&mut self) -> Result<Job> {
        let Some(generation) = self.generation else {
            return self.finished();
        };

        loop {
            let Some(event) = self.events.recv().await else {
                let err = ToolError::JobFailed("status polling stopped unexpectedly".to_string());
                self.fail_with(StatusMessage::new(StatusKind::Error, err.to_string()), &err);
                return Err(err);
            };
            if event.generation() != generation {
                continue;
            }

            match event {
                PollEvent::Tick {
                    job_id,
                    raw_status,
                    status,
                    known,
                    ..
                } => {
                    let job = self.job_mut();
                    job.status = status;
                    job.raw_status = Some(raw_status.clone());
                    let message = if known {
                        StatusMessage::new(
                            StatusKind::Pending,
                            format!("Job {job_id} is {}...", humanize_status(&raw_status)),
                        )
                    } else {
                        StatusMessage::new(
                            StatusKind::Unknown,
                            format!("Unknown status for Job {job_id}: {raw_status}"),
                        )
                    };
                    self.job_mut().set_progress(progress::POLLING);
                    self.set_status(message);
                }
                PollEvent::Completed {
                    job_id, artifact, ..
                } => {
                    self.generation = None;
                    let job = self.job_mut();
                    job.raw_status = Some("COMPLETED".to_string());
                    job.complete(artifact);
                    info!(job_id = %job_id, "Job completed");
                    self.set_status(StatusMessage::new(
                        StatusKind::Success,
                        format!("Job {job_id} Completed!"),
                    ));
                    return self.finished();
                }
                PollEvent::Failed { job_id, error, .. } => {
                    self.generation = None;
                    let message = match &error {
                        ToolError::Decode(_) => StatusMessage::new(
                            StatusKind::Warning,
                            format!("Job {job_id} completed, but output is missing: {error}"),
                        ),
                        ToolError::JobFailed(text) => StatusMessage::new(
                            StatusKind::Error,
                            format!("Job {job_id} failed. Error: {text}"),
                        ),
                        other => StatusMessage::new(
                            StatusKind::Error,
                            format!("Error checking status: {other}"),
                        ),
                    };
                    self.fail_with(message, &error);
                    return Err(error);
                }
            }
        }
    }

    /// Stop polling. The job keeps its last observed state.
    pub fn cancel(&mut self) {
        self.poller.stop();
        if self.generation.take().is_some() {
            self.set_status(StatusMessage::new(StatusKind::Info, "Polling stopped."));
        }
    }

    fn arm(&mut self, tool: ToolKind, job_id: String, options: DecodeOptions) -> Result<()> {
        let generation = self.poller.start(tool, job_id, options)?;
        self.generation = Some(generation);
        Ok(())
    }

    async fn upload_input(&mut self, request: &RunRequest) -> Result<Value> {
        let tool = request.tool;
        let file = &request.inputs[0];
        let now = Utc::now();
        let upload_name = if tool == ToolKind::WallPaintingV2 {
            patched_file_name(now)
        } else {
            input_file_name(&file.name, now)
        };

        self.update(
            progress::REQUEST_UPLOAD_URL,
            StatusKind::Info,
            "Requesting secure upload link...",
        );
        let input_slot = self.uploads.signed_url(&upload_name, &file.mime).await?;

        self.update(progress::UPLOADING, StatusKind::Info, "Uploading image to cloud...");
        self.uploader
            .put(&input_slot.signed_url, file.bytes.clone(), &file.mime)
            .await?;

        let mut input = Map::new();
        let image_key = match tool {
            ToolKind::PbrMapGenerator => "image_url",
            _ => "img_url",
        };
        input.insert(
            image_key.to_string(),
            Value::String(strip_query(&input_slot.file_url)),
        );

        if tool.reserves_output_slot() {
            self.update(
                progress::RESERVING_OUTPUT,
                StatusKind::Info,
                "Preparing AI result slot...",
            );
            let output_slot = self
                .uploads
                .signed_url(&output_file_name(now), "image/jpeg")
                .await?;
            input.insert(
                "output_signed_url".to_string(),
                Value::String(output_slot.signed_url),
            );
        }

        Ok(Value::Object(input))
    }

    fn encode_inputs(&mut self, request: &RunRequest) -> Value {
        self.update(progress::ENCODING, StatusKind::Info, "Encoding images...");
        match request.tool {
            ToolKind::ClothesSwapper => json!({
                "human_img": request.inputs[0].base64(),
                "garm_img": request.inputs[1].base64(),
            }),
            _ => json!({ "image_data": request.inputs[0].base64() }),
        }
    }

    fn reset(&mut self, mode: JobMode) {
        self.poller.stop();
        self.generation = None;
        self.job = Some(Job::new(mode));
        self.status = StatusMessage::new(StatusKind::Info, "Starting...");
    }

    fn job_mut(&mut self) -> &mut Job {
        self.job.get_or_insert_with(|| Job::new(JobMode::Async))
    }

    fn update(&mut self, progress: u8, kind: StatusKind, text: impl Into<String>) {
        self.job_mut().set_progress(progress);
        self.set_status(StatusMessage::new(kind, text));
    }

    fn set_status(&mut self, status: StatusMessage) {
        self.status = status;
        if let (Some(observer), Some(job)) = (&self.observer, &self.job) {
            observer(job, &self.status);
        }
    }

    fn fail_with(&mut self, status: StatusMessage, error: &ToolError) {
        self.poller.stop();
        self.generation = None;
        self.job_mut().fail(error.to_string());
        self.set_status(status);
    }

    fn finished(&self) -> Result<Job> {
        match &self.job {
            Some(job) if job.status.is_terminal() => Ok(job.clone()),
            Some(_) => Err(ToolError::InvalidRequest("job is still running".to_string())),
            None => Err(ToolError::InvalidRequest("no job has been submitted".to_string())),
        }
    }
}

/// Final payload for `tool`: stage-produced inputs, then tool defaults,
/// then caller parameters.
fn build_payload(request: &RunRequest, stage_input: Value) -> Value {
    let mut input = match stage_input {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    let defaults = match request.tool {
        ToolKind::ClothesSwapper => json!({
            "garment_des": "",
            "is_checked": true,
            "is_checked_crop": false,
            "denoise_steps": 30,
            "seed": 42,
        }),
        ToolKind::PbrMapGenerator => json!({
            "endpoint": request.options.map_type.clone().unwrap_or_else(|| "all".to_string()),
            "parameters": {"denoise_steps": 4, "ensemble_size": 1},
        }),
        ToolKind::WallPainting => json!({ "color": "#ffffff" }),
        ToolKind::WallPaintingV2 | ToolKind::ImageComposition => json!({}),
    };
    if let Value::Object(defaults) = defaults {
        for (key, value) in defaults {
            input.entry(key).or_insert(value);
        }
    }
    for (key, value) in &request.params {
        input.insert(key.clone(), value.clone());
    }

    json!({ "input": input })
}

/// `IN_QUEUE` -> `in queue`.
fn humanize_status(raw: &str) -> String {
    raw.trim().to_ascii_lowercase().replace('_', " ")
}
