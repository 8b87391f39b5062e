//! Interval-driven status polling for asynchronous jobs.
//!
//! A [`StatusPoller`] owns at most one armed polling task. Arming a new job
//! cancels the previous task first, and every write to shared state or the
//! event channel is guarded by the task's generation so a status response
//! that lands after cancellation is dropped instead of applied.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::decode::{decode_output, Artifact, DecodeOptions};
use crate::dispatch::{job_failure, ComputeBackend};
use crate::error::{Result, ToolError};
use crate::job::{is_known_status, JobStatus, StatusReport};
use crate::tool::ToolKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    Idle,
    Polling,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerState {
    pub phase: PollPhase,
    pub job_id: Option<String>,
    /// Incremented on every `start`; identifies the armed task.
    pub generation: u64,
    pub last_raw_status: Option<String>,
    pub ticks: u64,
}

impl Default for PollerState {
    fn default() -> Self {
        Self {
            phase: PollPhase::Idle,
            job_id: None,
            generation: 0,
            last_raw_status: None,
            ticks: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent {
    /// A non-terminal status came back. `raw_status` is exposed verbatim so
    /// a job stuck in an unfamiliar state stays diagnosable.
    Tick {
        generation: u64,
        job_id: String,
        raw_status: String,
        status: JobStatus,
        known: bool,
    },
    Completed {
        generation: u64,
        job_id: String,
        artifact: Artifact,
    },
    Failed {
        generation: u64,
        job_id: String,
        error: ToolError,
    },
}

impl PollEvent {
    pub fn generation(&self) -> u64 {
        match self {
            PollEvent::Tick { generation, .. }
            | PollEvent::Completed { generation, .. }
            | PollEvent::Failed { generation, .. } => *generation,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PollEvent::Tick { .. })
    }
}

struct ArmedPoll {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct StatusPoller {
    backend: Arc<dyn ComputeBackend>,
    period: Duration,
    shared: Arc<Mutex<PollerState>>,
    armed: Option<ArmedPoll>,
    events: mpsc::UnboundedSender<PollEvent>,
}

impl StatusPoller {
    /// Create a poller ticking every `period`. Events arrive on the returned
    /// receiver.
    pub fn new(
        backend: Arc<dyn ComputeBackend>,
        period: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PollEvent>)> {
        if period.is_zero() {
            return Err(ToolError::InvalidRequest(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        let (events, receiver) = mpsc::unbounded_channel();
        Ok((
            Self {
                backend,
                period,
                shared: Arc::new(Mutex::new(PollerState::default())),
                armed: None,
                events,
            },
            receiver,
        ))
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn state(&self) -> PollerState {
        lock(&self.shared).clone()
    }

    pub fn is_polling(&self) -> bool {
        lock(&self.shared).phase == PollPhase::Polling
    }

    /// Arm polling for `job_id`, disarming any previous task first. Returns
    /// the generation that tags this task's events.
    pub fn start(
        &mut self,
        tool: ToolKind,
        job_id: impl Into<String>,
        options: DecodeOptions,
    ) -> Result<u64> {
        let job_id = job_id.into();
        if job_id.trim().is_empty() {
            return Err(ToolError::InvalidRequest("job id must not be empty".to_string()));
        }

        let token = CancellationToken::new();
        let generation = {
            let mut state = lock(&self.shared);
            if let Some(previous) = self.armed.take() {
                previous.token.cancel();
                previous.handle.abort();
            }
            state.generation += 1;
            state.phase = PollPhase::Polling;
            state.job_id = Some(job_id.clone());
            state.last_raw_status = None;
            state.ticks = 0;
            state.generation
        };

        let task = PollTask {
            backend: Arc::clone(&self.backend),
            shared: Arc::clone(&self.shared),
            events: self.events.clone(),
            token: token.clone(),
            period: self.period,
            generation,
            tool,
            job_id: job_id.clone(),
            options,
        };
        let handle = tokio::spawn(task.run());
        self.armed = Some(ArmedPoll { token, handle });

        info!(%tool, job_id = %job_id, generation, period_ms = self.period.as_millis() as u64, "Polling armed");
        Ok(generation)
    }

    /// Disarm the current task. Calling it again, or with nothing armed, is
    /// a no-op.
    pub fn stop(&mut self) {
        let mut state = lock(&self.shared);
        if let Some(armed) = self.armed.take() {
            armed.token.cancel();
            armed.handle.abort();
        }
        if state.phase == PollPhase::Polling {
            state.phase = PollPhase::Cancelled;
            debug!(job_id = ?state.job_id, generation = state.generation, "Polling cancelled");
        }
    }
}

impl Drop for StatusPoller {
    fn drop(&mut self) {
        if let Some(armed) = self.armed.take() {
            armed.token.cancel();
            armed.handle.abort();
        }
    }
}

struct PollTask {
    backend: Arc<dyn ComputeBackend>,
    shared: Arc<Mutex<PollerState>>,
    events: mpsc::UnboundedSender<PollEvent>,
    token: CancellationToken,
    period: Duration,
    generation: u64,
    tool: ToolKind,
    job_id: String,
    options: DecodeOptions,
}

impl PollTask {
    async fn run(self) {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = ticker.tick() => {}
            }

            // One attempt per tick; a failed query ends the poll.
            let response = tokio::select! {
                _ = self.token.cancelled() => return,
                response = self.backend.status(self.tool, &self.job_id) => response,
            };

            let event = match response {
                Ok(body) => self.classify(body),
                Err(error) => {
                    warn!(tool = %self.tool, job_id = %self.job_id, error = %error, "Status query failed");
                    self.failed(error)
                }
            };

            let terminal = event.is_terminal();
            if !self.publish(event) || terminal {
                return;
            }
        }
    }

    fn classify(&self, body: serde_json::Value) -> PollEvent {
        let report = StatusReport::from_value(body);
        match report.canonical() {
            JobStatus::Completed => {
                match decode_output(self.tool, &report.to_document(), &self.options) {
                    Ok(artifact) => PollEvent::Completed {
                        generation: self.generation,
                        job_id: self.job_id.clone(),
                        artifact,
                    },
                    Err(error) => self.failed(error),
                }
            }
            JobStatus::Failed => self.failed(job_failure(&report)),
            status => {
                let known = is_known_status(&report.status);
                if !known {
                    warn!(
                        tool = %self.tool,
                        job_id = %self.job_id,
                        raw_status = %report.status,
                        "Unrecognized job status; still polling"
                    );
                }
                PollEvent::Tick {
                    generation: self.generation,
                    job_id: self.job_id.clone(),
                    raw_status: report.status,
                    status,
                    known,
                }
            }
        }
    }

    fn failed(&self, error: ToolError) -> PollEvent {
        PollEvent::Failed {
            generation: self.generation,
            job_id: self.job_id.clone(),
            error,
        }
    }

    /// Apply `event` to shared state and forward it, unless this task has
    /// been superseded or cancelled. Returns whether the task is still live.
    fn publish(&self, event: PollEvent) -> bool {
        let mut state = lock(&self.shared);
        if self.token.is_cancelled() || state.generation != self.generation {
            debug!(job_id = %self.job_id, generation = self.generation, "Dropping stale poll result");
            return false;
        }

        state.ticks += 1;
        match &event {
            PollEvent::Tick { raw_status, .. } => {
                state.last_raw_status = Some(raw_status.clone());
            }
            PollEvent::Completed { .. } => {
                state.phase = PollPhase::Completed;
                state.last_raw_status = Some("COMPLETED".to_string());
            }
            PollEvent::Failed { .. } => {
                state.phase = PollPhase::Failed;
            }
        }

        self.events.send(event).is_ok()
    }
}

fn lock(shared: &Mutex<PollerState>) -> MutexGuard<'_, PollerState> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}
