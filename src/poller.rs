//! Generic "ask again until terminal" loop for long-running remote jobs.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{Result, SyncError};
use crate::retry::{retry, RetryPolicy};

/// Ceiling for estimated progress while the remote side has not finished.
const ESTIMATE_CEILING: f64 = 90.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Map a remote status string; unknown values count as still running.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "pending" | "queued" | "created" => JobState::Pending,
            "completed" | "complete" | "succeeded" | "success" | "ready" | "done" => {
                JobState::Completed
            }
            "failed" | "failure" | "error" | "cancelled" | "canceled" => JobState::Failed,
            _ => JobState::Processing,
        }
    }
}

/// One observation of a remote job.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub state: JobState,
    /// Remote-reported progress in percent, when available.
    pub progress: Option<f64>,
    /// Location of the finished media.
    pub url: Option<String>,
    pub error: Option<String>,
    pub raw: Value,
}

/// Kind of remote job; selects default timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    VideoRender,
    ImageRender,
    VideoTranscode,
}

/// Anything that can report the current status of a job by id.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch_status(&self, job_id: &str) -> Result<JobStatus>;
}

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
    /// Wall-clock budget, independent of `max_attempts`.
    pub timeout: Duration,
    /// Estimated progress added per tick when the remote side reports none.
    pub progress_step: f64,
    /// Retry policy for transient failures of a single status fetch.
    pub fetch_retry: RetryPolicy,
}

impl PollConfig {
    pub fn for_kind(kind: JobKind) -> Self {
        let (interval, max_attempts, timeout, progress_step) = match kind {
            JobKind::VideoRender => (5, 60, 300, 3.0),
            JobKind::ImageRender => (3, 30, 90, 10.0),
            JobKind::VideoTranscode => (5, 36, 180, 5.0),
        };
        Self {
            interval: Duration::from_secs(interval),
            max_attempts,
            timeout: Duration::from_secs(timeout),
            progress_step,
            fetch_retry: RetryPolicy::default(),
        }
    }
}

/// Emitted while polling. Exactly one terminal event (`Completed`,
/// `Failed` or `TimedOut`) is sent per job unless the poll is cancelled.
#[derive(Debug, Clone)]
pub enum PollEvent {
    Progress {
        job_id: String,
        state: JobState,
        percent: f64,
    },
    Completed {
        job_id: String,
        url: Option<String>,
        payload: Value,
    },
    Failed {
        job_id: String,
        message: String,
    },
    TimedOut {
        job_id: String,
        elapsed: Duration,
    },
}

/// Successful outcome of a poll.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub job_id: String,
    pub url: Option<String>,
    pub payload: Value,
    pub attempts: u32,
}

#[derive(Debug)]
struct PollJob {
    job_id: String,
    kind: JobKind,
    state: JobState,
    progress_percent: f64,
    attempts_made: u32,
}

impl PollJob {
    fn observe(&mut self, status: &JobStatus, step: f64) {
        self.attempts_made += 1;
        if self.state == JobState::Pending || status.state != JobState::Pending {
            self.state = status.state;
        }
        let estimate = match status.progress {
            Some(p) => p.clamp(0.0, 100.0),
            None => (self.attempts_made as f64 * step).min(ESTIMATE_CEILING),
        };
        self.progress_percent = self.progress_percent.max(estimate);
    }
}

pub struct JobPoller {
    config: PollConfig,
}

impl JobPoller {
    /// Poller with explicit timing.
    pub fn new(config: PollConfig) -> Self {
        Self { config }
    }

    /// Poller with the default timing for `kind`.
    pub fn for_kind(kind: JobKind) -> Self {
        Self::new(PollConfig::for_kind(kind))
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Poll `job_id` until it completes, fails, runs out of attempts or time,
    /// or `cancel` fires.
    ///
    /// The timeout bounds the whole loop, including a status fetch that
    /// hangs or keeps retrying. A fetch that fails for good is reported as
    /// [`PollEvent::Failed`] before its error is returned.
    ///
    /// A status fetch already in flight when the token fires is allowed to
    /// finish; its result is discarded.
    pub async fn poll_until_done(
        &self,
        source: &dyn StatusSource,
        job_id: &str,
        kind: JobKind,
        events: Option<&UnboundedSender<PollEvent>>,
        cancel: &CancellationToken,
    ) -> Result<JobResult> {
        let started = Instant::now();
        let deadline = started + self.config.timeout;
        let mut job = PollJob {
            job_id: job_id.to_string(),
            kind,
            state: JobState::Pending,
            progress_percent: 0.0,
            attempts_made: 0,
        };
        let emit = |event: PollEvent| {
            if let Some(tx) = events {
                let _ = tx.send(event);
            }
        };

        info!(job = %job.job_id, kind = ?job.kind, "polling started");

        loop {
            if cancel.is_cancelled() {
                debug!(job = %job.job_id, "polling cancelled");
                return Err(SyncError::Cancelled);
            }

            let fetch = retry(&self.config.fetch_retry, "job status", || {
                source.fetch_status(&job.job_id)
            });
            let status = match tokio::time::timeout_at(deadline, fetch).await {
                Ok(Ok(status)) => status,
                Ok(Err(failure)) => {
                    let err = failure.into_error();
                    if cancel.is_cancelled() {
                        return Err(SyncError::Cancelled);
                    }
                    warn!(job = %job.job_id, error = %err, "status fetch failed");
                    emit(PollEvent::Failed {
                        job_id: job.job_id.clone(),
                        message: err.user_message(),
                    });
                    return Err(err);
                }
                Err(_) => return Err(self.timed_out(&job, started, &emit)),
            };

            if cancel.is_cancelled() {
                debug!(job = %job.job_id, "polling cancelled, discarding status");
                return Err(SyncError::Cancelled);
            }

            job.observe(&status, self.config.progress_step);

            match status.state {
                JobState::Completed => {
                    info!(job = %job.job_id, attempts = job.attempts_made, "job completed");
                    emit(PollEvent::Completed {
                        job_id: job.job_id.clone(),
                        url: status.url.clone(),
                        payload: status.raw.clone(),
                    });
                    return Ok(JobResult {
                        job_id: job.job_id,
                        url: status.url,
                        payload: status.raw,
                        attempts: job.attempts_made,
                    });
                }
                JobState::Failed => {
                    let message = status
                        .error
                        .unwrap_or_else(|| "remote job reported failure".to_string());
                    warn!(job = %job.job_id, %message, "job failed");
                    emit(PollEvent::Failed {
                        job_id: job.job_id.clone(),
                        message: message.clone(),
                    });
                    return Err(SyncError::JobFailed {
                        job_id: job.job_id,
                        message,
                    });
                }
                JobState::Pending | JobState::Processing => {}
            }

            emit(PollEvent::Progress {
                job_id: job.job_id.clone(),
                state: job.state,
                percent: job.progress_percent,
            });

            if job.attempts_made >= self.config.max_attempts {
                let message = format!("no terminal status after {} attempts", job.attempts_made);
                warn!(job = %job.job_id, %message, "poll attempts exhausted");
                emit(PollEvent::Failed {
                    job_id: job.job_id.clone(),
                    message: message.clone(),
                });
                return Err(SyncError::JobFailed {
                    job_id: job.job_id,
                    message,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(self.timed_out(&job, started, &emit));
            }

            let pause = self.config.interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(job = %job.job_id, "polling cancelled");
                    return Err(SyncError::Cancelled);
                }
                _ = tokio::time::sleep(pause) => {}
            }

            if Instant::now() >= deadline {
                return Err(self.timed_out(&job, started, &emit));
            }
        }
    }

    fn timed_out(&self, job: &PollJob, started: Instant, emit: &impl Fn(PollEvent)) -> SyncError {
        let elapsed = started.elapsed();
        warn!(job = %job.job_id, ?elapsed, "polling timed out");
        emit(PollEvent::TimedOut {
            job_id: job.job_id.clone(),
            elapsed,
        });
        SyncError::PollTimeout {
            job_id: job.job_id.clone(),
            elapsed,
            last_progress: job.progress_percent,
        }
    }
}
