//! Status sources for the two kinds of long-running media jobs: renders on
//! the media-generation API and transcoding of uploaded Graph videos.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SyncError};
use crate::gateway::Gateway;
use crate::poller::{JobState, JobStatus, StatusSource};

/// Client for a media-generation job API: a create call returns a job id
/// immediately and `GET /jobs/{id}` reports
/// `{done, status, progress?, url?, message?}`. A body carrying an `error`
/// marker is a failed request, not a failed job, and is classified as such.
///
/// The gateway should be built with [`AuthPlacement::Header`](crate::AuthPlacement)
/// and an empty API version.
#[derive(Clone)]
pub struct MediaJobs {
    gateway: Gateway,
}

impl MediaJobs {
    pub fn new(gateway: Gateway) -> Self {
        Self { gateway }
    }

    /// Start a job at `path` (for example `/videos` or `/images`) and
    /// return its identifier.
    pub async fn create(&self, path: &str, payload: Value) -> Result<String> {
        let value = self.gateway.post_json(path, payload).await?;
        let job_id = ["id", "job_id", "jobId"]
            .iter()
            .find_map(|k| value.get(*k))
            .and_then(|v| match v {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .ok_or_else(|| SyncError::Protocol {
                message: format!("{path}: create response has no job id"),
            })?;
        debug!(path, job = %job_id, "media job created");
        Ok(job_id)
    }
}

#[async_trait]
impl StatusSource for MediaJobs {
    async fn fetch_status(&self, job_id: &str) -> Result<JobStatus> {
        let value = self.gateway.get(&format!("/jobs/{job_id}"), &[]).await?;
        Ok(media_status(value))
    }
}

fn media_status(raw: Value) -> JobStatus {
    let done = raw.get("done").and_then(Value::as_bool).unwrap_or(false);
    let mut state = raw
        .get("status")
        .and_then(Value::as_str)
        .map(JobState::parse)
        .unwrap_or(JobState::Processing);
    if done && !state.is_terminal() {
        state = JobState::Completed;
    }

    let error = (state == JobState::Failed).then(|| {
        ["failure_reason", "message"]
            .iter()
            .find_map(|k| raw.get(*k).and_then(Value::as_str))
            .unwrap_or("media generation failed")
            .to_string()
    });

    JobStatus {
        state,
        progress: raw.get("progress").and_then(Value::as_f64),
        url: raw.get("url").and_then(Value::as_str).map(str::to_string),
        error,
        raw,
    }
}

/// Reports whether an uploaded Graph video has finished transcoding and can
/// be attached to a creative.
#[derive(Clone)]
pub struct VideoReadiness {
    gateway: Gateway,
}

impl VideoReadiness {
    pub fn new(gateway: Gateway) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl StatusSource for VideoReadiness {
    async fn fetch_status(&self, video_id: &str) -> Result<JobStatus> {
        let value = self
            .gateway
            .get(&format!("/{video_id}"), &[("fields", "status,source".to_string())])
            .await?;
        Ok(video_status(value))
    }
}

fn video_status(raw: Value) -> JobStatus {
    let status = raw.get("status");
    let video_status = status
        .and_then(|s| s.get("video_status"))
        .and_then(Value::as_str)
        .unwrap_or("processing");

    let state = match video_status {
        "ready" => JobState::Completed,
        "error" => JobState::Failed,
        _ => JobState::Processing,
    };

    let error = (state == JobState::Failed).then(|| {
        status
            .and_then(|s| s.get("processing_phase"))
            .and_then(|p| p.get("errors"))
            .and_then(|e| e.get(0))
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("video processing failed")
            .to_string()
    });

    JobStatus {
        state,
        progress: status
            .and_then(|s| s.get("processing_progress"))
            .and_then(Value::as_f64),
        url: raw.get("source").and_then(Value::as_str).map(str::to_string),
        error,
        raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn done_flag_without_status_is_completed() {
        let s = media_status(json!({"done": true, "url": "https://cdn/x.mp4"}));
        assert_eq!(s.state, JobState::Completed);
        assert_eq!(s.url.as_deref(), Some("https://cdn/x.mp4"));
    }

    #[test]
    fn failed_status_carries_reason() {
        let s = media_status(json!({"done": true, "status": "failed", "failure_reason": "content policy"}));
        assert_eq!(s.state, JobState::Failed);
        assert_eq!(s.error.as_deref(), Some("content policy"));
    }

    #[test]
    fn processing_reports_remote_progress() {
        let s = media_status(json!({"done": false, "status": "processing", "progress": 42}));
        assert_eq!(s.state, JobState::Processing);
        assert_eq!(s.progress, Some(42.0));
    }

    #[test]
    fn video_ready_and_error_states() {
        let ready = video_status(json!({
            "id": "v1",
            "status": {"video_status": "ready", "processing_progress": 100},
            "source": "https://video.example/v1.mp4"
        }));
        assert_eq!(ready.state, JobState::Completed);
        assert_eq!(ready.url.as_deref(), Some("https://video.example/v1.mp4"));

        let failed = video_status(json!({
            "status": {
                "video_status": "error",
                "processing_phase": {"errors": [{"message": "Unsupported codec"}]}
            }
        }));
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.error.as_deref(), Some("Unsupported codec"));
    }
}
