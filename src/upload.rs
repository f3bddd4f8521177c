//! Resumable chunked upload of binary assets.
//!
//! The remote protocol is offset-stateful: `start` announces the file size
//! and returns the first byte window, each `transfer` sends exactly that
//! window and receives the next one, and `finish` seals the asset. Chunks
//! are therefore sent strictly one after another.

use std::path::Path;

use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

use crate::errors::{Result, SyncError, UploadPhase};
use crate::gateway::{FilePart, Gateway};
use crate::resources::account_path;
use crate::retry::{retry, RetryFailure, RetryPolicy};

/// Emitted after every acknowledged chunk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UploadProgress {
    pub bytes_sent: u64,
    pub total_bytes: u64,
    /// `bytes_sent / total_bytes` as a percentage.
    pub percent: f64,
}

#[derive(Debug)]
struct UploadSession {
    session_id: String,
    remote_asset_id: String,
    file_size: u64,
    start_offset: u64,
    end_offset: u64,
}

impl UploadSession {
    fn is_complete(&self) -> bool {
        self.start_offset == self.end_offset
    }

    /// Accept the next window, enforcing that offsets only move forward.
    fn advance(&mut self, start: u64, end: u64) -> Result<()> {
        if start <= self.start_offset || start > end || end > self.file_size {
            return Err(SyncError::Protocol {
                message: format!(
                    "upload session {} returned window [{start}, {end}) after [{}, {}) for a {}-byte file",
                    self.session_id, self.start_offset, self.end_offset, self.file_size
                ),
            });
        }
        self.start_offset = start;
        self.end_offset = end;
        Ok(())
    }

    fn progress(&self) -> UploadProgress {
        let percent = if self.file_size == 0 {
            100.0
        } else {
            self.start_offset as f64 / self.file_size as f64 * 100.0
        };
        UploadProgress {
            bytes_sent: self.start_offset,
            total_bytes: self.file_size,
            percent,
        }
    }
}

/// Drives the start / transfer / finish protocol against an ad account's
/// video endpoint.
///
/// # Example
///
/// ```no_run
/// use graphsync::{ChunkedUpload, Gateway};
///
/// # async fn example(gateway: Gateway) -> graphsync::Result<()> {
/// let video_id = ChunkedUpload::new(gateway, "1234567890")
///     .upload_file("promo.mp4", None)
///     .await?;
/// println!("uploaded as {video_id}");
/// # Ok(())
/// # }
/// ```
pub struct ChunkedUpload {
    gateway: Gateway,
    path: String,
    policy: RetryPolicy,
}

impl ChunkedUpload {
    pub fn new(gateway: Gateway, account_id: &str) -> Self {
        Self {
            gateway,
            path: format!("/{}/advideos", account_path(account_id)),
            policy: RetryPolicy::default(),
        }
    }

    /// Override the per-step retry policy (3 attempts, 2 s apart by default).
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Read a local file and upload it. Returns the remote asset id.
    pub async fn upload_file(
        &self,
        path: impl AsRef<Path>,
        progress: Option<&UnboundedSender<UploadProgress>>,
    ) -> Result<String> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video.mp4".to_string());

        let bytes = tokio::fs::read(path).await.map_err(SyncError::Io)?;
        self.upload_bytes(&file_name, &bytes, progress).await
    }

    /// Upload an in-memory asset. Returns the remote asset id.
    pub async fn upload_bytes(
        &self,
        file_name: &str,
        data: &[u8],
        progress: Option<&UnboundedSender<UploadProgress>>,
    ) -> Result<String> {
        let mut session = self.start(data.len() as u64).await?;
        info!(
            session = %session.session_id,
            asset = %session.remote_asset_id,
            size = session.file_size,
            "upload session started"
        );

        while !session.is_complete() {
            let (start, end) = self.transfer(&session, file_name, data).await?;
            session.advance(start, end)?;
            debug!(session = %session.session_id, offset = start, "chunk acknowledged");

            if let Some(tx) = progress {
                let _ = tx.send(session.progress());
            }
        }

        let asset_id = self.finish(&session).await?;
        info!(session = %session.session_id, asset = %asset_id, "upload finished");
        Ok(asset_id)
    }

    async fn start(&self, file_size: u64) -> Result<UploadSession> {
        let params = [
            ("upload_phase", UploadPhase::Start.as_str().to_string()),
            ("file_size", file_size.to_string()),
        ];

        let value = retry(&self.policy, "upload start", || {
            self.gateway.post(&self.path, &params)
        })
        .await
        .map_err(|f| upload_failure(f, UploadPhase::Start, 0))?;

        let session_id = id_field(&value, "upload_session_id").ok_or_else(|| missing("upload_session_id"))?;
        let remote_asset_id = id_field(&value, "video_id")
            .or_else(|| id_field(&value, "id"))
            .ok_or_else(|| missing("video_id"))?;
        let start_offset = offset_field(&value, "start_offset").ok_or_else(|| missing("start_offset"))?;
        let end_offset = offset_field(&value, "end_offset").ok_or_else(|| missing("end_offset"))?;

        if start_offset > end_offset || end_offset > file_size {
            return Err(SyncError::Protocol {
                message: format!("start returned window [{start_offset}, {end_offset}) for a {file_size}-byte file"),
            });
        }

        Ok(UploadSession {
            session_id,
            remote_asset_id,
            file_size,
            start_offset,
            end_offset,
        })
    }

    /// Send the session's current window and return the next one.
    async fn transfer(&self, session: &UploadSession, file_name: &str, data: &[u8]) -> Result<(u64, u64)> {
        let chunk = &data[session.start_offset as usize..session.end_offset as usize];
        let fields = vec![
            ("upload_phase".to_string(), UploadPhase::Transfer.as_str().to_string()),
            ("upload_session_id".to_string(), session.session_id.clone()),
            ("start_offset".to_string(), session.start_offset.to_string()),
        ];
        let part = FilePart {
            field: "video_file_chunk",
            file_name: file_name.to_string(),
            bytes: chunk.to_vec(),
        };

        let value = retry(&self.policy, "upload transfer", || {
            self.gateway
                .post_multipart(&self.path, fields.clone(), part.clone())
        })
        .await
        .map_err(|f| upload_failure(f, UploadPhase::Transfer, session.start_offset))?;

        let start = offset_field(&value, "start_offset").ok_or_else(|| missing("start_offset"))?;
        let end = offset_field(&value, "end_offset").ok_or_else(|| missing("end_offset"))?;
        Ok((start, end))
    }

    async fn finish(&self, session: &UploadSession) -> Result<String> {
        let params = [
            ("upload_phase", UploadPhase::Finish.as_str().to_string()),
            ("upload_session_id", session.session_id.clone()),
        ];

        let value = retry(&self.policy, "upload finish", || {
            self.gateway.post(&self.path, &params)
        })
        .await
        .map_err(|f| upload_failure(f, UploadPhase::Finish, session.end_offset))?;

        if value.get("success").and_then(Value::as_bool) == Some(false) {
            return Err(SyncError::UploadFailed {
                phase: UploadPhase::Finish,
                offset: session.end_offset,
                attempts: 1,
                message: "finish phase reported success=false".into(),
            });
        }

        Ok(id_field(&value, "video_id")
            .or_else(|| id_field(&value, "id"))
            .unwrap_or_else(|| session.remote_asset_id.clone()))
    }
}

impl Gateway {
    /// Upload an ad image in one request. Returns the image hash used by
    /// creatives.
    pub async fn upload_image(&self, account_id: &str, file_name: &str, bytes: Vec<u8>) -> Result<String> {
        let path = format!("/{}/adimages", account_path(account_id));
        let part = FilePart {
            field: "filename",
            file_name: file_name.to_string(),
            bytes,
        };

        let value = retry(&RetryPolicy::default(), "image upload", || {
            self.post_multipart(&path, Vec::new(), part.clone())
        })
        .await
        .map_err(RetryFailure::into_error)?;

        value
            .get("images")
            .and_then(Value::as_object)
            .and_then(|images| images.values().find_map(|img| img.get("hash")))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| missing("images.*.hash"))
    }
}

fn upload_failure(failure: RetryFailure, phase: UploadPhase, offset: u64) -> SyncError {
    match failure {
        RetryFailure::Exhausted { attempts, last } => SyncError::UploadFailed {
            phase,
            offset,
            attempts,
            message: last.to_string(),
        },
        RetryFailure::Fatal(e) => e,
    }
}

fn missing(field: &str) -> SyncError {
    SyncError::Protocol {
        message: format!("upload response is missing `{field}`"),
    }
}

/// Graph returns ids and offsets as strings, occasionally as numbers.
fn id_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn offset_field(value: &Value, key: &str) -> Option<u64> {
    match value.get(key)? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}
