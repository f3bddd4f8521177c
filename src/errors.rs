use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::sequencer::ExecutedAction;

/// Phase of the resumable upload protocol in which a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    Start,
    Transfer,
    Finish,
}

impl UploadPhase {
    /// Value of the `upload_phase` form field.
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadPhase::Start => "start",
            UploadPhase::Transfer => "transfer",
            UploadPhase::Finish => "finish",
        }
    }
}

impl fmt::Display for UploadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every failure the synchronization layer can report.
///
/// The first group is produced once by the response classifier; downstream
/// components match on these variants and never look at raw payloads again.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The access token is invalid or has expired.
    #[error("session expired: {message}")]
    AuthExpired { message: String },

    /// A silent refresh was attempted and the replayed call was rejected again.
    #[error("session expired after refresh: {message}")]
    SessionExpired { message: String },

    /// The remote side is throttling this app, user, or ad account.
    #[error("rate limited (retry after {retry_after:?}): {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// The request was rejected with a user-facing explanation.
    #[error("{message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// The app or account is not set up for this operation. Waiting will not help.
    #[error("configuration error: {message} ({remediation})")]
    Configuration { message: String, remediation: String },

    /// Any other failure reported by the remote side.
    #[error("server error: {message}")]
    TransientServer {
        message: String,
        status: Option<u16>,
        code: Option<i64>,
    },

    /// The chunked upload was abandoned.
    #[error("upload failed during {phase} at offset {offset} after {attempts} attempt(s): {message}")]
    UploadFailed {
        phase: UploadPhase,
        offset: u64,
        attempts: u32,
        message: String,
    },

    /// Polling exceeded its wall-clock budget.
    #[error("job {job_id} did not finish within {elapsed:?} (last progress {last_progress:.0}%)")]
    PollTimeout {
        job_id: String,
        elapsed: Duration,
        last_progress: f64,
    },

    /// The remote job reached a failed state, or never reached a terminal one.
    #[error("job {job_id} failed: {message}")]
    JobFailed { job_id: String, message: String },

    /// A batch was refused up front because it would exceed the rolling quota.
    #[error("quota exceeded: {requested} action(s) requested, {remaining} remaining in window")]
    QuotaExceeded {
        requested: usize,
        remaining: usize,
        retry_at_ms: Option<u64>,
    },

    /// A batch stopped at `index`. `executed` holds the actions that had
    /// already gone through, with their remote responses.
    #[error("batch halted at action {index} ({} executed): {source}", .executed.len())]
    BatchHalted {
        index: usize,
        executed: Vec<ExecutedAction>,
        #[source]
        source: Box<SyncError>,
    },

    /// The caller stopped the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// A successful response whose payload did not have the expected shape.
    #[error("unexpected response: {message}")]
    Protocol { message: String },

    /// A transport-level HTTP error from reqwest.
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// An I/O error, typically from reading a local file or the rate window store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

const GENERIC_FAILURE: &str = "Sync failed, please retry.";

impl SyncError {
    /// Whether a bounded local retry is a legitimate correction for this error.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::TransientServer { .. } => true,
            SyncError::Http(e) => !e.is_builder() && !e.is_decode(),
            _ => false,
        }
    }

    pub fn is_auth_expired(&self) -> bool {
        matches!(self, SyncError::AuthExpired { .. })
    }

    /// Text suitable for showing to an end user.
    ///
    /// Rate-limit and validation messages are passed through verbatim, since
    /// they usually tell the user what to do. Everything else collapses to a
    /// generic retry prompt; the full error is logged separately.
    pub fn user_message(&self) -> String {
        match self {
            SyncError::RateLimited {
                message,
                retry_after: Some(wait),
            } => {
                let minutes = wait.as_secs().div_ceil(60).max(1);
                format!("{message} Try again in {minutes} minute(s).")
            }
            SyncError::RateLimited { message, .. } => message.clone(),
            SyncError::Validation { message, .. } => message.clone(),
            SyncError::Configuration { remediation, .. } => remediation.clone(),
            SyncError::QuotaExceeded { remaining, .. } => {
                format!("Daily limit reached. {remaining} action(s) left in the current window.")
            }
            SyncError::BatchHalted { source, .. } => source.user_message(),
            SyncError::AuthExpired { .. } | SyncError::SessionExpired { .. } => {
                "Your session has expired. Please log in again.".to_string()
            }
            _ => GENERIC_FAILURE.to_string(),
        }
    }
}

/// A convenience alias for `Result<T, SyncError>`.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_is_shown_verbatim() {
        let err = SyncError::Validation {
            message: "Image hash invalid, please re-upload the image.".into(),
            field: None,
        };
        assert_eq!(
            err.user_message(),
            "Image hash invalid, please re-upload the image."
        );
    }

    #[test]
    fn rate_limit_message_includes_wait_hint() {
        let err = SyncError::RateLimited {
            message: "Too many calls.".into(),
            retry_after: Some(Duration::from_secs(150)),
        };
        assert_eq!(err.user_message(), "Too many calls. Try again in 3 minute(s).");
    }

    #[test]
    fn server_errors_collapse_to_generic_text() {
        let err = SyncError::TransientServer {
            message: "An unknown error occurred".into(),
            status: Some(500),
            code: Some(1),
        };
        assert!(err.is_transient());
        assert_eq!(err.user_message(), GENERIC_FAILURE);
    }

    #[test]
    fn halted_batch_reports_underlying_message() {
        let err = SyncError::BatchHalted {
            index: 2,
            executed: Vec::new(),
            source: Box::new(SyncError::Validation {
                message: "Comment is too long.".into(),
                field: Some("message".into()),
            }),
        };
        assert_eq!(err.user_message(), "Comment is too long.");
        assert!(!err.is_transient());
    }
}
