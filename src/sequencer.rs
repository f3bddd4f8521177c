//! Ordered execution of irreversible remote actions under a rolling quota.
//!
//! A batch is admitted or refused as a whole before anything is sent.
//! Once running, actions go out one at a time with a random pause between
//! them, and the first failure halts the batch. Executed actions are never
//! rolled back; each one is written to the persisted window immediately.

use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{Result, SyncError};
use crate::gateway::Gateway;
use crate::rate_window::{now_millis, RateWindowStore};

const COUNTDOWN_TICK: Duration = Duration::from_secs(1);

/// One side-effecting call, sent as a form-encoded POST.
#[derive(Debug, Clone)]
pub struct RemoteAction {
    pub path: String,
    pub params: Vec<(String, String)>,
    /// Short description used in progress events and logs.
    pub label: String,
}

impl RemoteAction {
    /// Form-encoded POST of `params` to `path`.
    pub fn new(path: impl Into<String>, params: Vec<(String, String)>, label: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            params,
            label: label.into(),
        }
    }

    /// Post `message` as a comment on `object_id`.
    pub fn comment(object_id: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        let label = match message.char_indices().nth(40) {
            Some((cut, _)) => format!("comment \"{}…\"", &message[..cut]),
            None => format!("comment \"{message}\""),
        };
        Self::new(
            format!("/{object_id}/comments"),
            vec![("message".to_string(), message)],
            label,
        )
    }
}

#[derive(Debug, Clone)]
pub struct SequencerConfig {
    pub limit_per_window: usize,
    pub window: Duration,
    /// Bounds of the uniformly drawn pause between consecutive actions.
    pub min_spacing: Duration,
    pub max_spacing: Duration,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            limit_per_window: 10,
            window: Duration::from_secs(24 * 60 * 60),
            min_spacing: Duration::from_secs(10),
            max_spacing: Duration::from_secs(15),
        }
    }
}

/// Live progress of a running batch. `Display` renders a status line.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    Executing {
        index: usize,
        total: usize,
        label: String,
    },
    Executed {
        index: usize,
        total: usize,
    },
    Waiting {
        next_index: usize,
        total: usize,
        remaining: Duration,
    },
    Halted {
        index: usize,
        executed: usize,
        message: String,
    },
    Finished {
        executed: usize,
        total: usize,
        cancelled: bool,
    },
}

impl fmt::Display for BatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchEvent::Executing { index, total, label } => {
                write!(f, "Posting {} of {total}: {label}", index + 1)
            }
            BatchEvent::Executed { index, total } => write!(f, "Posted {} of {total}", index + 1),
            BatchEvent::Waiting {
                next_index,
                total,
                remaining,
            } => write!(
                f,
                "Next ({} of {total}) in {}s",
                next_index + 1,
                remaining.as_secs_f64().ceil() as u64
            ),
            BatchEvent::Halted {
                index,
                executed,
                message,
            } => write!(f, "Stopped at {} after {executed} posted: {message}", index + 1),
            BatchEvent::Finished {
                executed,
                total,
                cancelled: true,
            } => write!(f, "Cancelled after {executed} of {total}"),
            BatchEvent::Finished { executed, total, .. } => write!(f, "Done: {executed} of {total}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutedAction {
    pub index: usize,
    pub label: String,
    pub response: Value,
    pub executed_at_ms: u64,
}

#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub executed: Vec<ExecutedAction>,
    pub total: usize,
    /// The caller stopped the batch before every action ran.
    pub cancelled: bool,
}

pub struct ActionSequencer {
    gateway: Gateway,
    store: RateWindowStore,
    config: SequencerConfig,
}

impl ActionSequencer {
    /// Sequencer whose quota is persisted in `store`.
    pub fn new(gateway: Gateway, store: RateWindowStore, config: SequencerConfig) -> Self {
        Self {
            gateway,
            store,
            config,
        }
    }

    pub fn config(&self) -> &SequencerConfig {
        &self.config
    }

    /// Actions that could still be executed right now.
    pub async fn remaining_quota(&self) -> Result<usize> {
        let window = self
            .store
            .load(self.config.limit_per_window, self.config.window)
            .await?;
        Ok(window.remaining_at(now_millis()))
    }

    /// Run `actions` in order.
    ///
    /// Refuses the whole batch with [`SyncError::QuotaExceeded`] if it does
    /// not fit in the window. A failed action halts the batch with
    /// [`SyncError::BatchHalted`], which carries the actions already
    /// executed. Cancellation takes effect between actions and yields an
    /// outcome with `cancelled` set.
    pub async fn run(
        &self,
        actions: Vec<RemoteAction>,
        events: Option<&UnboundedSender<BatchEvent>>,
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome> {
        let total = actions.len();
        let emit = |event: BatchEvent| {
            if let Some(tx) = events {
                let _ = tx.send(event);
            }
        };

        let mut window = self
            .store
            .load(self.config.limit_per_window, self.config.window)
            .await?;
        let now = now_millis();
        if !window.admits(total, now) {
            let remaining = window.remaining_at(now);
            warn!(requested = total, remaining, "batch refused by rolling quota");
            return Err(SyncError::QuotaExceeded {
                requested: total,
                remaining,
                retry_at_ms: window.next_slot_at(now),
            });
        }

        info!(total, "batch started");
        let mut executed: Vec<ExecutedAction> = Vec::with_capacity(total);

        for (index, action) in actions.into_iter().enumerate() {
            if index > 0 {
                let delay = self.spacing();
                if !self.countdown(delay, index, total, &emit, cancel).await {
                    return Ok(self.cancelled(executed, total, &emit));
                }
            }
            if cancel.is_cancelled() {
                return Ok(self.cancelled(executed, total, &emit));
            }

            let now = now_millis();
            if !window.admits(1, now) {
                let err = SyncError::QuotaExceeded {
                    requested: 1,
                    remaining: 0,
                    retry_at_ms: window.next_slot_at(now),
                };
                return Err(self.halt(index, executed, err, &emit));
            }

            emit(BatchEvent::Executing {
                index,
                total,
                label: action.label.clone(),
            });

            let params: Vec<(&str, String)> = action
                .params
                .iter()
                .map(|(k, v)| (k.as_str(), v.clone()))
                .collect();

            let response = match self.gateway.post(&action.path, &params).await {
                Ok(response) => response,
                Err(e) => return Err(self.halt(index, executed, e, &emit)),
            };

            let at = now_millis();
            window.record(at);
            executed.push(ExecutedAction {
                index,
                label: action.label,
                response,
                executed_at_ms: at,
            });
            debug!(index, total, "action executed");

            if let Err(e) = self.store.save(&window).await {
                return Err(self.halt(index + 1, executed, e, &emit));
            }
            emit(BatchEvent::Executed { index, total });
        }

        info!(executed = executed.len(), "batch finished");
        emit(BatchEvent::Finished {
            executed: executed.len(),
            total,
            cancelled: false,
        });
        Ok(BatchOutcome {
            executed,
            total,
            cancelled: false,
        })
    }

    fn spacing(&self) -> Duration {
        let lo = self.config.min_spacing.as_millis() as u64;
        let hi = self.config.max_spacing.as_millis() as u64;
        if hi <= lo {
            return Duration::from_millis(lo);
        }
        Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
    }

    /// Sleep for `delay`, reporting the remaining time once per tick.
    /// Returns `false` if cancelled.
    async fn countdown(
        &self,
        delay: Duration,
        next_index: usize,
        total: usize,
        emit: &impl Fn(BatchEvent),
        cancel: &CancellationToken,
    ) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            let remaining = deadline - now;
            emit(BatchEvent::Waiting {
                next_index,
                total,
                remaining,
            });
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(remaining.min(COUNTDOWN_TICK)) => {}
            }
        }
    }

    fn halt(
        &self,
        index: usize,
        executed: Vec<ExecutedAction>,
        err: SyncError,
        emit: &impl Fn(BatchEvent),
    ) -> SyncError {
        warn!(index, executed = executed.len(), error = %err, "batch halted");
        emit(BatchEvent::Halted {
            index,
            executed: executed.len(),
            message: err.user_message(),
        });
        SyncError::BatchHalted {
            index,
            executed,
            source: Box::new(err),
        }
    }

    fn cancelled(&self, executed: Vec<ExecutedAction>, total: usize, emit: &impl Fn(BatchEvent)) -> BatchOutcome {
        info!(executed = executed.len(), total, "batch cancelled");
        emit(BatchEvent::Finished {
            executed: executed.len(),
            total,
            cancelled: true,
        });
        BatchOutcome {
            executed,
            total,
            cancelled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_comments_are_truncated_in_labels() {
        let action = RemoteAction::comment("123_456", "x".repeat(100));
        assert_eq!(action.path, "/123_456/comments");
        assert_eq!(action.params[0].1.len(), 100);
        assert!(action.label.ends_with("…\""));
    }

    #[test]
    fn status_lines_are_one_based() {
        let waiting = BatchEvent::Waiting {
            next_index: 1,
            total: 3,
            remaining: Duration::from_millis(12_300),
        };
        assert_eq!(waiting.to_string(), "Next (2 of 3) in 13s");

        let halted = BatchEvent::Halted {
            index: 2,
            executed: 2,
            message: "Comment blocked".into(),
        };
        assert_eq!(halted.to_string(), "Stopped at 3 after 2 posted: Comment blocked");
    }
}
