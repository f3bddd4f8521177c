use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::errors::SyncError;

/// Fixed-delay retry policy for single steps of a multi-step protocol.
///
/// `max_attempts` counts the first try, so a policy of 3 allows two retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(2))
    }
}

/// Why [`retry`] gave up.
#[derive(Debug)]
pub enum RetryFailure {
    /// Every attempt failed with a transient error; `last` is the final one.
    Exhausted { attempts: u32, last: SyncError },
    /// A non-transient error that retrying cannot fix.
    Fatal(SyncError),
}

impl RetryFailure {
    pub fn into_error(self) -> SyncError {
        match self {
            RetryFailure::Exhausted { last, .. } => last,
            RetryFailure::Fatal(e) => e,
        }
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// policy's attempts are used up.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> std::result::Result<T, RetryFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let max = policy.max_attempts();
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(RetryFailure::Fatal(e)),
            Err(e) if attempt >= max => {
                return Err(RetryFailure::Exhausted {
                    attempts: attempt,
                    last: e,
                })
            }
            Err(e) => {
                warn!(what, attempt, max, error = %e, "transient failure, retrying");
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> SyncError {
        SyncError::TransientServer {
            message: "blip".into(),
            status: Some(500),
            code: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_two_transient_failures() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let policy = RetryPolicy::default();

        let out = retry(&policy, "test", move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(transient())
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();

        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let policy = RetryPolicy::fixed(3, Duration::from_secs(2));

        let err = retry(&policy, "test", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(transient())
        })
        .await
        .unwrap_err();

        assert!(matches!(err, RetryFailure::Exhausted { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let err = retry(&RetryPolicy::default(), "test", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(SyncError::Validation {
                message: "nope".into(),
                field: None,
            })
        })
        .await
        .unwrap_err();

        assert!(matches!(err, RetryFailure::Fatal(SyncError::Validation { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
