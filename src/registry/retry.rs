//! Retry policy for registry operations
//!
//! Transient failures (connection resets, 5xx, 429) are retried with
//! exponential backoff bounded by an optional per-build deadline. A 429
//! defers by the server's `Retry-After`. 4xx responses other than 401/429
//! are never retried.

use std::future::Future;
use std::time::{Duration, Instant};

use reqwest::StatusCode;

use crate::error::{BuilderError, Result};
use crate::logging::Logger;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Absolute cutoff for the whole build, when configured
    pub deadline: Option<Instant>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            deadline: None,
        }
    }
}

impl RetryPolicy {
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        (self.initial_backoff * factor).min(self.max_backoff)
    }
}

/// Whether a response status is worth retrying.
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// Build the `Transient` error for a retryable response.
pub fn transient_from_status(
    operation: &str,
    status: StatusCode,
    retry_after: Option<u64>,
) -> BuilderError {
    BuilderError::Transient {
        operation: operation.to_string(),
        reason: format!("registry answered {}", status),
        retry_after,
    }
}

/// Run `operation`, retrying transient errors with exponential backoff.
pub async fn with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    output: &Logger,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => err,
            Err(err) => return Err(err),
        };

        let retry_after = match &err {
            BuilderError::Transient { retry_after, .. } => *retry_after,
            _ => None,
        };
        let wait = retry_after
            .map(Duration::from_secs)
            .unwrap_or_else(|| policy.backoff_for(attempt));

        if let Some(deadline) = policy.deadline {
            if Instant::now() + wait >= deadline {
                output.warning(&format!(
                    "{} still failing at the build deadline; giving up",
                    operation_name
                ));
                return Err(err);
            }
        }

        output.detail(&format!(
            "{} failed ({}); retry {}/{} in {:.1}s",
            operation_name,
            err,
            attempt,
            policy.max_attempts - 1,
            wait.as_secs_f64()
        ));
        tokio::time::sleep(wait).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn transient_statuses() {
        assert!(is_transient_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_transient_status(StatusCode::BAD_GATEWAY));
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
        assert!(!is_transient_status(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(1));
        assert_eq!(policy.backoff_for(3), Duration::from_secs(2));
        assert_eq!(policy.backoff_for(10), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let result = with_retries(&policy, "probe", &Logger::new_quiet(), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(transient_from_status(
                    "probe",
                    StatusCode::SERVICE_UNAVAILABLE,
                    None,
                ))
            } else {
                Ok(42)
            }
        })
        .await
        .expect("succeeds");
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let err = with_retries::<u32, _, _>(&policy, "pull", &Logger::new_quiet(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(BuilderError::ManifestNotFound {
                repository: "r".to_string(),
                reference: "t".to_string(),
            })
        })
        .await
        .expect_err("fails");
        assert!(matches!(err, BuilderError::ManifestNotFound { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let err = with_retries::<u32, _, _>(&policy, "push", &Logger::new_quiet(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(transient_from_status("push", StatusCode::BAD_GATEWAY, None))
        })
        .await
        .expect_err("fails");
        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), policy.max_attempts);
    }
}
