//! Retry Controller (spec.md §4.4, component E).
//!
//! Decides whether a transiently-failed job is retried with exponential
//! backoff or pushed into its terminal error state. Mirrors the teacher's
//! `PostgresJobQueue::mark_failed`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;

use crate::domain::{Job, JobStatus};
use crate::persistence::{PersistenceLayer, StatusUpdate};

/// Outcome of a retry decision, surfaced for logging/reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Scheduled { next_attempt: i32 },
    Exhausted,
}

/// Exponential backoff: `base * 2^(attempt-1)`, matching the teacher's
/// inline `2i64.pow(n)` computation in `queue.rs`.
pub fn backoff_delay(base: std::time::Duration, attempt: i32) -> ChronoDuration {
    let exponent = (attempt.max(1) - 1) as u32;
    let factor = 2i64.saturating_pow(exponent);
    ChronoDuration::seconds(base.as_secs() as i64 * factor)
}

pub async fn handle_failure(
    store: &dyn PersistenceLayer,
    job: &Job,
    lock_id: uuid::Uuid,
    error_message: &str,
    retry_delay: std::time::Duration,
    now: DateTime<Utc>,
) -> anyhow::Result<RetryOutcome> {
    let n = job.retry_count + 1;

    if n < job.max_retries {
        let delay = ChronoDuration::from_std(retry_delay).unwrap_or(ChronoDuration::seconds(60));
        let scheduled_for = now + delay;

        let result = json!({
            "error": error_message,
            "retry": n,
            "max_retries": job.max_retries,
        });

        store
            .update_job_status(
                job.id,
                JobStatus::RetryPending,
                StatusUpdate {
                    result: Some(result),
                    evidence: None,
                    assigned_worker: None,
                    retry_count: Some(n),
                    scheduled_for: Some(scheduled_for),
                },
                Some(format!("retry {n}/{}: {error_message}", job.max_retries)),
            )
            .await?;
        store.release_lock(job.id, lock_id, JobStatus::RetryPending).await?;

        Ok(RetryOutcome::Scheduled { next_attempt: n })
    } else {
        let result = json!({
            "error": error_message,
            "retries_exhausted": true,
        });

        store
            .update_job_status(
                job.id,
                JobStatus::Error,
                StatusUpdate {
                    result: Some(result),
                    evidence: None,
                    assigned_worker: None,
                    retry_count: Some(n),
                    scheduled_for: None,
                },
                Some(format!("retries exhausted: {error_message}")),
            )
            .await?;
        store.release_lock(job.id, lock_id, JobStatus::Error).await?;

        Ok(RetryOutcome::Exhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially() {
        let base = std::time::Duration::from_secs(60);
        assert_eq!(backoff_delay(base, 1), ChronoDuration::seconds(60));
        assert_eq!(backoff_delay(base, 2), ChronoDuration::seconds(120));
        assert_eq!(backoff_delay(base, 3), ChronoDuration::seconds(240));
    }
}
