//! Job model and state machine for the dispatch/retry pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Closed set of third-party fibre-network-operator portals this
/// orchestrator is allowed to target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "provider", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Mfn,
    Osn,
    Octotel,
    Evotel,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Mfn => "mfn",
            Provider::Osn => "osn",
            Provider::Octotel => "octotel",
            Provider::Evotel => "evotel",
        }
    }

    /// Upper-cased form used in external reports (`FNO` field).
    pub fn as_upper(&self) -> &'static str {
        match self {
            Provider::Mfn => "MFN",
            Provider::Osn => "OSN",
            Provider::Octotel => "OCTOTEL",
            Provider::Evotel => "EVOTEL",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The action a job asks a provider's portal to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_action", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Validation,
    Cancellation,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Validation => "validation",
            Action::Cancellation => "cancellation",
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Action::Cancellation)
    }
}

/// Job lifecycle state machine (spec.md §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    RetryPending,
    Dispatching,
    Running,
    Completed,
    Failed,
    Error,
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses never transition further (P2 — terminal stickiness).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Error | JobStatus::Cancelled
        )
    }

    /// States from which an API-initiated cancellation is accepted.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            JobStatus::Pending
                | JobStatus::Dispatching
                | JobStatus::RetryPending
                | JobStatus::Running
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::RetryPending => "retry_pending",
            JobStatus::Dispatching => "dispatching",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Error => "error",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// A job submitted by a client, its scheduling metadata, and its current
/// lease/outcome state.
///
/// See spec.md §3.1 for the field-by-field invariants. `lock_id` is
/// non-null iff `locked_at` is non-null; terminal statuses always carry a
/// non-null `completed_at` and a null `lock_id`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Job {
    pub id: i64,
    pub external_job_id: Option<String>,

    pub provider: Provider,
    pub action: Action,
    pub parameters: serde_json::Value,

    pub priority: i16,
    pub retry_count: i32,
    pub max_retries: i32,
    pub scheduled_for: Option<DateTime<Utc>>,

    pub status: JobStatus,
    pub assigned_worker: Option<String>,
    pub lock_id: Option<Uuid>,
    pub locked_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub result: Option<serde_json::Value>,
    pub evidence: Option<Vec<String>>,
}

/// Fields a client supplies when creating a job (spec.md §4.9 `POST /jobs`).
#[derive(Debug, Clone, Deserialize)]
pub struct JobDescriptor {
    pub external_job_id: Option<String>,
    pub provider: Provider,
    pub action: Action,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default = "default_priority")]
    pub priority: i16,
    #[serde(default)]
    pub max_retries: Option<i32>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

fn default_priority() -> i16 {
    0
}

pub const DEFAULT_MAX_RETRIES: i32 = 3;

impl Job {
    /// Whether this job is ready to be dispatched right now: `pending`, or
    /// `retry_pending` whose backoff has elapsed.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        if self.lock_id.is_some() {
            return false;
        }
        match self.status {
            JobStatus::Pending => true,
            JobStatus::RetryPending => self.scheduled_for.map(|t| t <= now).unwrap_or(true),
            _ => false,
        }
    }
}
