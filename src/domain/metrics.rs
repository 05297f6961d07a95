//! Periodic system metric snapshots (spec.md §3.4).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMetricSample {
    pub timestamp: DateTime<Utc>,
    pub queued: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    /// worker execute-URL -> liveness status string ("up" / "down" / probe error)
    pub worker_status: HashMap<String, String>,
}
