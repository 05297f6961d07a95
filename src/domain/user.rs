//! Bearer-token auth user (spec.md §3.5).
//!
//! Authentication itself is out of scope for this crate (spec.md §1); this
//! model exists only because `api_users` shares the same transactional
//! store as the job-queue and metrics tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub disabled: bool,
    pub last_login: Option<DateTime<Utc>>,
}
