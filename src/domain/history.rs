//! Append-only job history (spec.md §3.2).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct JobHistoryEntry {
    pub job_id: i64,
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub details: Option<String>,
}

/// History details are free text but must not grow unbounded.
pub const MAX_DETAILS_LEN: usize = 2000;

pub fn truncate_details(details: impl Into<String>) -> String {
    let mut s = details.into();
    if s.len() > MAX_DETAILS_LEN {
        s.truncate(MAX_DETAILS_LEN);
        s.push_str("...[truncated]");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_long_details() {
        let long = "a".repeat(MAX_DETAILS_LEN + 500);
        let truncated = truncate_details(long);
        assert!(truncated.len() <= MAX_DETAILS_LEN + "...[truncated]".len());
        assert!(truncated.ends_with("...[truncated]"));
    }

    #[test]
    fn leaves_short_details_untouched() {
        assert_eq!(truncate_details("ok"), "ok");
    }
}
