//! Evidence screenshots attached to a job (spec.md §3.3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Screenshot {
    pub job_id: i64,
    pub name: String,
    pub mime_type: Option<String>,
    pub description: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub image_data: String,
}

/// A raw screenshot entry as emitted by a worker inside
/// `result.screenshot_data`. Entries missing `name` or `base64_data` are
/// skipped by the persistence layer (spec.md §4.1 `save_screenshots`).
#[derive(Debug, Clone, Deserialize)]
pub struct RawScreenshot {
    pub name: Option<String>,
    pub base64_data: Option<String>,
    pub mime_type: Option<String>,
    pub description: Option<String>,
}

/// Metadata-only view returned by `GET /jobs/{id}/screenshots` when
/// `include_data=false` (the default).
#[derive(Debug, Clone, Serialize)]
pub struct ScreenshotMeta {
    pub name: String,
    pub mime_type: Option<String>,
    pub description: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl From<&Screenshot> for ScreenshotMeta {
    fn from(s: &Screenshot) -> Self {
        ScreenshotMeta {
            name: s.name.clone(),
            mime_type: s.mime_type.clone(),
            description: s.description.clone(),
            timestamp: s.timestamp,
        }
    }
}
