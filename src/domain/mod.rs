//! Core data model: jobs, history, screenshots, metrics, users.

pub mod history;
pub mod job;
pub mod metrics;
pub mod screenshot;
pub mod user;

pub use history::JobHistoryEntry;
pub use job::{Action, Job, JobDescriptor, JobStatus, Provider, DEFAULT_MAX_RETRIES};
pub use metrics::SystemMetricSample;
pub use screenshot::{RawScreenshot, Screenshot, ScreenshotMeta};
pub use user::User;
