//! Environment-driven configuration (spec.md §6.4).

use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub database_url: String,

    pub worker_endpoints: Vec<String>,
    pub worker_timeout: Duration,
    pub max_workers: usize,
    pub batch_size: i64,

    pub max_retry_attempts: i32,
    pub retry_delay: Duration,

    pub job_poll_interval: Duration,
    pub worker_poll_interval: Duration,
    pub metrics_interval: Duration,
    pub stale_lease_interval: Duration,
    pub cleanup_hour: u32,
    pub health_report_interval: Option<Duration>,

    pub callback_endpoint: Option<String>,
    pub callback_timeout: Duration,

    pub evidence_retention_days: i64,
    pub evidence_dir: String,

    pub stale_lease_max_age: Duration,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_secs(key: &str, default: u64) -> Result<Duration> {
    let raw = env_or(key, &default.to_string());
    let secs: u64 = raw
        .parse()
        .with_context(|| format!("{key} must be a non-negative integer number of seconds"))?;
    Ok(Duration::from_secs(secs))
}

impl Config {
    /// Load configuration from environment variables, falling back to a
    /// `.env` file in development (mirrors the teacher's `Config::from_env`).
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let worker_endpoints = env::var("WORKER_ENDPOINTS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self {
            host: env_or("ORCHESTRATOR_HOST", "0.0.0.0"),
            port: env_or("ORCHESTRATOR_PORT", "8000")
                .parse()
                .context("ORCHESTRATOR_PORT must be a valid port number")?,

            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,

            worker_endpoints,
            worker_timeout: parse_secs("WORKER_TIMEOUT", 30)?,
            max_workers: env_or("MAX_WORKERS", "5")
                .parse()
                .context("MAX_WORKERS must be a positive integer")?,
            batch_size: env_or("BATCH_SIZE", "10")
                .parse()
                .context("BATCH_SIZE must be a positive integer")?,

            max_retry_attempts: env_or("MAX_RETRY_ATTEMPTS", "3")
                .parse()
                .context("MAX_RETRY_ATTEMPTS must be an integer")?,
            retry_delay: parse_secs("RETRY_DELAY", 60)?,

            job_poll_interval: parse_secs("JOB_POLL_INTERVAL", 5)?,
            worker_poll_interval: parse_secs("WORKER_POLL_INTERVAL", 5)?,
            metrics_interval: parse_secs("METRICS_INTERVAL", 60)?,
            stale_lease_interval: parse_secs("STALE_LEASE_INTERVAL", 600)?,
            cleanup_hour: env_or("CLEANUP_HOUR", "3")
                .parse()
                .context("CLEANUP_HOUR must be 0-23")?,
            health_report_interval: match env::var("HEALTH_REPORT_INTERVAL") {
                Ok(v) => Some(Duration::from_secs(
                    v.parse().context("HEALTH_REPORT_INTERVAL must be seconds")?,
                )),
                Err(_) => None,
            },

            callback_endpoint: env::var("CALLBACK_ENDPOINT").ok(),
            callback_timeout: parse_secs("CALLBACK_TIMEOUT", 10)?,

            evidence_retention_days: env_or("EVIDENCE_RETENTION_DAYS", "30")
                .parse()
                .context("EVIDENCE_RETENTION_DAYS must be an integer")?,
            evidence_dir: env_or("EVIDENCE_DIR", "./data/evidence"),

            stale_lease_max_age: parse_secs("STALE_LEASE_MAX_AGE", 1800)?,
        })
    }
}
