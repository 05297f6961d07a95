//! Worker Directory (spec.md §4.3): tracks configured worker endpoints,
//! health-probes them, and selects one per dispatch.

use std::time::Duration;

/// Replaces the trailing `/execute` path segment with `/health`.
/// Pure string manipulation (not full URL parsing) so query-less worker
/// base URLs pass through verbatim.
fn health_url(execute_url: &str) -> String {
    match execute_url.rsplit_once("/execute") {
        Some((base, rest)) => format!("{base}/health{rest}"),
        None => format!("{}/health", execute_url.trim_end_matches('/')),
    }
}

/// Replaces the trailing `/execute` path segment with `/status/<job_id>`.
pub fn status_url(execute_url: &str, job_id: i64) -> String {
    match execute_url.rsplit_once("/execute") {
        Some((base, rest)) => format!("{base}/status/{job_id}{rest}"),
        None => format!("{}/status/{job_id}", execute_url.trim_end_matches('/')),
    }
}

pub struct WorkerDirectory {
    client: reqwest::Client,
    endpoints: Vec<String>,
    probe_timeout: Duration,
}

impl WorkerDirectory {
    pub fn new(endpoints: Vec<String>, probe_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoints,
            probe_timeout,
        }
    }

    pub fn configured_endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Probes every configured endpoint's health sibling concurrently.
    /// Returns the subset that answered 2xx within the timeout; falls
    /// back to the full configured list if none answered.
    pub async fn available_pool(&self) -> Vec<String> {
        if self.endpoints.is_empty() {
            return Vec::new();
        }

        let probes = self.endpoints.iter().map(|ep| {
            let client = self.client.clone();
            let url = health_url(ep);
            let timeout = self.probe_timeout;
            let ep = ep.clone();
            async move {
                let ok = tokio::time::timeout(timeout, client.get(&url).send())
                    .await
                    .ok()
                    .and_then(|r| r.ok())
                    .map(|resp| resp.status().is_success())
                    .unwrap_or(false);
                (ep, ok)
            }
        });

        let results = futures::future::join_all(probes).await;
        let healthy: Vec<String> = results
            .into_iter()
            .filter_map(|(ep, ok)| ok.then_some(ep))
            .collect();

        if healthy.is_empty() {
            self.endpoints.clone()
        } else {
            healthy
        }
    }

    /// Deterministic round-robin seeded by job id, stable across repeated
    /// dispatches of the same job but spreading load across jobs overall.
    pub fn select(pool: &[String], job_id: i64) -> Option<&String> {
        if pool.is_empty() {
            return None;
        }
        let idx = (job_id.rem_euclid(pool.len() as i64)) as usize;
        pool.get(idx)
    }
}
