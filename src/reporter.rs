//! External Reporter (spec.md §4.6, part of component H).
//!
//! Builds the flat evidence bag and POSTs the terminal-state report to the
//! configured callback endpoint. Non-2xx responses are warning-logged only
//! (§6.3 — the design does not retry the external post).

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};

use crate::domain::Job;
use crate::standardize::Canonical;

const DEDUPE_CAPACITY: usize = 2048;

/// Best-effort dedupe guard for the spec's §9 OQ2: passive reconciliation
/// can re-report a job whose first report merely raced a slow dispatch
/// response. Keyed on `(job_id, status)`, FIFO-evicted.
type ReportKey = (i64, String);

#[derive(Default)]
pub struct DedupeGuard {
    seen: Mutex<(HashSet<ReportKey>, VecDeque<ReportKey>)>,
}

impl DedupeGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if this (job_id, status) was already reported and
    /// should be skipped.
    fn already_reported(&self, job_id: i64, status: &str) -> bool {
        let mut guard = self.seen.lock().unwrap();
        let key = (job_id, status.to_string());
        if guard.0.contains(&key) {
            return true;
        }
        guard.0.insert(key.clone());
        guard.1.push_back(key);
        if guard.1.len() > DEDUPE_CAPACITY {
            if let Some(evicted) = guard.1.pop_front() {
                guard.0.remove(&evicted);
            }
        }
        false
    }
}

pub struct Reporter {
    client: reqwest::Client,
    endpoint: Option<String>,
    timeout: Duration,
    dedupe: DedupeGuard,
}

impl Reporter {
    pub fn new(endpoint: Option<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            timeout,
            dedupe: DedupeGuard::new(),
        }
    }

    /// Builds and POSTs the report. `automation_status` distinguishes a
    /// worker-signalled `error` from a 2xx response carrying an inner
    /// `failure` (spec.md §9 OQ1), recorded in `JOB_EVI.automation_status`.
    pub async fn report(
        &self,
        job: &Job,
        status: &str,
        canonical: &Canonical,
        automation_status: &str,
    ) -> anyhow::Result<()> {
        let Some(endpoint) = &self.endpoint else {
            return Ok(());
        };

        if self.dedupe.already_reported(job.id, status) {
            tracing::debug!(job_id = job.id, status, "skipping duplicate external report");
            return Ok(());
        }

        let job_id = job
            .external_job_id
            .clone()
            .unwrap_or_else(|| job.id.to_string());

        let evidence = flatten_evidence_bag(job, canonical, automation_status);

        let body = json!({
            "JOB_ID": job_id,
            "FNO": job.provider.as_upper(),
            "STATUS": status,
            "STATUS_DT": Utc::now().format("%Y/%m/%d %H:%M:%S").to_string(),
            "JOB_EVI": serde_json::to_string(&evidence)?,
        });

        match self
            .client
            .post(endpoint)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
        {
            Ok(resp) if !resp.status().is_success() => {
                tracing::warn!(
                    job_id = job.id,
                    status = resp.status().as_u16(),
                    "external report rejected by callback endpoint"
                );
            }
            Err(err) => {
                tracing::warn!(job_id = job.id, error = %err, "external report POST failed");
            }
            Ok(_) => {}
        }

        Ok(())
    }
}

/// Flattens canonical + raw extras into a string->string map. Keys carry
/// provider prefixes; nested objects/arrays are recursively flattened with
/// `_`-joined keys (P6 — no nested values survive in `JOB_EVI`).
fn flatten_evidence_bag(
    job: &Job,
    canonical: &Canonical,
    automation_status: &str,
) -> std::collections::BTreeMap<String, String> {
    let mut bag = std::collections::BTreeMap::new();

    bag.insert("automation_status".to_string(), automation_status.to_string());
    bag.insert("evidence_service_found".to_string(), canonical.service_found.to_string());
    bag.insert("evidence_customer_found".to_string(), canonical.customer_found.to_string());
    bag.insert("evidence_is_active".to_string(), canonical.is_active.to_string());
    bag.insert(
        "evidence_pending_cease_order".to_string(),
        canonical.pending_cease_order.to_string(),
    );
    if let Some(date) = &canonical.cancellation_implementation_date {
        bag.insert("evidence_cancellation_implementation_date".to_string(), date.clone());
    }
    if let Some(id) = &canonical.cancellation_captured_id {
        bag.insert("evidence_cancellation_captured_id".to_string(), id.clone());
    }
    bag.insert(
        "evidence_cancellation_submitted".to_string(),
        canonical.cancellation_submitted.to_string(),
    );

    let provider_prefix = job.provider.as_str();
    flatten_value(
        &Value::Object(canonical.extras.clone()),
        &format!("{provider_prefix}_"),
        &mut bag,
    );

    flatten_value(&job.parameters, "job_param_", &mut bag);

    bag
}

fn flatten_value(value: &Value, prefix: &str, out: &mut std::collections::BTreeMap<String, String>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let key = format!("{prefix}{k}");
                match v {
                    Value::Object(_) => flatten_value(v, &format!("{key}_"), out),
                    Value::Array(items) => {
                        for (i, item) in items.iter().enumerate() {
                            flatten_value(item, &format!("{key}_{i}_"), out);
                        }
                    }
                    Value::Null => {}
                    _ => {
                        out.insert(key, scalar_to_string(v));
                    }
                }
            }
        }
        Value::Null => {}
        other => {
            out.insert(prefix.trim_end_matches('_').to_string(), scalar_to_string(other));
        }
    }
}

fn scalar_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Action, JobStatus, Provider};

    fn job() -> Job {
        Job {
            id: 1,
            external_job_id: Some("ext-1".into()),
            provider: Provider::Octotel,
            action: Action::Validation,
            parameters: json!({ "circuit_number": "FTTX1" }),
            priority: 0,
            retry_count: 0,
            max_retries: 3,
            scheduled_for: None,
            status: JobStatus::Completed,
            assigned_worker: None,
            lock_id: None,
            locked_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            evidence: None,
        }
    }

    #[test]
    fn flatten_bag_has_no_nested_values() {
        let mut canonical = Canonical::default();
        canonical.extras.insert(
            "nested".to_string(),
            json!({ "a": { "b": 1 }, "list": [1, 2] }),
        );
        let bag = flatten_evidence_bag(&job(), &canonical, "completed");
        for value in bag.values() {
            assert!(!value.trim_start().starts_with('{'));
            assert!(!value.trim_start().starts_with('['));
        }
    }

    #[test]
    fn dedupe_guard_suppresses_repeat_status() {
        let guard = DedupeGuard::new();
        assert!(!guard.already_reported(1, "completed"));
        assert!(guard.already_reported(1, "completed"));
        assert!(!guard.already_reported(1, "error"));
    }
}
