//! Status Mapper (spec.md §4.5, component H): maps a canonical result plus
//! job outcome to one of a fixed external status vocabulary.

use crate::domain::{Action, JobStatus};
use crate::standardize::Canonical;

/// Failure kinds the dispatcher/retry path can classify, feeding the
/// error-variant branch of the decision table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    PortalError,
    AuthError,
    NetworkError,
    SystemError,
}

impl FailureKind {
    fn label(self) -> &'static str {
        match self {
            FailureKind::Timeout => "Timeout",
            FailureKind::PortalError => "Portal Error",
            FailureKind::AuthError => "Auth Error",
            FailureKind::NetworkError => "Network Error",
            FailureKind::SystemError => "System Error",
        }
    }
}

/// Classifies a failed worker response into one of the known failure
/// kinds by keyword-matching its error/message text (spec.md §4.5 "known"
/// failure kinds: timeout, portal unresponsive, login, network, driver).
/// Returns `None` when nothing recognizable is present, in which case the
/// caller falls back to the generic `Validation`/`Delete Error` label.
pub fn classify_failure_kind(body: &serde_json::Value) -> Option<FailureKind> {
    let text = body.to_string().to_lowercase();

    if text.contains("timeout") || text.contains("timed out") {
        Some(FailureKind::Timeout)
    } else if text.contains("login") || text.contains("auth") || text.contains("credential") {
        Some(FailureKind::AuthError)
    } else if text.contains("network") || text.contains("connection") || text.contains("dns") {
        Some(FailureKind::NetworkError)
    } else if text.contains("driver") || text.contains("browser") || text.contains("webdriver") || text.contains("selenium") {
        Some(FailureKind::SystemError)
    } else if text.contains("portal") || text.contains("unresponsive") || text.contains("unavailable") {
        Some(FailureKind::PortalError)
    } else {
        None
    }
}

/// Applies the §4.5 decision table top-down.
///
/// `reached_completed` is whether the job's terminal status is `completed`
/// (a "failed"/"error" terminal status fails the precondition even when
/// `canonical` carries partial data, e.g. from a worker that returned
/// some fields alongside its failure signal).
pub fn map_status(
    status: JobStatus,
    action: Action,
    canonical: &Canonical,
    failure_kind: Option<FailureKind>,
) -> String {
    let reached_completed = matches!(status, JobStatus::Completed);

    if !reached_completed {
        if let Some(kind) = failure_kind {
            let verb = if action.is_cancellation() { "Delete" } else { "Validation" };
            return format!("Bitstream {verb} {}", kind.label());
        }
        return match action {
            Action::Validation => "Bitstream Validation Error".to_string(),
            Action::Cancellation => "Bitstream Delete Error".to_string(),
        };
    }

    if !canonical.service_found {
        return "Bitstream Not Found".to_string();
    }

    if canonical.pending_cease_order {
        return "Bitstream Cancellation Pending".to_string();
    }

    if canonical.cancellation_implementation_date.is_some() {
        return "Bitstream Already Cancelled".to_string();
    }

    if canonical.cancellation_captured_id.is_some() && !canonical.is_active {
        return "Bitstream Already Cancelled".to_string();
    }

    if canonical.cancellation_submitted && canonical.cancellation_captured_id.is_some() {
        return "Bitstream Cancellation Pending".to_string();
    }

    if canonical.is_active {
        return "Bitstream Validated".to_string();
    }

    if canonical.cancellation_captured_id.is_some() {
        return "Bitstream Already Cancelled".to_string();
    }

    if let Some(v) = canonical.extras.get("verification_status").and_then(|v| v.as_str()) {
        if v.eq_ignore_ascii_case("unverified") {
            return "Bitstream Verification Pending".to_string();
        }
    }
    if let Some(v) = canonical.extras.get("isp_provisioned").and_then(|v| v.as_str()) {
        if v.eq_ignore_ascii_case("no") {
            return "Bitstream ISP Provisioning Pending".to_string();
        }
    }

    if canonical.service_found {
        return "Bitstream Validated".to_string();
    }

    "Bitstream Status Unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canonical(service_found: bool, is_active: bool) -> Canonical {
        Canonical {
            service_found,
            is_active,
            ..Default::default()
        }
    }

    #[test]
    fn incomplete_validation_maps_to_validation_error() {
        let status = map_status(
            JobStatus::Error,
            Action::Validation,
            &Canonical::default(),
            None,
        );
        assert_eq!(status, "Bitstream Validation Error");
    }

    #[test]
    fn incomplete_cancellation_maps_to_delete_error() {
        let status = map_status(
            JobStatus::Error,
            Action::Cancellation,
            &Canonical::default(),
            None,
        );
        assert_eq!(status, "Bitstream Delete Error");
    }

    #[test]
    fn service_not_found_wins_over_active() {
        let status = map_status(JobStatus::Completed, Action::Validation, &canonical(false, true), None);
        assert_eq!(status, "Bitstream Not Found");
    }

    #[test]
    fn active_service_is_validated() {
        let status = map_status(JobStatus::Completed, Action::Validation, &canonical(true, true), None);
        assert_eq!(status, "Bitstream Validated");
    }

    #[test]
    fn pending_cease_order_wins_over_active() {
        let c = Canonical {
            pending_cease_order: true,
            ..canonical(true, true)
        };
        assert_eq!(
            map_status(JobStatus::Completed, Action::Validation, &c, None),
            "Bitstream Cancellation Pending"
        );
    }

    #[test]
    fn decision_is_deterministic() {
        let c = canonical(true, false);
        let a = map_status(JobStatus::Completed, Action::Cancellation, &c, None);
        let b = map_status(JobStatus::Completed, Action::Cancellation, &c, None);
        assert_eq!(a, b);
    }

    #[test]
    fn known_failure_kind_produces_specific_variant() {
        let status = map_status(
            JobStatus::Error,
            Action::Validation,
            &Canonical::default(),
            Some(FailureKind::Timeout),
        );
        assert_eq!(status, "Bitstream Validation Timeout");
    }

    #[test]
    fn classify_failure_kind_recognizes_known_keywords() {
        assert_eq!(
            classify_failure_kind(&serde_json::json!({ "error": "connection timed out" })),
            Some(FailureKind::Timeout)
        );
        assert_eq!(
            classify_failure_kind(&serde_json::json!({ "result": { "error": "login failed: bad credentials" } })),
            Some(FailureKind::AuthError)
        );
        assert_eq!(
            classify_failure_kind(&serde_json::json!({ "error": "network unreachable" })),
            Some(FailureKind::NetworkError)
        );
        assert_eq!(
            classify_failure_kind(&serde_json::json!({ "error": "webdriver crashed" })),
            Some(FailureKind::SystemError)
        );
        assert_eq!(
            classify_failure_kind(&serde_json::json!({ "error": "portal unresponsive" })),
            Some(FailureKind::PortalError)
        );
        assert_eq!(classify_failure_kind(&serde_json::json!({ "error": "unexpected" })), None);
    }
}
