//! Result Standardizer (spec.md §4.5, component G).
//!
//! Raw per-provider automation payloads are opaque JSON — providers are
//! external black boxes, so each is modeled as a tagged variant wrapping
//! `serde_json::Value` (spec.md §9 "Sum-typed per-provider shapes"), with
//! one `extract_canonical` function per variant reading fields defensively.

use serde::Serialize;
use serde_json::Value;

use crate::domain::Provider;

/// Canonical, provider-agnostic view of an automation result (spec.md §4.5).
#[derive(Debug, Clone, Default, Serialize)]
pub struct Canonical {
    pub service_found: bool,
    pub customer_found: bool,
    pub is_active: bool,
    pub pending_cease_order: bool,
    pub cancellation_implementation_date: Option<String>,
    pub cancellation_captured_id: Option<String>,
    pub cancellation_submitted: bool,
    /// Provider-specific extras kept for reporting only (§6.3), not used
    /// by the status mapper.
    pub extras: serde_json::Map<String, Value>,
}

/// Raw automation output tagged by the provider that produced it.
#[derive(Debug, Clone)]
pub enum RawProviderResult {
    Mfn(Value),
    Osn(Value),
    Octotel(Value),
    Evotel(Value),
}

impl RawProviderResult {
    pub fn for_provider(provider: Provider, raw: Value) -> Self {
        match provider {
            Provider::Mfn => RawProviderResult::Mfn(raw),
            Provider::Osn => RawProviderResult::Osn(raw),
            Provider::Octotel => RawProviderResult::Octotel(raw),
            Provider::Evotel => RawProviderResult::Evotel(raw),
        }
    }

    pub fn extract_canonical(&self) -> Canonical {
        match self {
            RawProviderResult::Mfn(v) => extract_mfn(v),
            RawProviderResult::Osn(v) => extract_osn(v),
            RawProviderResult::Octotel(v) => extract_octotel(v),
            RawProviderResult::Evotel(v) => extract_evotel(v),
        }
    }
}

fn get<'a>(v: &'a Value, key: &str) -> Option<&'a Value> {
    v.as_object().and_then(|o| o.get(key))
}

fn as_str_owned(v: &Value) -> Option<String> {
    v.as_str().map(str::to_string)
}

fn as_bool(v: &Value) -> bool {
    v.as_bool().unwrap_or(false)
}

fn extract_mfn(raw: &Value) -> Canonical {
    let mut c = Canonical::default();

    if let Some(details) = get(raw, "details") {
        c.service_found = details
            .get("service_found")
            .map(as_bool)
            .unwrap_or(c.service_found);
        c.is_active = details.get("is_active").map(as_bool).unwrap_or(c.is_active);
        if let Some(v) = details.get("pending_cease_order") {
            c.pending_cease_order = as_bool(v);
        }
        if let Some(v) = details.get("cancellation_implementation_date").and_then(as_str_owned) {
            c.cancellation_implementation_date = Some(v);
        }
        c.extras.insert("shape".to_string(), Value::String("enhanced".to_string()));
        if let Some(customer_data) = details.get("customer_data").and_then(Value::as_object) {
            c.extras.insert("raw_mfn_fields_count".to_string(), Value::from(customer_data.len()));
            for (key, value) in customer_data {
                c.extras.insert(format!("customer_{key}"), value.clone());
            }
        }
        return c;
    }

    // Legacy shape.
    c.extras.insert("shape".to_string(), Value::String("legacy".to_string()));
    if let Some(active) = get(raw, "active_customer") {
        if let Some(fields) = active.as_object() {
            c.service_found = true;
            c.is_active = true;
            c.customer_found = true;
            for (key, value) in fields {
                c.extras.insert(format!("customer_{key}"), value.clone());
            }
        }
    }
    if let Some(cancellation) = get(raw, "cancellation") {
        let found = cancellation.get("found").map(as_bool).unwrap_or(false);
        c.extras.insert("raw_cancellation_found".to_string(), Value::String(found.to_string()));
        if found {
            c.service_found = true;
            c.is_active = false;
            c.cancellation_captured_id = cancellation
                .get("cancellation_captured_id")
                .and_then(as_str_owned);
            if let Some(fields) = cancellation.as_object() {
                for (key, value) in fields {
                    c.extras.insert(format!("raw_cancellation_{key}"), value.clone());
                }
            }
        }
    }
    c
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(needle)
}

const IMPLEMENTED_STATUSES: [&str; 4] = ["accepted", "completed", "implemented", "closed"];

fn extract_osn(raw: &Value) -> Canonical {
    let mut c = Canonical::default();

    let orders = get(raw, "order_data").and_then(Value::as_array).cloned().unwrap_or_default();

    let is_cease = |o: &Value| -> bool {
        get(o, "type")
            .and_then(Value::as_str)
            .map(|t| contains_ci(t, "cease") || contains_ci(t, "cancel"))
            .unwrap_or(false)
    };

    let status_of = |o: &Value| -> String {
        get(o, "orderStatus")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_lowercase()
    };

    let is_implemented = |o: &Value| -> bool {
        let status = status_of(o);
        let has_date = get(o, "dateImplemented")
            .and_then(Value::as_str)
            .map(|s| !s.is_empty())
            .unwrap_or(false);
        (has_date && IMPLEMENTED_STATUSES.contains(&status.as_str()))
            || IMPLEMENTED_STATUSES.contains(&status.as_str())
    };

    let ceases: Vec<&Value> = orders.iter().filter(|o| is_cease(o)).collect();
    let implemented: Vec<&Value> = ceases.iter().copied().filter(|o| is_implemented(o)).collect();

    c.extras.insert("raw_order_count".to_string(), Value::from(orders.len()));
    c.extras.insert("raw_cease_order_count".to_string(), Value::from(ceases.len()));

    if let Some(first) = implemented.first() {
        c.is_active = false;
        c.cancellation_implementation_date =
            get(first, "dateImplemented").and_then(as_str_owned);
        c.cancellation_captured_id = get(first, "orderNumber").and_then(as_str_owned);
        c.extras.insert("raw_cease_order_0_orderStatus".to_string(), status_of(first).into());
    } else if let Some(first) = ceases.first() {
        c.is_active = true;
        c.pending_cease_order = true;
        c.cancellation_captured_id = get(first, "orderNumber").and_then(as_str_owned);
        c.extras.insert("raw_cease_order_0_orderStatus".to_string(), status_of(first).into());
    } else {
        c.is_active = true;
    }

    if let Some(address) = get(raw, "service_address").and_then(as_str_owned) {
        c.extras.insert("raw_service_address".to_string(), Value::String(address));
    }

    c.service_found = !orders.is_empty() || get(raw, "service_address").is_some();
    c
}

fn extract_octotel(raw: &Value) -> Canonical {
    let mut c = Canonical::default();

    if let Some(detail) = get(raw, "service_detail") {
        c.service_found = detail.get("found").map(as_bool).unwrap_or(false);
    }

    let services = get(raw, "services").and_then(Value::as_array).cloned().unwrap_or_default();
    c.extras.insert("services_count".to_string(), Value::from(services.len()));

    let top_level_pending = get(raw, "pending_requests_detected").map(as_bool).unwrap_or(false);
    let service_entry_pending = services.iter().any(|e| {
        get(e, "status_information")
            .and_then(|si| si.get("has_pending_cancellation"))
            .map(as_bool)
            .unwrap_or(false)
    });
    let nested_pending = get(raw, "pending_cancellation_requests")
        .map(|v| match v {
            Value::Bool(b) => *b,
            Value::Array(arr) => !arr.is_empty(),
            _ => false,
        })
        .unwrap_or(false);

    c.pending_cease_order = top_level_pending || service_entry_pending || nested_pending;
    c.extras.insert(
        "has_pending_cancellation".to_string(),
        Value::String(c.pending_cease_order.to_string()),
    );

    if get(raw, "service_status").and_then(Value::as_str) == Some("cancelled") {
        c.cancellation_implementation_date = Some("auto-detected".to_string());
        c.is_active = false;
    }

    if get(raw, "cancellation_submitted").map(as_bool).unwrap_or(false) {
        c.cancellation_submitted = true;
        c.cancellation_captured_id = get(raw, "release_reference").and_then(as_str_owned);
        c.extras.insert("cancellation_submitted".to_string(), Value::String("true".to_string()));
    }

    if let Some(change_requests) = get(raw, "change_requests") {
        if let Some(found) = change_requests.get("change_requests_found").map(as_bool) {
            c.extras
                .insert("change_requests_found".to_string(), Value::String(found.to_string()));
        }
        if let Some(total) = change_requests.get("total_change_requests") {
            c.extras.insert("total_change_requests".to_string(), total.clone());
        }
    }

    c
}

fn extract_evotel(raw: &Value) -> Canonical {
    let mut c = Canonical {
        service_found: get(raw, "service_summary").is_some()
            || get(raw, "comprehensive_extraction").is_some(),
        ..Default::default()
    };

    let status_text = get(raw, "service_status")
        .or_else(|| get(raw, "work_order_status"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_lowercase();

    if ["active", "provisioned", "completed", "accepted"]
        .iter()
        .any(|s| status_text.contains(s))
    {
        c.is_active = true;
    } else if ["cancelled", "inactive", "failed"].iter().any(|s| status_text.contains(s)) {
        c.is_active = false;
        c.cancellation_implementation_date = get(raw, "scheduled_time").and_then(as_str_owned);
        c.cancellation_captured_id = get(raw, "work_order_reference").and_then(as_str_owned);
    } else if ["pending", "in progress", "provisioning"].iter().any(|s| status_text.contains(s)) {
        c.pending_cease_order = true;
        c.is_active = true;
    }

    if let Some(v) = get(raw, "verification_status").and_then(as_str_owned) {
        c.extras.insert("verification_status".to_string(), Value::String(v));
    }
    if let Some(v) = get(raw, "isp_provisioned").and_then(as_str_owned) {
        c.extras.insert("isp_provisioned".to_string(), Value::String(v));
    }
    for (raw_key, extra_key) in [
        ("customer_name", "customer_name"),
        ("customer_email", "customer_email"),
        ("fsan_number", "fsan_number"),
        ("work_order_reference", "work_order_reference"),
        ("service_provider", "service_provider"),
    ] {
        if let Some(v) = get(raw, raw_key).and_then(as_str_owned) {
            c.extras.insert(extra_key.to_string(), Value::String(v));
        }
    }

    c
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mfn_legacy_active_customer_implies_active() {
        let raw = json!({ "active_customer": { "customer": "X" } });
        let c = extract_mfn(&raw);
        assert!(c.service_found);
        assert!(c.is_active);
    }

    #[test]
    fn mfn_legacy_cancellation_found_implies_cancelled() {
        let raw = json!({ "cancellation": { "found": true, "cancellation_captured_id": "C1" } });
        let c = extract_mfn(&raw);
        assert!(c.service_found);
        assert!(!c.is_active);
        assert_eq!(c.cancellation_captured_id.as_deref(), Some("C1"));
    }

    #[test]
    fn osn_implemented_cease_wins() {
        let raw = json!({
            "order_data": [
                { "orderNumber": "ORD1", "type": "Cease Active Service", "orderStatus": "accepted", "dateImplemented": "2024-06-01" }
            ]
        });
        let c = extract_osn(&raw);
        assert!(!c.is_active);
        assert_eq!(c.cancellation_captured_id.as_deref(), Some("ORD1"));
        assert!(c.service_found);
    }

    #[test]
    fn osn_pending_cease_keeps_active_true() {
        let raw = json!({
            "order_data": [
                { "orderNumber": "ORD2", "type": "Cease Active Service", "orderStatus": "pending", "dateImplemented": "" }
            ]
        });
        let c = extract_osn(&raw);
        assert!(c.is_active);
        assert!(c.pending_cease_order);
    }

    #[test]
    fn octotel_pending_cancellation_from_nested_services() {
        let raw = json!({
            "service_detail": { "found": true },
            "services": [{ "status_information": { "has_pending_cancellation": true } }]
        });
        let c = extract_octotel(&raw);
        assert!(c.service_found);
        assert!(c.pending_cease_order);
    }

    #[test]
    fn evotel_status_keywords_classify_active() {
        let raw = json!({ "service_summary": {}, "service_status": "Active" });
        let c = extract_evotel(&raw);
        assert!(c.service_found);
        assert!(c.is_active);
    }

    #[test]
    fn evotel_extras_carry_verification_and_isp_fields_for_status_mapper() {
        let raw = json!({
            "service_summary": {},
            "service_status": "provisioning",
            "verification_status": "Unverified",
            "isp_provisioned": "No",
        });
        let c = extract_evotel(&raw);
        assert_eq!(c.extras.get("verification_status").and_then(Value::as_str), Some("Unverified"));
        assert_eq!(c.extras.get("isp_provisioned").and_then(Value::as_str), Some("No"));
    }

    #[test]
    fn octotel_extras_carry_pending_cancellation_flag() {
        let raw = json!({
            "service_detail": { "found": true },
            "services": [{ "status_information": { "has_pending_cancellation": true } }]
        });
        let c = extract_octotel(&raw);
        assert_eq!(
            c.extras.get("has_pending_cancellation").and_then(Value::as_str),
            Some("true")
        );
    }

    #[test]
    fn osn_extras_carry_raw_order_counts() {
        let raw = json!({
            "order_data": [
                { "orderNumber": "ORD1", "type": "Cease Active Service", "orderStatus": "accepted", "dateImplemented": "2024-06-01" }
            ]
        });
        let c = extract_osn(&raw);
        assert_eq!(c.extras.get("raw_order_count").and_then(Value::as_u64), Some(1));
        assert_eq!(c.extras.get("raw_cease_order_count").and_then(Value::as_u64), Some(1));
    }

    #[test]
    fn mfn_extras_carry_customer_fields_from_both_shapes() {
        let enhanced = json!({ "details": { "service_found": true, "customer_data": { "customer": "X", "expiry_date": "2030-01-01" } } });
        let c = extract_mfn(&enhanced);
        assert_eq!(c.extras.get("customer_customer").and_then(Value::as_str), Some("X"));

        let legacy = json!({ "active_customer": { "customer": "Y" } });
        let c = extract_mfn(&legacy);
        assert_eq!(c.extras.get("customer_customer").and_then(Value::as_str), Some("Y"));
    }
}
