use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lume_rt::json::{self as rt_json, JsonValue};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const REQUEST_ID_FALLBACK_HEADER: &str = "x-correlation-id";
pub const RESPONSE_REQUEST_ID_HEADER: &str = "X-Request-Id";

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PanicDetails {
    pub kind: &'static str,
    pub message: String,
}

pub fn classify_panic_payload(payload: &(dyn Any + Send)) -> PanicDetails {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return PanicDetails {
            kind: "panic_static_str",
            message: (*message).to_string(),
        };
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return PanicDetails {
            kind: "panic_string",
            message: message.clone(),
        };
    }
    PanicDetails {
        kind: "panic_non_string",
        message: "panic".to_string(),
    }
}

pub fn format_panic_message(details: &PanicDetails) -> String {
    if details.message.is_empty() {
        format!("panic_kind={}", details.kind)
    } else {
        format!("panic_kind={} {}", details.kind, details.message)
    }
}

/// Reuses a well-formed `X-Request-Id` (or `X-Correlation-Id`) from the
/// client, otherwise allocates a process-unique id.
pub fn resolve_request_id(headers: &HashMap<String, String>) -> String {
    request_id_from_header(headers, REQUEST_ID_HEADER)
        .or_else(|| request_id_from_header(headers, REQUEST_ID_FALLBACK_HEADER))
        .unwrap_or_else(next_request_id)
}

/// One access record per handled connection.
pub struct RequestRecord<'a> {
    pub request_id: &'a str,
    pub method: &'a str,
    pub path: &'a str,
    pub route: Option<&'a str>,
    pub status: u16,
    pub duration: Duration,
    pub response_bytes: usize,
}

pub fn emit_http_observability(record: &RequestRecord<'_>) {
    if structured_request_logging_enabled() {
        eprintln!("{}", request_log_line(record));
    } else {
        lume_rt::log::info(&format!(
            "{} {} -> {} ({}ms, {})",
            record.method,
            record.path,
            record.status,
            record.duration.as_millis(),
            record.request_id
        ));
    }
}

fn request_log_line(record: &RequestRecord<'_>) -> String {
    let mut obj = BTreeMap::new();
    obj.insert(
        "duration_ms".to_string(),
        JsonValue::Number(record.duration.as_millis() as f64),
    );
    obj.insert(
        "event".to_string(),
        JsonValue::String("http.request".to_string()),
    );
    obj.insert(
        "method".to_string(),
        JsonValue::String(record.method.to_string()),
    );
    obj.insert(
        "path".to_string(),
        JsonValue::String(record.path.to_string()),
    );
    obj.insert(
        "request_id".to_string(),
        JsonValue::String(record.request_id.to_string()),
    );
    obj.insert(
        "response_bytes".to_string(),
        JsonValue::Number(record.response_bytes as f64),
    );
    if let Some(route) = record.route {
        obj.insert("route".to_string(), JsonValue::String(route.to_string()));
    }
    obj.insert(
        "status".to_string(),
        JsonValue::Number(record.status as f64),
    );
    // Every field is finite, so encoding cannot fail.
    rt_json::encode(&JsonValue::Object(obj)).unwrap_or_default()
}

fn request_id_from_header(headers: &HashMap<String, String>, key: &str) -> Option<String> {
    headers.get(key).and_then(|raw| sanitize_request_id(raw))
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    let value = raw.trim();
    if value.is_empty() || value.len() > 128 {
        return None;
    }
    if value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | ':' | '/' | '@'))
    {
        Some(value.to_string())
    } else {
        None
    }
}

fn next_request_id() -> String {
    let next = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
    format!("req-{next:016x}")
}

fn structured_request_logging_enabled() -> bool {
    env_true("LUME_REQUEST_LOG", &["structured", "json"])
}

fn env_true(key: &str, extra_truthy: &[&str]) -> bool {
    let Ok(raw) = std::env::var(key) else {
        return false;
    };
    let value = raw.trim().to_ascii_lowercase();
    if value == "1" || value == "true" {
        return true;
    }
    extra_truthy.iter().any(|candidate| value == *candidate)
}
