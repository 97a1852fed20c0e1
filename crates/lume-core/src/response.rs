use std::collections::BTreeMap;

use mlua::{Table, Value};

use crate::bridge::opaque_text;

pub const DEFAULT_CONTENT_TYPE: &str = "text/html;charset=UTF-8";
const DEFAULT_STATUS: u16 = 200;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SynthesizedResponse {
    pub status: u16,
    /// Canonical header name to value.
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// Turns a handler's return value into the response parts.
///
/// A table may carry `status`, `headers` and `body` fields; any other value
/// is rendered as the body of a 200 response. Fields are read raw, so
/// metatables on the returned table are not consulted.
pub fn synthesize(value: &Value, server_name: &str) -> SynthesizedResponse {
    let mut headers = BTreeMap::new();
    headers.insert("Content-Type".to_string(), DEFAULT_CONTENT_TYPE.to_string());
    headers.insert("Server".to_string(), server_name.to_string());

    let Value::Table(table) = value else {
        return SynthesizedResponse {
            status: DEFAULT_STATUS,
            headers,
            body: display_value(value),
        };
    };

    if let Ok(Value::Table(extra)) = table.raw_get::<Value>("headers") {
        merge_headers(&mut headers, &extra);
    }
    let body = match table.raw_get::<Value>("body") {
        Ok(Value::Nil) | Err(_) => String::new(),
        Ok(body) => display_value(&body),
    };
    let status = table
        .raw_get::<Value>("status")
        .map(|raw| clamp_status(&raw))
        .unwrap_or(DEFAULT_STATUS);

    SynthesizedResponse {
        status,
        headers,
        body,
    }
}

fn merge_headers(headers: &mut BTreeMap<String, String>, extra: &Table) {
    for (key, value) in extra.pairs::<Value, Value>().flatten() {
        let name = match &key {
            Value::String(s) => s.to_string_lossy().to_string(),
            other => display_value(other),
        };
        headers.insert(canonical_header_key(&name), display_value(&value));
    }
}

/// Numeric statuses are truncated toward zero and kept when they fall in
/// `[100, 600)`. Everything else, including numeric strings, yields 200.
pub fn clamp_status(value: &Value) -> u16 {
    let code = match value {
        Value::Integer(i) => *i,
        Value::Number(n) if n.is_finite() => n.trunc() as i64,
        _ => return DEFAULT_STATUS,
    };
    if (100..600).contains(&code) {
        code as u16
    } else {
        DEFAULT_STATUS
    }
}

/// `content-type` becomes `Content-Type`. Names with characters outside the
/// HTTP token set are returned unchanged.
pub fn canonical_header_key(name: &str) -> String {
    if name.is_empty() || !name.bytes().all(is_token_byte) {
        return name.to_string();
    }
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for ch in name.chars() {
        if upper {
            out.push(ch.to_ascii_uppercase());
        } else {
            out.push(ch.to_ascii_lowercase());
        }
        upper = ch == '-';
    }
    out
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// The textual form a script value takes in a response body or header.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => format_float(*n),
        Value::String(s) => s.to_string_lossy().to_string(),
        other => opaque_text(other),
    }
}

/// `%.14g`, plus `.0` when the result reads as an integer. This is the
/// form `tostring` gives a Lua 5.4 float.
fn format_float(n: f64) -> String {
    if n.is_nan() {
        return if n.is_sign_negative() { "-nan" } else { "nan" }.to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let scientific = format!("{:.*e}", FLOAT_DIGITS - 1, n);
    let (mantissa, exp) = scientific.split_once('e').unwrap_or((&scientific, "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    let text = if exp < -4 || exp >= FLOAT_DIGITS as i32 {
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{sign}{:02}", trim_fraction(mantissa), exp.unsigned_abs())
    } else {
        let decimals = (FLOAT_DIGITS as i32 - 1 - exp) as usize;
        trim_fraction(&format!("{n:.decimals$}")).to_string()
    };
    if text.bytes().all(|b| b == b'-' || b.is_ascii_digit()) {
        format!("{text}.0")
    } else {
        text
    }
}

const FLOAT_DIGITS: usize = 14;

fn trim_fraction(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}
