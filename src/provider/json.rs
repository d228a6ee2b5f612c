//! Tolerant JSON extraction from LLM output.
//!
//! Providers decorate JSON with prose, code fences, or stray tokens. Every
//! response is treated as untrusted text: try a direct parse first, then
//! extract the first balanced `{...}` block, and let the caller fall back to
//! a deterministic default object when nothing parses.

use serde_json::Value;

/// Parse provider output as a JSON object, leniently.
///
/// Returns `None` when no parseable object can be recovered; callers supply
/// their own fallback shape.
#[must_use]
pub fn parse_lenient(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        if v.is_object() {
            return Some(v);
        }
    }
    let block = first_balanced_block(trimmed)?;
    serde_json::from_str::<Value>(block).ok().filter(Value::is_object)
}

/// Find the first balanced `{...}` block, respecting string literals.
fn first_balanced_block(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let bytes = s.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Read a string field, accepting a few synonymous keys in priority order.
#[must_use]
pub fn str_field<'a>(v: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| v.get(k).and_then(Value::as_str))
}

/// Read an `f64` field clamped to `[0, 1]`, with a default.
#[must_use]
pub fn conf_field(v: &Value, key: &str, default: f64) -> f64 {
    v.get(key)
        .and_then(Value::as_f64)
        .unwrap_or(default)
        .clamp(0.0, 1.0)
}

/// Read an array of strings, dropping non-string elements.
#[must_use]
pub fn str_array(v: &Value, key: &str) -> Vec<String> {
    v.get(key)
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}
