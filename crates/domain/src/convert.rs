//! Lenient JSON value conversions used by the config merge layer.
//!
//! Tenant config blobs arrive as free-form JSON; a recognized key whose value
//! has the wrong shape keeps the previous value instead of failing the whole
//! merge.

use std::time::Duration;

use serde_json::Value;

/// Parse a duration string: a decimal number followed by one of
/// `ms`, `s`, `m`, `h`, `d`. A bare number is seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let n: u64 = num.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(n)),
        "s" | "" => Some(Duration::from_secs(n)),
        "m" => Some(Duration::from_secs(n * 60)),
        "h" => Some(Duration::from_secs(n * 3_600)),
        "d" => Some(Duration::from_secs(n * 86_400)),
        _ => None,
    }
}

pub fn to_duration(value: &Value, default: Duration) -> Duration {
    match value {
        Value::String(s) => parse_duration(s).unwrap_or(default),
        _ => default,
    }
}

pub fn to_f32(value: &Value, default: f32) -> f32 {
    match value {
        Value::Number(n) => n.as_f64().map(|f| f as f32).unwrap_or(default),
        Value::String(s) => s.parse().unwrap_or(default),
        _ => default,
    }
}

pub fn to_i32(value: &Value, default: i32) -> i32 {
    match value {
        Value::Number(n) => n.as_i64().map(|i| i as i32).unwrap_or(default),
        Value::String(s) => s.parse().unwrap_or(default),
        _ => default,
    }
}

pub fn to_bool(value: &Value, default: bool) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64().map(|i| i != 0).unwrap_or(default),
        Value::String(s) => s.parse().unwrap_or(default),
        _ => default,
    }
}

pub fn to_string(value: &Value, default: &str) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => default.to_string(),
    }
}

/// Optional string coercion for required request members: numbers stringify,
/// everything else is `None`.
pub fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_units() {
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("4h"), Some(Duration::from_secs(14_400)));
        assert_eq!(parse_duration("30d"), Some(Duration::from_secs(2_592_000)));
        assert_eq!(parse_duration("7"), Some(Duration::from_secs(7)));
    }

    #[test]
    fn duration_rejects_garbage() {
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("fast"), None);
        assert_eq!(parse_duration("10weeks"), None);
    }

    #[test]
    fn lenient_scalars() {
        use serde_json::json;
        assert_eq!(to_f32(&json!(0.62), 0.0), 0.62);
        assert_eq!(to_f32(&json!("0.5"), 0.0), 0.5);
        assert_eq!(to_f32(&json!([1]), 0.7), 0.7);
        assert_eq!(to_i32(&json!("3"), 0), 3);
        assert!(to_bool(&json!(1), false));
        assert!(to_bool(&json!("true"), false));
        assert_eq!(to_string(&json!(42), ""), "42");
    }
}
