//! Recognition of notable GPIO events in the telemetry stream.
//!
//! A message is notable when `gpio.port` equals 101 and `gpio.value` equals true. Devices
//! report these fields with inconsistent JSON types (`"101"` vs `101`, `true` vs `1`), so
//! both comparisons normalize the field first and then compare with the same loose
//! semantics the stream's reference consumer uses:
//!
//! - a string port must be exactly `"101"`; a numeric port must equal 101;
//! - `value` is compared as a number against 1, so `true`, `1` and `"1"` match while
//!   `"true"` and `false` do not;
//! - arrays compare through their comma-joined string form; `null`, booleans (for `port`)
//!   and objects never match.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::model::NotificationRequest;

pub const MOTION_PORT: &str = "101";
pub const MOTION_MESSAGE: &str = "Movement detected";

/// Parses a text frame and applies [`match_notable`]. Unparseable text is "no match".
pub fn evaluate_text(text: &str) -> Option<NotificationRequest> {
    let payload: Value = serde_json::from_str(text).ok()?;
    match_notable(&payload)
}

pub fn match_notable(payload: &Value) -> Option<NotificationRequest> {
    let gpio = payload.as_object()?.get("gpio")?.as_object()?;
    let port = gpio.get("port")?;
    let value = gpio.get("value")?;
    if !port_matches(port) || !value_is_true(value) {
        return None;
    }

    let recipient = source_string(payload.get("src"));
    let timestamp = payload.get("timestamp").and_then(epoch_seconds);
    Some(NotificationRequest::new(recipient, MOTION_MESSAGE, timestamp))
}

fn port_matches(port: &Value) -> bool {
    match port {
        Value::String(s) => s == MOTION_PORT,
        Value::Number(n) => n.as_f64() == Some(101.0),
        Value::Array(_) => primitive_string(port).as_deref() == Some(MOTION_PORT),
        _ => false,
    }
}

fn value_is_true(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64() == Some(1.0),
        Value::String(s) => string_to_number(s) == Some(1.0),
        Value::Array(_) => primitive_string(value)
            .and_then(|s| string_to_number(&s))
            == Some(1.0),
        _ => false,
    }
}

/// Numeric reading of a string: surrounding whitespace ignored, empty reads as zero.
fn string_to_number(s: &str) -> Option<f64> {
    let t = s.trim();
    if t.is_empty() {
        return Some(0.0);
    }
    for (lower, upper, radix) in [("0x", "0X", 16), ("0o", "0O", 8), ("0b", "0B", 2)] {
        if let Some(digits) = t.strip_prefix(lower).or_else(|| t.strip_prefix(upper)) {
            return radix_digits(digits, radix);
        }
    }
    match t {
        "Infinity" | "+Infinity" => Some(f64::INFINITY),
        "-Infinity" => Some(f64::NEG_INFINITY),
        _ if t.chars().any(|c| c.is_ascii_alphabetic() && c != 'e' && c != 'E') => None,
        _ => t.parse::<f64>().ok(),
    }
}

/// Unsigned digits in `radix`; no sign, no separators, at least one digit.
fn radix_digits(digits: &str, radix: u32) -> Option<f64> {
    if digits.is_empty() {
        return None;
    }
    digits.chars().try_fold(0.0_f64, |acc, c| {
        c.to_digit(radix).map(|d| acc * f64::from(radix) + f64::from(d))
    })
}

/// String form of a primitive or array; objects have none that could ever match.
fn primitive_string(v: &Value) -> Option<String> {
    match v {
        Value::Null => Some(String::new()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(number_string(n)),
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let parts: Option<Vec<String>> = items.iter().map(primitive_string).collect();
            parts.map(|p| p.join(","))
        }
        Value::Object(_) => None,
    }
}

fn number_string(n: &serde_json::Number) -> String {
    if n.is_i64() || n.is_u64() {
        return n.to_string();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < 1e21 => format!("{}", f as i128),
        Some(f) => f.to_string(),
        None => n.to_string(),
    }
}

/// Recipient for a matched event: the `src` field rendered as a string.
fn source_string(src: Option<&Value>) -> String {
    match src {
        None => "undefined".to_string(),
        Some(Value::Null) => "null".to_string(),
        Some(Value::Object(_)) => "[object Object]".to_string(),
        Some(v) => primitive_string(v).unwrap_or_default(),
    }
}

/// `timestamp` in seconds, read numerically the same loose way as `value`:
/// `null` is 0, booleans are 0 or 1, arrays go through their string form.
fn epoch_seconds(ts: &Value) -> Option<DateTime<Utc>> {
    let secs = match ts {
        Value::Null => 0.0,
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => string_to_number(s)?,
        Value::Array(_) => string_to_number(&primitive_string(ts)?)?,
        Value::Object(_) => return None,
    };
    let millis = secs * 1000.0;
    if !millis.is_finite() {
        return None;
    }
    DateTime::from_timestamp_millis(millis.trunc() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn matches_string_port_and_bool_value() {
        let req = evaluate_text(
            r#"{"gpio":{"port":"101","value":true},"src":"d1","timestamp":1700000000}"#,
        )
        .unwrap();
        assert_eq!(req.recipient, "d1");
        assert_eq!(req.message, "Movement detected");
        assert_eq!(req.timestamp_millis(), Some(1_700_000_000_000));
    }

    #[test]
    fn ignores_other_ports() {
        assert!(evaluate_text(
            r#"{"gpio":{"port":"99","value":true},"src":"d1","timestamp":1}"#
        )
        .is_none());
        assert!(match_notable(&json!({"gpio": {"port": 100, "value": true}})).is_none());
        assert!(match_notable(&json!({"gpio": {"port": " 101", "value": true}})).is_none());
        assert!(match_notable(&json!({"gpio": {"port": true, "value": true}})).is_none());
    }

    #[test]
    fn ignores_false_or_missing_value() {
        assert!(match_notable(&json!({"gpio": {"port": 101, "value": false}})).is_none());
        assert!(match_notable(&json!({"gpio": {"port": 101, "value": 0}})).is_none());
        assert!(match_notable(&json!({"gpio": {"port": 101}})).is_none());
        assert!(match_notable(&json!({"gpio": {"port": 101, "value": null}})).is_none());
        assert!(match_notable(&json!({"gpio": {"port": 101, "value": "true"}})).is_none());
        assert!(match_notable(&json!({"gpio": {"port": 101, "value": "0b10"}})).is_none());
    }

    #[test]
    fn ignores_missing_or_malformed_gpio() {
        assert!(match_notable(&json!({"src": "d1", "timestamp": 1})).is_none());
        assert!(match_notable(&json!({"gpio": null})).is_none());
        assert!(match_notable(&json!({"gpio": "101"})).is_none());
        assert!(match_notable(&json!([{"gpio": {"port": 101, "value": true}}])).is_none());
        assert!(match_notable(&json!({"gpio": {"value": true}})).is_none());
    }

    #[test]
    fn malformed_text_is_no_match() {
        assert!(evaluate_text("").is_none());
        assert!(evaluate_text("{not json").is_none());
        assert!(evaluate_text("null").is_none());
        assert!(evaluate_text("42").is_none());
    }

    #[test]
    fn loose_representations_match() {
        for (port, value) in [
            (json!(101), json!(true)),
            (json!(101.0), json!(1)),
            (json!("101"), json!("1")),
            (json!(["101"]), json!(" 1 ")),
            (json!([101]), json!(["1"])),
            (json!("101"), json!(1.0)),
            (json!(101), json!("0b1")),
            (json!(101), json!("0o1")),
        ] {
            let payload = json!({"gpio": {"port": port, "value": value}, "src": "d", "timestamp": 5});
            let req = match_notable(&payload);
            assert!(req.is_some(), "expected match for {}", payload);
            assert_eq!(req.unwrap().timestamp_millis(), Some(5000));
        }
    }

    #[test]
    fn src_is_coerced_to_string() {
        let with_src = |src: Value| {
            match_notable(&json!({"gpio": {"port": 101, "value": true}, "src": src, "timestamp": 1}))
                .unwrap()
                .recipient
        };
        assert_eq!(with_src(json!(12345)), "12345");
        assert_eq!(with_src(json!(1.5)), "1.5");
        assert_eq!(with_src(json!(7.0)), "7");
        assert_eq!(with_src(json!(true)), "true");
        assert_eq!(with_src(Value::Null), "null");

        let no_src = match_notable(&json!({"gpio": {"port": 101, "value": true}})).unwrap();
        assert_eq!(no_src.recipient, "undefined");
    }

    #[test]
    fn timestamp_coercion() {
        let ts = |t: Value| {
            match_notable(&json!({"gpio": {"port": 101, "value": true}, "src": "d", "timestamp": t}))
                .unwrap()
                .timestamp_millis()
        };
        assert_eq!(ts(json!("1700000000")), Some(1_700_000_000_000));
        assert_eq!(ts(json!(1.2345)), Some(1234));
        assert_eq!(ts(json!("soon")), None);
        assert_eq!(ts(json!({"s": 1})), None);
        assert_eq!(ts(json!([1, 2])), None);
        assert_eq!(ts(Value::Null), Some(0));
        assert_eq!(ts(json!(true)), Some(1000));
        assert_eq!(ts(json!(false)), Some(0));
        assert_eq!(ts(json!([5])), Some(5000));
        assert_eq!(ts(json!([])), Some(0));
        assert_eq!(ts(json!("")), Some(0));

        let missing = match_notable(&json!({"gpio": {"port": 101, "value": true}})).unwrap();
        assert_eq!(missing.timestamp_millis(), None);
    }

    #[test]
    fn string_numbers_follow_loose_rules() {
        assert_eq!(string_to_number(""), Some(0.0));
        assert_eq!(string_to_number(" 1 "), Some(1.0));
        assert_eq!(string_to_number("0x1"), Some(1.0));
        assert_eq!(string_to_number("0XfF"), Some(255.0));
        assert_eq!(string_to_number("0b1"), Some(1.0));
        assert_eq!(string_to_number("0o17"), Some(15.0));
        assert_eq!(string_to_number("0b2"), None);
        assert_eq!(string_to_number("0x"), None);
        assert_eq!(string_to_number("0x+1"), None);
        assert_eq!(string_to_number("-0x1"), None);
        assert_eq!(string_to_number("1e0"), Some(1.0));
        assert_eq!(string_to_number("true"), None);
        assert_eq!(string_to_number("inf"), None);
    }
}
