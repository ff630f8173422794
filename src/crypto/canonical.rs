//! Deterministic JSON canonicalization.
//!
//! Both order payloads and evidence bundle content are hashed and signed
//! over this format: object keys sorted, no whitespace, UTF-8, timestamps
//! as RFC 3339 with a `Z` suffix, integers without exponent. Agents
//! recompute the same bytes independently, so any drift here is a fleet-wide
//! signature break.

use serde_json::Value;

/// Render a JSON value in canonical form.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            // serde_json renders integers without exponent and floats in
            // shortest round-trip form, which is the wire contract.
            out.push_str(&n.to_string());
        }
        Value::String(s) => {
            out.push_str(&serde_json::to_string(s).expect("string serialization is infallible"));
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(
                    &serde_json::to_string(key).expect("string serialization is infallible"),
                );
                out.push(':');
                write_value(out, &map[key.as_str()]);
            }
            out.push('}');
        }
    }
}

/// Format a timestamp the way canonical payloads carry it: RFC 3339, UTC,
/// second precision, `Z` suffix.
pub fn canonical_timestamp(ts: chrono::DateTime<chrono::Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_sorted() {
        let v = json!({"zebra": 1, "alpha": 2, "mid": {"b": 1, "a": 2}});
        assert_eq!(
            canonical_json(&v),
            r#"{"alpha":2,"mid":{"a":2,"b":1},"zebra":1}"#
        );
    }

    #[test]
    fn test_no_whitespace() {
        let v = json!({"a": [1, 2, 3], "b": "x y"});
        let s = canonical_json(&v);
        assert!(!s.contains(": "));
        assert!(!s.contains(", "));
    }

    #[test]
    fn test_integers_without_exponent() {
        let v = json!({"n": 1000000});
        assert_eq!(canonical_json(&v), r#"{"n":1000000}"#);
    }

    #[test]
    fn test_string_escaping_preserved() {
        let v = json!({"msg": "line1\nline2 \"quoted\""});
        assert_eq!(
            canonical_json(&v),
            r#"{"msg":"line1\nline2 \"quoted\""}"#
        );
    }

    #[test]
    fn test_canonical_timestamp_z_suffix() {
        let ts = chrono::DateTime::parse_from_rfc3339("2026-03-01T10:20:30.456Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        assert_eq!(canonical_timestamp(ts), "2026-03-01T10:20:30Z");
    }

    #[test]
    fn test_stable_across_insertion_order() {
        let a = json!({"x": 1, "y": 2});
        let mut map = serde_json::Map::new();
        map.insert("y".to_string(), json!(2));
        map.insert("x".to_string(), json!(1));
        let b = Value::Object(map);
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }
}
