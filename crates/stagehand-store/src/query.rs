//! Dotted-path extraction and value ordering for the query operations.
//!
//! The path language is the `$.a.b` subset the engine actually uses,
//! not a full JSONPath implementation.

use std::cmp::Ordering;

use serde_json::Value;

/// Extract the value at a dotted path (`$.a.b` or `a.b`) from `value`.
///
/// Returns `None` when any segment is missing or traverses a
/// non-object.
pub fn extract_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.strip_prefix("$.").unwrap_or(path);
    if path.is_empty() {
        return Some(value);
    }
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Total order over JSON values used by the sorted queries.
///
/// Nulls sort first, then booleans, numbers, strings (RFC 3339
/// timestamps sort correctly here), then arrays and objects by their
/// rendered form.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.total_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ if rank(a) != rank(b) => rank(a).cmp(&rank(b)),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

/// Render an extracted value as a grouping key for count-by queries.
pub fn render_group_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extract_nested_path() {
        let value = json!({"state": {"current_version": {"version": "v2"}}});
        assert_eq!(
            extract_path(&value, "$.state.current_version.version"),
            Some(&json!("v2"))
        );
    }

    #[test]
    fn extract_top_level() {
        let value = json!({"state": "Success"});
        assert_eq!(extract_path(&value, "$.state"), Some(&json!("Success")));
    }

    #[test]
    fn extract_missing_path_is_none() {
        let value = json!({"state": "Success"});
        assert_eq!(extract_path(&value, "$.nope"), None);
        assert_eq!(extract_path(&value, "$.state.deeper"), None);
    }

    #[test]
    fn compare_orders_numbers_and_strings() {
        assert_eq!(compare_values(&json!(1), &json!(2)), Ordering::Less);
        assert_eq!(compare_values(&json!("a"), &json!("b")), Ordering::Less);
        assert_eq!(compare_values(&json!(null), &json!(false)), Ordering::Less);
    }

    #[test]
    fn compare_orders_rfc3339_timestamps() {
        let earlier = json!("2026-07-01T00:00:00Z");
        let later = json!("2026-07-02T00:00:00Z");
        assert_eq!(compare_values(&earlier, &later), Ordering::Less);
    }

    #[test]
    fn group_key_unquotes_strings() {
        assert_eq!(render_group_key(&json!("Failed")), "Failed");
        assert_eq!(render_group_key(&json!(true)), "true");
    }
}
