//! Dotted JSON path resolution used by the Executor's variable substitution
//! (§4.5): `.a.b.0.c` reads field `a`, then `b`, then array index `0`, then
//! field `c`.

use serde_json::Value;

/// Apply a dotted path like `.a.b.0.c` to `value`. Returns `None` if any
/// segment is absent or type-mismatched.
pub fn apply(value: &Value, path: &str) -> Option<Value> {
    let mut current = value;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = match (current, segment.parse::<usize>()) {
            (Value::Object(map), _) => map.get(segment)?,
            (Value::Array(items), Ok(index)) => items.get(index)?,
            _ => return None,
        };
    }
    Some(current.clone())
}
