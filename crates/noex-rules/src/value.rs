//! Reference resolution, string interpolation, and canonical JSON.
//!
//! `ref{path}` objects and `${...}` placeholders share one resolver. A path
//! is `source.segment...`; the resolver maps it to a live value from the
//! evaluation context. The canonical serialization (key-sorted, compact) is
//! the basis for rule fingerprints and lookup cache keys.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("placeholder regex"))
}

/// Whether a string contains `${...}` placeholders.
pub fn has_placeholder(template: &str) -> bool {
    placeholder_regex().is_match(template)
}

/// If `value` is a `{"ref": "path"}` object, return the path.
pub fn as_ref_path(value: &Value) -> Option<&str> {
    match value {
        Value::Object(map) if map.len() == 1 => map.get("ref").and_then(Value::as_str),
        _ => None,
    }
}

/// Traverse a dotted path into a JSON value.
///
/// Each segment indexes an object key; traversal through a non-object
/// yields `None`.
pub fn traverse<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }

    let mut current = value;
    for segment in path.split('.') {
        match current {
            Value::Object(map) => current = map.get(segment)?,
            _ => return None,
        }
    }
    Some(current)
}

/// Render a resolved value into an interpolated string.
///
/// Absent values and null render as the empty string; strings are inserted
/// verbatim; everything else uses its compact JSON form.
pub fn stringify(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Expand every `${path}` placeholder in a template using the resolver.
pub fn interpolate<F>(template: &str, resolver: &F) -> String
where
    F: Fn(&str) -> Option<Value>,
{
    placeholder_regex()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let path = caps[1].trim();
            stringify(resolver(path).as_ref())
        })
        .into_owned()
}

/// Resolve a JSON value for use in an action payload.
///
/// `{"ref": "path"}` objects are replaced by the referenced value (null
/// when absent), strings are interpolated, and containers are resolved
/// recursively.
pub fn resolve_value<F>(value: &Value, resolver: &F) -> Value
where
    F: Fn(&str) -> Option<Value>,
{
    if let Some(path) = as_ref_path(value) {
        return resolver(path).unwrap_or(Value::Null);
    }

    match value {
        Value::String(s) if has_placeholder(s) => Value::String(interpolate(s, resolver)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| resolve_value(v, resolver)).collect())
        }
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve_value(v, resolver));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Produce the canonical serialization of a JSON value.
///
/// Object keys are emitted in sorted order at every level; arrays keep
/// their order; scalars use their compact JSON form. Equal values always
/// produce identical strings regardless of insertion order.
pub fn canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolver(path: &str) -> Option<Value> {
        match path {
            "event.user.id" => Some(json!(42)),
            "event.user.name" => Some(json!("ada")),
            "fact:customer:tier" => Some(json!("vip")),
            "context.missing" => None,
            _ => None,
        }
    }

    #[test]
    fn test_traverse() {
        let data = json!({"user": {"name": "ada", "id": 42}});
        assert_eq!(traverse(&data, "user.name"), Some(&json!("ada")));
        assert_eq!(traverse(&data, "user.id"), Some(&json!(42)));
        assert_eq!(traverse(&data, "user.name.first"), None);
        assert_eq!(traverse(&data, "missing"), None);
        assert_eq!(traverse(&data, ""), Some(&data));
    }

    #[test]
    fn test_as_ref_path() {
        assert_eq!(as_ref_path(&json!({"ref": "event.user.id"})), Some("event.user.id"));
        assert_eq!(as_ref_path(&json!({"ref": "a", "other": 1})), None);
        assert_eq!(as_ref_path(&json!("ref")), None);
    }

    #[test]
    fn test_interpolate() {
        assert_eq!(
            interpolate("user ${event.user.name} (#${event.user.id})", &resolver),
            "user ada (#42)"
        );
        assert_eq!(interpolate("tier=${fact:customer:tier}", &resolver), "tier=vip");
        assert_eq!(interpolate("got ${context.missing}!", &resolver), "got !");
        assert_eq!(interpolate("no placeholders", &resolver), "no placeholders");
    }

    #[test]
    fn test_resolve_value() {
        let payload = json!({
            "customer": {"ref": "event.user.id"},
            "label": "name=${event.user.name}",
            "items": [{"ref": "context.missing"}, 7],
        });
        let resolved = resolve_value(&payload, &resolver);
        assert_eq!(
            resolved,
            json!({
                "customer": 42,
                "label": "name=ada",
                "items": [null, 7],
            })
        );
    }

    #[test]
    fn test_canonical_string_is_key_order_independent() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": {"y": 2, "x": [3, 4]}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": {"x": [3, 4], "y": 2}, "b": 1}"#).unwrap();
        assert_eq!(canonical_string(&a), canonical_string(&b));
        assert_eq!(
            canonical_string(&a),
            r#"{"a":{"x":[3,4],"y":2},"b":1}"#
        );
    }

    #[test]
    fn test_canonical_string_preserves_array_order() {
        assert_ne!(
            canonical_string(&json!([1, 2])),
            canonical_string(&json!([2, 1]))
        );
    }
}
