//! JSON document tree operations shared by the store backends.
//!
//! Paths are `/`-separated (`sessions/abc/client/connected`). A `null` value is
//! never stored: writing `null` removes the node, and objects left empty by a
//! removal are pruned, the way a realtime database tree behaves.

use serde_json::{Map, Value};

use crate::store::StoreError;

/// Characters a path segment may not contain.
const FORBIDDEN: [char; 5] = ['.', '#', '$', '[', ']'];

/// Prefix of keys generated by [`next_push_key`].
const PUSH_KEY_PREFIX: &str = "-c";

/// Split a path into validated segments.
pub fn segments(path: &str) -> Result<Vec<&str>, StoreError> {
    let segs: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segs.is_empty() {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    if segs.iter().any(|s| s.contains(FORBIDDEN)) {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(segs)
}

/// Look up the node at `segs`. Absent and `null` nodes both yield `None`.
pub fn get<'a>(root: &'a Value, segs: &[&str]) -> Option<&'a Value> {
    let mut node = root;
    for seg in segs {
        node = node.as_object()?.get(*seg)?;
    }
    if node.is_null() {
        None
    } else {
        Some(node)
    }
}

/// Replace the node at `segs`. A `null` (or empty) value removes it.
pub fn set(root: &mut Value, segs: &[&str], value: Value) {
    let value = normalize(value);
    if value.is_null() {
        remove(root, segs);
        return;
    }

    let Some((last, parents)) = segs.split_last() else {
        *root = value;
        return;
    };

    let mut map = ensure_object(root);
    for seg in parents {
        let child = map
            .entry((*seg).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        map = ensure_object(child);
    }
    map.insert((*last).to_string(), value);
}

/// Merge `fields` into the node at `segs`. Field keys may themselves be
/// relative paths (`client/connected`).
pub fn update(root: &mut Value, segs: &[&str], fields: Map<String, Value>) {
    for (key, value) in fields {
        let mut path: Vec<&str> = segs.to_vec();
        path.extend(key.split('/').filter(|s| !s.is_empty()));
        set(root, &path, value);
    }
}

/// Remove the node at `segs`, pruning parents left empty.
pub fn remove(root: &mut Value, segs: &[&str]) {
    fn walk(node: &mut Value, segs: &[&str]) {
        let Some((head, rest)) = segs.split_first() else {
            return;
        };
        let Value::Object(map) = node else {
            return;
        };
        if rest.is_empty() {
            map.remove(*head);
            return;
        }
        if let Some(child) = map.get_mut(*head) {
            walk(child, rest);
            if is_empty(child) {
                map.remove(*head);
            }
        }
    }

    if segs.is_empty() {
        *root = Value::Null;
    } else {
        walk(root, segs);
    }
}

/// Next append key for the log stored at `existing`.
///
/// Keys are fixed-width and strictly increasing, so key order is append order.
pub fn next_push_key(existing: Option<&Value>) -> String {
    let last = existing
        .and_then(Value::as_object)
        .map(|children| {
            children
                .keys()
                .filter_map(|k| k.strip_prefix(PUSH_KEY_PREFIX))
                .filter_map(|n| n.parse::<u64>().ok())
                .max()
                .unwrap_or(0)
        })
        .unwrap_or(0);
    format!("{PUSH_KEY_PREFIX}{:012}", last + 1)
}

/// Drop `null` members and empty objects, recursively.
pub fn normalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let cleaned: Map<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, normalize(v)))
                .filter(|(_, v)| !v.is_null())
                .collect();
            if cleaned.is_empty() {
                Value::Null
            } else {
                Value::Object(cleaned)
            }
        }
        other => other,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    match node {
        Value::Object(map) => map,
        other => {
            *other = Value::Object(Map::new());
            ensure_object(other)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_segments_rejects_empty_and_forbidden() {
        assert!(segments("").is_err());
        assert!(segments("///").is_err());
        assert!(segments("sessions/a.b").is_err());
        assert_eq!(segments("/sessions//abc/").unwrap(), vec!["sessions", "abc"]);
    }

    #[test]
    fn test_set_creates_intermediate_objects() {
        let mut root = Value::Null;
        set(&mut root, &["sessions", "s1", "lockState"], json!("locked"));
        assert_eq!(root, json!({"sessions": {"s1": {"lockState": "locked"}}}));
    }

    #[test]
    fn test_set_null_removes_and_prunes() {
        let mut root = json!({"sessions": {"s1": {"lockState": "locked"}}});
        set(&mut root, &["sessions", "s1", "lockState"], Value::Null);
        assert_eq!(root, json!({}));
    }

    #[test]
    fn test_set_strips_nested_nulls() {
        let mut root = Value::Null;
        set(
            &mut root,
            &["s"],
            json!({"client": {"connected": false, "lastSeen": null}, "commands": {}}),
        );
        assert_eq!(root, json!({"s": {"client": {"connected": false}}}));
    }

    #[test]
    fn test_update_merges_fields() {
        let mut root = json!({"s": {"client": {"connected": false, "lastSeen": 1}}});
        let mut fields = Map::new();
        fields.insert("connected".into(), json!(true));
        fields.insert("deviceInfo/platform".into(), json!("linux"));
        update(&mut root, &["s", "client"], fields);
        assert_eq!(
            root,
            json!({"s": {"client": {"connected": true, "lastSeen": 1, "deviceInfo": {"platform": "linux"}}}})
        );
    }

    #[test]
    fn test_get_treats_null_as_absent() {
        let root = json!({"a": {"b": null}});
        assert!(get(&root, &["a", "b"]).is_none());
        assert!(get(&root, &["a", "missing"]).is_none());
        assert!(get(&root, &["a"]).is_some());
    }

    #[test]
    fn test_next_push_key_is_ordered() {
        let first = next_push_key(None);
        let mut log = Map::new();
        log.insert(first.clone(), json!(1));
        let second = next_push_key(Some(&Value::Object(log)));
        assert!(second > first);
        assert_eq!(first.len(), second.len());
    }
}
