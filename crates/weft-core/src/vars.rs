//! Per-run variable store
//!
//! A mutable mapping from dotted, optionally indexed paths
//! (`steps.extract.result`, `items[2].name`) to JSON values. Seeded from
//! the run's initial variables and written only by the owning executor
//! when a step attempt succeeds.

use serde_json::{Map, Value};

/// One segment of a parsed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSeg {
    Key(String),
    Index(usize),
}

/// Parse `a.b[2].c` into segments. Empty segments and malformed index
/// brackets yield `None`.
pub fn parse_path(path: &str) -> Option<Vec<PathSeg>> {
    let mut segs = Vec::new();
    for part in path.split('.') {
        if part.is_empty() {
            return None;
        }
        let mut rest = part;
        // Leading key before any brackets.
        let key_end = rest.find('[').unwrap_or(rest.len());
        if key_end > 0 {
            segs.push(PathSeg::Key(rest[..key_end].to_string()));
        }
        rest = &rest[key_end..];
        while let Some(stripped) = rest.strip_prefix('[') {
            let close = stripped.find(']')?;
            let idx: usize = stripped[..close].parse().ok()?;
            segs.push(PathSeg::Index(idx));
            rest = &stripped[close + 1..];
        }
        if !rest.is_empty() {
            return None;
        }
    }
    if segs.is_empty() {
        None
    } else {
        Some(segs)
    }
}

/// Walk `value` along already parsed segments.
pub fn lookup<'a>(value: &'a Value, segs: &[PathSeg]) -> Option<&'a Value> {
    let mut current = value;
    for seg in segs {
        current = match (seg, current) {
            (PathSeg::Key(k), Value::Object(map)) => map.get(k)?,
            (PathSeg::Index(i), Value::Array(arr)) => arr.get(*i)?,
            _ => return None,
        };
    }
    Some(current)
}

/// The run-scoped variable store.
#[derive(Debug, Clone, Default)]
pub struct VariableStore {
    root: Map<String, Value>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from initial variables, exposed both at the top level and
    /// under the `inputs.` prefix.
    pub fn seeded(initial: impl IntoIterator<Item = (String, Value)>) -> Self {
        let mut store = Self::new();
        let mut inputs = Map::new();
        for (name, value) in initial {
            inputs.insert(name.clone(), value.clone());
            store.root.insert(name, value);
        }
        store.root.insert("inputs".to_string(), Value::Object(inputs));
        store
    }

    /// Rebuild a store from a snapshot produced by `as_value`. Non-object
    /// snapshots yield an empty store.
    pub fn from_snapshot(snapshot: Value) -> Self {
        match snapshot {
            Value::Object(root) => Self { root },
            _ => Self::new(),
        }
    }

    /// Look up a dotted path; `None` when the path is absent or malformed.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let segs = parse_path(path)?;
        let first = match segs.first()? {
            PathSeg::Key(k) => self.root.get(k)?,
            PathSeg::Index(_) => return None,
        };
        lookup(first, &segs[1..])
    }

    /// Write a value at a dotted path, creating intermediate objects.
    /// Array segments must already exist; writing through a missing index
    /// is rejected.
    pub fn set(&mut self, path: &str, value: Value) -> bool {
        let Some(segs) = parse_path(path) else {
            return false;
        };
        let Some(PathSeg::Key(first)) = segs.first() else {
            return false;
        };
        if segs.len() == 1 {
            self.root.insert(first.clone(), value);
            return true;
        }
        let slot = self
            .root
            .entry(first.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        set_inner(slot, &segs[1..], value)
    }

    /// Snapshot of the whole store as one JSON object.
    pub fn as_value(&self) -> Value {
        Value::Object(self.root.clone())
    }

    pub fn root(&self) -> &Map<String, Value> {
        &self.root
    }
}

fn set_inner(current: &mut Value, segs: &[PathSeg], value: Value) -> bool {
    let (head, tail) = match segs.split_first() {
        Some(split) => split,
        None => {
            *current = value;
            return true;
        }
    };
    match head {
        PathSeg::Key(k) => {
            if !current.is_object() {
                *current = Value::Object(Map::new());
            }
            let map = current.as_object_mut().expect("object ensured above");
            let slot = map.entry(k.clone()).or_insert(Value::Null);
            if slot.is_null() && !tail.is_empty() {
                *slot = Value::Object(Map::new());
            }
            set_inner(slot, tail, value)
        }
        PathSeg::Index(i) => match current.as_array_mut() {
            Some(arr) if *i < arr.len() => set_inner(&mut arr[*i], tail, value),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_path_segments() {
        assert_eq!(
            parse_path("a.b[2].c").unwrap(),
            vec![
                PathSeg::Key("a".into()),
                PathSeg::Key("b".into()),
                PathSeg::Index(2),
                PathSeg::Key("c".into()),
            ]
        );
        assert!(parse_path("").is_none());
        assert!(parse_path("a..b").is_none());
        assert!(parse_path("a[x]").is_none());
        assert!(parse_path("a[1").is_none());
    }

    #[test]
    fn test_seeded_exposes_inputs_prefix() {
        let store = VariableStore::seeded([("x".to_string(), json!(5))]);
        assert_eq!(store.get("x"), Some(&json!(5)));
        assert_eq!(store.get("inputs.x"), Some(&json!(5)));
        assert_eq!(store.get("inputs.missing"), None);
    }

    #[test]
    fn test_set_and_get_nested() {
        let mut store = VariableStore::new();
        assert!(store.set("steps.fetch.response", json!({"items": [1, 2, 3]})));
        assert_eq!(store.get("steps.fetch.response.items[1]"), Some(&json!(2)));
        assert!(store.set("steps.fetch.status", json!(200)));
        assert_eq!(store.get("steps.fetch.status"), Some(&json!(200)));
        // Existing value is untouched by the sibling write.
        assert_eq!(store.get("steps.fetch.response.items[0]"), Some(&json!(1)));
    }

    #[test]
    fn test_set_through_missing_index_rejected() {
        let mut store = VariableStore::new();
        store.set("arr", json!([1]));
        assert!(!store.set("arr[5]", json!(9)));
        assert!(store.set("arr[0]", json!(9)));
        assert_eq!(store.get("arr[0]"), Some(&json!(9)));
    }
}
