//! Persistence layer: session messages, metadata blobs and statistics.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use memory::MemoryStore;
pub use traits::{MessageSummary, SessionMessage, SessionStats, SessionStore};

use serde_json::Value;

/// Deep-merge `patch` into `base`: objects merge key by key, everything
/// else (arrays included) is replaced.
pub fn merge_json(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match base_map.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_json(existing, value);
                    }
                    _ => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_preserves_unrelated_keys() {
        let mut base = json!({
            "title": "Trip planning",
            "rootIds": {"other-session": "root_a"},
            "trajectory": {"items": [1, 2]}
        });
        merge_json(
            &mut base,
            &json!({
                "rootIds": {"this-session": "root_b"},
                "trajectory": {"items": [1, 2, 3], "completed": true}
            }),
        );

        assert_eq!(base["title"], "Trip planning");
        assert_eq!(base["rootIds"]["other-session"], "root_a");
        assert_eq!(base["rootIds"]["this-session"], "root_b");
        assert_eq!(base["trajectory"]["items"], json!([1, 2, 3]));
        assert_eq!(base["trajectory"]["completed"], true);
    }

    #[test]
    fn merge_replaces_non_objects() {
        let mut base = json!("scalar");
        merge_json(&mut base, &json!({"a": 1}));
        assert_eq!(base, json!({"a": 1}));
    }
}
