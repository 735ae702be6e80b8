//! Persisted key-value store
//!
//! One JSON document whose top-level keys are module names. Each module owns
//! the object stored under its name. The store is opened once when the process
//! starts and written back once when a command completes successfully.

use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{FukuError, Result};

#[derive(Debug, Default)]
pub struct Store {
    path: Option<PathBuf>,
    data: Map<String, Value>,
}

impl Store {
    /// Open the store at `path`, creating its parent directory when missing.
    /// A missing or empty file yields an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| FukuError::Store {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let data = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|source| FukuError::Store {
                path: path.clone(),
                source,
            })?;
            if content.trim().is_empty() {
                Map::new()
            } else {
                serde_json::from_str(&content).map_err(|source| FukuError::StoreFormat {
                    path: path.clone(),
                    source,
                })?
            }
        } else {
            Map::new()
        };

        debug!(path = %path.display(), modules = data.len(), "opened store");
        Ok(Self {
            path: Some(path),
            data,
        })
    }

    /// A store that is never written to disk
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write the whole document back to disk as pretty-printed JSON.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = serde_json::to_string_pretty(&self.data).map_err(|source| {
            FukuError::StoreFormat {
                path: path.clone(),
                source,
            }
        })?;
        fs::write(path, content).map_err(|source| FukuError::Store {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), "saved store");
        Ok(())
    }

    /// The private object owned by `module`, if anything has been stored for it
    pub fn module(&self, module: &str) -> Option<&Map<String, Value>> {
        self.data.get(module).and_then(Value::as_object)
    }

    /// The private object owned by `module`, created on first access
    pub fn module_mut(&mut self, module: &str) -> &mut Map<String, Value> {
        object_entry(
            self.data
                .entry(module.to_string())
                .or_insert_with(|| Value::Object(Map::new())),
        )
    }

    /// Look up a dotted path (`images.api.web.local`) inside a module's object.
    /// Any missing segment yields `None`.
    pub fn get(&self, module: &str, key: &str) -> Option<&Value> {
        let mut current = self.module(module)?;
        let mut parts = key.split('.').peekable();
        while let Some(part) = parts.next() {
            let value = current.get(part)?;
            if parts.peek().is_none() {
                return Some(value);
            }
            current = value.as_object()?;
        }
        None
    }

    pub fn get_str(&self, module: &str, key: &str) -> Option<&str> {
        self.get(module, key).and_then(Value::as_str)
    }

    /// Store `value` at a dotted path, creating intermediate objects. A falsy
    /// value removes the key instead of storing it.
    pub fn set(&mut self, module: &str, key: &str, value: impl Into<Value>) {
        let value = value.into();
        debug!(module, key, %value, "store set");

        let parts: Vec<&str> = key.split('.').collect();
        let (leaf, parents) = match parts.split_last() {
            Some(split) => split,
            None => return,
        };

        if is_falsy(&value) {
            let mut current = self.module_mut(module);
            for part in parents {
                match current.get_mut(*part).and_then(Value::as_object_mut) {
                    Some(next) => current = next,
                    None => return,
                }
            }
            current.remove(*leaf);
            return;
        }

        let mut current = self.module_mut(module);
        for part in parents {
            current = object_entry(
                current
                    .entry(part.to_string())
                    .or_insert_with(|| Value::Object(Map::new())),
            );
        }
        current.insert(leaf.to_string(), value);
    }

    pub fn remove(&mut self, module: &str, key: &str) {
        self.set(module, key, Value::Null);
    }
}

/// Coerce a slot into an object, replacing any scalar stored there.
fn object_entry(entry: &mut Value) -> &mut Map<String, Value> {
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    match entry {
        Value::Object(map) => map,
        _ => unreachable!("slot was just replaced with an object"),
    }
}

/// JSON values that count as "unset": null, false, zero, empty string,
/// empty array and empty object.
pub fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_set_and_get() {
        let mut store = Store::in_memory();
        store.set("cluster", "selected", "prod");
        assert_eq!(store.get_str("cluster", "selected"), Some("prod"));
        assert_eq!(store.get_str("app", "selected"), None);
    }

    #[test]
    fn test_falsy_values_remove_key() {
        for falsy in [
            Value::Null,
            json!(false),
            json!(0),
            json!(""),
            json!([]),
            json!({}),
        ] {
            let mut store = Store::in_memory();
            store.set("region", "selected", "ap-southeast-2");
            store.set("region", "selected", falsy.clone());
            assert!(
                store.get("region", "selected").is_none(),
                "{falsy} should remove the key"
            );
        }
    }

    #[test]
    fn test_truthy_values_are_kept() {
        let mut store = Store::in_memory();
        store.set("task", "count", 3);
        store.set("task", "enabled", true);
        assert_eq!(store.get("task", "count"), Some(&json!(3)));
        assert_eq!(store.get("task", "enabled"), Some(&json!(true)));
    }

    #[test]
    fn test_dotted_paths() {
        let mut store = Store::in_memory();
        store.set("image", "images.api.web.local", "api-web:dev");
        assert_eq!(
            store.get_str("image", "images.api.web.local"),
            Some("api-web:dev")
        );
        assert!(store.get("image", "images.api.missing.local").is_none());
        assert!(store.get("image", "images.api.web.local.deeper").is_none());

        store.remove("image", "images.api.web.local");
        assert!(store.get("image", "images.api.web.local").is_none());
        assert!(store.get("image", "images.api.web").is_some());
    }

    #[test]
    fn test_removing_missing_key_is_noop() {
        let mut store = Store::in_memory();
        store.remove("pg", "selected");
        store.remove("pg", "a.b.c");
        assert!(store.get("pg", "selected").is_none());
    }

    #[test]
    fn test_open_save_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("db.json");

        let mut store = Store::open(&path).unwrap();
        store.set("configuration", "bucket", "fuku-state");
        store.save().unwrap();

        let reopened = Store::open(&path).unwrap();
        assert_eq!(
            reopened.get_str("configuration", "bucket"),
            Some("fuku-state")
        );
    }

    #[test]
    fn test_open_rejects_invalid_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.json");
        fs::write(&path, "{not json").unwrap();

        let err = Store::open(&path).unwrap_err();
        assert!(matches!(err, FukuError::StoreFormat { .. }));
    }

    #[test]
    fn test_open_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.json");
        fs::write(&path, "").unwrap();

        let store = Store::open(&path).unwrap();
        assert!(store.module("cluster").is_none());
    }
}
