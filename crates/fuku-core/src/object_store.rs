//! Blob storage under the `fuku/` prefix of the configured bucket
//!
//! Lookups distinguish "not there" (`Ok(None)`) from failures the caller
//! should surface: access denied and an unavailable backend.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Prefix every fuku object lives under
pub const OBJECT_PREFIX: &str = "fuku/";

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("access denied to object {key}")]
    AccessDenied { key: String },

    #[error("object storage unavailable for {key}: {reason}")]
    Unavailable { key: String, reason: String },
}

/// Keys are relative to [`OBJECT_PREFIX`].
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ObjectStoreError>;

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), ObjectStoreError>;
}

/// In-process object store, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    denied: Mutex<BTreeSet<String>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later access to `key` fail with [`ObjectStoreError::AccessDenied`].
    pub fn deny(&self, key: impl Into<String>) {
        self.denied.lock().insert(key.into());
    }

    fn check(&self, key: &str) -> Result<(), ObjectStoreError> {
        if self.denied.lock().contains(key) {
            return Err(ObjectStoreError::AccessDenied {
                key: key.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ObjectStoreError> {
        self.check(key)?;
        Ok(self.objects.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), ObjectStoreError> {
        self.check(key)?;
        self.objects.lock().insert(key.to_string(), body);
        Ok(())
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_object_is_none() {
        let store = MemoryObjectStore::new();
        assert!(store.get("prod/key.pem.gpg").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_access_denied_is_distinct_from_missing() {
        let store = MemoryObjectStore::new();
        store.deny("prod/key.pem.gpg");
        let err = store.get("prod/key.pem.gpg").await.unwrap_err();
        assert!(matches!(err, ObjectStoreError::AccessDenied { .. }));
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let store = MemoryObjectStore::new();
        store.put("prod/key.pem.gpg", b"sealed".to_vec()).await.unwrap();
        assert_eq!(
            store.get("prod/key.pem.gpg").await.unwrap(),
            Some(b"sealed".to_vec())
        );
        assert!(store.get("staging/key.pem.gpg").await.unwrap().is_none());
    }
}
