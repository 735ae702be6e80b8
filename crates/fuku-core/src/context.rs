use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{FukuError, Result};

/// Flat configuration assembled from the selections of a module and everything
/// it depends on (`region`, `profile`, `bucket`, `cluster`, `app`, `db`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Context(BTreeMap<String, String>);

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Like [`Context::get`] but a missing key is an error.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| FukuError::MissingContext(key.to_string()))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Fold `other` into this context; keys from `other` win.
    pub fn merge(&mut self, other: Context) {
        self.0.extend(other.0);
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> = self.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{{{}}}", pairs.join(", "))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Context {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_overwrites() {
        let mut ctx = Context::new().with("region", "us-east-1").with("cluster", "prod");
        ctx.merge(Context::new().with("cluster", "staging").with("app", "api"));

        assert_eq!(ctx.get("region"), Some("us-east-1"));
        assert_eq!(ctx.get("cluster"), Some("staging"));
        assert_eq!(ctx.get("app"), Some("api"));
    }

    #[test]
    fn test_require_missing_key() {
        let ctx = Context::new();
        let err = ctx.require("bucket").unwrap_err();
        assert_eq!(err.to_string(), "missing context value: bucket");
    }

    #[test]
    fn test_display() {
        let ctx: Context = [("b", "2"), ("a", "1")].into_iter().collect();
        assert_eq!(ctx.to_string(), "{a=1, b=2}");
    }
}
