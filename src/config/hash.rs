//! Canonical hashing for change detection.
//!
//! Attribute hashes decide whether a resource needs an update; the document
//! hash is recorded in state to tell whether the document changed between runs.

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::spec::Document;
use crate::graph::Attributes;

/// Hasher for attributes and documents.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Hashes resolved attributes. Key order never affects the result.
    #[must_use]
    pub fn hash_attributes(&self, attributes: &Attributes) -> String {
        let mut hasher = Sha256::new();
        for (key, value) in attributes {
            feed_str(&mut hasher, key);
            feed_value(&mut hasher, value);
        }
        hex::encode(hasher.finalize())
    }

    /// Hashes an arbitrary JSON value.
    #[must_use]
    pub fn hash_value(&self, value: &Value) -> String {
        let mut hasher = Sha256::new();
        feed_value(&mut hasher, value);
        hex::encode(hasher.finalize())
    }

    /// Hashes the whole document.
    #[must_use]
    pub fn hash_document(&self, doc: &Document) -> String {
        match serde_json::to_value(doc) {
            Ok(value) => self.hash_value(&value),
            // Document only holds JSON-representable data.
            Err(_) => String::new(),
        }
    }

    /// Returns the first 12 characters of a hash.
    #[must_use]
    pub fn short_hash(hash: &str) -> &str {
        hash.get(..12).unwrap_or(hash)
    }
}

fn feed_str(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u64).to_be_bytes());
    hasher.update(s.as_bytes());
}

fn feed_value(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update([0u8]),
        Value::Bool(b) => hasher.update([1u8, u8::from(*b)]),
        Value::Number(n) => {
            hasher.update([2u8]);
            feed_str(hasher, &n.to_string());
        }
        Value::String(s) => {
            hasher.update([3u8]);
            feed_str(hasher, s);
        }
        Value::Array(items) => {
            hasher.update([4u8]);
            hasher.update((items.len() as u64).to_be_bytes());
            for item in items {
                feed_value(hasher, item);
            }
        }
        Value::Object(entries) => {
            hasher.update([5u8]);
            hasher.update((entries.len() as u64).to_be_bytes());
            let mut keys: Vec<&String> = entries.keys().collect();
            keys.sort();
            for key in keys {
                feed_str(hasher, key);
                feed_value(hasher, &entries[key]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(pairs: &[(&str, Value)]) -> Attributes {
        pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
    }

    #[test]
    fn test_hash_is_deterministic() {
        let hasher = ConfigHasher::new();
        let a = attrs(&[("cidr", json!("10.0.0.0/16")), ("tags", json!({"a": 1, "b": 2}))]);
        let b = attrs(&[("tags", json!({"b": 2, "a": 1})), ("cidr", json!("10.0.0.0/16"))]);

        assert_eq!(hasher.hash_attributes(&a), hasher.hash_attributes(&b));
        assert_eq!(hasher.hash_attributes(&a).len(), 64);
    }

    #[test]
    fn test_hash_distinguishes_types() {
        let hasher = ConfigHasher::new();
        assert_ne!(
            hasher.hash_attributes(&attrs(&[("size", json!(3))])),
            hasher.hash_attributes(&attrs(&[("size", json!("3"))]))
        );
        assert_ne!(
            hasher.hash_value(&json!(["ab", "c"])),
            hasher.hash_value(&json!(["a", "bc"]))
        );
    }

    #[test]
    fn test_short_hash() {
        assert_eq!(ConfigHasher::short_hash("0123456789abcdef"), "0123456789ab");
        assert_eq!(ConfigHasher::short_hash("abc"), "abc");
    }
}
