//! Content hashing for schema definitions and entity payloads
//!
//! The digest is SHA-256 over canonical JSON: compact output with object keys
//! sorted at every depth, so key order and whitespace never change the hash.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Hash a JSON value, returning the lowercase hex digest.
pub fn content_hash(value: &Value) -> String {
    let canonical = canonicalize(value);
    // Serializing a `Value` cannot fail: every key is already a string.
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Rebuild a value with object keys inserted in sorted order.
///
/// Rebuilding keeps the ordering correct even when `serde_json` is compiled
/// with `preserve_order`.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = Map::with_capacity(map.len());
            for (key, item) in entries {
                sorted.insert(key.clone(), canonicalize(item));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
