//! Canonical JSON and request digests.
//!
//! A job stores the digest of its request so a resumed job can prove it is
//! replaying the journal it wrote.

use perfbisect_state::ContentDigest;
use serde::Serialize;

use crate::domain::error::{BisectError, Result};

/// Recursively sort object keys; arrays keep their order.
fn sort_keys(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            let mut sorted = serde_json::Map::new();
            for key in keys {
                if let Some(v) = map.get(key) {
                    sorted.insert(key.clone(), sort_keys(v));
                }
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(arr) => serde_json::Value::Array(arr.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// Compact JSON with sorted keys.
pub fn canonical_json(value: &serde_json::Value) -> Result<String> {
    Ok(serde_json::to_string(&sort_keys(value))?)
}

/// SHA-256 of the canonical JSON form of `value`.
pub fn digest_of<T: Serialize>(value: &T) -> Result<ContentDigest> {
    let json = serde_json::to_value(value).map_err(BisectError::Serialization)?;
    let canonical = canonical_json(&json)?;
    Ok(ContentDigest::from_bytes(canonical.as_bytes()))
}
