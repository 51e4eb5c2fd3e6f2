//! Deep structural hashing for fetch verification.
//!
//! The three-phase make protocol runs its compute step outside any
//! transaction. Before inserting the computed result, the engine re-fetches
//! the inputs and compares structural digests: a mismatch means the inputs
//! changed underneath the computation and the result must be discarded.
//!
//! The digest distinguishes sequence order (two arrays with the same
//! elements in different order hash differently) but not map insertion
//! order (objects hash by sorted key). It is used only for equality
//! comparison within one populate call and is never persisted.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::PopulateError;

/// Hash any serializable value by structure.
///
/// Serialization failures surface as configuration errors: a fetch payload
/// that cannot be serialized cannot be verified, so it cannot participate
/// in the three-phase protocol.
pub fn deep_hash_of<T: Serialize>(value: &T) -> Result<String, PopulateError> {
    let value = serde_json::to_value(value).map_err(|e| PopulateError::Configuration {
        table: String::new(),
        reason: format!("fetch payload is not serializable: {e}"),
    })?;
    Ok(deep_hash(&value))
}

/// Hash a JSON value by structure, returning a hex digest.
pub fn deep_hash(value: &Value) -> String {
    let mut hasher = Sha256::new();
    fold(&mut hasher, value);
    format!("{:x}", hasher.finalize())
}

// Each node contributes a type tag and a length prefix so that, for
// example, the string "12" and the number 12 never collide, and neither do
// ["ab"] and ["a","b"].
fn fold(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => {
            hasher.update(b"n");
        }
        Value::Bool(b) => {
            hasher.update(if *b { b"t" } else { b"f" });
        }
        Value::Number(n) => {
            hasher.update(b"#");
            let text = n.to_string();
            hasher.update((text.len() as u64).to_le_bytes());
            hasher.update(text.as_bytes());
        }
        Value::String(s) => {
            hasher.update(b"s");
            hasher.update((s.len() as u64).to_le_bytes());
            hasher.update(s.as_bytes());
        }
        Value::Array(items) => {
            hasher.update(b"[");
            hasher.update((items.len() as u64).to_le_bytes());
            for item in items {
                fold(hasher, item);
            }
        }
        Value::Object(map) => {
            // serde_json maps iterate in sorted key order, which makes the
            // digest insensitive to construction order
            hasher.update(b"{");
            hasher.update((map.len() as u64).to_le_bytes());
            for (key, item) in map {
                hasher.update((key.len() as u64).to_le_bytes());
                hasher.update(key.as_bytes());
                fold(hasher, item);
            }
        }
    }
}
