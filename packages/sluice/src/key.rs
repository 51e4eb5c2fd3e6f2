//! Canonical primary-key tuples and their fixed-width digests.
//!
//! A [`Key`] identifies one unit of population work: the primary-key tuple
//! of a row the make procedure is expected to produce. Keys are
//! canonicalized on construction - attributes follow the target's declared
//! primary-key order and values are normalized - so two keys compare equal
//! iff they address the same row, regardless of how they were assembled.
//!
//! [`Key::digest`] is the 32-character hex digest used as half of the jobs
//! registry's composite primary key. Digest equality is treated as key
//! equality throughout the engine.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PopulateError;
use crate::expr::Row;

/// One primary-key tuple, in canonical attribute order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    attrs: Vec<(String, Value)>,
}

impl Key {
    /// Build a key from `(attribute, value)` pairs already in primary-key
    /// order. Values are normalized (see [`normalize_value`]).
    pub fn new(attrs: Vec<(String, Value)>) -> Self {
        let attrs = attrs
            .into_iter()
            .map(|(name, value)| (name, normalize_value(value)))
            .collect();
        Self { attrs }
    }

    /// Extract a key from a fetched row, ordering attributes by the declared
    /// primary key. Fails when the row is missing a primary-key attribute.
    pub fn from_row(row: &Row, primary_key: &[String]) -> Result<Self, PopulateError> {
        let mut attrs = Vec::with_capacity(primary_key.len());
        for name in primary_key {
            let value = row.get(name).ok_or_else(|| PopulateError::Configuration {
                table: String::new(),
                reason: format!("fetched key is missing primary key attribute `{name}`"),
            })?;
            attrs.push((name.clone(), normalize_value(value.clone())));
        }
        Ok(Self { attrs })
    }

    /// The attributes of this key, in canonical order.
    pub fn attrs(&self) -> &[(String, Value)] {
        &self.attrs
    }

    /// Look up a single attribute value.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attrs
            .iter()
            .find(|(attr, _)| attr == name)
            .map(|(_, value)| value)
    }

    /// The key as a row, for use in restrictions and inserts.
    pub fn to_row(&self) -> Row {
        self.attrs.iter().cloned().collect()
    }

    /// The 32-character hex digest of the canonical serialization.
    ///
    /// Deterministic for canonically-equal keys; used as the `key_hash`
    /// column of the jobs registry.
    pub fn digest(&self) -> String {
        let mut encoded = Vec::new();
        for (name, value) in &self.attrs {
            encoded.extend_from_slice(name.as_bytes());
            encoded.push(b'=');
            // serde_json is deterministic for normalized scalar values
            encoded.extend_from_slice(value.to_string().as_bytes());
            encoded.push(b'\n');
        }
        format!("{:x}", md5::compute(&encoded))
    }

    /// The serialized key blob stored in the jobs registry for inspection.
    pub fn to_blob(&self) -> Value {
        Value::String(
            serde_json::to_string(&self.to_row()).unwrap_or_else(|_| String::from("{}")),
        )
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, (name, value)) in self.attrs.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        write!(f, ")")
    }
}

/// Normalize a value to its canonical form.
///
/// Floats with an exact integral value collapse to integers so that `2.0`
/// and `2` hash identically, matching how the database compares them.
pub fn normalize_value(value: Value) -> Value {
    match value {
        Value::Number(n) => {
            if n.is_f64() {
                let f = n.as_f64().unwrap_or_default();
                if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                    return Value::from(f as i64);
                }
            }
            Value::Number(n)
        }
        other => other,
    }
}
