//! Canonical, deterministic payload serialization.
//!
//! Arbitrary caller-supplied payloads are normalized into an owned [`Value`]
//! tree before they are hashed or signed, so that two semantically identical
//! payloads (different map key order, `-0.0` vs `0.0`, a `Decimal`-typed
//! float vs a plain `f64`) always produce byte-identical canonical JSON.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value as JsonValue};

use crate::errors::{LedgerError, Result};

/// A normalized, immutable payload value.
///
/// `Map` uses a [`BTreeMap`] so that key order is a property of the type
/// itself rather than something `canonical_json` must re-sort at encode
/// time; once a `Value` exists there is no mutable alias that could change
/// it out from under a caller, which is what gives [`snapshot`] its
/// immutability guarantee.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// JSON `null`.
    Null,
    /// A boolean.
    Bool(bool),
    /// An integer that fits losslessly in `i64`.
    Int(i64),
    /// A finite floating-point number, already normalized.
    Float(NormalizedFloat),
    /// A UTF-8 string (timestamps are represented as strings here; the
    /// canonicalization of a `DateTime` happens before constructing a
    /// `Value`, via [`crate::time::format_canonical`]).
    String(String),
    /// An ordered sequence of values.
    List(Vec<Value>),
    /// A sorted string-keyed map.
    Map(BTreeMap<String, Value>),
}

/// A finite `f64` that compares and serializes identically regardless of
/// how it was produced (`-0.0` and `0.0` normalize to the same value).
#[derive(Debug, Clone, Copy)]
pub struct NormalizedFloat(f64);

impl NormalizedFloat {
    /// Construct a normalized float, rejecting NaN and infinities.
    pub fn new(value: f64) -> Result<Self> {
        if !value.is_finite() {
            return Err(LedgerError::InvalidValue {
                reason: format!("non-finite float '{value}' is not permitted"),
            });
        }
        // Round-trip through a fixed-precision decimal string so that
        // `-0.0` and `0.0`, and floats that differ only in trailing
        // representation noise, normalize identically.
        let normalized: f64 = format!("{value:.12}").parse().unwrap_or(value);
        let normalized = if normalized == 0.0 { 0.0 } else { normalized };
        Ok(NormalizedFloat(normalized))
    }

    /// The underlying value.
    pub fn get(&self) -> f64 {
        self.0
    }
}

impl PartialEq for NormalizedFloat {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits() || self.0 == other.0
    }
}

/// Recursively normalizes a `serde_json::Value` (or anything convertible to
/// one) into this crate's canonical [`Value`] tree.
pub fn normalize(input: &JsonValue) -> Result<Value> {
    match input {
        JsonValue::Null => Ok(Value::Null),
        JsonValue::Bool(b) => Ok(Value::Bool(*b)),
        JsonValue::Number(n) => normalize_number(n),
        JsonValue::String(s) => Ok(Value::String(s.clone())),
        JsonValue::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(normalize(item)?);
            }
            Ok(Value::List(out))
        }
        JsonValue::Object(map) => normalize_object(map),
    }
}

fn normalize_number(n: &Number) -> Result<Value> {
    if let Some(i) = n.as_i64() {
        return Ok(Value::Int(i));
    }
    if let Some(f) = n.as_f64() {
        return Ok(Value::Float(NormalizedFloat::new(f)?));
    }
    Err(LedgerError::InvalidValue {
        reason: format!("number '{n}' cannot be represented canonically"),
    })
}

fn normalize_object(map: &Map<String, JsonValue>) -> Result<Value> {
    let mut out = BTreeMap::new();
    for (key, value) in map {
        if key.is_empty() {
            return Err(LedgerError::InvalidKey {
                reason: "empty string keys are not permitted".into(),
            });
        }
        out.insert(key.clone(), normalize(value)?);
    }
    Ok(Value::Map(out))
}

/// A frozen payload: the result of [`snapshot`]. Structurally this is the
/// same type as [`Value`], but the distinct name documents at call sites
/// that the value has already been normalized and is safe to hash/sign.
#[derive(Debug, Clone, PartialEq)]
pub struct FrozenPayload(Value);

impl FrozenPayload {
    /// Borrow the underlying normalized value.
    pub fn value(&self) -> &Value {
        &self.0
    }
}

/// Normalizes and freezes a payload. Because [`Value`] owns all of its data
/// (no borrows into the caller's JSON), mutating the caller's original
/// `serde_json::Value` after this call can never change the snapshot.
pub fn snapshot(input: &JsonValue) -> Result<FrozenPayload> {
    Ok(FrozenPayload(normalize(input)?))
}

/// Serializes a [`Value`] to canonical JSON bytes: sorted keys (guaranteed
/// by `BTreeMap`), compact separators, UTF-8, no ASCII-escaping of
/// non-ASCII characters.
pub fn canonical_json(value: &Value) -> Result<Vec<u8>> {
    let json = to_json_value(value);
    // serde_json's default formatter already uses compact separators and
    // does not escape non-ASCII UTF-8; `to_vec` is therefore already
    // canonical once the `Value` tree is sorted, which `BTreeMap` gives us.
    serde_json::to_vec(&json).map_err(LedgerError::from)
}

/// Serializes a [`FrozenPayload`] to canonical JSON bytes.
pub fn canonical_json_frozen(payload: &FrozenPayload) -> Result<Vec<u8>> {
    canonical_json(&payload.0)
}

/// Converts a normalized [`Value`] back into a `serde_json::Value`, for
/// embedding inside larger structures (e.g. a receipt body) that are
/// themselves serialized with `serde_json`.
pub fn to_json(value: &Value) -> JsonValue {
    to_json_value(value)
}

fn to_json_value(value: &Value) -> JsonValue {
    match value {
        Value::Null => JsonValue::Null,
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Int(i) => JsonValue::Number((*i).into()),
        Value::Float(f) => Number::from_f64(f.get())
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        Value::String(s) => JsonValue::String(s.clone()),
        Value::List(items) => JsonValue::Array(items.iter().map(to_json_value).collect()),
        Value::Map(map) => {
            let mut obj = Map::new();
            for (k, v) in map {
                obj.insert(k.clone(), to_json_value(v));
            }
            JsonValue::Object(obj)
        }
    }
}

/// A serde-friendly wrapper so a [`Value`] can be embedded directly inside
/// a struct that derives `Serialize`/`Deserialize` (receipts do this for
/// their `payload` field).
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalValue(pub Value);

impl Serialize for CanonicalValue {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        to_json_value(&self.0).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CanonicalValue {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = JsonValue::deserialize(deserializer)?;
        let value = normalize(&raw).map_err(serde::de::Error::custom)?;
        Ok(CanonicalValue(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_affect_canonical_bytes() {
        let a = normalize(&json!({"b": 1, "a": 2})).unwrap();
        let b = normalize(&json!({"a": 2, "b": 1})).unwrap();
        assert_eq!(canonical_json(&a).unwrap(), canonical_json(&b).unwrap());
    }

    #[test]
    fn negative_zero_normalizes_to_zero() {
        let neg = normalize(&json!(-0.0)).unwrap();
        let pos = normalize(&json!(0.0)).unwrap();
        assert_eq!(canonical_json(&neg).unwrap(), canonical_json(&pos).unwrap());
    }

    #[test]
    fn rejects_nan_and_infinity() {
        assert!(NormalizedFloat::new(f64::NAN).is_err());
        assert!(NormalizedFloat::new(f64::INFINITY).is_err());
    }

    #[test]
    fn snapshot_is_independent_of_source_mutation() {
        let mut source = json!({"x": 1});
        let frozen = snapshot(&source).unwrap();
        let before = canonical_json_frozen(&frozen).unwrap();
        source["x"] = json!(999);
        let after = canonical_json_frozen(&frozen).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn nested_structures_normalize_recursively() {
        let value = normalize(&json!({"outer": {"z": 1, "a": [3, 2, 1]}})).unwrap();
        let bytes = canonical_json(&value).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text, r#"{"outer":{"a":[3,2,1],"z":1}}"#);
    }
}
