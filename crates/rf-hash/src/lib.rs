// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deterministic canonical JSON serialization and SHA-256 fingerprinting.
//!
//! Every hash the engine stores is computed over the canonical form produced
//! here, so the same logical value always fingerprints identically across
//! platforms and processes:
//!
//! - object keys are emitted in sorted order,
//! - array order is preserved,
//! - non-finite numbers are stringified (`"NaN"`, `"Infinity"`, `"-Infinity"`),
//! - absent values collapse to `null`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Recursively normalize a JSON value into its canonical shape.
///
/// The result is structurally equal for any key ordering of the input's
/// objects. Arrays keep their order.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Serialize a JSON value to its canonical string form.
///
/// # Examples
///
/// ```
/// use serde_json::json;
///
/// let a = rf_hash::canonical_json(&json!({"b": 1, "a": 2}));
/// let b = rf_hash::canonical_json(&json!({"a": 2, "b": 1}));
/// assert_eq!(a, b);
/// assert_eq!(a, r#"{"a":2,"b":1}"#);
/// ```
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(&mut out, value);
    out
}

fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            // serde_json escaping is deterministic.
            out.push_str(&serde_json::to_string(s).expect("string serialization is infallible"));
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            for (i, (k, v)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(
                    &serde_json::to_string(k).expect("string serialization is infallible"),
                );
                out.push(':');
                write_canonical(out, v);
            }
            out.push('}');
        }
    }
}

/// Convert a float into a canonical JSON value, stringifying non-finite
/// values (JSON numbers cannot represent them).
pub fn number_value(f: f64) -> Value {
    match serde_json::Number::from_f64(f) {
        Some(n) => Value::Number(n),
        None if f.is_nan() => Value::String("NaN".into()),
        None if f.is_sign_positive() => Value::String("Infinity".into()),
        None => Value::String("-Infinity".into()),
    }
}

/// Hex-encoded SHA-256 of raw bytes.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Hex-encoded SHA-256 of a value's canonical JSON form.
///
/// # Examples
///
/// ```
/// use serde_json::json;
///
/// // sha256 of the canonical form `"hi"`.
/// let h = rf_hash::hash_value(&json!("hi"));
/// assert_eq!(h.len(), 64);
/// assert_eq!(h, rf_hash::hash_bytes(b"\"hi\""));
/// ```
pub fn hash_value(value: &Value) -> String {
    hash_bytes(canonical_json(value).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_affect_output() {
        let a = json!({"z": [1, 2], "a": {"y": 1, "x": 2}});
        let b = json!({"a": {"x": 2, "y": 1}, "z": [1, 2]});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(hash_value(&a), hash_value(&b));
    }

    #[test]
    fn array_order_is_preserved() {
        assert_ne!(hash_value(&json!([1, 2])), hash_value(&json!([2, 1])));
    }

    #[test]
    fn canonical_form_is_compact_and_sorted() {
        let v = json!({"b": 1, "a": null, "c": "x"});
        assert_eq!(canonical_json(&v), r#"{"a":null,"b":1,"c":"x"}"#);
    }

    #[test]
    fn string_escaping_matches_serde() {
        let v = json!("a\"b\\c\n");
        assert_eq!(canonical_json(&v), serde_json::to_string(&v).unwrap());
    }

    #[test]
    fn non_finite_numbers_stringify() {
        assert_eq!(number_value(f64::NAN), json!("NaN"));
        assert_eq!(number_value(f64::INFINITY), json!("Infinity"));
        assert_eq!(number_value(f64::NEG_INFINITY), json!("-Infinity"));
        assert_eq!(number_value(1.5), json!(1.5));
    }

    #[test]
    fn known_sha256_vector() {
        // sha256("\"hi\"")
        assert_eq!(
            hash_value(&json!("hi")),
            "b49177e05868b7af8e82a644c1ce20e521af46497adeaffe861d294d9b4bb75e"
        );
    }

    #[test]
    fn canonicalize_sorts_nested_objects() {
        let v = canonicalize(&json!({"b": {"d": 1, "c": 2}, "a": 3}));
        let keys: Vec<&String> = v.as_object().unwrap().keys().collect();
        assert_eq!(keys, ["a", "b"]);
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            "[a-zA-Z0-9 ]{0,12}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn hash_is_stable_under_reserialization(v in arb_json()) {
            // Round-tripping through serde_json must not change the hash.
            let text = serde_json::to_string(&v).unwrap();
            let back: Value = serde_json::from_str(&text).unwrap();
            prop_assert_eq!(hash_value(&v), hash_value(&back));
        }

        #[test]
        fn canonicalize_is_idempotent(v in arb_json()) {
            let once = canonicalize(&v);
            let twice = canonicalize(&once);
            prop_assert_eq!(once, twice);
        }
    }
}
