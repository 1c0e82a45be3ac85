//! Canonical serialization and SHA-256 hashing.
//!
//! A record is first converted into a JSON value, then written with object
//! keys sorted byte-wise at every nesting level and no insignificant
//! whitespace. Two honest producers of identical logical content therefore
//! emit identical bytes, independent of struct field order, map iteration
//! order, or serde_json feature flags elsewhere in the build.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::CryptoError;

/// Canonical byte encoding of any serializable value.
pub fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CryptoError> {
    let value = serde_json::to_value(value).map_err(|e| CryptoError::Canonical(e.to_string()))?;
    let mut out = Vec::with_capacity(256);
    write_value(&value, &mut out)?;
    Ok(out)
}

/// Lowercase hex SHA-256 of the canonical encoding of `value`.
pub fn canonical_hash<T: Serialize + ?Sized>(value: &T) -> Result<String, CryptoError> {
    Ok(sha256_hex(&canonical_bytes(value)?))
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

fn write_value(value: &Value, out: &mut Vec<u8>) -> Result<(), CryptoError> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_scalar(&Value::String(key.clone()), out)?;
                out.push(b':');
                write_value(&map[key], out)?;
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(item, out)?;
            }
            out.push(b']');
        }
        scalar => write_scalar(scalar, out)?,
    }
    Ok(())
}

fn write_scalar(value: &Value, out: &mut Vec<u8>) -> Result<(), CryptoError> {
    serde_json::to_writer(&mut *out, value).map_err(|e| CryptoError::Canonical(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Serialize)]
    struct Ab {
        b: u32,
        a: &'static str,
    }

    #[derive(Serialize)]
    struct Ba {
        a: &'static str,
        b: u32,
    }

    #[test]
    fn test_field_order_does_not_matter() {
        let x = canonical_bytes(&Ab { b: 1, a: "x" }).unwrap();
        let y = canonical_bytes(&Ba { a: "x", b: 1 }).unwrap();
        assert_eq!(x, y);
        assert_eq!(x, br#"{"a":"x","b":1}"#.to_vec());
    }

    #[test]
    fn test_nested_maps_sorted() {
        let mut inner = HashMap::new();
        inner.insert("zeta", 1);
        inner.insert("alpha", 2);
        let mut outer = HashMap::new();
        outer.insert("outer", inner);

        let bytes = canonical_bytes(&outer).unwrap();
        assert_eq!(bytes, br#"{"outer":{"alpha":2,"zeta":1}}"#.to_vec());
    }

    #[test]
    fn test_hash_is_stable_and_sensitive() {
        let h1 = canonical_hash(&Ab { b: 1, a: "x" }).unwrap();
        let h2 = canonical_hash(&Ab { b: 1, a: "x" }).unwrap();
        let h3 = canonical_hash(&Ab { b: 2, a: "x" }).unwrap();
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn test_strings_are_escaped() {
        let bytes = canonical_bytes(&"quote\"d").unwrap();
        assert_eq!(bytes, br#""quote\"d""#.to_vec());
    }
}
