//! Canonical JSON encoding and reference hashes.
//!
//! Canonical JSON is what content hashes are computed over, so two servers
//! holding the same event agree on its ID:
//!
//! - Object keys are sorted by their UTF-8 bytes
//! - No insignificant whitespace
//! - Numbers must be integers
//! - Strings use the shortest JSON escaping

use crate::error::{EventError, EventResult};
use crate::version::EventIdFormat;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Encodes any serializable value as canonical JSON bytes.
pub fn to_canonical_json<T: Serialize>(value: &T) -> EventResult<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    let mut out = Vec::with_capacity(256);
    write_value(&value, &mut out)?;
    Ok(out)
}

fn write_value(value: &Value, out: &mut Vec<u8>) -> EventResult<()> {
    match value {
        Value::Null | Value::Bool(_) | Value::String(_) => {
            serde_json::to_writer(&mut *out, value)?;
        }
        Value::Number(n) => {
            if !(n.is_i64() || n.is_u64()) {
                return Err(EventError::json(format!(
                    "non-integer number {n} is not permitted in canonical JSON"
                )));
            }
            serde_json::to_writer(&mut *out, value)?;
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
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable_by(|a, b| a.as_bytes().cmp(b.as_bytes()));
            out.push(b'{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                serde_json::to_writer(&mut *out, key)?;
                out.push(b':');
                write_value(&map[key], out)?;
            }
            out.push(b'}');
        }
    }
    Ok(())
}

/// Computes the SHA-256 reference hash of an event-shaped JSON object.
///
/// The `event_id` field is never part of the hash, since for hash-based
/// formats it is derived from it.
pub fn reference_hash<T: Serialize>(event: &T) -> EventResult<[u8; 32]> {
    let mut value = serde_json::to_value(event)?;
    if let Value::Object(map) = &mut value {
        map.remove("event_id");
    }
    let bytes = to_canonical_json(&value)?;
    Ok(Sha256::digest(&bytes).into())
}

/// Formats a reference hash as an event ID. Returns `None` for
/// [`EventIdFormat::Origin`], where the origin chooses the ID.
#[must_use]
pub fn event_id_from_hash(format: EventIdFormat, hash: &[u8; 32]) -> Option<String> {
    match format {
        EventIdFormat::Origin => None,
        EventIdFormat::ReferenceHash => Some(format!("${}", STANDARD_NO_PAD.encode(hash))),
        EventIdFormat::UrlSafeReferenceHash => Some(format!("${}", URL_SAFE_NO_PAD.encode(hash))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted() {
        let value = json!({"b": 1, "a": {"d": 2, "c": [3, {"z": 0, "y": 1}]}});
        let bytes = to_canonical_json(&value).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"a":{"c":[3,{"y":1,"z":0}],"d":2},"b":1}"#
        );
    }

    #[test]
    fn strings_are_escaped() {
        let value = json!({"k": "line\nbreak \"quoted\""});
        let bytes = to_canonical_json(&value).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"k":"line\nbreak \"quoted\""}"#
        );
    }

    #[test]
    fn floats_are_rejected() {
        let value = json!({"pi": 3.14});
        assert!(to_canonical_json(&value).is_err());
    }

    #[test]
    fn hash_ignores_event_id() {
        let a = json!({"event_id": "$one", "type": "m.room.message"});
        let b = json!({"event_id": "$two", "type": "m.room.message"});
        assert_eq!(reference_hash(&a).unwrap(), reference_hash(&b).unwrap());
    }

    #[test]
    fn hash_changes_with_content() {
        let a = json!({"type": "m.room.message", "content": {"body": "hi"}});
        let b = json!({"type": "m.room.message", "content": {"body": "ho"}});
        assert_ne!(reference_hash(&a).unwrap(), reference_hash(&b).unwrap());
    }

    #[test]
    fn event_id_formats() {
        let hash = [0xfb; 32];
        assert!(event_id_from_hash(EventIdFormat::Origin, &hash).is_none());

        let standard = event_id_from_hash(EventIdFormat::ReferenceHash, &hash).unwrap();
        let url_safe = event_id_from_hash(EventIdFormat::UrlSafeReferenceHash, &hash).unwrap();
        assert!(standard.starts_with('$'));
        assert!(standard.contains('+') || standard.contains('/'));
        assert!(!url_safe.contains('+') && !url_safe.contains('/'));
        assert!(!standard.ends_with('='));
    }
}
