//! Summary: Canonical JSON encoding, content hashing, ids, and timestamps.
//! Copyright (c) YOAB. All rights reserved.
//!
//! Data lines must be canonical JSON (UTF-8, object keys sorted ascending,
//! no insignificant whitespace, no ASCII escaping) so that `len_data` and
//! `sha256_data` in meta lines stay stable across rewrites. Dirty tracking
//! reuses the same encoding as its baseline.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use ulid::Ulid;

/// Encodes a JSON value canonically.
///
/// `serde_json`'s object map is backed by a `BTreeMap`, so compact
/// serialization already yields sorted keys and unescaped UTF-8; this wrapper
/// pins that contract in one place.
pub fn canonical_json(value: &Value) -> String {
    // Serializing a `Value` cannot fail: keys are strings and numbers are finite.
    serde_json::to_string(value).expect("canonical serialization of a JSON value")
}

/// Returns the lowercase hex SHA-256 of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Generates a new 26-character ULID string for a record id.
pub fn new_ulid() -> String {
    Ulid::new().to_string()
}

/// Current time as an ISO-8601 UTC string with millisecond precision.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parses an ISO-8601 timestamp into epoch milliseconds.
///
/// Unparseable input maps to 0 so that a damaged meta timestamp never
/// poisons an open scan.
pub fn iso_to_epoch_ms(ts: &str) -> i64 {
    DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(0)
}

/// Renders epoch milliseconds back as an ISO-8601 UTC string.
pub fn epoch_ms_to_iso(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(now_iso)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_sorts_keys() {
        let v = json!({"b": 1, "a": {"z": true, "k": null}});
        assert_eq!(canonical_json(&v), r#"{"a":{"k":null,"z":true},"b":1}"#);
    }

    #[test]
    fn test_canonical_no_ascii_escapes() {
        let v = json!({"city": "Wien", "note": "grüß"});
        assert_eq!(canonical_json(&v), "{\"city\":\"Wien\",\"note\":\"grüß\"}");
    }

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_ulid_shape() {
        let id = new_ulid();
        assert_eq!(id.len(), 26);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_iso_roundtrip() {
        let ts = now_iso();
        let ms = iso_to_epoch_ms(&ts);
        assert!(ms > 0);
        assert_eq!(iso_to_epoch_ms(&epoch_ms_to_iso(ms)), ms);
    }

    #[test]
    fn test_iso_garbage_is_zero() {
        assert_eq!(iso_to_epoch_ms("not a timestamp"), 0);
    }
}
