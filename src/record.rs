//! Summary: Meta-line codec and the mutable document view with dirty tracking.
//! Copyright (c) YOAB. All rights reserved.
//!
//! Every logical write emits a meta line followed, for puts, by a canonical
//! JSON data line. The meta line carries the operation, the timestamp, and,
//! for puts, the byte length and SHA-256 of the data line (excluding its
//! trailing newline), which is what strict reads verify against.
//!
//! A [`Record`] is a detached view of one document: it carries its id, the
//! meta offset it was loaded from (the optimistic-concurrency marker), and
//! the canonical serialization captured at load/save time as the dirty
//! baseline. The database owns the index and the file handle; records save
//! and reload through it.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::canonical::{canonical_json, sha256_hex};
use crate::error::{Error, Result};

/// Operation recorded by a meta line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Put,
    Del,
}

/// One meta line of the record stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaLine {
    /// Line tag, always `"meta"`.
    #[serde(rename = "_t")]
    pub tag: String,
    /// Record id the operation applies to.
    pub id: String,
    /// `put` or `del`.
    pub op: Op,
    /// ISO-8601 UTC timestamp of the operation.
    pub ts: String,
    /// Byte length of the following data line, excluding the newline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub len_data: Option<u64>,
    /// Hex SHA-256 of the same bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256_data: Option<String>,
}

impl MetaLine {
    /// Builds a `put` meta line for the given canonical data bytes.
    pub fn put(id: impl Into<String>, ts: impl Into<String>, data: &[u8]) -> Self {
        Self {
            tag: "meta".to_string(),
            id: id.into(),
            op: Op::Put,
            ts: ts.into(),
            len_data: Some(data.len() as u64),
            sha256_data: Some(sha256_hex(data)),
        }
    }

    /// Builds a `del` (tombstone) meta line.
    pub fn del(id: impl Into<String>, ts: impl Into<String>) -> Self {
        Self {
            tag: "meta".to_string(),
            id: id.into(),
            op: Op::Del,
            ts: ts.into(),
            len_data: None,
            sha256_data: None,
        }
    }

    /// Encodes the meta line as a single JSON line (no trailing newline).
    pub fn encode(&self) -> String {
        // Serializing a plain data struct cannot fail.
        serde_json::to_string(self).expect("serializing meta line")
    }

    /// Decodes a meta line, checking the `_t` tag.
    ///
    /// # Errors
    ///
    /// Returns `IoCorruption` if the line is not valid JSON or is not a meta
    /// line.
    pub fn decode(line: &str) -> Result<Self> {
        let meta: MetaLine = serde_json::from_str(line)
            .map_err(|e| Error::corrupt(format!("unreadable meta line: {e}")))?;
        if meta.tag != "meta" {
            return Err(Error::corrupt(format!(
                "expected meta line, found tag `{}`",
                meta.tag
            )));
        }
        Ok(meta)
    }

    /// Verifies data bytes against the recorded length and hash.
    ///
    /// # Errors
    ///
    /// Returns `IoCorruption` on a length or hash mismatch.
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        if let Some(len) = self.len_data {
            if len != data.len() as u64 {
                return Err(Error::corrupt(format!(
                    "data length mismatch for `{}`: meta says {len}, line has {}",
                    self.id,
                    data.len()
                )));
            }
        }
        if let Some(expected) = &self.sha256_data {
            let actual = sha256_hex(data);
            if *expected != actual {
                return Err(Error::corrupt(format!(
                    "data hash mismatch for `{}`",
                    self.id
                )));
            }
        }
        Ok(())
    }
}

/// A mutable document view bound to a database by id.
///
/// Tracks dirtiness against the canonical serialization captured at load or
/// save time, plus the set of top-level keys written since load.
#[derive(Debug, Clone)]
pub struct Record {
    doc: Value,
    id: Option<String>,
    expected_offset: Option<u64>,
    baseline: String,
    modified: BTreeSet<String>,
    meta: Option<MetaLine>,
}

impl Record {
    /// Wraps a fresh document (defaults already applied) with no identity.
    pub(crate) fn draft(doc: Value) -> Self {
        let baseline = canonical_json(&doc);
        Self {
            doc,
            id: None,
            expected_offset: None,
            baseline,
            modified: BTreeSet::new(),
            meta: None,
        }
    }

    /// Wraps a document loaded from disk.
    pub(crate) fn loaded(doc: Value, id: String, offset_meta: u64) -> Self {
        let baseline = canonical_json(&doc);
        Self {
            doc,
            id: Some(id),
            expected_offset: Some(offset_meta),
            baseline,
            modified: BTreeSet::new(),
            meta: None,
        }
    }

    /// Record id, present once saved or loaded.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// The raw meta line, populated by `get_with_meta`.
    pub fn meta(&self) -> Option<&MetaLine> {
        self.meta.as_ref()
    }

    /// The underlying document.
    pub fn doc(&self) -> &Value {
        &self.doc
    }

    /// Consumes the record, returning the document.
    pub fn into_doc(self) -> Value {
        self.doc
    }

    /// Reads a top-level field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.doc.get(key)
    }

    /// Writes a top-level field and records it as modified.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        self.object_mut().insert(key.clone(), value.into());
        self.modified.insert(key);
    }

    /// Removes a top-level field, recording it as modified if present.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.object_mut().remove(key);
        if removed.is_some() {
            self.modified.insert(key.to_string());
        }
        removed
    }

    /// True if the current canonical form differs from the baseline.
    pub fn dirty(&self) -> bool {
        canonical_json(&self.doc) != self.baseline
    }

    /// Top-level keys written since load, in sorted order.
    pub fn modified_fields(&self) -> Vec<&str> {
        self.modified.iter().map(String::as_str).collect()
    }

    pub(crate) fn expected_offset(&self) -> Option<u64> {
        self.expected_offset
    }

    pub(crate) fn doc_mut(&mut self) -> &mut Value {
        &mut self.doc
    }

    pub(crate) fn assign_id(&mut self, id: String) {
        self.object_mut()
            .insert("id".to_string(), Value::String(id.clone()));
        self.id = Some(id);
    }

    pub(crate) fn set_meta(&mut self, meta: Option<MetaLine>) {
        self.meta = meta;
    }

    /// Resets baseline and bookkeeping after a successful save or reload.
    pub(crate) fn mark_clean(&mut self, offset_meta: u64, baseline: String) {
        self.expected_offset = Some(offset_meta);
        self.baseline = baseline;
        self.modified.clear();
    }

    /// Replaces the document wholesale (reload path).
    pub(crate) fn replace_doc(&mut self, doc: Value, offset_meta: u64) {
        let baseline = canonical_json(&doc);
        self.doc = doc;
        self.mark_clean(offset_meta, baseline);
    }

    fn object_mut(&mut self) -> &mut Map<String, Value> {
        if !self.doc.is_object() {
            self.doc = Value::Object(Map::new());
        }
        // Guaranteed by the branch above.
        self.doc.as_object_mut().expect("record document is an object")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_meta_carries_len_and_hash() {
        let data = br#"{"id":"x","name":"Alice"}"#;
        let meta = MetaLine::put("x", "2026-01-01T00:00:00.000Z", data);
        assert_eq!(meta.op, Op::Put);
        assert_eq!(meta.len_data, Some(data.len() as u64));
        assert_eq!(meta.sha256_data.as_deref(), Some(sha256_hex(data).as_str()));
    }

    #[test]
    fn test_meta_roundtrip() {
        let meta = MetaLine::put("abc", "2026-01-01T00:00:00.000Z", b"{}");
        let decoded = MetaLine::decode(&meta.encode()).expect("decode");
        assert_eq!(meta, decoded);

        let del = MetaLine::del("abc", "2026-01-01T00:00:00.000Z");
        let line = del.encode();
        assert!(!line.contains("len_data"));
        assert_eq!(MetaLine::decode(&line).expect("decode").op, Op::Del);
    }

    #[test]
    fn test_decode_rejects_non_meta() {
        assert!(MetaLine::decode(r#"{"_t":"header"}"#).is_err());
        assert!(MetaLine::decode("not json").is_err());
    }

    #[test]
    fn test_verify_detects_mismatch() {
        let meta = MetaLine::put("x", "2026-01-01T00:00:00.000Z", b"{\"a\":1}");
        assert!(meta.verify(b"{\"a\":1}").is_ok());
        assert!(meta.verify(b"{\"a\":2}").is_err());
        assert!(meta.verify(b"{\"a\":10}").is_err());
    }

    #[test]
    fn test_dirty_tracking() {
        let mut rec = Record::draft(json!({"age": 0}));
        assert!(!rec.dirty());
        rec.set("name", "Alice");
        assert!(rec.dirty());
        assert_eq!(rec.modified_fields(), vec!["name"]);

        // Writing the same value back still counts as a modified field,
        // but dirtiness follows content.
        let mut rec = Record::draft(json!({"age": 0}));
        rec.set("age", 0);
        assert!(!rec.dirty());
        assert_eq!(rec.modified_fields(), vec!["age"]);
    }

    #[test]
    fn test_remove_marks_modified() {
        let mut rec = Record::draft(json!({"a": 1, "b": 2}));
        assert!(rec.remove("a").is_some());
        assert!(rec.dirty());
        assert_eq!(rec.modified_fields(), vec!["a"]);
        assert!(rec.remove("missing").is_none());
        assert_eq!(rec.modified_fields(), vec!["a"]);
    }

    #[test]
    fn test_mark_clean_resets() {
        let mut rec = Record::loaded(json!({"a": 1}), "id1".to_string(), 99);
        rec.set("a", 2);
        assert!(rec.dirty());
        let baseline = canonical_json(rec.doc());
        rec.mark_clean(123, baseline);
        assert!(!rec.dirty());
        assert!(rec.modified_fields().is_empty());
        assert_eq!(rec.expected_offset(), Some(123));
    }
}
