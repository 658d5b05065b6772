//! Summary: Raw-line scalar extraction to skip full JSON parses.
//! Copyright (c) YOAB. All rights reserved.
//!
//! For simple scalar queries with a small projection, candidate data lines
//! can be evaluated with a regex built from the path and the declared scalar
//! type, extracting the first matching JSON token instead of parsing the
//! whole document. This is an optimization, not a correctness path: any
//! extraction miss falls back to a full parse for that record, and the
//! executor only engages it for unambiguous top-level scalar paths, so both
//! paths return identical results.

use regex::Regex;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::schema::FieldType;

const PAT_STR: &str = r#""(?:[^"\\]|\\.)*""#;
const PAT_INT: &str = r"-?\d+";
const PAT_FLOAT: &str = r"-?(?:\d+\.\d+|\d+)(?:[eE][+-]?\d+)?";
const PAT_BOOL: &str = r"(?:true|false)";

fn value_pattern(field_type: FieldType) -> Option<&'static str> {
    match field_type {
        FieldType::Str | FieldType::Datetime => Some(PAT_STR),
        FieldType::Int => Some(PAT_INT),
        FieldType::Float => Some(PAT_FLOAT),
        FieldType::Bool => Some(PAT_BOOL),
        FieldType::List | FieldType::Object | FieldType::Blob => None,
    }
}

/// Compiled extractor for one (path, scalar type) pair.
#[derive(Debug)]
pub(crate) struct Extractor {
    pattern: Regex,
}

impl Extractor {
    /// Builds the extractor.
    ///
    /// Intermediate path segments match an opening object brace; the final
    /// segment captures the JSON token of the declared type.
    ///
    /// # Errors
    ///
    /// Returns `Validation` when the type has no scalar token pattern.
    pub(crate) fn compile(path: &str, field_type: FieldType) -> Result<Self> {
        let token = value_pattern(field_type).ok_or_else(|| {
            Error::Validation(format!(
                "no fast-path token pattern for non-scalar path `{path}`"
            ))
        })?;
        let keys: Vec<&str> = path.split('/').filter(|k| !k.is_empty()).collect();
        let mut pattern = String::new();
        for (i, key) in keys.iter().enumerate() {
            let escaped = regex::escape(key);
            if i < keys.len() - 1 {
                pattern.push_str(&format!(r#""{escaped}"\s*:\s*\{{\s*"#));
            } else {
                pattern.push_str(&format!(r#""{escaped}"\s*:\s*({token})"#));
            }
        }
        let pattern = Regex::new(&pattern)
            .map_err(|e| Error::Validation(format!("fast-path pattern for `{path}`: {e}")))?;
        Ok(Self { pattern })
    }

    /// Extracts the first matching raw token from a data line.
    pub(crate) fn extract_raw<'a>(&self, line: &'a str) -> Option<&'a str> {
        self.pattern
            .captures(line)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
    }

    /// Extracts and parses the token into a JSON value.
    pub(crate) fn extract_value(&self, line: &str) -> Option<Value> {
        serde_json::from_str(self.extract_raw(line)?).ok()
    }
}

const SIMPLE_OPS: [&str; 6] = ["$eq", "$ne", "$gt", "$gte", "$lt", "$lte"];

/// True when the query consists of at most `max_terms` simple scalar
/// predicates with no `$or`/`$in`/`$nin`/`$regex`/`$contains` anywhere.
pub(crate) fn is_simple_query(query: &Value, max_terms: usize) -> bool {
    let mut terms = 0usize;
    if !visit(query, &mut terms, max_terms) {
        return false;
    }
    terms <= max_terms
}

fn visit(value: &Value, terms: &mut usize, max_terms: usize) -> bool {
    if *terms > max_terms {
        return false;
    }
    let Some(map) = value.as_object() else {
        return true;
    };
    for excluded in ["$or", "$in", "$nin", "$regex", "$contains"] {
        if map.contains_key(excluded) {
            return false;
        }
    }
    for pred in map.values() {
        if let Some(ops) = pred.as_object() {
            if SIMPLE_OPS.iter().any(|op| ops.contains_key(*op)) {
                *terms += 1;
            } else if !visit(pred, terms, max_terms) {
                return false;
            }
        } else {
            *terms += 1;
        }
    }
    true
}
