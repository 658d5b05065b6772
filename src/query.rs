//! Summary: Predicate model, residual matching, ordering, and projection.
//! Copyright (c) YOAB. All rights reserved.
//!
//! Queries are Mongo-flavored JSON objects:
//!
//! ```text
//! Query     := { field: FieldPred, ..., [$or: [Query, ...]] }
//! FieldPred := scalar                              // equality shorthand
//!            | { $eq|$ne|$gt|$gte|$lt|$lte: scalar }
//!            | { $in: [scalar, ...] }
//!            | { $contains: scalar }               // list membership or substring
//!            | { key: FieldPred }                  // nested path descent
//! ```
//!
//! A missing field evaluates as JSON null, so `$ne` against an absent field
//! matches. Operator type mismatches fail the match silently, never the
//! query. The planner walks the same tree to collect indexable terms
//! (`$eq` on indexed scalars, `$eq`/`$contains` on taxonomy paths, `$in`
//! decomposed as a union of `$eq` probes); a top-level `$or` forces a full
//! scan.

use std::cmp::Ordering;

use serde_json::Value;

use crate::canonical::canonical_json;

/// Sort direction for `order_by` keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    Asc,
    Desc,
}

/// Options for `find`: pagination, ordering, projection.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// Maximum number of records to return; absent returns all.
    pub limit: Option<usize>,
    /// Records to skip after ordering; negative is impossible by type.
    pub skip: usize,
    /// Stable, composable ordering keys; paths may be nested (`a/b`).
    pub order_by: Vec<(String, SortDir)>,
    /// Top-level fields (or `/`-nested paths) to retain, plus `id`.
    pub fields: Option<Vec<String>>,
}

impl FindOptions {
    /// Options with no pagination, ordering, or projection.
    pub fn new() -> Self {
        Self::default()
    }
}

/// One indexable term collected from a query.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum IndexTerm {
    Eq { path: String, value: Value },
    Contains { path: String, value: Value },
    In { path: String, values: Vec<Value> },
}

/// Evaluates the full predicate against a parsed document.
pub(crate) fn matches(doc: &Value, query: &Value) -> bool {
    let Some(map) = query.as_object() else {
        return false;
    };
    for (key, pred) in map {
        if key == "$or" {
            let Some(branches) = pred.as_array() else {
                return false;
            };
            if !branches.iter().any(|branch| matches(doc, branch)) {
                return false;
            }
            continue;
        }
        if key.starts_with('$') {
            // Unsupported top-level operator.
            return false;
        }
        if !match_field(doc, key, pred) {
            return false;
        }
    }
    true
}

fn match_field(doc: &Value, key: &str, pred: &Value) -> bool {
    let value = doc.get(key);
    if let Some(ops) = pred.as_object() {
        if ops.keys().any(|op| op.starts_with('$')) {
            let value = value.unwrap_or(&Value::Null);
            return ops.iter().all(|(op, arg)| apply_op(value, op, arg));
        }
        // Nested descent: the document value must itself be an object.
        let Some(sub) = value else {
            return false;
        };
        if !sub.is_object() {
            return false;
        }
        return matches(sub, pred);
    }
    // Equality shorthand; a missing field compares as null.
    value.unwrap_or(&Value::Null) == pred
}

pub(crate) fn apply_op(value: &Value, op: &str, arg: &Value) -> bool {
    match op {
        "$eq" => value == arg,
        "$ne" => value != arg,
        "$gt" => compare_order(value, arg) == Some(Ordering::Greater),
        "$gte" => matches!(
            compare_order(value, arg),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        "$lt" => compare_order(value, arg) == Some(Ordering::Less),
        "$lte" => matches!(
            compare_order(value, arg),
            Some(Ordering::Less | Ordering::Equal)
        ),
        "$in" => arg
            .as_array()
            .is_some_and(|candidates| candidates.iter().any(|c| c == value)),
        "$contains" => match value {
            Value::Array(items) => items.iter().any(|item| item == arg),
            Value::String(s) => arg.as_str().is_some_and(|needle| s.contains(needle)),
            _ => false,
        },
        // Unknown operator: fail the match, not the query.
        _ => false,
    }
}

/// Orders two values when they are order-comparable: both numbers or both
/// strings. Everything else is a silent mismatch.
fn compare_order(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            Some(x.as_f64()?.total_cmp(&y.as_f64()?))
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Collects indexable terms. Returns `None` when a top-level `$or` is
/// present (full scan required).
pub(crate) fn collect_index_terms(query: &Value) -> Option<Vec<IndexTerm>> {
    let map = query.as_object()?;
    if map.contains_key("$or") {
        return None;
    }
    let mut terms = Vec::new();
    walk_terms(query, String::new(), &mut terms);
    Some(terms)
}

fn walk_terms(query: &Value, base: String, terms: &mut Vec<IndexTerm>) {
    let Some(map) = query.as_object() else {
        return;
    };
    for (key, pred) in map {
        if key.starts_with('$') {
            continue;
        }
        let path = if base.is_empty() {
            key.clone()
        } else {
            format!("{base}/{key}")
        };
        if let Some(ops) = pred.as_object() {
            if ops.keys().any(|op| op.starts_with('$')) {
                if let Some(arg) = ops.get("$eq") {
                    terms.push(IndexTerm::Eq {
                        path: path.clone(),
                        value: arg.clone(),
                    });
                }
                if let Some(arg) = ops.get("$contains") {
                    terms.push(IndexTerm::Contains {
                        path: path.clone(),
                        value: arg.clone(),
                    });
                }
                if let Some(args) = ops.get("$in").and_then(Value::as_array) {
                    terms.push(IndexTerm::In {
                        path,
                        values: args.clone(),
                    });
                }
            } else {
                walk_terms(pred, path, terms);
            }
        } else {
            terms.push(IndexTerm::Eq {
                path,
                value: pred.clone(),
            });
        }
    }
}

/// Type-tagged sort key: null sorts first, then numbers, strings, and
/// composites. Numbers compare numerically, composites by canonical JSON.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SortKey {
    Null,
    Num(f64),
    Str(String),
    Composite(String),
}

impl Eq for SortKey {}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        use SortKey::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,
            (Num(a), Num(b)) => a.total_cmp(b),
            (Num(_), _) => Ordering::Less,
            (_, Num(_)) => Ordering::Greater,
            (Str(a), Str(b)) => a.cmp(b),
            (Str(_), _) => Ordering::Less,
            (_, Str(_)) => Ordering::Greater,
            (Composite(a), Composite(b)) => a.cmp(b),
        }
    }
}

/// Normalizes a value (or its absence) for deterministic ordering.
pub(crate) fn sort_key(value: Option<&Value>) -> SortKey {
    match value {
        None | Some(Value::Null) => SortKey::Null,
        Some(Value::Bool(b)) => SortKey::Num(if *b { 1.0 } else { 0.0 }),
        Some(Value::Number(n)) => SortKey::Num(n.as_f64().unwrap_or(0.0)),
        Some(Value::String(s)) => SortKey::Str(s.clone()),
        Some(other) => SortKey::Composite(canonical_json(other)),
    }
}

/// Extracts a value at a `/`-separated path.
pub(crate) fn extract_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for key in path.split('/').filter(|k| !k.is_empty()) {
        current = current.as_object()?.get(key)?;
    }
    Some(current)
}

/// Applies a `fields` projection: requested top-level fields plus `id`;
/// a `/`-nested path retains the subtree at its nested position.
pub(crate) fn project(doc: &Value, fields: &[String]) -> Value {
    let mut out = serde_json::Map::new();
    for field in fields {
        if field.contains('/') {
            if let Some(value) = extract_path(doc, field) {
                insert_at_path(&mut out, field, value.clone());
            }
        } else if let Some(value) = doc.get(field) {
            out.insert(field.clone(), value.clone());
        }
    }
    if let Some(id) = doc.get("id") {
        out.insert("id".to_string(), id.clone());
    }
    Value::Object(out)
}

fn insert_at_path(out: &mut serde_json::Map<String, Value>, path: &str, value: Value) {
    let keys: Vec<&str> = path.split('/').filter(|k| !k.is_empty()).collect();
    let mut current = out;
    for key in &keys[..keys.len() - 1] {
        let slot = current
            .entry((*key).to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(serde_json::Map::new());
        }
        current = slot.as_object_mut().expect("just ensured an object");
    }
    if let Some(last) = keys.last() {
        current.insert((*last).to_string(), value);
    }
}
