//! Summary: Field specifications, default materialization, and validation.
//! Copyright (c) YOAB. All rights reserved.
//!
//! A schema is a mapping of field name to [`FieldSpec`]. The same shape is
//! stored verbatim as header line 2, so specs round-trip through serde and
//! the canonical form of the whole mapping is what schema-migration
//! detection compares on open.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::taxonomy::Taxonomies;

/// Recognized field types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Str,
    Int,
    Float,
    Bool,
    Datetime,
    List,
    Object,
    Blob,
}

impl FieldType {
    /// Scalar types are the only ones eligible for secondary indexes.
    pub fn is_scalar(self) -> bool {
        matches!(
            self,
            FieldType::Str | FieldType::Int | FieldType::Float | FieldType::Bool | FieldType::Datetime
        )
    }
}

/// Whether a taxonomy-bound field holds one key or a list of keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaxonomyMode {
    Single,
    Multi,
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Specification of a single field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldSpec {
    /// Field type.
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Field must be present and non-null after defaults are applied.
    #[serde(default, skip_serializing_if = "is_false")]
    pub mandatory: bool,
    /// Value materialized when the field is absent at save.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Build a secondary scalar index on this path.
    #[serde(default, skip_serializing_if = "is_false")]
    pub index: bool,
    /// Name of the taxonomy catalog this field references.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taxonomy: Option<String>,
    /// Single (scalar) or multi (list) taxonomy reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taxonomy_mode: Option<TaxonomyMode>,
    /// Every taxonomy value must be a key present in the catalog.
    #[serde(default, skip_serializing_if = "is_false")]
    pub strict: bool,
    /// Build a reverse taxonomy index for list-typed fields.
    #[serde(default, skip_serializing_if = "is_false")]
    pub index_membership: bool,
    /// Element spec for `list` fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<FieldSpec>>,
    /// Nested spec for `object` fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<BTreeMap<String, FieldSpec>>,
}

/// A parsed schema with its flattened path lookup.
#[derive(Debug, Clone)]
pub struct Schema {
    fields: BTreeMap<String, FieldSpec>,
    flat: BTreeMap<String, FieldSpec>,
}

impl Schema {
    /// Parses a schema from its JSON representation (field name → spec).
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the value is not an object or a field spec
    /// carries an unknown option or a bad type tag.
    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::Validation("schema must be a JSON object".to_string()))?;
        let mut fields = BTreeMap::new();
        for (name, spec) in obj {
            let spec: FieldSpec = serde_json::from_value(spec.clone())
                .map_err(|e| Error::Validation(format!("invalid spec for field `{name}`: {e}")))?;
            fields.insert(name.clone(), spec);
        }
        let mut flat = BTreeMap::new();
        flatten_into(&fields, "", &mut flat);
        Ok(Self { fields, flat })
    }

    /// Serializes the schema back to its header representation.
    pub fn to_value(&self) -> Value {
        // FieldSpec serialization cannot fail: it is a plain data struct.
        serde_json::to_value(&self.fields).expect("serializing field specs")
    }

    /// Looks up a spec by flattened `/`-separated path.
    pub fn spec_at(&self, path: &str) -> Option<&FieldSpec> {
        self.flat.get(path)
    }

    /// Iterates (path, spec) pairs over the flattened schema.
    pub fn iter_flat(&self) -> impl Iterator<Item = (&String, &FieldSpec)> {
        self.flat.iter()
    }

    /// Walks the schema and inserts missing fields with their defaults,
    /// recursively for objects. Present values are never overwritten.
    pub fn apply_defaults(&self, doc: &mut Value) {
        if let Value::Object(map) = doc {
            apply_defaults_fields(&self.fields, map);
        }
    }

    /// Validates a document: type checks, mandatory presence, and strict
    /// taxonomy membership.
    ///
    /// Fields present in the document but unknown to the schema are allowed;
    /// they are preserved across migrations and ignored here.
    ///
    /// # Errors
    ///
    /// Returns `Validation` naming the offending path.
    pub fn validate(&self, doc: &Value, taxonomies: &Taxonomies) -> Result<()> {
        let obj = doc
            .as_object()
            .ok_or_else(|| Error::Validation("document must be a JSON object".to_string()))?;
        validate_fields(&self.fields, obj, "", taxonomies)
    }
}

fn flatten_into(
    fields: &BTreeMap<String, FieldSpec>,
    prefix: &str,
    flat: &mut BTreeMap<String, FieldSpec>,
) {
    for (name, spec) in fields {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };
        if let Some(nested) = &spec.fields {
            flatten_into(nested, &path, flat);
        }
        flat.insert(path, spec.clone());
    }
}

fn apply_defaults_fields(specs: &BTreeMap<String, FieldSpec>, obj: &mut Map<String, Value>) {
    for (name, spec) in specs {
        match obj.get_mut(name) {
            Some(Value::Object(sub)) => {
                if let Some(nested) = &spec.fields {
                    apply_defaults_fields(nested, sub);
                }
            }
            Some(_) => {}
            None => {
                if let Some(default) = &spec.default {
                    obj.insert(name.clone(), default.clone());
                } else if let Some(nested) = &spec.fields {
                    // Materialize an object when any nested default exists.
                    let mut sub = Map::new();
                    apply_defaults_fields(nested, &mut sub);
                    if !sub.is_empty() {
                        obj.insert(name.clone(), Value::Object(sub));
                    }
                }
            }
        }
    }
}

fn validate_fields(
    specs: &BTreeMap<String, FieldSpec>,
    obj: &Map<String, Value>,
    prefix: &str,
    taxonomies: &Taxonomies,
) -> Result<()> {
    for (name, spec) in specs {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };
        match obj.get(name) {
            None | Some(Value::Null) => {
                if spec.mandatory {
                    return Err(Error::Validation(format!(
                        "missing mandatory field `{path}`"
                    )));
                }
            }
            Some(value) => validate_value(spec, value, &path, taxonomies)?,
        }
    }
    Ok(())
}

fn validate_value(
    spec: &FieldSpec,
    value: &Value,
    path: &str,
    taxonomies: &Taxonomies,
) -> Result<()> {
    let type_err = |expected: &str| {
        Err(Error::Validation(format!(
            "field `{path}` expects {expected}, got {}",
            type_name(value)
        )))
    };
    match spec.field_type {
        FieldType::Str | FieldType::Datetime => {
            if !value.is_string() {
                return type_err("a string");
            }
        }
        FieldType::Int => {
            if value.as_i64().is_none() && value.as_u64().is_none() {
                return type_err("an integer");
            }
        }
        FieldType::Float => {
            if !value.is_number() {
                return type_err("a number");
            }
        }
        FieldType::Bool => {
            if !value.is_boolean() {
                return type_err("a boolean");
            }
        }
        FieldType::List => {
            let Some(arr) = value.as_array() else {
                return type_err("a list");
            };
            if let Some(items) = &spec.items {
                let item_path = format!("{path}[]");
                for element in arr {
                    validate_value(items, element, &item_path, taxonomies)?;
                }
            }
        }
        FieldType::Object => {
            let Some(sub) = value.as_object() else {
                return type_err("an object");
            };
            if let Some(nested) = &spec.fields {
                validate_fields(nested, sub, path, taxonomies)?;
            }
        }
        FieldType::Blob => {
            let ok = value
                .as_object()
                .and_then(|o| o.get("$blob"))
                .and_then(Value::as_str)
                .is_some();
            if !ok {
                return type_err("a blob reference");
            }
        }
    }

    if spec.strict {
        if let Some(taxonomy) = &spec.taxonomy {
            let check = |key: &str| -> Result<()> {
                if taxonomies.contains_key(taxonomy, key) {
                    Ok(())
                } else {
                    Err(Error::Validation(format!(
                        "field `{path}` references unknown taxonomy key `{key}` in `{taxonomy}`"
                    )))
                }
            };
            match value {
                Value::String(s) => check(s)?,
                Value::Array(arr) => {
                    for element in arr {
                        if let Some(s) = element.as_str() {
                            check(s)?;
                        }
                    }
                }
                _ => {}
            }
        }
    }
    Ok(())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_schema() -> Schema {
        Schema::from_value(&json!({
            "id": {"type": "str", "mandatory": true, "index": true},
            "name": {"type": "str", "mandatory": true},
            "age": {"type": "int", "default": 0, "index": true},
            "active": {"type": "bool", "default": true},
            "createdAt": {"type": "datetime"},
            "flags": {"type": "object", "fields": {
                "vip": {"type": "bool", "default": false}
            }},
            "tags": {"type": "list", "items": {"type": "str"},
                     "taxonomy": "tags", "taxonomy_mode": "multi",
                     "strict": true, "index_membership": true}
        }))
        .expect("schema parses")
    }

    #[test]
    fn test_rejects_unknown_option() {
        let bad = json!({"name": {"type": "str", "indexed": true}});
        assert!(Schema::from_value(&bad).is_err());
    }

    #[test]
    fn test_apply_defaults_nested() {
        let schema = sample_schema();
        let mut doc = json!({"name": "Alice"});
        schema.apply_defaults(&mut doc);
        assert_eq!(doc["age"], json!(0));
        assert_eq!(doc["active"], json!(true));
        assert_eq!(doc["flags"], json!({"vip": false}));
        // Present values are untouched.
        assert_eq!(doc["name"], json!("Alice"));
    }

    #[test]
    fn test_defaults_do_not_overwrite() {
        let schema = sample_schema();
        let mut doc = json!({"name": "Bob", "age": 7, "flags": {"vip": true}});
        schema.apply_defaults(&mut doc);
        assert_eq!(doc["age"], json!(7));
        assert_eq!(doc["flags"]["vip"], json!(true));
    }

    #[test]
    fn test_mandatory_enforced() {
        let schema = sample_schema();
        let taxos = Taxonomies::default();
        let doc = json!({"id": "x"});
        let err = schema.validate(&doc, &taxos).unwrap_err();
        assert!(err.to_string().contains("name"));
    }

    #[test]
    fn test_type_mismatch_names_path() {
        let schema = sample_schema();
        let taxos = Taxonomies::default();
        let doc = json!({"id": "x", "name": "A", "flags": {"vip": "yes"}});
        let err = schema.validate(&doc, &taxos).unwrap_err();
        assert!(err.to_string().contains("flags/vip"));
    }

    #[test]
    fn test_strict_taxonomy_membership() {
        let schema = sample_schema();
        let mut taxos = Taxonomies::default();
        taxos.upsert_key("tags", "red", json!({"title": "Red"}));

        let ok = json!({"id": "x", "name": "A", "tags": ["red"]});
        assert!(schema.validate(&ok, &taxos).is_ok());

        let bad = json!({"id": "x", "name": "A", "tags": ["magenta"]});
        let err = schema.validate(&bad, &taxos).unwrap_err();
        assert!(err.to_string().contains("magenta"));
    }

    #[test]
    fn test_unknown_document_fields_allowed() {
        let schema = sample_schema();
        let taxos = Taxonomies::default();
        let doc = json!({"id": "x", "name": "A", "legacy": {"deep": 1}});
        assert!(schema.validate(&doc, &taxos).is_ok());
    }

    #[test]
    fn test_flatten_paths() {
        let schema = sample_schema();
        assert!(schema.spec_at("flags/vip").is_some());
        assert!(schema.spec_at("flags").is_some());
        assert_eq!(
            schema.spec_at("age").map(|s| s.field_type),
            Some(FieldType::Int)
        );
        assert!(schema.spec_at("missing").is_none());
    }

    #[test]
    fn test_header_roundtrip() {
        let schema = sample_schema();
        let reparsed = Schema::from_value(&schema.to_value()).expect("roundtrip");
        assert_eq!(
            crate::canonical::canonical_json(&schema.to_value()),
            crate::canonical::canonical_json(&reparsed.to_value())
        );
    }
}
