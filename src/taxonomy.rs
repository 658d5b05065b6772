//! Summary: Header-resident taxonomy catalogs and their maintenance API.
//! Copyright (c) YOAB. All rights reserved.
//!
//! Taxonomies live in header line 3: a named catalog of allowed keys, each
//! with free-form attributes. Catalog-only changes (`upsert`, and `delete`
//! of an unreferenced key) rewrite the header lines and copy the body
//! verbatim. Changes that touch values stored inside live records (`rename`,
//! `merge`, `delete` with detach) are full-file migrations: there is no
//! indirection table, so every live record is rewritten with transformed
//! documents and the in-memory index is rebuilt from the new file.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::db::Database;
use crate::error::{Error, Result};

/// One taxonomy: a catalog of key → attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Taxonomy {
    /// Allowed keys with their attribute objects (e.g. `{"title": ...}`).
    #[serde(default)]
    pub keys: BTreeMap<String, Value>,
}

/// All taxonomies of one database, as stored in header line 3.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Taxonomies(BTreeMap<String, Taxonomy>);

impl Taxonomies {
    /// Parses the payload of header line 3 (the `_t` tag already stripped).
    ///
    /// # Errors
    ///
    /// Returns `IoCorruption` when a catalog entry has an unexpected shape.
    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::corrupt("taxonomies line is not an object"))?;
        let mut catalogs = BTreeMap::new();
        for (name, taxonomy) in obj {
            let taxonomy: Taxonomy = serde_json::from_value(taxonomy.clone())
                .map_err(|e| Error::corrupt(format!("bad taxonomy `{name}`: {e}")))?;
            catalogs.insert(name.clone(), taxonomy);
        }
        Ok(Self(catalogs))
    }

    /// Serializes back to the header line payload.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(&self.0).expect("serializing taxonomies")
    }

    /// True when the named catalog contains the key.
    pub fn contains_key(&self, taxonomy: &str, key: &str) -> bool {
        self.0
            .get(taxonomy)
            .is_some_and(|t| t.keys.contains_key(key))
    }

    /// Returns the named catalog, if declared.
    pub fn get(&self, taxonomy: &str) -> Option<&Taxonomy> {
        self.0.get(taxonomy)
    }

    /// Adds or updates a key's attributes, creating the catalog on demand.
    /// New attributes are merged over existing ones.
    pub fn upsert_key(&mut self, taxonomy: &str, key: &str, attrs: Value) {
        let catalog = self.0.entry(taxonomy.to_string()).or_default();
        let slot = catalog
            .keys
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let (Some(existing), Some(new)) = (slot.as_object_mut(), attrs.as_object()) {
            for (k, v) in new {
                existing.insert(k.clone(), v.clone());
            }
        } else if !attrs.is_null() {
            *slot = attrs;
        }
    }

    /// Removes a key from a catalog. Missing entries are a no-op.
    pub fn remove_key(&mut self, taxonomy: &str, key: &str) {
        if let Some(catalog) = self.0.get_mut(taxonomy) {
            catalog.keys.remove(key);
        }
    }
}

/// Collision policy for `rename` and `merge` on list-typed fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Collision {
    /// Fail the whole migration with `Conflict`; the file is left untouched.
    #[default]
    Error,
    /// Replace and deduplicate list items.
    Merge,
    /// Leave colliding records unchanged.
    Skip,
}

/// Strategy for `delete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeleteStrategy {
    /// Remove the key from list fields, clear single-value fields equal to it.
    #[default]
    Detach,
    /// Fail if any live record references the key.
    Error,
}

/// A catalog entry as returned by `list()`.
#[derive(Debug, Clone, PartialEq)]
pub struct TaxonomyEntry {
    pub key: String,
    pub attrs: Value,
}

/// Value transformation a migration applies to each live document.
#[derive(Debug, Clone)]
pub(crate) enum KeyChange {
    /// Replace source keys by their targets in every bound field.
    Remap {
        mapping: BTreeMap<String, String>,
        collision: Collision,
    },
    /// Remove the key from bound list fields and null bound single fields.
    Detach { key: String },
}

/// Applies a key change to one document in place.
///
/// `bound` lists the `/`-separated paths of fields bound to the taxonomy and
/// whether each is list-typed. Collisions are only observable on list fields;
/// `Skip` leaves the whole record unchanged, `Error` aborts the migration.
pub(crate) fn apply_key_change(
    doc: &mut Value,
    bound: &[(String, bool)],
    change: &KeyChange,
) -> Result<()> {
    match change {
        KeyChange::Remap { mapping, collision } => {
            if has_collision(doc, bound, mapping) {
                match collision {
                    Collision::Error => {
                        let id = doc.get("id").and_then(Value::as_str).unwrap_or("?");
                        return Err(Error::Conflict(format!(
                            "record `{id}` already contains a rename target"
                        )));
                    }
                    Collision::Skip => return Ok(()),
                    Collision::Merge => {}
                }
            }
            for (path, is_list) in bound {
                let Some(value) = value_at_path_mut(doc, path) else {
                    continue;
                };
                if *is_list {
                    if let Value::Array(items) = value {
                        for item in items.iter_mut() {
                            if let Value::String(s) = item {
                                if let Some(target) = mapping.get(s) {
                                    *s = target.clone();
                                }
                            }
                        }
                        dedup_strings(items);
                    }
                } else if let Value::String(s) = value {
                    if let Some(target) = mapping.get(s) {
                        *s = target.clone();
                    }
                }
            }
        }
        KeyChange::Detach { key } => {
            for (path, is_list) in bound {
                let Some(value) = value_at_path_mut(doc, path) else {
                    continue;
                };
                if *is_list {
                    if let Value::Array(items) = value {
                        items.retain(|item| item.as_str() != Some(key.as_str()));
                    }
                } else if value.as_str() == Some(key.as_str()) {
                    *value = Value::Null;
                }
            }
        }
    }
    Ok(())
}

fn has_collision(doc: &Value, bound: &[(String, bool)], mapping: &BTreeMap<String, String>) -> bool {
    for (path, is_list) in bound {
        if !is_list {
            continue;
        }
        let Some(Value::Array(items)) = value_at_path(doc, path) else {
            continue;
        };
        let present: BTreeSet<&str> = items.iter().filter_map(Value::as_str).collect();
        for (source, target) in mapping {
            if source != target && present.contains(source.as_str()) && present.contains(target.as_str())
            {
                return true;
            }
        }
    }
    false
}

fn dedup_strings(items: &mut Vec<Value>) {
    let mut seen = BTreeSet::new();
    items.retain(|item| match item.as_str() {
        Some(s) => seen.insert(s.to_string()),
        None => true,
    });
}

fn value_at_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for key in path.split('/').filter(|k| !k.is_empty()) {
        current = current.as_object()?.get(key)?;
    }
    Some(current)
}

fn value_at_path_mut<'a>(doc: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    let mut current = doc;
    for key in path.split('/').filter(|k| !k.is_empty()) {
        current = current.as_object_mut()?.get_mut(key)?;
    }
    Some(current)
}

/// Maintenance handle for one taxonomy, obtained via `db.taxonomy(name)`.
pub struct TaxonomyApi<'db> {
    db: &'db mut Database,
    name: String,
}

impl<'db> TaxonomyApi<'db> {
    pub(crate) fn new(db: &'db mut Database, name: impl Into<String>) -> Self {
        Self {
            db,
            name: name.into(),
        }
    }

    /// Adds or updates a key's attributes. Header-only rewrite.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if `attrs` is neither an object nor null.
    pub fn upsert(&mut self, key: &str, attrs: Value) -> Result<()> {
        if !attrs.is_object() && !attrs.is_null() {
            return Err(Error::Validation(
                "taxonomy attributes must be a JSON object".to_string(),
            ));
        }
        let mut taxonomies = self.db.taxonomies_ref().clone();
        taxonomies.upsert_key(&self.name, key, attrs);
        self.db.rewrite_header_only(taxonomies)
    }

    /// Enumerates catalog keys with their attributes.
    pub fn list(&self) -> Vec<TaxonomyEntry> {
        self.db
            .taxonomies_ref()
            .get(&self.name)
            .map(|t| {
                t.keys
                    .iter()
                    .map(|(key, attrs)| TaxonomyEntry {
                        key: key.clone(),
                        attrs: attrs.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Live-record reference counts per key, from the reverse index.
    /// Catalog keys with no references report 0.
    pub fn stats(&self) -> BTreeMap<String, usize> {
        let mut counts: BTreeMap<String, usize> = self
            .db
            .taxonomies_ref()
            .get(&self.name)
            .map(|t| t.keys.keys().map(|k| (k.clone(), 0)).collect())
            .unwrap_or_default();
        for (key, count) in self.db.index_ref().reverse_counts(&self.name) {
            counts.insert(key, count);
        }
        counts
    }

    /// Renames a key across the catalog and every live record. Full-file
    /// migration.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `old` is not in the catalog, `Conflict` when a
    /// record contains both keys and `collision` is [`Collision::Error`].
    pub fn rename(&mut self, old: &str, new: &str, collision: Collision) -> Result<()> {
        if old == new {
            return Ok(());
        }
        if !self.db.taxonomies_ref().contains_key(&self.name, old) {
            return Err(Error::NotFound(format!(
                "taxonomy `{}` has no key `{old}`",
                self.name
            )));
        }
        let mut taxonomies = self.db.taxonomies_ref().clone();
        let attrs = taxonomies
            .get(&self.name)
            .and_then(|t| t.keys.get(old).cloned())
            .unwrap_or(Value::Null);
        taxonomies.remove_key(&self.name, old);
        if !taxonomies.contains_key(&self.name, new) {
            taxonomies.upsert_key(&self.name, new, attrs);
        }
        let change = KeyChange::Remap {
            mapping: BTreeMap::from([(old.to_string(), new.to_string())]),
            collision,
        };
        self.db.taxonomy_migrate(&self.name, taxonomies, &change)
    }

    /// Merges several keys into a target across catalog and records, with
    /// list deduplication. Full-file migration.
    pub fn merge(&mut self, sources: &[&str], target: &str) -> Result<()> {
        let mut mapping = BTreeMap::new();
        let mut taxonomies = self.db.taxonomies_ref().clone();
        for source in sources {
            if *source == target {
                continue;
            }
            mapping.insert((*source).to_string(), target.to_string());
            taxonomies.remove_key(&self.name, source);
        }
        if mapping.is_empty() {
            return Ok(());
        }
        if !taxonomies.contains_key(&self.name, target) {
            taxonomies.upsert_key(&self.name, target, Value::Null);
        }
        let change = KeyChange::Remap {
            mapping,
            collision: Collision::Merge,
        };
        self.db.taxonomy_migrate(&self.name, taxonomies, &change)
    }

    /// Deletes a key from the catalog.
    ///
    /// With [`DeleteStrategy::Detach`], references are removed from live
    /// records (full-file migration). With [`DeleteStrategy::Error`], fails
    /// when any live record still references the key.
    pub fn delete(&mut self, key: &str, strategy: DeleteStrategy) -> Result<()> {
        let referenced = self
            .db
            .index_ref()
            .reverse_ids(&self.name, key)
            .is_some_and(|ids| !ids.is_empty());
        let mut taxonomies = self.db.taxonomies_ref().clone();
        taxonomies.remove_key(&self.name, key);
        match strategy {
            DeleteStrategy::Error => {
                if referenced {
                    return Err(Error::Conflict(format!(
                        "taxonomy key `{key}` is referenced by live records"
                    )));
                }
                self.db.rewrite_header_only(taxonomies)
            }
            DeleteStrategy::Detach => {
                let change = KeyChange::Detach {
                    key: key.to_string(),
                };
                self.db.taxonomy_migrate(&self.name, taxonomies, &change)
            }
        }
    }
}
