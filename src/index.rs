//! Summary: In-memory record index rebuilt from the meta stream on open.
//! Copyright (c) YOAB. All rights reserved.
//!
//! Three stores back all lookups:
//! - `meta`: id → latest [`MetaEntry`] (primary; latest wins by file order)
//! - `secondary`: (path, canonical value) → id set for indexed scalar fields
//! - `reverse`: (taxonomy, key) → id set for taxonomy-bound fields
//!
//! Indexes are ephemeral by design: they are rebuilt from a sequential scan
//! of meta offsets plus the live data lines, which avoids a persistent index
//! format and its recovery problems.
//!
//! # Implementation
//!
//! `meta` uses a `BTreeMap` for deterministic id-order iteration (ULIDs are
//! lexicographically sortable, so id order is creation order for generated
//! ids). Bucket sets are `BTreeSet`s for the same determinism. Removing the
//! last id from a bucket leaves the empty bucket in place for reuse.

use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Latest known state of one record id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaEntry {
    /// Record id, unique across live records.
    pub id: String,
    /// Byte offset of the meta line in the file.
    pub offset_meta: u64,
    /// Byte offset of the data line; `None` for tombstones.
    pub offset_data: Option<u64>,
    /// Tombstone flag.
    pub deleted: bool,
    /// Last meta timestamp in epoch milliseconds.
    pub ts_ms: i64,
}

/// The in-memory index over one database file.
#[derive(Debug, Default)]
pub struct InMemoryIndex {
    meta: BTreeMap<String, MetaEntry>,
    secondary: HashMap<(String, String), BTreeSet<String>>,
    reverse: HashMap<(String, String), BTreeSet<String>>,
}

impl InMemoryIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the entry for an id. The latest entry wins.
    pub fn add_meta(&mut self, entry: MetaEntry) {
        self.meta.insert(entry.id.clone(), entry);
    }

    /// Returns the latest entry for an id, tombstones included.
    pub fn get(&self, id: &str) -> Option<&MetaEntry> {
        self.meta.get(id)
    }

    /// Iterates all entries in id order, tombstones included.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetaEntry)> {
        self.meta.iter()
    }

    /// Iterates live entries (non-deleted, with a data offset) in id order.
    pub fn iter_live(&self) -> impl Iterator<Item = &MetaEntry> {
        self.meta
            .values()
            .filter(|e| !e.deleted && e.offset_data.is_some())
    }

    /// Number of distinct ids seen (live and tombstoned).
    pub fn distinct_ids(&self) -> usize {
        self.meta.len()
    }

    /// Number of live records.
    pub fn live_count(&self) -> usize {
        self.iter_live().count()
    }

    /// Adds an id to a secondary scalar bucket.
    pub fn add_secondary(&mut self, path: &str, value_key: &str, id: &str) {
        self.secondary
            .entry((path.to_string(), value_key.to_string()))
            .or_default()
            .insert(id.to_string());
    }

    /// Removes an id from a secondary scalar bucket, leaving the bucket.
    pub fn remove_secondary(&mut self, path: &str, value_key: &str, id: &str) {
        if let Some(bucket) = self
            .secondary
            .get_mut(&(path.to_string(), value_key.to_string()))
        {
            bucket.remove(id);
        }
    }

    /// Looks up the id set for a (path, canonical value) pair.
    pub fn secondary_ids(&self, path: &str, value_key: &str) -> Option<&BTreeSet<String>> {
        self.secondary
            .get(&(path.to_string(), value_key.to_string()))
    }

    /// Adds an id to a reverse taxonomy bucket.
    pub fn add_reverse(&mut self, taxonomy: &str, key: &str, id: &str) {
        self.reverse
            .entry((taxonomy.to_string(), key.to_string()))
            .or_default()
            .insert(id.to_string());
    }

    /// Removes an id from a reverse taxonomy bucket, leaving the bucket.
    pub fn remove_reverse(&mut self, taxonomy: &str, key: &str, id: &str) {
        if let Some(bucket) = self
            .reverse
            .get_mut(&(taxonomy.to_string(), key.to_string()))
        {
            bucket.remove(id);
        }
    }

    /// Looks up the id set for a (taxonomy, key) pair.
    pub fn reverse_ids(&self, taxonomy: &str, key: &str) -> Option<&BTreeSet<String>> {
        self.reverse.get(&(taxonomy.to_string(), key.to_string()))
    }

    /// Per-key live reference counts for one taxonomy.
    pub fn reverse_counts(&self, taxonomy: &str) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for ((taxo, key), ids) in &self.reverse {
            if taxo == taxonomy && !ids.is_empty() {
                counts.insert(key.clone(), ids.len());
            }
        }
        counts
    }

    /// Drops all entries from all three stores.
    pub fn clear(&mut self) {
        self.meta.clear();
        self.secondary.clear();
        self.reverse.clear();
    }
}
