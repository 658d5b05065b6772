//! Summary: Database facade: lifecycle, CRUD, compaction, backups, migrations.
//! Copyright (c) YOAB. All rights reserved.
//!
//! The open sequence acquires the exclusive lock, reads or initializes the
//! header, migrates the schema when the stored one differs, then rebuilds
//! the in-memory index from a sequential scan of meta offsets. All writes
//! append meta+data pairs and update the index in place; rewrites
//! (compaction, schema migration, taxonomy migration) stream live records
//! into a temp file and atomically replace the database file, after which
//! the index is rebuilt from the new offsets.
//!
//! # Concurrency
//!
//! Single writer, multiple readers within one process: reads borrow the
//! handle immutably and share the writer's index; writes take `&mut self`.
//! A second process (or handle) cannot open the same file while this one is
//! alive.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::{debug, info};
use serde_json::{Map, Value};

use crate::blobs::{self, BlobManager, BlobRef, GcStats};
use crate::canonical::{canonical_json, epoch_ms_to_iso, iso_to_epoch_ms, new_ulid, now_iso};
use crate::error::{Error, Result};
use crate::fastpath::{Extractor, is_simple_query};
use crate::index::{InMemoryIndex, MetaEntry};
use crate::progress::{Progress, ProgressFn, phase};
use crate::query::{self, FindOptions, IndexTerm, SortDir};
use crate::record::{MetaLine, Record};
use crate::schema::{FieldType, Schema, TaxonomyMode};
use crate::storage::{FORMAT_VERSION, FileStorage, Header, encode_header_lines, temp_sibling};
use crate::taxonomy::{KeyChange, Taxonomies, TaxonomyApi, apply_key_change};

const BACKUP_DIR_NAME: &str = "embedded_jsonl_db_backup";

/// How the database file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    /// Full access; creates and migrates the file as needed.
    #[default]
    ReadWrite,
    /// Refuses writes; requires an existing, well-formed file.
    ReadOnly,
}

/// Maintenance policy knobs.
#[derive(Debug, Clone, Copy)]
pub struct Maintenance {
    /// Garbage ratio at which update/delete trigger automatic compaction.
    pub compact_threshold: f64,
    /// Whether compaction also takes the first-of-day snapshot.
    pub daily_backup: bool,
}

impl Default for Maintenance {
    fn default() -> Self {
        Self {
            compact_threshold: 0.30,
            daily_backup: true,
        }
    }
}

/// Options for [`Database::open_with`].
#[derive(Default)]
pub struct OpenOptions {
    pub mode: OpenMode,
    pub maintenance: Maintenance,
    pub on_progress: Option<ProgressFn>,
}

/// Backup flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupKind {
    /// Timestamped copy under `.../rolling/`.
    Rolling,
    /// First-of-day snapshot under `.../daily/`; a later call the same day
    /// is a no-op.
    Daily,
}

/// Index extraction plan precomputed from schema hints.
#[derive(Debug, Default)]
struct IndexSpecs {
    /// Scalar paths with a secondary index.
    sec_paths: Vec<String>,
    /// (path, taxonomy) pairs for list fields with a membership index.
    rev_list_paths: Vec<(String, String)>,
    /// (path, taxonomy) pairs for single-reference string fields.
    rev_single_paths: Vec<(String, String)>,
    /// path → taxonomy for every reverse-indexed path.
    rev_map: HashMap<String, String>,
    /// Leaf names that occur at more than one schema path; the fast-path
    /// extractor takes the first raw match, so these are excluded from it.
    ambiguous_leaves: HashSet<String>,
}

impl IndexSpecs {
    fn compute(schema: &Schema) -> Self {
        let mut specs = Self::default();
        let mut leaf_counts: HashMap<String, usize> = HashMap::new();
        for (path, spec) in schema.iter_flat() {
            let leaf = path.rsplit('/').next().unwrap_or(path.as_str());
            *leaf_counts.entry(leaf.to_string()).or_insert(0) += 1;

            if spec.field_type.is_scalar() && spec.index {
                specs.sec_paths.push(path.clone());
            }
            if let Some(taxonomy) = &spec.taxonomy {
                if spec.field_type == FieldType::List && spec.index_membership {
                    specs.rev_list_paths.push((path.clone(), taxonomy.clone()));
                    specs.rev_map.insert(path.clone(), taxonomy.clone());
                }
                if spec.field_type == FieldType::Str
                    && spec.taxonomy_mode == Some(TaxonomyMode::Single)
                {
                    specs.rev_single_paths.push((path.clone(), taxonomy.clone()));
                    specs.rev_map.insert(path.clone(), taxonomy.clone());
                }
            }
        }
        specs.ambiguous_leaves = leaf_counts
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(leaf, _)| leaf)
            .collect();
        specs
    }
}

/// The main database handle.
///
/// A `Database` represents an open, exclusively locked connection to one
/// JSONL database file. Records are created with [`Database::new_record`],
/// persisted with [`Database::save`], and located with [`Database::get`]
/// and [`Database::find`].
pub struct Database {
    path: PathBuf,
    storage: FileStorage,
    header: Header,
    schema: Schema,
    taxonomies: Taxonomies,
    index: InMemoryIndex,
    specs: IndexSpecs,
    blobs: BlobManager,
    progress: Progress,
    maintenance: Maintenance,
    /// Meta lines currently in the file (valid ones counted at scan plus
    /// appends since); drives the garbage ratio.
    total_meta_lines: u64,
}

impl Database {
    /// Opens a database with default options (read-write, default
    /// maintenance, no progress callback).
    pub fn open<P: AsRef<Path>>(path: P, schema: Value) -> Result<Self> {
        Self::open_with(path, schema, OpenOptions::default())
    }

    /// Opens a database at the given path.
    ///
    /// A missing or empty file is initialized with the supplied schema. An
    /// existing file whose stored schema differs from the supplied one is
    /// migrated: every live record gets the new defaults materialized and
    /// fields unknown to the new schema are preserved.
    ///
    /// # Errors
    ///
    /// Returns `LockHeld` when another handle owns the file, `IoCorruption`
    /// when an existing non-empty file has a broken header, and `Validation`
    /// when the supplied schema does not parse.
    pub fn open_with<P: AsRef<Path>>(path: P, schema: Value, options: OpenOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let schema = Schema::from_value(&schema)?;
        let mut progress = Progress::new(options.on_progress);
        progress.emit(phase::OPEN_START, 0);

        let read_only = options.mode == OpenMode::ReadOnly;
        let mut storage = FileStorage::open_exclusive(&path, read_only)?;

        let (header, taxonomies, stored_fields) = match storage.read_header() {
            Ok((header, fields, taxonomies)) => (header, taxonomies, Some(fields)),
            Err(Error::IoCorruption(reason)) => {
                if read_only || storage.file_len()? > 0 {
                    // Never re-initialize over existing bytes.
                    return Err(Error::corrupt(reason));
                }
                let header = Header {
                    format: FORMAT_VERSION.to_string(),
                    table: table_name(&path),
                    created: now_iso(),
                    defaults_always_materialized: true,
                };
                let taxonomies = Taxonomies::default();
                storage.write_initial(&header, &schema.to_value(), &taxonomies)?;
                debug!("initialized new database at '{}'", path.display());
                (header, taxonomies, None)
            }
            Err(e) => return Err(e),
        };

        let specs = IndexSpecs::compute(&schema);
        let blobs = BlobManager::new(&path);
        let mut db = Self {
            path,
            storage,
            header,
            schema,
            taxonomies,
            index: InMemoryIndex::new(),
            specs,
            blobs,
            progress,
            maintenance: options.maintenance,
            total_meta_lines: 0,
        };

        db.rescan(true)?;

        if let Some(stored) = stored_fields {
            let differs = canonical_json(&stored) != canonical_json(&db.schema.to_value());
            if differs && !read_only {
                info!(
                    "schema changed for '{}', migrating {} live records",
                    db.path.display(),
                    db.index.live_count()
                );
                db.migrate_schema()?;
            }
        }

        db.progress.emit(phase::OPEN_DONE, 100);
        Ok(db)
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of live records.
    pub fn count(&self) -> usize {
        self.index.live_count()
    }

    /// Fraction of meta lines that are superseded or tombstoned: only the
    /// latest meta line per id is useful, everything older is garbage.
    pub fn garbage_ratio(&self) -> f64 {
        if self.total_meta_lines == 0 {
            return 0.0;
        }
        let garbage = self
            .total_meta_lines
            .saturating_sub(self.index.distinct_ids() as u64);
        garbage as f64 / self.total_meta_lines as f64
    }

    /// Syncs and releases the handle. Dropping the handle also releases the
    /// lock; `close` additionally surfaces sync errors.
    pub fn close(self) -> Result<()> {
        if !self.storage.read_only() {
            self.storage.sync()?;
        }
        Ok(())
    }

    /// Creates a fresh unsaved record with schema defaults materialized.
    pub fn new_record(&self) -> Record {
        let mut doc = Value::Object(Map::new());
        self.schema.apply_defaults(&mut doc);
        Record::draft(doc)
    }

    /// Loads the latest version of a record by id.
    ///
    /// A tombstoned id or an unreadable data line reports as absent; only a
    /// strict length/hash mismatch against the paired meta line raises.
    ///
    /// # Errors
    ///
    /// Returns `IoCorruption` on checksum or length mismatch.
    pub fn get(&self, id: &str) -> Result<Option<Record>> {
        self.get_inner(id, false)
    }

    /// Like [`Database::get`], additionally attaching the parsed meta line.
    pub fn get_with_meta(&self, id: &str) -> Result<Option<Record>> {
        self.get_inner(id, true)
    }

    fn get_inner(&self, id: &str, include_meta: bool) -> Result<Option<Record>> {
        let Some(entry) = self.index.get(id) else {
            return Ok(None);
        };
        if entry.deleted {
            return Ok(None);
        }
        let Some(off_data) = entry.offset_data else {
            return Ok(None);
        };
        let off_meta = entry.offset_meta;
        let Ok(line) = self.storage.read_line_at(off_data) else {
            return Ok(None);
        };
        let Ok(doc) = serde_json::from_str::<Value>(&line) else {
            return Ok(None);
        };

        // Meta read/parse trouble is tolerated; a real mismatch is not.
        let meta = self
            .storage
            .read_line_at(off_meta)
            .ok()
            .and_then(|raw| MetaLine::decode(&raw).ok());
        if let Some(meta) = &meta {
            meta.verify(line.as_bytes())?;
        }

        let mut record = Record::loaded(doc, id.to_string(), off_meta);
        if include_meta {
            record.set_meta(meta);
        }
        Ok(Some(record))
    }

    /// Runs a query: index prefilter where possible, residual full match,
    /// then ordering, pagination, and projection.
    pub fn find(&self, query: &Value, options: &FindOptions) -> Result<Vec<Record>> {
        let candidates = self.candidate_entries(query);

        let mut records = match self.try_fast_path(query, options, &candidates)? {
            Some(records) => records,
            None => {
                let mut records = Vec::new();
                for (id, off_meta, off_data) in &candidates {
                    let Ok(line) = self.storage.read_line_at(*off_data) else {
                        continue;
                    };
                    let Ok(doc) = serde_json::from_str::<Value>(&line) else {
                        continue;
                    };
                    if !query::matches(&doc, query) {
                        continue;
                    }
                    records.push(Record::loaded(doc, id.clone(), *off_meta));
                }
                records
            }
        };

        for (path, dir) in options.order_by.iter().rev() {
            records.sort_by(|a, b| {
                let ka = query::sort_key(query::extract_path(a.doc(), path));
                let kb = query::sort_key(query::extract_path(b.doc(), path));
                match dir {
                    SortDir::Asc => ka.cmp(&kb),
                    SortDir::Desc => kb.cmp(&ka),
                }
            });
        }

        let start = options.skip.min(records.len());
        let mut records = records.split_off(start);
        if let Some(limit) = options.limit {
            records.truncate(limit);
        }

        // The fast path already produced projected documents.
        if let Some(fields) = &options.fields {
            if !self.fast_path_applies(query, options) {
                records = records
                    .into_iter()
                    .map(|record| {
                        let projected = query::project(record.doc(), fields);
                        let id = record.id().unwrap_or_default().to_string();
                        let offset = record.expected_offset().unwrap_or_default();
                        Record::loaded(projected, id, offset)
                    })
                    .collect();
            }
        }

        Ok(records)
    }

    /// Applies a patch (deep merge for nested objects) to every record
    /// matching the query and saves each one. Returns the match count.
    pub fn update(&mut self, query: &Value, patch: &Value) -> Result<usize> {
        self.storage.check_writable()?;
        self.progress.emit(phase::UPDATE_START, 0);
        let mut records = self.find(query, &FindOptions::new())?;
        let mut updated = 0usize;
        for record in &mut records {
            apply_patch(record, patch);
            self.save_inner(record, false)?;
            updated += 1;
        }
        self.progress.emit(phase::UPDATE_DONE, 100);
        self.maybe_autocompact()?;
        Ok(updated)
    }

    /// Logically deletes every record matching the query by appending
    /// tombstones. Returns the match count.
    pub fn delete(&mut self, query: &Value) -> Result<usize> {
        self.storage.check_writable()?;
        self.progress.emit(phase::DELETE_START, 0);
        let records = self.find(query, &FindOptions::new())?;
        let mut deleted = 0usize;
        for record in &records {
            let Some(id) = record.id() else {
                continue;
            };
            let id = id.to_string();
            self.index_remove_from_doc(&id, record.doc());
            let ts = now_iso();
            let meta = MetaLine::del(id.clone(), ts.clone());
            let (off_meta, _) = self.storage.append_meta_data(&meta.encode(), None)?;
            self.total_meta_lines += 1;
            self.index.add_meta(MetaEntry {
                id,
                offset_meta: off_meta,
                offset_data: None,
                deleted: true,
                ts_ms: iso_to_epoch_ms(&ts),
            });
            deleted += 1;
        }
        self.progress.emit(phase::DELETE_DONE, 100);
        self.maybe_autocompact()?;
        Ok(deleted)
    }

    /// Persists a record: validates, runs the optimistic check, appends
    /// meta+data, and updates the index and the record's baseline.
    ///
    /// # Errors
    ///
    /// `Validation` from the schema, `DuplicateId` when a new record reuses
    /// a live id, `Conflict` when the record changed underneath this view.
    pub fn save(&mut self, record: &mut Record) -> Result<()> {
        self.save_inner(record, false)
    }

    /// Like [`Database::save`], skipping the optimistic conflict check.
    pub fn save_force(&mut self, record: &mut Record) -> Result<()> {
        self.save_inner(record, true)
    }

    fn save_inner(&mut self, record: &mut Record, force: bool) -> Result<()> {
        self.storage.check_writable()?;
        let is_new = record.expected_offset().is_none();

        if record.id().is_none() {
            // First save: adopt a caller-provided `id` field or mint a ULID,
            // and stamp `createdAt`.
            let id = record
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(new_ulid);
            record.assign_id(id);
            if record.get("createdAt").is_none() {
                record.set("createdAt", Value::String(now_iso()));
            }
        } else if let Some(id) = record.id().map(str::to_string) {
            match record.get("id") {
                Some(Value::String(s)) if *s == id => {}
                None => record.assign_id(id),
                _ => {
                    return Err(Error::Validation(
                        "`id` is immutable after creation".to_string(),
                    ));
                }
            }
        }

        if !force && !record.dirty() {
            return Ok(());
        }

        self.schema.apply_defaults(record.doc_mut());
        self.schema.validate(record.doc(), &self.taxonomies)?;

        let id = match record.id() {
            Some(id) => id.to_string(),
            None => return Err(Error::Validation("record has no id".to_string())),
        };
        let current = self.index.get(&id).cloned();

        if is_new {
            if let Some(entry) = &current {
                if !entry.deleted {
                    return Err(Error::DuplicateId { id });
                }
            }
        } else if !force {
            match &current {
                None => {
                    return Err(Error::Conflict(format!("record `{id}` no longer exists")));
                }
                Some(entry) if entry.deleted => {
                    return Err(Error::Conflict(format!("record `{id}` was deleted")));
                }
                Some(entry) if Some(entry.offset_meta) != record.expected_offset() => {
                    return Err(Error::Conflict(format!(
                        "record `{id}` was modified since it was loaded"
                    )));
                }
                _ => {}
            }
        }

        // Retire the previous version's index contributions.
        if let Some(entry) = &current {
            if !entry.deleted {
                if let Some(off) = entry.offset_data {
                    if let Ok(line) = self.storage.read_line_at(off) {
                        if let Ok(old_doc) = serde_json::from_str::<Value>(&line) {
                            self.index_remove_from_doc(&id, &old_doc);
                        }
                    }
                }
            }
        }

        let data = canonical_json(record.doc());
        let ts = now_iso();
        let meta = MetaLine::put(id.clone(), ts.clone(), data.as_bytes());
        let (off_meta, off_data) = self
            .storage
            .append_meta_data(&meta.encode(), Some(&data))?;
        self.total_meta_lines += 1;
        self.index.add_meta(MetaEntry {
            id: id.clone(),
            offset_meta: off_meta,
            offset_data: off_data,
            deleted: false,
            ts_ms: iso_to_epoch_ms(&ts),
        });
        self.index_add_from_doc(&id, record.doc());

        if record.meta().is_some() {
            record.set_meta(Some(meta));
        }
        record.mark_clean(off_meta, data);
        Ok(())
    }

    /// Re-reads the latest version of the record by id and resets its
    /// baseline.
    ///
    /// # Errors
    ///
    /// `Conflict` when the record has been deleted, `Validation` when it was
    /// never saved.
    pub fn reload(&self, record: &mut Record) -> Result<()> {
        let Some(id) = record.id().map(str::to_string) else {
            return Err(Error::Validation(
                "record has no id; save it first".to_string(),
            ));
        };
        let Some(fresh) = self.get(&id)? else {
            return Err(Error::Conflict(format!("record `{id}` not found")));
        };
        let offset = fresh.expected_offset().unwrap_or_default();
        record.set_meta(None);
        record.replace_doc(fresh.into_doc(), offset);
        Ok(())
    }

    /// Maintenance handle for one taxonomy.
    pub fn taxonomy(&mut self, name: &str) -> TaxonomyApi<'_> {
        TaxonomyApi::new(self, name)
    }

    /// Stores a blob from an in-memory payload.
    pub fn put_blob(&self, bytes: &[u8], mime: &str, filename: Option<&str>) -> Result<BlobRef> {
        self.blobs.put_blob_bytes(bytes, mime, filename)
    }

    /// Stores a blob from a reader, hashing incrementally.
    pub fn put_blob_stream(
        &self,
        reader: &mut dyn Read,
        mime: &str,
        filename: Option<&str>,
    ) -> Result<BlobRef> {
        self.blobs.put_blob(reader, mime, filename)
    }

    /// Opens a stored blob for reading.
    pub fn open_blob(&self, blob_ref: &BlobRef) -> Result<File> {
        self.blobs.open_blob(blob_ref)
    }

    /// Removes blobs not referenced by any live record.
    pub fn gc_blobs(&self) -> Result<GcStats> {
        let mut used = HashSet::new();
        let offsets: Vec<u64> = self.index.iter_live().filter_map(|e| e.offset_data).collect();
        for offset in offsets {
            let Ok(line) = self.storage.read_line_at(offset) else {
                continue;
            };
            let Ok(doc) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            blobs::collect_refs(&doc, &mut used);
        }
        let stats = self.blobs.gc(&used)?;
        info!(
            "blob gc for '{}': removed {} files, freed {} bytes",
            self.path.display(),
            stats.files_removed,
            stats.bytes_freed
        );
        Ok(stats)
    }

    /// Takes a backup now. Rolling backups are timestamped copies; daily
    /// backups keep the first snapshot of the day and are otherwise a no-op.
    /// Returns the destination path.
    pub fn backup_now(&mut self, kind: BackupKind) -> Result<PathBuf> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let root = parent.join(BACKUP_DIR_NAME);
        match kind {
            BackupKind::Rolling => {
                let dir = root.join("rolling");
                fs::create_dir_all(&dir)?;
                let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
                let dest = dir.join(format!("{stamp}.jsonl"));
                fs::copy(&self.path, &dest)?;
                debug!("rolling backup at '{}'", dest.display());
                self.progress.emit(phase::BACKUP_ROLLING, 100);
                Ok(dest)
            }
            BackupKind::Daily => {
                let dir = root.join("daily");
                fs::create_dir_all(&dir)?;
                let day = Utc::now().format("%Y-%m-%d");
                let dest = dir.join(format!("{day}.jsonl"));
                if dest.exists() {
                    debug!("daily backup '{}' already exists", dest.display());
                } else {
                    fs::copy(&self.path, &dest)?;
                }
                self.progress.emit(phase::BACKUP_DAILY, 100);
                Ok(dest)
            }
        }
    }

    /// Rewrites the file to a fresh put-only stream of live records,
    /// dropping superseded versions and tombstones. Takes rolling (and,
    /// per policy, daily) backups before replacing.
    pub fn compact_now(&mut self) -> Result<()> {
        self.storage.check_writable()?;
        self.progress.emit(phase::COMPACT_START, 0);
        self.backup_now(BackupKind::Rolling)?;
        if self.maintenance.daily_backup {
            self.backup_now(BackupKind::Daily)?;
        }
        let live_before = self.index.live_count();
        self.rewrite_file(phase::COMPACT_COPY, None, |_, doc| Ok(doc))?;
        self.progress.emit(phase::COMPACT_DONE, 100);
        info!(
            "compacted '{}': {} live records retained",
            self.path.display(),
            live_before
        );
        Ok(())
    }

    // ----- crate-internal surface for TaxonomyApi -----

    pub(crate) fn taxonomies_ref(&self) -> &Taxonomies {
        &self.taxonomies
    }

    pub(crate) fn index_ref(&self) -> &InMemoryIndex {
        &self.index
    }

    /// Rewrites header lines 1–3, copying the body verbatim, with a rolling
    /// backup first. Used for catalog-only taxonomy changes.
    pub(crate) fn rewrite_header_only(&mut self, taxonomies: Taxonomies) -> Result<()> {
        self.backup_now(BackupKind::Rolling)?;
        let tmp = temp_sibling(&self.path);
        let body_start = self.storage.body_start();
        let result = (|| -> Result<()> {
            let mut out = BufWriter::with_capacity(64 * 1024, File::create(&tmp)?);
            out.write_all(
                encode_header_lines(&self.header, &self.schema.to_value(), &taxonomies).as_bytes(),
            )?;
            let mut src = File::open(&self.path)?;
            src.seek(SeekFrom::Start(body_start))?;
            std::io::copy(&mut src, &mut out)?;
            out.flush()?;
            out.get_ref().sync_all()?;
            Ok(())
        })();
        if let Err(err) = result {
            let _ = fs::remove_file(&tmp);
            return Err(err);
        }
        self.finish_replace(&tmp, taxonomies)
    }

    /// Full-file migration for taxonomy value changes: live records are
    /// re-emitted with transformed documents and the index is rebuilt.
    pub(crate) fn taxonomy_migrate(
        &mut self,
        name: &str,
        taxonomies: Taxonomies,
        change: &KeyChange,
    ) -> Result<()> {
        self.progress.emit(phase::TAXONOMY_MIGRATE_START, 0);
        self.backup_now(BackupKind::Rolling)?;
        let bound: Vec<(String, bool)> = self
            .schema
            .iter_flat()
            .filter(|(_, spec)| spec.taxonomy.as_deref() == Some(name))
            .map(|(path, spec)| (path.clone(), spec.field_type == FieldType::List))
            .collect();
        self.rewrite_file(
            phase::TAXONOMY_MIGRATE_COPY,
            Some(taxonomies),
            move |_, mut doc| {
                apply_key_change(&mut doc, &bound, change)?;
                Ok(doc)
            },
        )?;
        self.progress.emit(phase::TAXONOMY_MIGRATE_DONE, 100);
        info!("taxonomy `{name}` migrated for '{}'", self.path.display());
        Ok(())
    }

    // ----- internals -----

    fn migrate_schema(&mut self) -> Result<()> {
        self.progress.emit(phase::SCHEMA_MIGRATE_START, 0);
        self.backup_now(BackupKind::Rolling)?;
        let schema = self.schema.clone();
        self.rewrite_file(phase::SCHEMA_MIGRATE_COPY, None, move |_, mut doc| {
            // New defaults are materialized; unknown fields pass through.
            schema.apply_defaults(&mut doc);
            Ok(doc)
        })?;
        self.progress.emit(phase::SCHEMA_MIGRATE_DONE, 100);
        Ok(())
    }

    /// Streams the header plus transformed live records into a temp file,
    /// then atomically replaces the database file and rebuilds the index.
    /// On any error the temp file is removed and the original is intact.
    fn rewrite_file<F>(
        &mut self,
        copy_phase: &'static str,
        new_taxonomies: Option<Taxonomies>,
        mut transform: F,
    ) -> Result<()>
    where
        F: FnMut(&str, Value) -> Result<Value>,
    {
        let taxonomies = new_taxonomies.unwrap_or_else(|| self.taxonomies.clone());
        let tmp = temp_sibling(&self.path);
        let result = (|| -> Result<()> {
            let mut out = BufWriter::with_capacity(64 * 1024, File::create(&tmp)?);
            out.write_all(
                encode_header_lines(&self.header, &self.schema.to_value(), &taxonomies).as_bytes(),
            )?;
            let live: Vec<(String, u64, i64)> = self
                .index
                .iter_live()
                .filter_map(|e| e.offset_data.map(|off| (e.id.clone(), off, e.ts_ms)))
                .collect();
            let total = live.len().max(1) as u64;
            self.progress.emit(copy_phase, 0);
            for (i, (id, offset, ts_ms)) in live.iter().enumerate() {
                let Ok(line) = self.storage.read_line_at(*offset) else {
                    continue;
                };
                let Ok(doc) = serde_json::from_str::<Value>(&line) else {
                    continue;
                };
                let doc = transform(id, doc)?;
                let data = canonical_json(&doc);
                let meta = MetaLine::put(id.clone(), epoch_ms_to_iso(*ts_ms), data.as_bytes());
                out.write_all(meta.encode().as_bytes())?;
                out.write_all(b"\n")?;
                out.write_all(data.as_bytes())?;
                out.write_all(b"\n")?;
                if i % 256 == 0 {
                    let pct = ((i as u64) * 100 / total) as u8;
                    self.progress.emit_count(copy_phase, pct, i as u64, total);
                }
            }
            out.flush()?;
            out.get_ref().sync_all()?;
            self.progress.emit(copy_phase, 100);
            Ok(())
        })();
        if let Err(err) = result {
            let _ = fs::remove_file(&tmp);
            return Err(err);
        }
        self.finish_replace(&tmp, taxonomies)
    }

    fn finish_replace(&mut self, tmp: &Path, taxonomies: Taxonomies) -> Result<()> {
        self.storage.replace_file(tmp)?;
        let (header, _, _) = self.storage.read_header()?;
        self.header = header;
        self.taxonomies = taxonomies;
        self.rescan(false)
    }

    /// Rebuilds the primary index from a meta-offset scan and the secondary
    /// and reverse indexes from live data lines.
    fn rescan(&mut self, emit_open_phases: bool) -> Result<()> {
        self.index.clear();
        self.total_meta_lines = 0;

        if emit_open_phases {
            self.progress.emit(phase::OPEN_SCAN_META, 0);
        }
        let file_len = self.storage.file_len()?.max(1);
        let metas = self.storage.iter_meta_offsets()?;
        for (i, (offset, line)) in metas.enumerate() {
            let Ok(value) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            let Some(id) = value.get("id").and_then(Value::as_str) else {
                continue;
            };
            let op = value.get("op").and_then(Value::as_str).unwrap_or("");
            let ts = value
                .get("ts")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(now_iso);
            let offset_data = if op == "put" {
                Some(offset + line.len() as u64 + 1)
            } else {
                None
            };
            self.total_meta_lines += 1;
            self.index.add_meta(MetaEntry {
                id: id.to_string(),
                offset_meta: offset,
                offset_data,
                deleted: op == "del",
                ts_ms: iso_to_epoch_ms(&ts),
            });
            if emit_open_phases && i % 1024 == 0 {
                let pct = (offset * 100 / file_len).min(99) as u8;
                self.progress.emit(phase::OPEN_SCAN_META, pct);
            }
        }
        if emit_open_phases {
            self.progress.emit(phase::OPEN_SCAN_META, 100);
            self.progress.emit(phase::OPEN_BUILD_INDEXES, 0);
        }

        let live: Vec<(String, u64)> = self
            .index
            .iter_live()
            .filter_map(|e| e.offset_data.map(|off| (e.id.clone(), off)))
            .collect();
        let total = live.len().max(1) as u64;
        for (i, (id, offset)) in live.iter().enumerate() {
            let Ok(line) = self.storage.read_line_at(*offset) else {
                continue;
            };
            let Ok(doc) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            self.index_add_from_doc(id, &doc);
            if emit_open_phases && i % 512 == 0 {
                let pct = ((i as u64) * 100 / total).min(99) as u8;
                self.progress
                    .emit_count(phase::OPEN_BUILD_INDEXES, pct, i as u64, total);
            }
        }
        if emit_open_phases {
            self.progress.emit(phase::OPEN_BUILD_INDEXES, 100);
        }
        debug!(
            "scanned '{}': {} meta lines, {} live records",
            self.path.display(),
            self.total_meta_lines,
            live.len()
        );
        Ok(())
    }

    fn maybe_autocompact(&mut self) -> Result<()> {
        if self.storage.read_only() || self.total_meta_lines == 0 {
            return Ok(());
        }
        let ratio = self.garbage_ratio();
        if ratio >= self.maintenance.compact_threshold {
            info!(
                "garbage ratio {:.2} reached threshold {:.2}, compacting '{}'",
                ratio,
                self.maintenance.compact_threshold,
                self.path.display()
            );
            self.compact_now()?;
        }
        Ok(())
    }

    fn index_add_from_doc(&mut self, id: &str, doc: &Value) {
        for path in &self.specs.sec_paths {
            if let Some(value) = query::extract_path(doc, path) {
                if is_scalar_value(value) {
                    self.index.add_secondary(path, &canonical_json(value), id);
                }
            }
        }
        for (path, taxonomy) in &self.specs.rev_list_paths {
            if let Some(Value::Array(items)) = query::extract_path(doc, path) {
                for item in items {
                    if let Some(key) = item.as_str() {
                        self.index.add_reverse(taxonomy, key, id);
                    }
                }
            }
        }
        for (path, taxonomy) in &self.specs.rev_single_paths {
            if let Some(Value::String(key)) = query::extract_path(doc, path) {
                self.index.add_reverse(taxonomy, key, id);
            }
        }
    }

    fn index_remove_from_doc(&mut self, id: &str, doc: &Value) {
        for path in &self.specs.sec_paths {
            if let Some(value) = query::extract_path(doc, path) {
                if is_scalar_value(value) {
                    self.index.remove_secondary(path, &canonical_json(value), id);
                }
            }
        }
        for (path, taxonomy) in &self.specs.rev_list_paths {
            if let Some(Value::Array(items)) = query::extract_path(doc, path) {
                for item in items {
                    if let Some(key) = item.as_str() {
                        self.index.remove_reverse(taxonomy, key, id);
                    }
                }
            }
        }
        for (path, taxonomy) in &self.specs.rev_single_paths {
            if let Some(Value::String(key)) = query::extract_path(doc, path) {
                self.index.remove_reverse(taxonomy, key, id);
            }
        }
    }

    /// Resolves the candidate set: an index prefilter when at least one
    /// indexable term exists and no top-level `$or`, otherwise all live
    /// records. Returns (id, offset_meta, offset_data) triples in id order.
    fn candidate_entries(&self, query: &Value) -> Vec<(String, u64, u64)> {
        let ids = self.prefilter_ids(query);
        match ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.index.get(id))
                .filter(|e| !e.deleted)
                .filter_map(|e| e.offset_data.map(|off| (e.id.clone(), e.offset_meta, off)))
                .collect(),
            None => self
                .index
                .iter_live()
                .filter_map(|e| e.offset_data.map(|off| (e.id.clone(), e.offset_meta, off)))
                .collect(),
        }
    }

    fn prefilter_ids(&self, query: &Value) -> Option<BTreeSet<String>> {
        let terms = query::collect_index_terms(query)?;
        let mut candidates: Option<BTreeSet<String>> = None;
        let mut any_indexable = false;

        for term in terms {
            let ids: Option<BTreeSet<String>> = match &term {
                IndexTerm::Eq { path, value } => {
                    if self.specs.sec_paths.contains(path) {
                        Some(
                            self.index
                                .secondary_ids(path, &canonical_json(value))
                                .cloned()
                                .unwrap_or_default(),
                        )
                    } else if let Some(taxonomy) = self.specs.rev_map.get(path) {
                        value.as_str().map(|key| {
                            self.index
                                .reverse_ids(taxonomy, key)
                                .cloned()
                                .unwrap_or_default()
                        })
                    } else {
                        None
                    }
                }
                IndexTerm::Contains { path, value } => {
                    self.specs.rev_map.get(path).and_then(|taxonomy| {
                        value.as_str().map(|key| {
                            self.index
                                .reverse_ids(taxonomy, key)
                                .cloned()
                                .unwrap_or_default()
                        })
                    })
                }
                IndexTerm::In { path, values } => {
                    // Decomposed as a union of $eq probes.
                    if self.specs.sec_paths.contains(path) {
                        let mut union = BTreeSet::new();
                        for value in values {
                            if let Some(ids) =
                                self.index.secondary_ids(path, &canonical_json(value))
                            {
                                union.extend(ids.iter().cloned());
                            }
                        }
                        Some(union)
                    } else if let Some(taxonomy) = self.specs.rev_map.get(path) {
                        let mut union = BTreeSet::new();
                        for value in values {
                            if let Some(key) = value.as_str() {
                                if let Some(ids) = self.index.reverse_ids(taxonomy, key) {
                                    union.extend(ids.iter().cloned());
                                }
                            }
                        }
                        Some(union)
                    } else {
                        None
                    }
                }
            };

            if let Some(ids) = ids {
                any_indexable = true;
                candidates = Some(match candidates {
                    None => ids,
                    Some(previous) => previous.intersection(&ids).cloned().collect(),
                });
                if candidates.as_ref().is_some_and(BTreeSet::is_empty) {
                    break;
                }
            }
        }

        if any_indexable { candidates } else { None }
    }

    /// True when the executor will take the raw-line fast path for this
    /// query and options.
    fn fast_path_applies(&self, query: &Value, options: &FindOptions) -> bool {
        let Some(fields) = &options.fields else {
            return false;
        };
        if fields.is_empty() || !options.order_by.is_empty() {
            return false;
        }
        if !is_simple_query(query, 3) {
            return false;
        }
        let mut terms = Vec::new();
        if !gather_simple_terms(query, "", &mut terms) {
            return false;
        }
        terms
            .iter()
            .map(|(path, _, _)| path)
            .chain(fields.iter().filter(|f| f.as_str() != "id"))
            .all(|path| self.fast_path_extractable(path))
    }

    fn fast_path_extractable(&self, path: &str) -> bool {
        if path.contains('/') {
            return false;
        }
        if self.specs.ambiguous_leaves.contains(path) {
            return false;
        }
        self.schema
            .spec_at(path)
            .is_some_and(|spec| spec.field_type.is_scalar())
    }

    /// Raw-line evaluation: extract scalar tokens with per-path regexes and
    /// build projected documents without a full JSON parse. Any extraction
    /// miss falls back to parsing that record, so results are identical to
    /// the full path.
    fn try_fast_path(
        &self,
        query: &Value,
        options: &FindOptions,
        candidates: &[(String, u64, u64)],
    ) -> Result<Option<Vec<Record>>> {
        if !self.fast_path_applies(query, options) {
            return Ok(None);
        }
        let fields = match &options.fields {
            Some(fields) => fields,
            None => return Ok(None),
        };
        let mut terms = Vec::new();
        gather_simple_terms(query, "", &mut terms);

        let mut extractors: HashMap<String, Extractor> = HashMap::new();
        for path in terms
            .iter()
            .map(|(path, _, _)| path)
            .chain(fields.iter().filter(|f| f.as_str() != "id"))
        {
            if !extractors.contains_key(path) {
                let Some(spec) = self.schema.spec_at(path) else {
                    return Ok(None);
                };
                extractors.insert(path.clone(), Extractor::compile(path, spec.field_type)?);
            }
        }

        let mut records = Vec::with_capacity(candidates.len().min(1024));
        'candidates: for (id, off_meta, off_data) in candidates {
            let Ok(line) = self.storage.read_line_at(*off_data) else {
                continue;
            };

            let mut matched = true;
            for (path, op, arg) in &terms {
                let extractor = &extractors[path];
                match extractor.extract_value(&line) {
                    Some(value) => {
                        if !query::apply_op(&value, op, arg) {
                            matched = false;
                            break;
                        }
                    }
                    None => {
                        // Absent field or extraction miss: full parse decides.
                        let Ok(doc) = serde_json::from_str::<Value>(&line) else {
                            continue 'candidates;
                        };
                        if query::matches(&doc, query) {
                            let projected = query::project(&doc, fields);
                            records.push(Record::loaded(projected, id.clone(), *off_meta));
                        }
                        continue 'candidates;
                    }
                }
            }
            if !matched {
                continue;
            }

            let mut out = Map::new();
            for field in fields {
                if field == "id" {
                    continue;
                }
                if let Some(value) = extractors[field].extract_value(&line) {
                    out.insert(field.clone(), value);
                }
            }
            out.insert("id".to_string(), Value::String(id.clone()));
            records.push(Record::loaded(Value::Object(out), id.clone(), *off_meta));
        }
        Ok(Some(records))
    }
}

/// Applies a patch to a record: nested objects merge recursively, everything
/// else replaces. Each top-level patch key counts as modified.
fn apply_patch(record: &mut Record, patch: &Value) {
    let Some(patch) = patch.as_object() else {
        return;
    };
    for (key, pvalue) in patch {
        let merged = match (record.get(key), pvalue) {
            (Some(existing @ Value::Object(_)), Value::Object(_)) => {
                let mut merged = existing.clone();
                deep_merge(&mut merged, pvalue);
                merged
            }
            _ => pvalue.clone(),
        };
        record.set(key.clone(), merged);
    }
}

fn deep_merge(target: &mut Value, patch: &Value) {
    if let (Value::Object(target), Value::Object(patch)) = (target, patch) {
        for (key, pvalue) in patch {
            match target.get_mut(key) {
                Some(slot) if slot.is_object() && pvalue.is_object() => deep_merge(slot, pvalue),
                _ => {
                    target.insert(key.clone(), pvalue.clone());
                }
            }
        }
    }
}

fn is_scalar_value(value: &Value) -> bool {
    matches!(
        value,
        Value::String(_) | Value::Number(_) | Value::Bool(_)
    )
}

fn table_name(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("db")
        .to_string()
}

fn gather_simple_terms(
    query: &Value,
    base: &str,
    out: &mut Vec<(String, String, Value)>,
) -> bool {
    let Some(map) = query.as_object() else {
        return false;
    };
    for (key, pred) in map {
        if key.starts_with('$') {
            return false;
        }
        let path = if base.is_empty() {
            key.clone()
        } else {
            format!("{base}/{key}")
        };
        if let Some(ops) = pred.as_object() {
            if ops.keys().any(|op| op.starts_with('$')) {
                for (op, arg) in ops {
                    if !matches!(
                        op.as_str(),
                        "$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte"
                    ) {
                        return false;
                    }
                    out.push((path.clone(), op.clone(), arg.clone()));
                }
            } else if !gather_simple_terms(pred, &path, out) {
                return false;
            }
        } else {
            out.push((path, "$eq".to_string(), pred.clone()));
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deep_merge_replaces_scalars_and_merges_objects() {
        let mut target = json!({"a": 1, "nested": {"x": 1, "y": 2}});
        deep_merge(&mut target, &json!({"a": 9, "nested": {"y": 3, "z": 4}}));
        assert_eq!(target, json!({"a": 9, "nested": {"x": 1, "y": 3, "z": 4}}));
    }

    #[test]
    fn test_apply_patch_marks_modified() {
        let mut record = Record::draft(json!({"flags": {"active": true}, "age": 1}));
        apply_patch(&mut record, &json!({"age": 2, "flags": {"vip": true}}));
        assert_eq!(record.get("age"), Some(&json!(2)));
        assert_eq!(record.get("flags"), Some(&json!({"active": true, "vip": true})));
        assert_eq!(record.modified_fields(), vec!["age", "flags"]);
    }

    #[test]
    fn test_gather_simple_terms_nested() {
        let mut terms = Vec::new();
        let ok = gather_simple_terms(
            &json!({"age": {"$gte": 18}, "flags": {"active": true}}),
            "",
            &mut terms,
        );
        assert!(ok);
        assert!(terms.contains(&("age".to_string(), "$gte".to_string(), json!(18))));
        assert!(terms.contains(&("flags/active".to_string(), "$eq".to_string(), json!(true))));
    }

    #[test]
    fn test_table_name_from_path() {
        assert_eq!(table_name(Path::new("/tmp/users.jsonl")), "users");
        assert_eq!(table_name(Path::new("relative.jsonl")), "relative");
    }
}
