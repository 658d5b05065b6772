//! Summary: Embedded, single-file, append-only JSONL document database engine.
//! Copyright (c) YOAB. All rights reserved.
//!
//! Each database is one text file: a four-line header (format, schema,
//! taxonomies, begin sentinel) followed by a stream of line-delimited JSON
//! records. Every logical write appends a meta line carrying the operation,
//! timestamp, and, for puts, the byte length and SHA-256 of the canonical
//! JSON data line that follows. Deletion is logical (tombstones); background
//! compaction and taxonomy/schema migrations rewrite the file through a
//! temp file plus atomic replace.
//!
//! Secondary and reverse-taxonomy indexes are ephemeral: they are rebuilt
//! on open from a sequential scan, so there is no persistent index format
//! to recover. One process-wide exclusive lock makes this a single-writer,
//! multiple-reader engine.
//!
//! # Example
//!
//! ```no_run
//! use ejldb::{Database, FindOptions};
//! use serde_json::json;
//!
//! # fn main() -> ejldb::Result<()> {
//! let schema = json!({
//!     "id":   {"type": "str", "mandatory": true, "index": true},
//!     "name": {"type": "str", "mandatory": true},
//!     "age":  {"type": "int", "default": 0, "index": true},
//!     "createdAt": {"type": "datetime"},
//! });
//! let mut db = Database::open("users.jsonl", schema)?;
//!
//! let mut rec = db.new_record();
//! rec.set("name", "Alice");
//! rec.set("age", 33);
//! db.save(&mut rec)?;
//!
//! for found in db.find(&json!({"age": {"$gte": 18}}), &FindOptions::new())? {
//!     println!("{}", found.get("name").and_then(|v| v.as_str()).unwrap_or("?"));
//! }
//! # Ok(())
//! # }
//! ```

pub mod blobs;
pub mod canonical;
pub mod db;
pub mod error;
mod fastpath;
pub mod index;
pub mod progress;
pub mod query;
pub mod record;
pub mod schema;
pub mod storage;
pub mod taxonomy;

pub use blobs::{BlobManager, BlobRef, GcStats};
pub use db::{BackupKind, Database, Maintenance, OpenMode, OpenOptions};
pub use error::{Error, Result};
pub use index::{InMemoryIndex, MetaEntry};
pub use progress::{ProgressEvent, ProgressFn};
pub use query::{FindOptions, SortDir};
pub use record::{MetaLine, Op, Record};
pub use schema::{FieldSpec, FieldType, Schema, TaxonomyMode};
pub use storage::{FileStorage, Header};
pub use taxonomy::{Collision, DeleteStrategy, Taxonomies, Taxonomy, TaxonomyApi, TaxonomyEntry};
