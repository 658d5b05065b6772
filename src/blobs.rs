//! Summary: Content-addressed external blob store (SHA-256 CAS).
//! Copyright (c) YOAB. All rights reserved.
//!
//! Blobs live next to the database file at
//! `<base>.blobs/sha256/<first 2 hex>/<remaining hex>`. Writes stream into a
//! temp file under `<base>.blobs/tmp/` while hashing incrementally, then
//! rename atomically into the store; an existing destination means the
//! content is already stored and the temp is discarded. GC removes every
//! file whose hash is not in the reachable set computed from live records.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::canonical::new_ulid;
use crate::error::{Error, Result};
use crate::storage::fsync_dir;

const HASH_SCHEME: &str = "sha256:";
const COPY_BUF: usize = 64 * 1024;

/// Reference to a stored blob, embedded into documents as
/// `{"$blob":"sha256:<hex>", size, mime, filename?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobRef {
    /// Content address, `sha256:<hex>`.
    #[serde(rename = "$blob")]
    pub blob: String,
    /// Blob size in bytes.
    pub size: u64,
    /// MIME type supplied at store time.
    pub mime: String,
    /// Original file name, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl BlobRef {
    /// The hex digest, when the scheme is `sha256:`.
    pub fn hash_hex(&self) -> Option<&str> {
        self.blob.strip_prefix(HASH_SCHEME)
    }

    /// JSON form for embedding into a document field.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("serializing blob ref")
    }
}

/// Result of a blob garbage collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Orphaned files removed.
    pub files_removed: u64,
    /// Bytes those files occupied.
    pub bytes_freed: u64,
}

/// Content-addressed blob store rooted next to one database file.
#[derive(Debug, Clone)]
pub struct BlobManager {
    base: PathBuf,
}

impl BlobManager {
    /// Creates the manager for a database path; `users.jsonl` maps to a
    /// `users.blobs/` store. Directories are created lazily on first write.
    pub fn new(db_path: &Path) -> Self {
        Self {
            base: db_path.with_extension("blobs"),
        }
    }

    /// Root directory of the store.
    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    fn store_dir(&self) -> PathBuf {
        self.base.join("sha256")
    }

    fn tmp_dir(&self) -> PathBuf {
        self.base.join("tmp")
    }

    fn blob_path(&self, hex: &str) -> PathBuf {
        let (prefix, rest) = hex.split_at(2);
        self.store_dir().join(prefix).join(rest)
    }

    /// Streams a blob into the store, hashing incrementally, and returns its
    /// reference. Content already present is deduplicated.
    pub fn put_blob(
        &self,
        reader: &mut dyn Read,
        mime: &str,
        filename: Option<&str>,
    ) -> Result<BlobRef> {
        fs::create_dir_all(self.tmp_dir())?;
        let tmp = self.tmp_dir().join(format!("{}.part", new_ulid()));

        let written = (|| -> Result<(String, u64)> {
            let mut out = File::create(&tmp)?;
            let mut hasher = Sha256::new();
            let mut size = 0u64;
            let mut buf = vec![0u8; COPY_BUF];
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                out.write_all(&buf[..n])?;
                size += n as u64;
            }
            out.sync_all()?;
            Ok((hex::encode(hasher.finalize()), size))
        })();

        let (hex_digest, size) = match written {
            Ok(v) => v,
            Err(err) => {
                let _ = fs::remove_file(&tmp);
                return Err(err);
            }
        };

        let dest = self.blob_path(&hex_digest);
        if dest.exists() {
            // Same content already stored; keep the existing file.
            fs::remove_file(&tmp)?;
        } else {
            let parent = dest.parent().unwrap_or_else(|| Path::new("."));
            fs::create_dir_all(parent)?;
            fs::rename(&tmp, &dest)?;
            fsync_dir(parent)?;
        }

        Ok(BlobRef {
            blob: format!("{HASH_SCHEME}{hex_digest}"),
            size,
            mime: mime.to_string(),
            filename: filename.map(str::to_string),
        })
    }

    /// Convenience wrapper for in-memory payloads.
    pub fn put_blob_bytes(
        &self,
        bytes: &[u8],
        mime: &str,
        filename: Option<&str>,
    ) -> Result<BlobRef> {
        let mut cursor = std::io::Cursor::new(bytes);
        self.put_blob(&mut cursor, mime, filename)
    }

    /// Opens the addressed blob for reading.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a non-`sha256:` scheme and `NotFound` when
    /// the addressed file is absent.
    pub fn open_blob(&self, blob_ref: &BlobRef) -> Result<File> {
        let hex_digest = blob_ref.hash_hex().ok_or_else(|| {
            Error::Validation(format!("unsupported blob ref scheme: `{}`", blob_ref.blob))
        })?;
        if hex_digest.len() < 3 {
            return Err(Error::Validation(format!(
                "malformed blob address: `{}`",
                blob_ref.blob
            )));
        }
        let path = self.blob_path(hex_digest);
        match OpenOptions::new().read(true).open(&path) {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("blob `{}`", blob_ref.blob)))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Removes every stored file whose hex digest is not in `used`.
    pub fn gc(&self, used: &HashSet<String>) -> Result<GcStats> {
        let mut stats = GcStats::default();
        let store = self.store_dir();
        if !store.is_dir() {
            return Ok(stats);
        }
        for prefix_entry in fs::read_dir(&store)? {
            let prefix_entry = prefix_entry?;
            if !prefix_entry.file_type()?.is_dir() {
                continue;
            }
            let prefix = prefix_entry.file_name().to_string_lossy().into_owned();
            for blob_entry in fs::read_dir(prefix_entry.path())? {
                let blob_entry = blob_entry?;
                if !blob_entry.file_type()?.is_file() {
                    continue;
                }
                let rest = blob_entry.file_name().to_string_lossy().into_owned();
                let hex_digest = format!("{prefix}{rest}");
                if used.contains(&hex_digest) {
                    continue;
                }
                let size = blob_entry.metadata()?.len();
                fs::remove_file(blob_entry.path())?;
                stats.files_removed += 1;
                stats.bytes_freed += size;
            }
        }
        Ok(stats)
    }
}

/// Recursively collects `sha256:` blob digests referenced by a document.
pub(crate) fn collect_refs(value: &Value, into: &mut HashSet<String>) {
    match value {
        Value::Object(map) => {
            if let Some(address) = map.get("$blob").and_then(Value::as_str) {
                if let Some(hex_digest) = address.strip_prefix(HASH_SCHEME) {
                    into.insert(hex_digest.to_string());
                }
            }
            for nested in map.values() {
                collect_refs(nested, into);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_refs(item, into);
            }
        }
        _ => {}
    }
}
