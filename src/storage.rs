//! Summary: Byte-level file I/O: exclusive lock, header, append, scan, replace.
//! Copyright (c) YOAB. All rights reserved.
//!
//! A database is one text file. Lines 1–4 are the header (`header`,
//! `schema`, `taxonomies`, `begin`); everything after is the record stream of
//! meta lines and, for puts, data lines. Appends position at end-of-file,
//! write `meta\n` (+ `data\n`) in one batch and fdatasync. Rewrites go
//! through a temp file in the same directory followed by an atomic rename
//! plus directory fsync.
//!
//! The exclusive advisory lock is taken on the data file itself (not a
//! sidecar) and lives for the lifetime of the handle; it is released on drop
//! or process exit. `replace_file` locks the replacement before renaming it
//! into place so the file at the database path is never observably unlocked.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::canonical::new_ulid;
use crate::error::{Error, Result};
use crate::taxonomy::Taxonomies;

/// Magic format string carried by header line 1.
pub const FORMAT_VERSION: &str = "ejl1";

const TAG_HEADER: &str = "header";
const TAG_SCHEMA: &str = "schema";
const TAG_TAXONOMIES: &str = "taxonomies";
const TAG_BEGIN: &str = "begin";
const TAG_META: &str = "meta";

/// Payload of header line 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    /// Format magic, always [`FORMAT_VERSION`].
    pub format: String,
    /// Logical table name, derived from the file name at creation.
    pub table: String,
    /// ISO-8601 creation timestamp.
    pub created: String,
    /// Defaults are materialized into documents at save and migration time.
    pub defaults_always_materialized: bool,
}

/// Exclusive-locked handle over one database file.
pub struct FileStorage {
    path: PathBuf,
    file: Flock<File>,
    body_start: u64,
    read_only: bool,
}

impl FileStorage {
    /// Opens the file and takes the exclusive lock.
    ///
    /// Read-write mode creates the file when missing; read-only mode does
    /// not.
    ///
    /// # Errors
    ///
    /// Returns `LockHeld` when another handle holds the lock, or `Io` when
    /// the file cannot be opened.
    pub fn open_exclusive(path: &Path, read_only: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .truncate(false)
            .open(path)?;
        let file = lock_exclusive(file, path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            body_start: 0,
            read_only,
        })
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when the handle refuses writes.
    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Byte offset of the first record-stream line (right after `begin`).
    pub fn body_start(&self) -> u64 {
        self.body_start
    }

    /// Current file length in bytes.
    pub fn file_len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Reads and validates the 4-line header, remembering where the record
    /// stream begins.
    ///
    /// # Errors
    ///
    /// Returns `IoCorruption` on a missing, truncated, or malformed header.
    pub fn read_header(&mut self) -> Result<(Header, Value, Taxonomies)> {
        let mut reader = BufReader::new(&*self.file);
        reader.seek(SeekFrom::Start(0))?;
        let mut offset = 0u64;
        let mut lines = Vec::with_capacity(4);
        for _ in 0..4 {
            let mut buf = Vec::new();
            let n = reader.read_until(b'\n', &mut buf)?;
            if n == 0 || buf.last() != Some(&b'\n') {
                return Err(Error::corrupt("truncated header"));
            }
            offset += n as u64;
            let text = std::str::from_utf8(&buf[..n - 1])
                .map_err(|_| Error::corrupt("header line is not UTF-8"))?;
            let value: Value = serde_json::from_str(text)
                .map_err(|e| Error::corrupt(format!("unreadable header line: {e}")))?;
            lines.push(value);
        }

        let header = parse_tagged(&lines[0], TAG_HEADER)?;
        let header: Header = serde_json::from_value(Value::Object(header))
            .map_err(|e| Error::corrupt(format!("bad header line: {e}")))?;
        if header.format != FORMAT_VERSION {
            return Err(Error::corrupt(format!(
                "unsupported format `{}`, expected `{FORMAT_VERSION}`",
                header.format
            )));
        }

        let schema_line = parse_tagged(&lines[1], TAG_SCHEMA)?;
        let schema_fields = schema_line
            .get("fields")
            .cloned()
            .ok_or_else(|| Error::corrupt("schema line has no `fields`"))?;

        let taxonomies = parse_tagged(&lines[2], TAG_TAXONOMIES)?;
        let taxonomies = Taxonomies::from_value(&Value::Object(taxonomies))?;

        parse_tagged(&lines[3], TAG_BEGIN)?;

        self.body_start = offset;
        Ok((header, schema_fields, taxonomies))
    }

    /// Writes a fresh file containing only the header, via the atomic
    /// temp + replace protocol, and positions the body start after it.
    pub fn write_initial(
        &mut self,
        header: &Header,
        schema_fields: &Value,
        taxonomies: &Taxonomies,
    ) -> Result<()> {
        self.check_writable()?;
        let tmp = temp_sibling(&self.path);
        let result = (|| -> Result<()> {
            let mut out = File::create(&tmp)?;
            out.write_all(encode_header_lines(header, schema_fields, taxonomies).as_bytes())?;
            out.sync_all()?;
            Ok(())
        })();
        if let Err(err) = result {
            let _ = std::fs::remove_file(&tmp);
            return Err(err);
        }
        self.replace_file(&tmp)?;
        self.read_header()?;
        Ok(())
    }

    /// Appends a meta line and, when present, its data line, then syncs.
    ///
    /// Returns the byte offsets of the meta line and the data line.
    pub fn append_meta_data(
        &mut self,
        meta_line: &str,
        data_line: Option<&str>,
    ) -> Result<(u64, Option<u64>)> {
        self.check_writable()?;
        let mut file: &File = &self.file;
        let off_meta = file.seek(SeekFrom::End(0))?;

        let data_len = data_line.map_or(0, str::len);
        let mut buf = Vec::with_capacity(meta_line.len() + data_len + 2);
        buf.extend_from_slice(meta_line.as_bytes());
        buf.push(b'\n');
        let off_data = if let Some(data) = data_line {
            buf.extend_from_slice(data.as_bytes());
            buf.push(b'\n');
            Some(off_meta + meta_line.len() as u64 + 1)
        } else {
            None
        };

        file.write_all(&buf)?;
        self.sync()?;
        Ok((off_meta, off_data))
    }

    /// Lazily yields `(offset, raw_meta_line)` for every meta line of the
    /// record stream, skipping data lines by `len_data + 1` and tolerating
    /// unreadable lines and a partial final line.
    pub fn iter_meta_offsets(&self) -> Result<MetaOffsets<'_>> {
        let mut reader = BufReader::new(&*self.file);
        reader.seek(SeekFrom::Start(self.body_start))?;
        Ok(MetaOffsets {
            reader,
            offset: self.body_start,
            buf: Vec::new(),
        })
    }

    /// Reads exactly one line starting at `offset` (which must be a line
    /// start), without its trailing newline.
    pub fn read_line_at(&self, offset: u64) -> Result<String> {
        let mut reader = BufReader::new(&*self.file);
        reader.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::new();
        let n = reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Err(Error::corrupt(format!("no line at offset {offset}")));
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
        }
        String::from_utf8(buf).map_err(|_| Error::corrupt(format!("non-UTF-8 line at {offset}")))
    }

    /// Atomically replaces the database file with `tmp` and fsyncs the
    /// containing directory. The replacement is locked before the rename so
    /// the path never points at an unlocked file.
    ///
    /// The header must be re-read afterwards: offsets have changed.
    pub fn replace_file(&mut self, tmp: &Path) -> Result<()> {
        self.check_writable()?;
        let new_file = OpenOptions::new().read(true).write(true).open(tmp)?;
        let new_file = lock_exclusive(new_file, tmp)?;
        std::fs::rename(tmp, &self.path)?;
        fsync_dir(self.path.parent().unwrap_or_else(|| Path::new(".")))?;
        self.file = new_file;
        self.body_start = 0;
        Ok(())
    }

    /// Flushes appended data to stable storage.
    pub fn sync(&self) -> Result<()> {
        fdatasync(&self.file)
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "database opened read-only",
            )));
        }
        Ok(())
    }
}

/// Lazy scan over meta lines; see [`FileStorage::iter_meta_offsets`].
pub struct MetaOffsets<'a> {
    reader: BufReader<&'a File>,
    offset: u64,
    buf: Vec<u8>,
}

impl Iterator for MetaOffsets<'_> {
    type Item = (u64, String);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line_start = self.offset;
            self.buf.clear();
            let n = self.reader.read_until(b'\n', &mut self.buf).ok()?;
            if n == 0 {
                return None;
            }
            // A final line without newline is a partial append; stop there.
            if self.buf.last() != Some(&b'\n') {
                return None;
            }
            self.offset += n as u64;

            let Ok(text) = std::str::from_utf8(&self.buf[..n - 1]) else {
                continue;
            };
            let Ok(value) = serde_json::from_str::<Value>(text) else {
                continue;
            };
            if value.get("_t").and_then(Value::as_str) != Some(TAG_META) {
                continue;
            }

            if value.get("op").and_then(Value::as_str) == Some("put") {
                if let Some(len) = value.get("len_data").and_then(Value::as_u64) {
                    // Skip the paired data line without reading it.
                    if self.reader.seek_relative((len + 1) as i64).is_err() {
                        return Some((line_start, text.to_string()));
                    }
                    self.offset += len + 1;
                }
                // Without len_data the data line is consumed by the next
                // round and skipped as a non-meta line.
            }
            return Some((line_start, text.to_string()));
        }
    }
}

/// Encodes the four header lines, each newline-terminated.
pub(crate) fn encode_header_lines(
    header: &Header,
    schema_fields: &Value,
    taxonomies: &Taxonomies,
) -> String {
    let header_value = serde_json::to_value(header).expect("serializing header");
    let mut out = String::new();
    out.push_str(&tagged_line(TAG_HEADER, header_value));
    out.push('\n');
    out.push_str(&tagged_line(
        TAG_SCHEMA,
        serde_json::json!({ "fields": schema_fields }),
    ));
    out.push('\n');
    out.push_str(&tagged_line(TAG_TAXONOMIES, taxonomies.to_value()));
    out.push('\n');
    out.push_str(&tagged_line(TAG_BEGIN, Value::Object(Map::new())));
    out.push('\n');
    out
}

/// Serializes a header line payload with its `_t` tag. `_t` sorts before
/// every other key, so it leads each line.
fn tagged_line(tag: &str, payload: Value) -> String {
    let mut obj = payload.as_object().cloned().unwrap_or_default();
    obj.insert("_t".to_string(), Value::String(tag.to_string()));
    serde_json::to_string(&Value::Object(obj)).expect("serializing header line")
}

fn parse_tagged(value: &Value, expected: &str) -> Result<Map<String, Value>> {
    let obj = value
        .as_object()
        .ok_or_else(|| Error::corrupt(format!("header line `{expected}` is not an object")))?;
    if obj.get("_t").and_then(Value::as_str) != Some(expected) {
        return Err(Error::corrupt(format!(
            "expected header line `{expected}`"
        )));
    }
    let mut obj = obj.clone();
    obj.remove("_t");
    Ok(obj)
}

/// Sibling temp-file path for rewrites, unique per call.
pub(crate) fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("db.jsonl");
    path.with_file_name(format!("{name}.{}.tmp", new_ulid()))
}

fn lock_exclusive(file: File, path: &Path) -> Result<Flock<File>> {
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(locked) => Ok(locked),
        Err((_, nix::errno::Errno::EWOULDBLOCK)) => Err(Error::LockHeld {
            path: path.to_path_buf(),
        }),
        Err((_, errno)) => Err(Error::Io(io::Error::from_raw_os_error(errno as i32))),
    }
}

/// fdatasync on Unix, falling back to sync_all elsewhere. fdatasync skips
/// unneeded metadata flushes while still covering the appended bytes.
#[inline]
fn fdatasync(file: &File) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: fdatasync is a standard POSIX call, safe with a valid fd.
        let ret = unsafe { libc::fdatasync(file.as_raw_fd()) };
        if ret != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        file.sync_all().map_err(Error::Io)
    }
}

/// Fsyncs a directory so a rename inside it survives a crash.
pub(crate) fn fsync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let dir = if dir.as_os_str().is_empty() {
            Path::new(".")
        } else {
            dir
        };
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}
