//! Summary: Error types for the ejldb database engine.
//! Copyright (c) YOAB. All rights reserved.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for ejldb operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for ejldb database operations.
///
/// Parse errors encountered while scanning an existing file are tolerated
/// (unreadable lines are skipped to maximize recovery); at write time every
/// failure is surfaced through one of these variants.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Document violates the schema (type, missing mandatory field, or
    /// strict taxonomy reference to an unknown key).
    #[error("validation failed: {0}")]
    Validation(String),
    /// Saving would create a second live record with an existing id.
    #[error("duplicate id: {id}")]
    DuplicateId {
        /// The id that already exists as a live record.
        id: String,
    },
    /// Optimistic check failed: the record was modified or deleted by
    /// another path between load and save.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Blob or record absent when required.
    #[error("not found: {0}")]
    NotFound(String),
    /// The exclusive file lock is held by another handle.
    #[error("exclusive lock held on '{path}'")]
    LockHeld {
        /// Path of the locked database file.
        path: PathBuf,
    },
    /// Header missing or partial, meta/data framing violated, or a
    /// checksum/length mismatch on a strict read.
    #[error("database corrupted: {0}")]
    IoCorruption(String),
    /// I/O error from filesystem operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Shorthand for a corruption error with a formatted message.
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Error::IoCorruption(msg.into())
    }
}
