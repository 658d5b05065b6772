//! Summary: Progress event reporting for long-running operations.
//! Copyright (c) YOAB. All rights reserved.
//!
//! Long operations (open scan, index build, compaction, migrations, backups)
//! are synchronous and emit progress events between chunks. `pct` is
//! monotonic within a phase and 100 marks completion.

/// Phase names carried by progress events.
pub mod phase {
    pub const OPEN_START: &str = "open.start";
    pub const OPEN_SCAN_META: &str = "open.scan_meta";
    pub const OPEN_BUILD_INDEXES: &str = "open.build_indexes";
    pub const OPEN_DONE: &str = "open.done";
    pub const UPDATE_START: &str = "update.start";
    pub const UPDATE_DONE: &str = "update.done";
    pub const DELETE_START: &str = "delete.start";
    pub const DELETE_DONE: &str = "delete.done";
    pub const COMPACT_START: &str = "compact.start";
    pub const COMPACT_COPY: &str = "compact.copy";
    pub const COMPACT_DONE: &str = "compact.done";
    pub const BACKUP_ROLLING: &str = "backup.rolling";
    pub const BACKUP_DAILY: &str = "backup.daily";
    pub const SCHEMA_MIGRATE_START: &str = "migrate.schema.start";
    pub const SCHEMA_MIGRATE_COPY: &str = "migrate.schema.copy";
    pub const SCHEMA_MIGRATE_DONE: &str = "migrate.schema.done";
    pub const TAXONOMY_MIGRATE_START: &str = "taxonomy.migrate.start";
    pub const TAXONOMY_MIGRATE_COPY: &str = "taxonomy.migrate.copy";
    pub const TAXONOMY_MIGRATE_DONE: &str = "taxonomy.migrate.done";
}

/// A single progress event delivered to the `on_progress` callback.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    /// Phase name, e.g. `open.scan_meta` or `compact.copy`.
    pub phase: &'static str,
    /// Completion percentage within the phase, 0–100.
    pub pct: u8,
    /// Optional human-readable detail.
    pub msg: Option<String>,
    /// Items processed so far, when the phase is counted.
    pub count: Option<u64>,
    /// Total items for the phase, when known up front.
    pub total: Option<u64>,
}

/// Callback type for progress reporting.
pub type ProgressFn = Box<dyn FnMut(&ProgressEvent)>;

/// Wraps the optional user callback behind a no-allocation fast path.
pub(crate) struct Progress {
    callback: Option<ProgressFn>,
}

impl Progress {
    pub(crate) fn new(callback: Option<ProgressFn>) -> Self {
        Self { callback }
    }

    pub(crate) fn emit(&mut self, phase: &'static str, pct: u8) {
        self.send(ProgressEvent {
            phase,
            pct,
            msg: None,
            count: None,
            total: None,
        });
    }

    pub(crate) fn emit_msg(&mut self, phase: &'static str, pct: u8, msg: impl Into<String>) {
        self.send(ProgressEvent {
            phase,
            pct,
            msg: Some(msg.into()),
            count: None,
            total: None,
        });
    }

    pub(crate) fn emit_count(&mut self, phase: &'static str, pct: u8, count: u64, total: u64) {
        self.send(ProgressEvent {
            phase,
            pct,
            msg: None,
            count: Some(count),
            total: Some(total),
        });
    }

    fn send(&mut self, event: ProgressEvent) {
        if let Some(cb) = self.callback.as_mut() {
            cb(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_events_reach_callback() {
        let seen: Rc<RefCell<Vec<(&'static str, u8)>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let mut progress = Progress::new(Some(Box::new(move |evt| {
            sink.borrow_mut().push((evt.phase, evt.pct));
        })));

        progress.emit(phase::OPEN_START, 0);
        progress.emit_count(phase::OPEN_SCAN_META, 50, 5, 10);
        progress.emit_msg(phase::OPEN_DONE, 100, "ready");

        let seen = seen.borrow();
        assert_eq!(
            *seen,
            vec![
                (phase::OPEN_START, 0),
                (phase::OPEN_SCAN_META, 50),
                (phase::OPEN_DONE, 100),
            ]
        );
    }

    #[test]
    fn test_no_callback_is_silent() {
        let mut progress = Progress::new(None);
        progress.emit(phase::COMPACT_START, 0);
        progress.emit(phase::COMPACT_DONE, 100);
    }
}
