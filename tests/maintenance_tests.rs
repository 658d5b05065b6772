//! Summary: Compaction, backup, blob, schema-migration, and progress tests.
//! Copyright (c) YOAB. All rights reserved.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io::Read;
use std::rc::Rc;

use ejldb::{
    BackupKind, Database, Error, FindOptions, Maintenance, OpenMode, OpenOptions, ProgressEvent,
};
use serde_json::{Value, json};
use tempfile::TempDir;

fn make_schema() -> Value {
    json!({
        "id":        {"type": "str", "mandatory": true, "index": true},
        "name":      {"type": "str", "mandatory": true},
        "age":       {"type": "int", "default": 0, "index": true},
        "active":    {"type": "bool", "default": true},
        "createdAt": {"type": "datetime", "mandatory": true},
        "attachment": {"type": "blob"},
    })
}

fn open_db(dir: &TempDir) -> Database {
    Database::open(dir.path().join("users.jsonl"), make_schema()).expect("open")
}

fn open_quiet(dir: &TempDir) -> Database {
    // Compaction disabled (the ratio can never reach 1.0) and no daily
    // backups, for tests that control maintenance explicitly.
    Database::open_with(
        dir.path().join("users.jsonl"),
        make_schema(),
        OpenOptions {
            maintenance: Maintenance {
                compact_threshold: 1.0,
                daily_backup: false,
            },
            ..OpenOptions::default()
        },
    )
    .expect("open")
}

fn insert(db: &mut Database, name: &str, age: i64) -> String {
    let mut rec = db.new_record();
    rec.set("name", name);
    rec.set("age", age);
    db.save(&mut rec).expect("save");
    rec.id().expect("id").to_string()
}

fn file_size(db: &Database) -> u64 {
    std::fs::metadata(db.path()).expect("metadata").len()
}

// ==================== Compaction ====================

mod compaction_tests {
    use super::*;

    #[test]
    fn test_threshold_drives_auto_compaction() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut db = open_db(&dir);
        let ids: Vec<String> = (0..3).map(|i| insert(&mut db, &format!("U{i}"), i)).collect();

        // 3 puts + 1 del: ratio 1/4, below the 0.30 threshold.
        db.delete(&json!({"id": ids[0]})).expect("delete");
        assert!((db.garbage_ratio() - 0.25).abs() < 1e-9);
        assert_eq!(db.count(), 2);
        let size_before = file_size(&db);

        // 3 puts + 2 dels: ratio 2/5 crosses the threshold and compaction
        // runs inside delete().
        db.delete(&json!({"id": ids[1]})).expect("delete");
        assert_eq!(db.garbage_ratio(), 0.0);
        assert_eq!(db.count(), 1);
        assert!(file_size(&db) < size_before);

        let survivor = db.get(&ids[2]).expect("get").expect("present");
        assert_eq!(survivor.get("name"), Some(&json!("U2")));
    }

    #[test]
    fn test_manual_compaction_preserves_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut db = open_quiet(&dir);
        let ids: Vec<String> = (0..5).map(|i| insert(&mut db, &format!("U{i}"), i)).collect();
        db.update(&json!({"age": {"$lt": 3}}), &json!({"age": 99}))
            .expect("update");
        db.delete(&json!({"id": ids[4]})).expect("delete");

        let mut before = BTreeMap::new();
        for id in &ids[..4] {
            before.insert(id.clone(), db.get(id).expect("get").expect("present").doc().clone());
        }
        let size_before = file_size(&db);
        assert!(db.garbage_ratio() > 0.0);

        db.compact_now().expect("compact");

        assert!(file_size(&db) < size_before);
        assert_eq!(db.garbage_ratio(), 0.0);
        assert_eq!(db.count(), 4);
        for (id, doc) in &before {
            let after = db.get(id).expect("get").expect("present");
            assert_eq!(after.doc(), doc);
        }
        assert!(db.get(&ids[4]).expect("get").is_none());
    }

    #[test]
    fn test_compaction_drops_tombstones_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut db = open_quiet(&dir);
        insert(&mut db, "keep", 1);
        let gone = insert(&mut db, "gone", 2);
        db.delete(&json!({"id": gone})).expect("delete");
        db.compact_now().expect("compact");

        let path = db.path().to_path_buf();
        db.close().expect("close");
        let content = std::fs::read_to_string(&path).expect("read");
        // 4 header lines plus exactly one meta/data pair.
        assert_eq!(content.lines().count(), 6);
        assert!(!content.contains("\"del\""));
        assert!(!content.contains("gone"));
    }

    #[test]
    fn test_compacted_file_reopens_cleanly() {
        let dir = tempfile::tempdir().expect("tempdir");
        let id;
        {
            let mut db = open_quiet(&dir);
            id = insert(&mut db, "Alice", 30);
            db.update(&json!({"id": id}), &json!({"age": 31})).expect("update");
            db.compact_now().expect("compact");
            db.close().expect("close");
        }
        let db = open_quiet(&dir);
        let rec = db.get(&id).expect("get").expect("present");
        assert_eq!(rec.get("age"), Some(&json!(31)));
    }
}

// ==================== Backups ====================

mod backup_tests {
    use super::*;

    #[test]
    fn test_rolling_backup_copies_current_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut db = open_quiet(&dir);
        insert(&mut db, "Alice", 30);

        let first = db.backup_now(BackupKind::Rolling).expect("backup");
        assert!(first.exists());
        assert_eq!(
            std::fs::read(&first).expect("read backup"),
            std::fs::read(db.path()).expect("read db")
        );

        std::thread::sleep(std::time::Duration::from_millis(5));
        insert(&mut db, "Bob", 10);
        let second = db.backup_now(BackupKind::Rolling).expect("backup");
        assert_ne!(first, second);

        let rolling_dir = dir.path().join("embedded_jsonl_db_backup/rolling");
        assert_eq!(std::fs::read_dir(rolling_dir).expect("dir").count(), 2);
    }

    #[test]
    fn test_daily_backup_is_idempotent_per_day() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut db = open_quiet(&dir);
        insert(&mut db, "Alice", 30);

        let dest = db.backup_now(BackupKind::Daily).expect("backup");
        assert!(dest.exists());
        let mtime1 = std::fs::metadata(&dest).expect("metadata").modified().expect("mtime");

        std::thread::sleep(std::time::Duration::from_millis(10));
        insert(&mut db, "Bob", 10);
        let again = db.backup_now(BackupKind::Daily).expect("backup");
        assert_eq!(dest, again);
        let mtime2 = std::fs::metadata(&dest).expect("metadata").modified().expect("mtime");
        assert_eq!(mtime1, mtime2);

        let daily_dir = dir.path().join("embedded_jsonl_db_backup/daily");
        assert_eq!(std::fs::read_dir(daily_dir).expect("dir").count(), 1);
    }

    #[test]
    fn test_compaction_takes_backups_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut db = open_db(&dir);
        insert(&mut db, "Alice", 30);
        db.compact_now().expect("compact");

        assert!(dir.path().join("embedded_jsonl_db_backup/rolling").is_dir());
        assert!(dir.path().join("embedded_jsonl_db_backup/daily").is_dir());
    }
}

// ==================== Blobs ====================

mod blob_tests {
    use super::*;

    const HELLO_SHA: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_blob_roundtrip_and_gc() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);

        let blob_ref = db
            .put_blob(b"hello world", "text/plain", Some("hello.txt"))
            .expect("put");
        assert_eq!(blob_ref.blob, format!("sha256:{HELLO_SHA}"));

        let mut data = Vec::new();
        db.open_blob(&blob_ref)
            .expect("open")
            .read_to_end(&mut data)
            .expect("read");
        assert_eq!(data, b"hello world");

        // No live references: gc removes the file.
        let stats = db.gc_blobs().expect("gc");
        assert!(stats.files_removed >= 1);
        assert!(matches!(db.open_blob(&blob_ref), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_gc_keeps_referenced_blobs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut db = open_db(&dir);

        let kept = db.put_blob(b"kept", "text/plain", None).expect("put");
        db.put_blob(b"orphan", "text/plain", None).expect("put");

        let mut rec = db.new_record();
        rec.set("name", "Holder");
        rec.set("attachment", kept.to_value());
        db.save(&mut rec).expect("save");

        let stats = db.gc_blobs().expect("gc");
        assert_eq!(stats.files_removed, 1);
        assert!(db.open_blob(&kept).is_ok());
    }

    #[test]
    fn test_blob_field_type_validated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut db = open_db(&dir);
        let mut rec = db.new_record();
        rec.set("name", "Bad");
        rec.set("attachment", "not a blob ref");
        assert!(matches!(db.save(&mut rec), Err(Error::Validation(_))));
    }

    #[test]
    fn test_blob_stream_dedup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);
        let payload = vec![7u8; 200_000];
        let mut cursor = std::io::Cursor::new(payload.clone());
        let first = db
            .put_blob_stream(&mut cursor, "application/octet-stream", None)
            .expect("put");
        assert_eq!(first.size, 200_000);
        let second = db
            .put_blob(&payload, "application/octet-stream", None)
            .expect("put");
        assert_eq!(first.blob, second.blob);
    }
}

// ==================== Schema migration ====================

mod migration_tests {
    use super::*;

    fn schema_v1() -> Value {
        json!({
            "id":        {"type": "str", "mandatory": true, "index": true},
            "name":      {"type": "str", "mandatory": true, "index": true},
            "createdAt": {"type": "datetime"},
        })
    }

    fn schema_v2() -> Value {
        json!({
            "id":        {"type": "str", "mandatory": true, "index": true},
            "name":      {"type": "str", "mandatory": true, "index": true},
            "age":       {"type": "int", "default": 0, "index": true},
            "flags":     {"type": "object", "fields": {
                "active": {"type": "bool", "default": true}
            }},
            "createdAt": {"type": "datetime"},
        })
    }

    #[test]
    fn test_reopen_with_new_schema_materializes_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("migrate.jsonl");
        let id;
        {
            let mut db = Database::open(&path, schema_v1()).expect("open v1");
            let mut rec = db.new_record();
            rec.set("name", "Alice");
            // Unknown to both schema versions; must survive the migration.
            rec.set("legacy", json!({"source": "import"}));
            db.save(&mut rec).expect("save");
            id = rec.id().expect("id").to_string();
            db.close().expect("close");
        }

        let mut db = Database::open(&path, schema_v2()).expect("open v2");
        let rec = db.get(&id).expect("get").expect("present");
        assert_eq!(rec.get("name"), Some(&json!("Alice")));
        assert_eq!(rec.get("age"), Some(&json!(0)));
        assert_eq!(rec.get("flags"), Some(&json!({"active": true})));
        assert_eq!(rec.get("legacy"), Some(&json!({"source": "import"})));

        // New fields are queryable through the migrated index.
        let found = db.find(&json!({"age": 0}), &FindOptions::new()).expect("find");
        assert_eq!(found.len(), 1);

        // And the migrated schema accepts updates against new fields.
        let n = db
            .update(&json!({"id": id}), &json!({"age": 42, "flags": {"active": false}}))
            .expect("update");
        assert_eq!(n, 1);
        let rec = db.get(&id).expect("get").expect("present");
        assert_eq!(rec.get("age"), Some(&json!(42)));
        assert_eq!(rec.get("flags"), Some(&json!({"active": false})));
    }

    #[test]
    fn test_migration_takes_rolling_backup_and_is_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("migrate.jsonl");
        {
            let mut db = Database::open(&path, schema_v1()).expect("open v1");
            insert_named(&mut db, "Alice");
            db.close().expect("close");
        }
        let rolling = dir.path().join("embedded_jsonl_db_backup/rolling");

        {
            let db = Database::open(&path, schema_v2()).expect("open v2");
            db.close().expect("close");
        }
        let after_migration = std::fs::read_dir(&rolling).expect("dir").count();
        assert_eq!(after_migration, 1);

        // Same schema again: no migration, no new backup.
        {
            let db = Database::open(&path, schema_v2()).expect("reopen v2");
            db.close().expect("close");
        }
        assert_eq!(std::fs::read_dir(&rolling).expect("dir").count(), after_migration);
    }

    fn insert_named(db: &mut Database, name: &str) {
        let mut rec = db.new_record();
        rec.set("name", name);
        db.save(&mut rec).expect("save");
    }
}

// ==================== Progress and modes ====================

mod lifecycle_tests {
    use super::*;

    fn collecting_options(events: &Rc<RefCell<Vec<String>>>) -> OpenOptions {
        let sink = Rc::clone(events);
        OpenOptions {
            on_progress: Some(Box::new(move |evt: &ProgressEvent| {
                sink.borrow_mut().push(evt.phase.to_string());
            })),
            ..OpenOptions::default()
        }
    }

    #[test]
    fn test_progress_events_cover_all_phases() {
        let dir = tempfile::tempdir().expect("tempdir");
        let events: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let mut db = Database::open_with(
            dir.path().join("events.jsonl"),
            make_schema(),
            collecting_options(&events),
        )
        .expect("open");

        for phase in ["open.start", "open.scan_meta", "open.build_indexes", "open.done"] {
            assert!(events.borrow().iter().any(|p| p == phase), "missing {phase}");
        }

        let ids: Vec<String> = (0..3).map(|i| insert(&mut db, &format!("U{i}"), i)).collect();

        events.borrow_mut().clear();
        let n = db.update(&json!({}), &json!({"age": 1})).expect("update");
        assert_eq!(n, 3);
        assert!(events.borrow().iter().any(|p| p == "update.start"));
        assert!(events.borrow().iter().any(|p| p == "update.done"));

        events.borrow_mut().clear();
        let n = db.delete(&json!({"id": ids[0]})).expect("delete");
        assert_eq!(n, 1);
        assert!(events.borrow().iter().any(|p| p == "delete.start"));
        assert!(events.borrow().iter().any(|p| p == "delete.done"));

        events.borrow_mut().clear();
        db.backup_now(BackupKind::Rolling).expect("backup");
        assert!(events.borrow().iter().any(|p| p == "backup.rolling"));

        events.borrow_mut().clear();
        db.backup_now(BackupKind::Daily).expect("backup");
        assert!(events.borrow().iter().any(|p| p == "backup.daily"));

        events.borrow_mut().clear();
        db.compact_now().expect("compact");
        for phase in ["compact.start", "compact.copy", "compact.done"] {
            assert!(events.borrow().iter().any(|p| p == phase), "missing {phase}");
        }
    }

    #[test]
    fn test_progress_pct_is_monotonic_per_phase() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let mut db = open_quiet(&dir);
            for i in 0..50 {
                insert(&mut db, &format!("U{i}"), i);
            }
            db.close().expect("close");
        }

        let seen: Rc<RefCell<Vec<(String, u8)>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let db = Database::open_with(
            dir.path().join("users.jsonl"),
            make_schema(),
            OpenOptions {
                on_progress: Some(Box::new(move |evt: &ProgressEvent| {
                    sink.borrow_mut().push((evt.phase.to_string(), evt.pct));
                })),
                ..OpenOptions::default()
            },
        )
        .expect("reopen");
        db.close().expect("close");

        let mut last: BTreeMap<String, u8> = BTreeMap::new();
        for (phase, pct) in seen.borrow().iter() {
            if let Some(prev) = last.get(phase) {
                assert!(pct >= prev, "pct regressed in {phase}: {prev} -> {pct}");
            }
            last.insert(phase.clone(), *pct);
        }
        assert_eq!(last.get("open.done"), Some(&100));
    }

    #[test]
    fn test_read_only_mode_refuses_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let id;
        {
            let mut db = open_db(&dir);
            id = insert(&mut db, "Alice", 30);
            db.close().expect("close");
        }

        let mut db = Database::open_with(
            dir.path().join("users.jsonl"),
            make_schema(),
            OpenOptions {
                mode: OpenMode::ReadOnly,
                ..OpenOptions::default()
            },
        )
        .expect("open read-only");

        let rec = db.get(&id).expect("get").expect("present");
        assert_eq!(rec.get("name"), Some(&json!("Alice")));

        let mut fresh = db.new_record();
        fresh.set("name", "Nope");
        assert!(matches!(db.save(&mut fresh), Err(Error::Io(_))));
        assert!(matches!(db.delete(&json!({"id": id})), Err(Error::Io(_))));
    }

    #[test]
    fn test_read_only_requires_existing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = Database::open_with(
            dir.path().join("missing.jsonl"),
            make_schema(),
            OpenOptions {
                mode: OpenMode::ReadOnly,
                ..OpenOptions::default()
            },
        );
        assert!(result.is_err());
    }
}
