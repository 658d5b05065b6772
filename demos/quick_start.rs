//! Summary: Quick-start walkthrough: open, save, query, update, delete.
//! Copyright (c) YOAB. All rights reserved.
//!
//! Run with `cargo run --example quick_start`.

use ejldb::{Database, FindOptions};
use serde_json::{Value, json};

fn main() -> ejldb::Result<()> {
    env_logger::init();

    // A user with a name, an age, and nested flags.
    let schema = json!({
        "id":   {"type": "str", "mandatory": false, "index": true},
        "name": {"type": "str", "mandatory": true, "index": true},
        "age":  {"type": "int", "mandatory": false, "default": 0, "index": true},
        "flags": {"type": "object", "fields": {
            "active": {"type": "bool", "mandatory": false, "default": true, "index": true},
        }},
        "createdAt": {"type": "datetime", "mandatory": false, "index": true},
    });

    // Create/open the database file (single writer).
    let mut db = Database::open("demo.jsonl", schema)?;

    // Create a new record with defaults applied.
    let mut rec = db.new_record();
    rec.set("name", "Alice");
    rec.set("age", 33);
    db.save(&mut rec)?;

    // Fetch it back by id.
    let id = rec.id().expect("assigned at save").to_string();
    if let Some(loaded) = db.get(&id)? {
        println!("Loaded: {}", loaded.doc());
    }

    // Query by simple predicate.
    let adults = db.find(
        &json!({"flags": {"active": true}, "age": {"$gte": 18}}),
        &FindOptions::new(),
    )?;
    for r in &adults {
        println!(
            "Adult active: {} {}",
            r.get("name").and_then(Value::as_str).unwrap_or("?"),
            r.get("age").and_then(Value::as_i64).unwrap_or(0)
        );
    }

    // Update a set of records.
    let modified = db.update(&json!({"name": "Alice"}), &json!({"age": 34}))?;
    println!("Updated records: {modified}");

    // Logical delete.
    let deleted = db.delete(&json!({"name": "Alice"}))?;
    println!("Deleted (logical): {deleted}");

    db.close()
}
