//! Summary: Taxonomy walkthrough: upsert, rename, merge, delete (detach).
//! Copyright (c) YOAB. All rights reserved.
//!
//! Run with `cargo run --example taxonomy_quickstart`.

use ejldb::{Collision, Database, DeleteStrategy, FindOptions};
use serde_json::{Value, json};

fn main() -> ejldb::Result<()> {
    env_logger::init();

    // Two taxonomy fields: a strict single reference and a loose tag list.
    let schema = json!({
        "id":   {"type": "str", "mandatory": false, "index": true},
        "name": {"type": "str", "mandatory": true, "index": true},
        "category": {"type": "str", "mandatory": false, "taxonomy": "categories",
                     "taxonomy_mode": "single", "strict": true, "index": true},
        "tags": {"type": "list", "items": {"type": "str"}, "mandatory": false,
                 "index_membership": true, "taxonomy": "tags", "strict": false},
        "createdAt": {"type": "datetime", "mandatory": false},
    });

    let mut db = Database::open("taxonomy.jsonl", schema)?;

    // Define taxonomy entries.
    let mut cats = db.taxonomy("categories");
    cats.upsert("news", json!({"title": "News"}))?;
    cats.upsert("tech", json!({"title": "Technology"}))?;
    cats.upsert("life", json!({"title": "Lifestyle"}))?;

    let mut tags = db.taxonomy("tags");
    tags.upsert("red", json!({"title": "Red"}))?;
    tags.upsert("blue", json!({"title": "Blue"}))?;
    tags.upsert("navy", json!({"title": "Navy"}))?;
    tags.upsert("old", json!({"title": "Deprecated"}))?;

    // Insert sample records.
    for (name, category, tags) in [
        ("Post A", "news", json!(["red", "blue"])),
        ("Post B", "tech", json!(["navy"])),
        ("Post C", "life", json!(["old"])),
    ] {
        let mut rec = db.new_record();
        rec.set("name", name);
        rec.set("category", category);
        rec.set("tags", tags);
        db.save(&mut rec)?;
    }

    println!("Initial stats (by category): {:?}", db.taxonomy("categories").stats());
    println!("Initial stats (by tags): {:?}", db.taxonomy("tags").stats());

    // Rename a tag key across all records (full-file rewrite).
    db.taxonomy("tags").rename("red", "scarlet", Collision::Merge)?;
    println!("After rename('red'->'scarlet'): {:?}", db.taxonomy("tags").stats());

    // Merge two tags into one.
    db.taxonomy("tags").merge(&["blue", "navy"], "blue")?;
    println!("After merge(['blue','navy']->'blue'): {:?}", db.taxonomy("tags").stats());

    // Delete a tag and detach it from records.
    db.taxonomy("tags").delete("old", DeleteStrategy::Detach)?;
    println!("After delete('old', detach): {:?}", db.taxonomy("tags").stats());

    // Query by taxonomy: list membership and single-reference equality.
    let scarlet = db.find(&json!({"tags": {"$contains": "scarlet"}}), &FindOptions::new())?;
    println!(
        "Records with tag 'scarlet': {:?}",
        scarlet
            .iter()
            .map(|r| r.get("name").and_then(Value::as_str).unwrap_or("?").to_string())
            .collect::<Vec<_>>()
    );
    let tech = db.find(&json!({"category": {"$eq": "tech"}}), &FindOptions::new())?;
    println!(
        "Records in category 'tech': {:?}",
        tech.iter()
            .map(|r| r.get("name").and_then(Value::as_str).unwrap_or("?").to_string())
            .collect::<Vec<_>>()
    );

    db.close()?;
    println!("Done.");
    Ok(())
}
