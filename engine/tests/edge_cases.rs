//! Edge case tests for tether-engine
//!
//! These tests cover boundary conditions and unusual inputs.

use serde_json::json;
use tether_engine::{
    ColumnDef, ColumnType, Error, FieldMap, ForeignKey, LogicalClock, OnDeleteAction,
    SchemaDescriptor, Scope, SyncEngine, TableSchema, MAX_RECORD_NAME_BYTES,
};

fn notes_schema() -> SchemaDescriptor {
    SchemaDescriptor::new(1).with_table(TableSchema::new(
        "notes",
        vec![
            ColumnDef::primary_key("id", ColumnType::Text),
            ColumnDef::required("body", ColumnType::Text),
            ColumnDef::nullable("count", ColumnType::Integer),
            ColumnDef::nullable("data", ColumnType::Json),
        ],
    ))
}

fn engine() -> SyncEngine {
    let mut engine = SyncEngine::new(notes_schema(), "device-1");
    engine.account_changed(Some("alice"));
    engine.start();
    engine
}

fn row(pairs: &[(&str, serde_json::Value)]) -> FieldMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

// ============================================================================
// String Edge Cases
// ============================================================================

#[test]
fn empty_string_fields() {
    let mut engine = engine();
    engine
        .insert("notes", row(&[("id", json!("n1")), ("body", json!(""))]))
        .unwrap();
    assert_eq!(engine.row("notes", "n1").unwrap()["body"], json!(""));
}

#[test]
fn unicode_values_round_trip_through_capture() {
    let mut engine = engine();
    let bodies = [
        "日本語テスト",
        "Привет мир",
        "مرحبا بالعالم",
        "🎉🚀💯",
        "Hello\nWorld\tTab",
    ];

    for (i, body) in bodies.iter().enumerate() {
        let id = format!("n{i}");
        engine
            .insert("notes", row(&[("id", json!(id)), ("body", json!(body))]))
            .unwrap();
        assert_eq!(engine.row("notes", &id).unwrap()["body"], json!(body));
    }

    let batch = engine.next_batch(Scope::Private).unwrap();
    assert_eq!(batch.saves.len(), bodies.len());
}

#[test]
fn unicode_primary_keys() {
    let mut engine = engine();
    engine
        .insert(
            "notes",
            row(&[("id", json!("键-🔑")), ("body", json!("unicode key"))]),
        )
        .unwrap();

    let md = engine.metadata_for("notes", "键-🔑").unwrap();
    assert_eq!(md.record_name, "键-🔑:notes");
}

#[test]
fn primary_key_containing_separator() {
    let mut engine = engine();
    engine
        .insert(
            "notes",
            row(&[("id", json!("a:b:c")), ("body", json!("colons"))]),
        )
        .unwrap();

    let md = engine.metadata_for("notes", "a:b:c").unwrap();
    assert_eq!(md.record_name, "a:b:c:notes");
    let (pk, table) = tether_engine::split_record_name(&md.record_name).unwrap();
    assert_eq!(pk, "a:b:c");
    assert_eq!(table, "notes");
}

#[test]
fn record_name_at_byte_limit() {
    let mut engine = engine();
    // "{pk}:notes" lands exactly on the limit.
    let pk = "x".repeat(MAX_RECORD_NAME_BYTES - ":notes".len());
    engine
        .insert("notes", row(&[("id", json!(pk)), ("body", json!("ok"))]))
        .unwrap();
}

#[test]
fn over_long_record_name_rejected() {
    let mut engine = engine();
    let pk = "x".repeat(MAX_RECORD_NAME_BYTES);
    let err = engine
        .insert("notes", row(&[("id", json!(pk)), ("body", json!("no"))]))
        .unwrap_err();
    assert!(matches!(err, Error::RecordNameTooLong { .. }));
}

// ============================================================================
// Numeric Edge Cases
// ============================================================================

#[test]
fn integer_boundaries() {
    let mut engine = engine();
    for (i, value) in [i64::MIN, i64::MAX, 0, -1, 1].iter().enumerate() {
        let id = format!("n{i}");
        engine
            .insert(
                "notes",
                row(&[
                    ("id", json!(id)),
                    ("body", json!("numbers")),
                    ("count", json!(value)),
                ]),
            )
            .unwrap();
        assert_eq!(engine.row("notes", &id).unwrap()["count"], json!(value));
    }
}

#[test]
fn integer_primary_keys_stringify_canonically() {
    let schema = SchemaDescriptor::new(1).with_table(TableSchema::new(
        "counters",
        vec![
            ColumnDef::primary_key("id", ColumnType::Integer),
            ColumnDef::required("value", ColumnType::Integer),
        ],
    ));
    let mut engine = SyncEngine::new(schema, "device-1");
    engine
        .insert(
            "counters",
            row(&[("id", json!(i64::MAX)), ("value", json!(0))]),
        )
        .unwrap();

    let md = engine.metadata_for("counters", &i64::MAX.to_string()).unwrap();
    assert_eq!(md.record_name, format!("{}:counters", i64::MAX));
}

#[test]
fn clock_counter_high_values() {
    let mut clock = LogicalClock::with_counter("node", u64::MAX - 1);
    clock.tick();
    assert_eq!(clock.counter, u64::MAX);
}

// ============================================================================
// JSON Edge Cases
// ============================================================================

#[test]
fn deeply_nested_json_payload() {
    let mut engine = engine();
    let mut nested = json!("leaf");
    for _ in 0..50 {
        nested = json!({ "inner": nested });
    }
    engine
        .insert(
            "notes",
            row(&[
                ("id", json!("deep")),
                ("body", json!("nested")),
                ("data", nested.clone()),
            ]),
        )
        .unwrap();
    assert_eq!(engine.row("notes", "deep").unwrap()["data"], nested);
}

#[test]
fn null_optional_column_accepted() {
    let mut engine = engine();
    engine
        .insert(
            "notes",
            row(&[
                ("id", json!("n1")),
                ("body", json!("text")),
                ("count", json!(null)),
            ]),
        )
        .unwrap();
    assert!(engine.row("notes", "n1").unwrap()["count"].is_null());
}

#[test]
fn null_required_column_rejected() {
    let mut engine = engine();
    let err = engine
        .insert(
            "notes",
            row(&[("id", json!("n1")), ("body", json!(null))]),
        )
        .unwrap_err();
    assert!(matches!(err, Error::MissingRequiredColumn(c) if c == "body"));
}

// ============================================================================
// Volume
// ============================================================================

#[test]
fn large_batch_keeps_every_save() {
    let mut engine = engine();
    for i in 0..500 {
        engine
            .insert(
                "notes",
                row(&[
                    ("id", json!(format!("n{i}"))),
                    ("body", json!(format!("body {i}"))),
                ]),
            )
            .unwrap();
    }

    let batch = engine.next_batch(Scope::Private).unwrap();
    assert_eq!(batch.saves.len(), 500);
}

#[test]
fn deep_parent_chain_sends_in_order() {
    let mut schema = SchemaDescriptor::new(1);
    schema.add_table(TableSchema::new(
        "t0",
        vec![
            ColumnDef::primary_key("id", ColumnType::Text),
            ColumnDef::required("label", ColumnType::Text),
        ],
    ));
    for depth in 1..6 {
        schema.add_table(
            TableSchema::new(
                format!("t{depth}"),
                vec![
                    ColumnDef::primary_key("id", ColumnType::Text),
                    ColumnDef::required("label", ColumnType::Text),
                    ColumnDef::nullable("parentID", ColumnType::Text),
                ],
            )
            .with_foreign_key(ForeignKey::new(
                "parentID",
                format!("t{}", depth - 1),
                OnDeleteAction::Cascade,
            )),
        );
    }

    let mut engine = SyncEngine::new(schema, "device-1");
    engine.account_changed(Some("alice"));
    engine.start();

    // Insert leaf-ward; the drain must still order rootward.
    engine
        .insert(
            "t0",
            row(&[("id", json!("r0")), ("label", json!("root"))]),
        )
        .unwrap();
    for depth in 1..6 {
        engine
            .insert(
                &format!("t{depth}"),
                row(&[
                    ("id", json!(format!("r{depth}"))),
                    ("label", json!(format!("level {depth}"))),
                    ("parentID", json!(format!("r{}", depth - 1))),
                ]),
            )
            .unwrap();
    }

    let batch = engine.next_batch(Scope::Private).unwrap();
    let names: Vec<&str> = batch
        .saves
        .iter()
        .map(|r| r.id.record_name.as_str())
        .collect();
    assert_eq!(
        names,
        vec!["r0:t0", "r1:t1", "r2:t2", "r3:t3", "r4:t4", "r5:t5"]
    );
}

// ============================================================================
// Update Edge Cases
// ============================================================================

#[test]
fn no_op_update_still_queues_a_save() {
    let mut engine = engine();
    engine
        .insert("notes", row(&[("id", json!("n1")), ("body", json!("same"))]))
        .unwrap();
    // Drain the insert's save out of the way via ack-less inspection.
    let first = engine.next_batch(Scope::Private).unwrap();
    assert_eq!(first.saves.len(), 1);
    engine.handle_send_failure(Scope::Private);

    engine
        .update("notes", "n1", row(&[("body", json!("same"))]))
        .unwrap();
    let batch = engine.next_batch(Scope::Private).unwrap();
    // Coalesced: still exactly one save for the record.
    assert_eq!(batch.saves.len(), 1);
}

#[test]
fn primary_key_change_is_delete_plus_insert() {
    let mut engine = engine();
    engine
        .insert("notes", row(&[("id", json!("old")), ("body", json!("text"))]))
        .unwrap();

    engine
        .update("notes", "old", row(&[("id", json!("new"))]))
        .unwrap();

    assert!(engine.row("notes", "old").is_none());
    assert!(engine.row("notes", "new").is_some());
    assert!(!engine.has_metadata("notes", "old") || {
        // Old metadata may linger only as a tombstone.
        engine.metadata_for("notes", "old").unwrap().is_deleted
    });
    let md = engine.metadata_for("notes", "new").unwrap();
    assert_eq!(md.record_name, "new:notes");
}

#[test]
fn update_of_missing_row_errors() {
    let mut engine = engine();
    let err = engine
        .update("notes", "ghost", row(&[("body", json!("boo"))]))
        .unwrap_err();
    assert!(matches!(err, Error::RowNotFound { .. }));
}

#[test]
fn delete_of_missing_row_errors() {
    let mut engine = engine();
    let err = engine.delete("notes", "ghost").unwrap_err();
    assert!(matches!(err, Error::RowNotFound { .. }));
}

#[test]
fn unknown_table_errors() {
    let mut engine = engine();
    let err = engine
        .insert("nope", row(&[("id", json!("n1"))]))
        .unwrap_err();
    assert!(matches!(err, Error::TableNotSynchronized(t) if t == "nope"));
}
