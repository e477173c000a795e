//! Performance benchmarks for tether-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use tether_engine::{
    ColumnDef, ColumnType, FieldMap, LogicalClock, RecordIdentity, RemoteBatch, RemoteRecord,
    SchemaDescriptor, Scope, SyncEngine, TableSchema, ZoneId,
};

fn bench_schema() -> SchemaDescriptor {
    SchemaDescriptor::new(1).with_table(TableSchema::new(
        "notes",
        vec![
            ColumnDef::primary_key("id", ColumnType::Text),
            ColumnDef::required("body", ColumnType::Text),
            ColumnDef::nullable("count", ColumnType::Integer),
        ],
    ))
}

fn bench_engine() -> SyncEngine {
    let mut engine = SyncEngine::new(bench_schema(), "bench-device");
    engine.account_changed(Some("alice"));
    engine.start();
    engine
}

fn note_row(id: u64) -> FieldMap {
    let mut row = FieldMap::new();
    row.insert("id".into(), json!(format!("n{id}")));
    row.insert("body".into(), json!("benchmark body"));
    row.insert("count".into(), json!(id));
    row
}

fn bench_capture(c: &mut Criterion) {
    let mut group = c.benchmark_group("capture");

    group.bench_function("insert", |b| {
        let mut engine = bench_engine();
        let mut id = 0u64;
        b.iter(|| {
            id += 1;
            engine.insert("notes", black_box(note_row(id))).unwrap()
        })
    });

    group.bench_function("update", |b| {
        let mut engine = bench_engine();
        engine.insert("notes", note_row(1)).unwrap();
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let mut values = FieldMap::new();
            values.insert("count".into(), json!(counter));
            engine.update("notes", "n1", black_box(values)).unwrap()
        })
    });

    group.finish();
}

fn bench_outbound(c: &mut Criterion) {
    let mut group = c.benchmark_group("outbound");

    for size in [10usize, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("next_batch", size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let mut engine = bench_engine();
                    for id in 0..size as u64 {
                        engine.insert("notes", note_row(id)).unwrap();
                    }
                    engine
                },
                |mut engine| engine.next_batch(black_box(Scope::Private)),
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn bench_inbound(c: &mut Criterion) {
    let mut group = c.benchmark_group("inbound");

    for size in [10usize, 100, 1000] {
        let zone = ZoneId::new("tether.records", "alice");
        let batch = RemoteBatch {
            modifications: (0..size as u64)
                .map(|id| {
                    let mut record = RemoteRecord::new(
                        RecordIdentity::new(format!("n{id}:notes"), zone.clone()),
                        "notes",
                        note_row(id),
                        LogicalClock::with_counter("other-device", id + 1),
                    );
                    record.change_tag = Some(format!("tag-{id}"));
                    record
                })
                .collect(),
            ..Default::default()
        };

        group.bench_with_input(
            BenchmarkId::new("apply_remote_batch", size),
            &batch,
            |b, batch| {
                b.iter_batched(
                    bench_engine,
                    |mut engine| {
                        engine
                            .apply_remote_batch(Scope::Private, black_box(batch))
                            .unwrap()
                    },
                    criterion::BatchSize::SmallInput,
                )
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_capture, bench_outbound, bench_inbound);
criterion_main!(benches);
