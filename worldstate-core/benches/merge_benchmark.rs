use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::{json, Value};
use worldstate_core::{decode_tick, encode_tick, EntityId, Patch, Store, TickMessage};

fn merge(v: Value) -> Patch {
    match v {
        Value::Object(m) => Patch::Merge(m),
        _ => unreachable!(),
    }
}

/// Store with `n` vessels, each carrying a small nested document.
fn populated(n: usize) -> (Store, Vec<EntityId>) {
    let mut store = Store::new();
    let ids: Vec<EntityId> = (0..n).map(|_| EntityId::new_v4()).collect();
    for id in &ids {
        let patch = merge(json!({
            "type": "vessel",
            "position": { "x": 0.0, "y": 0.0, "z": 0.0 },
            "health": 100,
            "modules": ["engine", "cargo"],
        }));
        store.apply(id, &patch).unwrap();
    }
    (store, ids)
}

fn bench_apply_nested_patch(c: &mut Criterion) {
    let (mut store, ids) = populated(1_000);
    let patch = merge(json!({ "position": { "x": 12.5, "y": -3.0 }, "health": 90 }));

    c.bench_function("apply_nested_patch", |b| {
        let mut i = 0;
        b.iter(|| {
            let id = &ids[i % ids.len()];
            i += 1;
            black_box(store.apply(black_box(id), black_box(&patch)).unwrap());
        })
    });
}

fn bench_decode_tick_100_changes(c: &mut Criterion) {
    let (_, ids) = populated(100);
    let mut tick = TickMessage::new(1);
    for id in &ids {
        tick = tick.with_change(*id, merge(json!({ "position": { "x": 1.0 } })));
    }
    let encoded = encode_tick(&tick).unwrap();

    c.bench_function("decode_tick_100_changes", |b| {
        b.iter(|| {
            black_box(decode_tick(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_load_snapshot_1k(c: &mut Criterion) {
    let (store, _) = populated(1_000);
    let blob = worldstate_core::encode_snapshot(store.iter()).unwrap();

    c.bench_function("load_snapshot_1k", |b| {
        b.iter(|| {
            let mut fresh = Store::new();
            black_box(fresh.load_snapshot(black_box(&blob)).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_apply_nested_patch,
    bench_decode_tick_100_changes,
    bench_load_snapshot_1k,
);
criterion_main!(benches);
