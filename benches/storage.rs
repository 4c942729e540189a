// SPDX-License-Identifier: MIT

//! Hot-path benchmarks for the mmap-backed storage engine (spec.md §4.1:
//! insert/lookup are meant to be constant-time per record).

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use smq::storage::Engine;
use tempfile::tempdir;

fn insert_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("storage_engine");

    for payload_size in [64usize, 1024, 16 * 1024] {
        group.bench_with_input(
            BenchmarkId::new("insert", payload_size),
            &payload_size,
            |b, &payload_size| {
                let dir = tempdir().unwrap();
                let engine =
                    Engine::open_with_slot_size(dir.path(), "bench", 24 + 4096 * 4096, 4096).unwrap();
                let payload = vec![0xABu8; payload_size.min(4096 - 16)];
                b.iter(|| {
                    engine.insert(&payload).unwrap();
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("lookup", payload_size),
            &payload_size,
            |b, &payload_size| {
                let dir = tempdir().unwrap();
                let engine =
                    Engine::open_with_slot_size(dir.path(), "bench", 24 + 4096 * 4096, 4096).unwrap();
                let payload = vec![0xABu8; payload_size.min(4096 - 16)];
                let handle = engine.insert(&payload).unwrap();
                b.iter(|| {
                    engine.lookup(handle).unwrap();
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, insert_lookup);
criterion_main!(benches);
