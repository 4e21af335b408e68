//! STRATA - Performance Benchmarks
//! Measures throughput of core engine operations using Criterion.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use strata::config::{Config, MemtableStructure};
use strata::engine::block::{FileBlockManager, SharedBlockStore};
use strata::engine::bloom::BloomFilter;
use strata::engine::memtable::MemTable;
use strata::engine::wal::WriteAheadLog;
use strata::engine::Strata;
use strata::types::Entry;

fn filled_memtable(structure: MemtableStructure) -> MemTable {
    let mut table = MemTable::new(1000, structure, 16);
    for i in 0..1000 {
        let key = format!("key_{:06}", i).into_bytes();
        let value = format!("value_{:06}", i).into_bytes();
        table.update(key, value, i as i64, false);
    }
    table
}

fn bench_memtable_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("memtable");

    for structure in [MemtableStructure::SkipList, MemtableStructure::BTree] {
        let label = format!("{:?}", structure);

        // Benchmark: Sequential inserts
        group.bench_function(BenchmarkId::new("insert_1000", &label), |b| {
            b.iter(|| black_box(filled_memtable(structure)));
        });

        // Benchmark: Point lookups
        group.bench_function(BenchmarkId::new("lookup_hit", &label), |b| {
            let table = filled_memtable(structure);
            b.iter(|| black_box(table.lookup(b"key_000500")));
        });

        group.bench_function(BenchmarkId::new("lookup_miss", &label), |b| {
            let table = filled_memtable(structure);
            b.iter(|| black_box(table.lookup(b"nonexistent_key")));
        });

        // Benchmark: Full sorted iteration
        group.bench_function(BenchmarkId::new("iter_1000", &label), |b| {
            let table = filled_memtable(structure);
            b.iter(|| black_box(table.iter().count()));
        });
    }

    group.finish();
}

fn bench_bloom_filter(c: &mut Criterion) {
    let mut group = c.benchmark_group("bloom_filter");

    group.bench_function("insert_1000", |b| {
        b.iter(|| {
            let mut bf = BloomFilter::new(1000, 0.01);
            for i in 0..1000 {
                let key = format!("key_{:06}", i);
                bf.insert(black_box(key.as_bytes()));
            }
        });
    });

    let mut bf = BloomFilter::new(1000, 0.01);
    for i in 0..1000 {
        let key = format!("key_{:06}", i);
        bf.insert(key.as_bytes());
    }

    group.bench_function("lookup_hit", |b| {
        b.iter(|| black_box(bf.may_contain(b"key_000500")));
    });

    group.bench_function("lookup_miss", |b| {
        b.iter(|| black_box(bf.may_contain(b"definitely_not_here")));
    });

    group.finish();
}

fn bench_wal_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal");

    group.bench_function("append_100", |b| {
        let dir = tempfile::tempdir().unwrap();
        let store: SharedBlockStore = Arc::new(FileBlockManager::new(4096));
        let mut wal = WriteAheadLog::open(dir.path(), store, 1024, false).unwrap();

        b.iter(|| {
            for i in 0..100 {
                let key = format!("key_{:06}", i).into_bytes();
                let value = format!("value_{:06}", i).into_bytes();
                wal.append(black_box(&Entry::put(key, value, i))).unwrap();
            }
        });
    });

    group.finish();
}

fn bench_engine_e2e(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_e2e");
    group.sample_size(10);

    for size in [100, 500, 1000].iter() {
        group.bench_with_input(
            BenchmarkId::new("put_get_cycle", size),
            size,
            |b, &size| {
                b.iter(|| {
                    let dir = tempfile::tempdir().unwrap();
                    let mut config = Config::new(dir.path()).with_memtable_capacity(256);
                    config.sync_writes = false;
                    let mut engine = Strata::open(config).unwrap();

                    for i in 0..size {
                        let key = format!("key_{:06}", i).into_bytes();
                        let value = format!("value_{:06}", i).into_bytes();
                        engine.put(key, value).unwrap();
                    }

                    for i in 0..size {
                        let key = format!("key_{:06}", i);
                        black_box(engine.get(key.as_bytes()).unwrap());
                    }
                });
            },
        );
    }

    group.bench_function("prefix_scan_page", |b| {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::new(dir.path()).with_memtable_capacity(128);
        config.sync_writes = false;
        let mut engine = Strata::open(config).unwrap();
        for i in 0..1000 {
            engine
                .put(format!("user:{:04}", i).into_bytes(), b"profile".to_vec())
                .unwrap();
        }
        b.iter(|| black_box(engine.prefix_scan(b"user:05", 2, 20).unwrap()));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_memtable_operations,
    bench_bloom_filter,
    bench_wal_operations,
    bench_engine_e2e
);
criterion_main!(benches);
