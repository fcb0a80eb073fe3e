use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use std::time::Duration;
use strata_core::backend::{Backend, MemoryStore};
use strata_core::blocklist::{BlockScanner, Blocklist, BlocklistSnapshot, SnapshotSource};
use strata_core::index::TenantIndex;
use strata_core::{BlockMeta, BlockVersion};
use tokio::runtime::Runtime;
use uuid::Uuid;

const BLOCKS: usize = 10_000;

fn populate(rt: &Runtime, blocks: usize) -> Backend {
    let store = Arc::new(MemoryStore::new());
    let backend = Backend::new(store, Duration::from_secs(30));
    rt.block_on(async {
        for i in 0..blocks {
            let meta = BlockMeta::new("bench", Uuid::new_v4(), BlockVersion::VParquet4)
                .with_objects(i as u64, 1024 * 1024);
            backend.write_block_meta(&meta).await.unwrap();
        }
    });
    backend
}

fn bench_full_scan(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let backend = populate(&rt, BLOCKS);

    let mut group = c.benchmark_group("full_scan");
    group.sample_size(10);

    for concurrency in [1, 50] {
        let scanner = BlockScanner::new(backend.clone(), concurrency);
        let empty = BlocklistSnapshot::empty("bench");
        group.bench_with_input(
            BenchmarkId::new("cold", concurrency),
            &concurrency,
            |b, _| b.iter(|| rt.block_on(scanner.scan("bench", &empty)).unwrap()),
        );
    }

    // every meta already known, only the listing is paid
    let scanner = BlockScanner::new(backend.clone(), 50);
    let scanned = rt
        .block_on(scanner.scan("bench", &BlocklistSnapshot::empty("bench")))
        .unwrap();
    let previous = Blocklist::new().swap(
        "bench",
        SnapshotSource::FullScan,
        scanned.metas,
        scanned.compacted_metas,
    );
    group.bench_function("warm", |b| {
        b.iter(|| rt.block_on(scanner.scan("bench", &previous)).unwrap())
    });

    group.finish();
}

fn bench_tenant_index(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let backend = populate(&rt, BLOCKS);
    let scanned = rt
        .block_on(BlockScanner::new(backend, 50).scan("bench", &BlocklistSnapshot::empty("bench")))
        .unwrap();
    let index = TenantIndex::new("bench", chrono::Utc::now(), scanned.metas, scanned.compacted_metas);
    let encoded = index.encode().unwrap();

    let mut group = c.benchmark_group("tenant_index");
    group.bench_function("encode", |b| b.iter(|| index.encode().unwrap()));
    group.bench_function("decode", |b| {
        b.iter(|| TenantIndex::decode("bench/index.json.lz4", &encoded).unwrap())
    });
    group.finish();
}

criterion_group!(benches, bench_full_scan, bench_tenant_index);
criterion_main!(benches);
