//! Benchmarks for MeshSync reconciliation
//!
//! Run with: cargo bench -p meshsync-core
//!
//! These benchmarks establish performance baselines for:
//! - Sync index writes and ordered scans
//! - Window rebuilds from the index
//! - Windowed reconciliation between two in-process peers
//! - Mediator import of a received batch

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use meshsync_core::sync::windows::DAY_SECS;
use meshsync_core::{
    AdapterOptions, ChannelTransport, IterateOptions, Mediator, MediatorConfig, MediatorMessage,
    MemoryLedger, MemorySyncStore, NegentropyAdapter, Operation, OperationSyncStore,
    RedbSyncStore, SessionOptions, SyncCursor, SyncRecord,
};
use serde_json::json;
use tempfile::TempDir;

const NOW: i64 = 1_750_000_000;

fn record(n: u32) -> SyncRecord {
    let id = format!("{n:064x}");
    // Spread over roughly a year
    let ts = NOW - (n as i64 * 3_607) % (365 * DAY_SECS);
    SyncRecord::new(
        id.clone(),
        ts,
        Operation::new(json!({ "type": "create", "signature": { "hash": id, "signed": ts } })),
    )
}

fn records(range: std::ops::Range<u32>) -> Vec<SyncRecord> {
    range.map(record).collect()
}

// ============================================================================
// Store Benchmarks
// ============================================================================

fn bench_upsert(c: &mut Criterion) {
    let mut group = c.benchmark_group("upsert_many");

    for size in [100u32, 1000] {
        let batch = records(0..size);
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("memory", size), &batch, |b, batch| {
            b.iter_batched(
                MemorySyncStore::new,
                |store| black_box(store.upsert_many(batch).unwrap()),
                criterion::BatchSize::SmallInput,
            )
        });

        group.bench_with_input(BenchmarkId::new("redb", size), &batch, |b, batch| {
            b.iter_batched(
                || {
                    let dir = TempDir::new().unwrap();
                    let store = RedbSyncStore::open(dir.path().join("sync.redb")).unwrap();
                    (dir, store)
                },
                |(_dir, store)| black_box(store.upsert_many(batch).unwrap()),
                criterion::BatchSize::PerIteration,
            )
        });
    }

    group.finish();
}

fn bench_iterate_sorted(c: &mut Criterion) {
    let mut group = c.benchmark_group("iterate_sorted");
    let all = records(0..10_000);

    let memory = MemorySyncStore::with_records(&all);
    let dir = TempDir::new().unwrap();
    let redb = RedbSyncStore::open(dir.path().join("sync.redb")).unwrap();
    redb.upsert_many(&all).unwrap();

    let stores: [(&str, &dyn OperationSyncStore); 2] = [("memory", &memory), ("redb", &redb)];
    for (name, store) in stores {
        group.throughput(Throughput::Elements(all.len() as u64));
        group.bench_function(BenchmarkId::new("full_scan_pages", name), |b| {
            b.iter(|| {
                let mut after: Option<SyncCursor> = None;
                let mut seen = 0;
                loop {
                    let page = store
                        .iterate_sorted(&IterateOptions::new().with_limit(1000).with_after(after.take()))
                        .unwrap();
                    let Some(last) = page.last() else { break };
                    after = Some(last.cursor());
                    seen += page.len();
                }
                black_box(seen)
            })
        });

        group.bench_function(BenchmarkId::new("recent_week", name), |b| {
            b.iter(|| {
                let rows = store
                    .iterate_sorted(&IterateOptions::new().with_range(NOW - 7 * DAY_SECS, NOW))
                    .unwrap();
                black_box(rows.len())
            })
        });
    }

    group.finish();
}

// ============================================================================
// Adapter Benchmarks
// ============================================================================

fn bench_rebuild(c: &mut Criterion) {
    let mut group = c.benchmark_group("rebuild");

    for size in [1_000u32, 10_000] {
        let store = Arc::new(MemorySyncStore::with_records(&records(0..size)));
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("full_history", size), &store, |b, store| {
            let mut adapter =
                NegentropyAdapter::create(store.clone(), AdapterOptions::default().deferred())
                    .unwrap();
            b.iter(|| black_box(adapter.rebuild_from_store().unwrap()))
        });
    }

    group.finish();
}

fn bench_windowed_session(c: &mut Criterion) {
    let mut group = c.benchmark_group("windowed_session");
    group.sample_size(20);

    // (local, remote) record ranges
    let cases = [
        ("identical_5k", 0..5_000u32, 0..5_000u32),
        ("overlap_5k", 0..5_000, 500..5_500),
        ("disjoint_2k", 0..2_000, 2_000..4_000),
    ];

    for (name, local, remote) in cases {
        let local = Arc::new(MemorySyncStore::with_records(&records(local)));
        let remote = Arc::new(MemorySyncStore::with_records(&records(remote)));
        let options = AdapterOptions {
            frame_size_limit: 60_000,
            max_rounds_per_session: 1_000,
            ..AdapterOptions::default()
        }
        .deferred();

        group.bench_function(name, |b| {
            b.iter(|| {
                let mut a = NegentropyAdapter::create(local.clone(), options.clone()).unwrap();
                let mut peer = NegentropyAdapter::create(remote.clone(), options.clone()).unwrap();
                let stats = a
                    .run_windowed_session_with_peer(
                        &mut peer,
                        SessionOptions {
                            now_ts: Some(NOW),
                            ..Default::default()
                        },
                    )
                    .unwrap();
                black_box((stats.have_ids.len(), stats.need_ids.len()))
            })
        });
    }

    group.finish();
}

// ============================================================================
// Mediator Benchmarks
// ============================================================================

fn bench_legacy_batch_import(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("mediator_import");
    group.sample_size(20);

    for size in [100u32, 1000] {
        let data: Vec<Operation> = (0..size)
            .map(|n| {
                Operation::new(json!({
                    "type": "create",
                    "signature": {
                        "hash": format!("{n:064x}"),
                        "signed": "2025-06-01T12:00:00Z",
                    }
                }))
            })
            .collect();
        let hello = MediatorMessage::Hello {
            node: "old".into(),
            capabilities: None,
        }
        .encode()
        .unwrap();
        let batch = MediatorMessage::Batch {
            node: "old".into(),
            data,
        }
        .encode()
        .unwrap();

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("legacy_batch", size), &batch, |b, batch| {
            b.to_async(&runtime).iter(|| async {
                let transport = Arc::new(ChannelTransport::new());
                let _rx = transport.register("peer");
                let mediator = Mediator::new(
                    MediatorConfig::default(),
                    Arc::new(MemorySyncStore::new()),
                    Arc::new(MemoryLedger::new()),
                    transport,
                )
                .unwrap();
                mediator.peer_connected("peer", false).await.unwrap();
                mediator.handle_message("peer", &hello).await.unwrap();
                mediator.handle_message("peer", batch).await.unwrap();
                mediator.wait_idle().await;
                mediator.stop().await;
                black_box(mediator.store().count().unwrap())
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_upsert,
    bench_iterate_sorted,
    bench_rebuild,
    bench_windowed_session,
    bench_legacy_batch_import,
);
criterion_main!(benches);
