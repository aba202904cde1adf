//! Sync store contract tests
//!
//! Every check runs against both the in-memory and the redb store.

use meshsync_core::{
    IterateOptions, MemorySyncStore, Operation, OperationSyncStore, RedbSyncStore, SyncCursor,
    SyncError, SyncRecord,
};
use serde_json::json;
use tempfile::TempDir;

fn record(n: u32, ts: i64) -> SyncRecord {
    let id = format!("{n:064x}");
    SyncRecord::new(
        id.clone(),
        ts,
        Operation::new(json!({ "signature": { "hash": id, "signed": "2025-01-01T00:00:00Z" } })),
    )
}

fn with_stores(check: impl Fn(&dyn OperationSyncStore)) {
    let memory = MemorySyncStore::new();
    check(&memory);

    let dir = TempDir::new().unwrap();
    let redb = RedbSyncStore::open(dir.path().join("sync.redb")).unwrap();
    check(&redb);
    redb.stop().unwrap();
}

// ============================================================================
// Upsert
// ============================================================================

#[test]
fn test_upsert_is_idempotent() {
    with_stores(|store| {
        assert_eq!(store.upsert_many(&[record(1, 10), record(2, 20)]).unwrap(), 2);
        assert_eq!(store.upsert_many(&[record(1, 10), record(3, 30)]).unwrap(), 1);
        assert_eq!(store.count().unwrap(), 3);
    });
}

#[test]
fn test_upsert_skips_repeats_within_one_call() {
    with_stores(|store| {
        let inserted = store
            .upsert_many(&[record(5, 1), record(5, 1), record(6, 2)])
            .unwrap();
        assert_eq!(inserted, 2);
        assert_eq!(store.count().unwrap(), 2);
    });
}

#[test]
fn test_existing_row_is_never_rewritten() {
    with_stores(|store| {
        store.upsert_many(&[record(1, 100)]).unwrap();
        // Same id, different timestamp: ignored
        assert_eq!(store.upsert_many(&[record(1, 5)]).unwrap(), 0);
        let rows = store.get_by_ids(&[format!("{:064x}", 1)]).unwrap();
        assert_eq!(rows[0].ts, 100);
    });
}

#[test]
fn test_upsert_empty_slice() {
    with_stores(|store| {
        assert_eq!(store.upsert_many(&[]).unwrap(), 0);
        assert_eq!(store.count().unwrap(), 0);
    });
}

// ============================================================================
// Lookup
// ============================================================================

#[test]
fn test_get_by_ids_returns_found_only() {
    with_stores(|store| {
        store.upsert_many(&[record(1, 10), record(2, 20)]).unwrap();
        let ids = vec![format!("{:064x}", 2), format!("{:064x}", 99)];
        let rows = store.get_by_ids(&ids).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, ids[0]);
        assert!(store.has(&ids[0]).unwrap());
        assert!(!store.has(&ids[1]).unwrap());
    });
}

#[test]
fn test_insertion_sequence_increases() {
    with_stores(|store| {
        store.upsert_many(&[record(9, 1)]).unwrap();
        store.upsert_many(&[record(1, 2)]).unwrap();
        let rows = store
            .get_by_ids(&[format!("{:064x}", 9), format!("{:064x}", 1)])
            .unwrap();
        assert!(rows[0].inserted_at < rows[1].inserted_at);
    });
}

// ============================================================================
// Ordered iteration
// ============================================================================

#[test]
fn test_iterate_orders_by_ts_then_id() {
    with_stores(|store| {
        store
            .upsert_many(&[record(3, 20), record(2, 10), record(1, 20), record(4, 5)])
            .unwrap();
        let rows = store.iterate_sorted(&IterateOptions::new()).unwrap();
        let order: Vec<(i64, String)> = rows.iter().map(|r| (r.ts, r.id.clone())).collect();
        let mut expected = order.clone();
        expected.sort();
        assert_eq!(order, expected);
        assert_eq!(rows[0].ts, 5);
    });
}

#[test]
fn test_iterate_range_is_inclusive() {
    with_stores(|store| {
        let records: Vec<_> = (0..10).map(|n| record(n, n as i64 * 10)).collect();
        store.upsert_many(&records).unwrap();
        let rows = store
            .iterate_sorted(&IterateOptions::new().with_range(20, 50))
            .unwrap();
        let ts: Vec<i64> = rows.iter().map(|r| r.ts).collect();
        assert_eq!(ts, vec![20, 30, 40, 50]);
    });
}

#[test]
fn test_keyset_pagination_visits_every_row_once() {
    with_stores(|store| {
        // Many rows share a timestamp so the cursor has to use the id
        let records: Vec<_> = (0..57).map(|n| record(n, (n % 4) as i64)).collect();
        store.upsert_many(&records).unwrap();

        let mut seen = Vec::new();
        let mut after: Option<SyncCursor> = None;
        loop {
            let page = store
                .iterate_sorted(&IterateOptions::new().with_limit(10).with_after(after.take()))
                .unwrap();
            let Some(last) = page.last() else { break };
            after = Some(last.cursor());
            seen.extend(page.iter().map(|r| r.id.clone()));
        }
        assert_eq!(seen.len(), 57);
        let mut unique = seen.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 57);
    });
}

#[test]
fn test_cursor_is_strictly_after() {
    with_stores(|store| {
        store.upsert_many(&[record(1, 10), record(2, 10)]).unwrap();
        let after = SyncCursor::new(10, format!("{:064x}", 1));
        let rows = store
            .iterate_sorted(&IterateOptions::new().with_after(Some(after)))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, format!("{:064x}", 2));
    });
}

#[test]
fn test_negative_timestamps_sort_first() {
    with_stores(|store| {
        store
            .upsert_many(&[record(1, 100), record(2, -5), record(3, 0)])
            .unwrap();
        let ts: Vec<i64> = store
            .iterate_sorted(&IterateOptions::new())
            .unwrap()
            .iter()
            .map(|r| r.ts)
            .collect();
        assert_eq!(ts, vec![-5, 0, 100]);
        assert_eq!(store.earliest_ts().unwrap(), Some(-5));
    });
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_reset_clears_everything() {
    with_stores(|store| {
        store.upsert_many(&[record(1, 1), record(2, 2)]).unwrap();
        store.reset().unwrap();
        assert_eq!(store.count().unwrap(), 0);
        assert_eq!(store.earliest_ts().unwrap(), None);
        // Usable again after a reset
        assert_eq!(store.upsert_many(&[record(1, 1)]).unwrap(), 1);
    });
}

#[test]
fn test_redb_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("sync.redb");
    {
        let store = RedbSyncStore::open(&path).unwrap();
        store.upsert_many(&[record(1, 10), record(2, 20)]).unwrap();
        store.stop().unwrap();
    }
    let store = RedbSyncStore::open(&path).unwrap();
    assert_eq!(store.count().unwrap(), 2);
    assert_eq!(store.upsert_many(&[record(3, 30)]).unwrap(), 1);
    let rows = store.iterate_sorted(&IterateOptions::new()).unwrap();
    assert!(rows[2].inserted_at > rows[1].inserted_at);
}

#[test]
fn test_redb_requires_start() {
    let dir = TempDir::new().unwrap();
    let store = RedbSyncStore::new(dir.path().join("sync.redb"));
    assert!(matches!(store.count(), Err(SyncError::StoreNotStarted)));
    store.start().unwrap();
    store.start().unwrap();
    assert_eq!(store.count().unwrap(), 0);
}
