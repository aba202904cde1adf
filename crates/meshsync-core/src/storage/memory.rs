//! In-memory sync store

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use parking_lot::RwLock;

use super::OperationSyncStore;
use crate::error::SyncResult;
use crate::types::{IterateOptions, SyncOperationRecord, SyncRecord};

#[derive(Default)]
struct Inner {
    /// Rows keyed by their sort position
    sorted: BTreeMap<(i64, String), SyncOperationRecord>,
    /// id -> ts, for point lookups
    ts_by_id: HashMap<String, i64>,
    next_seq: u64,
}

/// Sync store held entirely in memory.
///
/// Lifecycle hooks are no-ops. Used by tests and for in-process peers.
#[derive(Default)]
pub struct MemorySyncStore {
    inner: RwLock<Inner>,
}

impl MemorySyncStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with `records`
    pub fn with_records(records: &[SyncRecord]) -> Self {
        let store = Self::new();
        let mut inner = store.inner.write();
        for record in records {
            insert_row(&mut inner, record);
        }
        drop(inner);
        store
    }
}

fn insert_row(inner: &mut Inner, record: &SyncRecord) -> bool {
    if inner.ts_by_id.contains_key(&record.id) {
        return false;
    }
    inner.next_seq += 1;
    let row = SyncOperationRecord {
        id: record.id.clone(),
        ts: record.ts,
        operation: record.operation.clone(),
        inserted_at: inner.next_seq,
    };
    inner.ts_by_id.insert(record.id.clone(), record.ts);
    inner.sorted.insert((record.ts, record.id.clone()), row);
    true
}

impl OperationSyncStore for MemorySyncStore {
    fn start(&self) -> SyncResult<()> {
        Ok(())
    }

    fn stop(&self) -> SyncResult<()> {
        Ok(())
    }

    fn reset(&self) -> SyncResult<()> {
        let mut inner = self.inner.write();
        inner.sorted.clear();
        inner.ts_by_id.clear();
        Ok(())
    }

    fn upsert_many(&self, records: &[SyncRecord]) -> SyncResult<usize> {
        let mut inner = self.inner.write();
        Ok(records
            .iter()
            .filter(|record| insert_row(&mut inner, record))
            .count())
    }

    fn get_by_ids(&self, ids: &[String]) -> SyncResult<Vec<SyncOperationRecord>> {
        let inner = self.inner.read();
        Ok(ids
            .iter()
            .filter_map(|id| {
                let ts = *inner.ts_by_id.get(id)?;
                inner.sorted.get(&(ts, id.clone())).cloned()
            })
            .collect())
    }

    fn has(&self, id: &str) -> SyncResult<bool> {
        Ok(self.inner.read().ts_by_id.contains_key(id))
    }

    fn count(&self) -> SyncResult<usize> {
        Ok(self.inner.read().ts_by_id.len())
    }

    fn iterate_sorted(&self, options: &IterateOptions) -> SyncResult<Vec<SyncOperationRecord>> {
        let inner = self.inner.read();

        let start = match (&options.after, options.from_ts) {
            (Some(after), Some(from)) if (from, "") > (after.ts, after.id.as_str()) => {
                Bound::Included((from, String::new()))
            }
            (Some(after), _) => Bound::Excluded((after.ts, after.id.clone())),
            (None, Some(from)) => Bound::Included((from, String::new())),
            (None, None) => Bound::Unbounded,
        };

        let to_ts = options.to_ts.unwrap_or(i64::MAX);
        Ok(inner
            .sorted
            .range((start, Bound::Unbounded))
            .map(|(_, row)| row)
            .take_while(|row| row.ts <= to_ts)
            .take(options.effective_limit())
            .cloned()
            .collect())
    }

    fn earliest_ts(&self) -> SyncResult<Option<i64>> {
        Ok(self.inner.read().sorted.keys().next().map(|(ts, _)| *ts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Operation, SyncCursor};
    use serde_json::json;

    fn record(id: &str, ts: i64) -> SyncRecord {
        SyncRecord::new(id, ts, Operation::new(json!({ "id": id })))
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let store = MemorySyncStore::new();
        assert_eq!(store.upsert_many(&[record("a", 1), record("b", 2)]).unwrap(), 2);
        assert_eq!(store.upsert_many(&[record("a", 1), record("c", 3)]).unwrap(), 1);
        assert_eq!(store.count().unwrap(), 3);
    }

    #[test]
    fn test_duplicate_within_batch_counted_once() {
        let store = MemorySyncStore::new();
        assert_eq!(store.upsert_many(&[record("a", 1), record("a", 5)]).unwrap(), 1);
        assert_eq!(store.iterate_sorted(&IterateOptions::new()).unwrap()[0].ts, 1);
    }

    #[test]
    fn test_inserted_at_increases() {
        let store = MemorySyncStore::new();
        store.upsert_many(&[record("b", 1)]).unwrap();
        store.upsert_many(&[record("a", 1)]).unwrap();
        let rows = store.get_by_ids(&["b".into(), "a".into()]).unwrap();
        assert!(rows[0].inserted_at < rows[1].inserted_at);
    }

    #[test]
    fn test_after_cursor_before_from_ts() {
        let store = MemorySyncStore::with_records(&[record("a", 1), record("b", 5), record("c", 9)]);
        let opts = IterateOptions::new()
            .with_range(5, 9)
            .with_after(Some(SyncCursor::new(2, "z")));
        let ids: Vec<_> = store
            .iterate_sorted(&opts)
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn test_reset_clears() {
        let store = MemorySyncStore::with_records(&[record("a", 1)]);
        store.reset().unwrap();
        assert_eq!(store.count().unwrap(), 0);
        assert!(!store.has("a").unwrap());
        assert_eq!(store.earliest_ts().unwrap(), None);
    }
}
