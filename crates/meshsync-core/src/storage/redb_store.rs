//! Durable sync store backed by redb.
//!
//! Layout:
//! - `sync_records`: sort key -> JSON row, where the sort key is the
//!   order-preserving encoding of `(ts, id)`, so keyset cursors become range
//!   scans
//! - `sync_ids`: id -> ts, for idempotency checks and point lookups
//! - `sync_meta`: the local insertion sequence

use std::ops::Bound;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use tracing::debug;

use super::OperationSyncStore;
use crate::error::{SyncError, SyncResult};
use crate::types::{IterateOptions, SyncOperationRecord, SyncRecord};

const RECORDS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("sync_records");
const IDS_TABLE: TableDefinition<&str, i64> = TableDefinition::new("sync_ids");
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("sync_meta");

const INSERT_SEQ_KEY: &str = "insert_seq";

/// Order-preserving key for `(ts, id)`: sign-flipped big-endian ts, then id bytes.
fn sort_key(ts: i64, id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + id.len());
    key.extend_from_slice(&((ts as u64) ^ (1 << 63)).to_be_bytes());
    key.extend_from_slice(id.as_bytes());
    key
}

fn ts_from_sort_key(key: &[u8]) -> Option<i64> {
    let prefix: [u8; 8] = key.get(..8)?.try_into().ok()?;
    Some((u64::from_be_bytes(prefix) ^ (1 << 63)) as i64)
}

/// Sync store persisted in a redb database file
pub struct RedbSyncStore {
    path: PathBuf,
    db: RwLock<Option<Database>>,
}

impl RedbSyncStore {
    /// Create a store for `path` without opening it; call `start()` next.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            db: RwLock::new(None),
        }
    }

    /// Create and start a store in one step
    pub fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        let store = Self::new(path);
        store.start()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> SyncResult<T>) -> SyncResult<T> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or(SyncError::StoreNotStarted)?;
        f(db)
    }
}

fn decode_row(bytes: &[u8]) -> SyncResult<SyncOperationRecord> {
    serde_json::from_slice(bytes).map_err(|e| SyncError::Serialization(e.to_string()))
}

impl OperationSyncStore for RedbSyncStore {
    fn start(&self) -> SyncResult<()> {
        let mut guard = self.db.write();
        if guard.is_some() {
            return Ok(());
        }

        // Create parent directory if needed
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(&self.path)?;
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(RECORDS_TABLE)?;
            let _ = write_txn.open_table(IDS_TABLE)?;
            let _ = write_txn.open_table(META_TABLE)?;
        }
        write_txn.commit()?;

        debug!(path = %self.path.display(), "Opened sync store");
        *guard = Some(db);
        Ok(())
    }

    fn stop(&self) -> SyncResult<()> {
        if self.db.write().take().is_some() {
            debug!(path = %self.path.display(), "Closed sync store");
        }
        Ok(())
    }

    fn reset(&self) -> SyncResult<()> {
        self.with_db(|db| {
            let write_txn = db.begin_write()?;
            write_txn.delete_table(RECORDS_TABLE)?;
            write_txn.delete_table(IDS_TABLE)?;
            {
                let _ = write_txn.open_table(RECORDS_TABLE)?;
                let _ = write_txn.open_table(IDS_TABLE)?;
            }
            write_txn.commit()?;
            Ok(())
        })
    }

    fn upsert_many(&self, records: &[SyncRecord]) -> SyncResult<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        self.with_db(|db| {
            let write_txn = db.begin_write()?;
            let mut inserted = 0;
            {
                let mut rows = write_txn.open_table(RECORDS_TABLE)?;
                let mut ids = write_txn.open_table(IDS_TABLE)?;
                let mut meta = write_txn.open_table(META_TABLE)?;

                let mut seq = meta.get(INSERT_SEQ_KEY)?.map(|v| v.value()).unwrap_or(0);
                for record in records {
                    if ids.get(record.id.as_str())?.is_some() {
                        continue;
                    }
                    seq += 1;
                    let row = SyncOperationRecord {
                        id: record.id.clone(),
                        ts: record.ts,
                        operation: record.operation.clone(),
                        inserted_at: seq,
                    };
                    let data = serde_json::to_vec(&row)
                        .map_err(|e| SyncError::Serialization(e.to_string()))?;
                    let key = sort_key(record.ts, &record.id);
                    rows.insert(key.as_slice(), data.as_slice())?;
                    ids.insert(record.id.as_str(), record.ts)?;
                    inserted += 1;
                }
                meta.insert(INSERT_SEQ_KEY, seq)?;
            }
            write_txn.commit()?;
            Ok(inserted)
        })
    }

    fn get_by_ids(&self, ids: &[String]) -> SyncResult<Vec<SyncOperationRecord>> {
        self.with_db(|db| {
            let read_txn = db.begin_read()?;
            let rows = read_txn.open_table(RECORDS_TABLE)?;
            let id_index = read_txn.open_table(IDS_TABLE)?;

            let mut out = Vec::new();
            for id in ids {
                let Some(ts) = id_index.get(id.as_str())?.map(|v| v.value()) else {
                    continue;
                };
                let key = sort_key(ts, id);
                if let Some(data) = rows.get(key.as_slice())? {
                    out.push(decode_row(data.value())?);
                }
            }
            Ok(out)
        })
    }

    fn has(&self, id: &str) -> SyncResult<bool> {
        self.with_db(|db| {
            let read_txn = db.begin_read()?;
            let ids = read_txn.open_table(IDS_TABLE)?;
            Ok(ids.get(id)?.is_some())
        })
    }

    fn count(&self) -> SyncResult<usize> {
        self.with_db(|db| {
            let read_txn = db.begin_read()?;
            let ids = read_txn.open_table(IDS_TABLE)?;
            Ok(ids.len()? as usize)
        })
    }

    fn iterate_sorted(&self, options: &IterateOptions) -> SyncResult<Vec<SyncOperationRecord>> {
        let limit = options.effective_limit();
        if limit == 0 {
            return Ok(Vec::new());
        }

        let from_key = options.from_ts.map(|ts| sort_key(ts, ""));
        let after_key = options.after.as_ref().map(|c| sort_key(c.ts, &c.id));
        let to_ts = options.to_ts.unwrap_or(i64::MAX);

        self.with_db(|db| {
            let read_txn = db.begin_read()?;
            let rows = read_txn.open_table(RECORDS_TABLE)?;

            let start: Bound<&[u8]> = match (&after_key, &from_key) {
                (Some(after), Some(from)) if from > after => Bound::Included(from.as_slice()),
                (Some(after), _) => Bound::Excluded(after.as_slice()),
                (None, Some(from)) => Bound::Included(from.as_slice()),
                (None, None) => Bound::Unbounded,
            };

            let mut out = Vec::new();
            for entry in rows.range::<&[u8]>((start, Bound::Unbounded))? {
                let (_, data) = entry?;
                let row = decode_row(data.value())?;
                if row.ts > to_ts {
                    break;
                }
                out.push(row);
                if out.len() >= limit {
                    break;
                }
            }
            Ok(out)
        })
    }

    fn earliest_ts(&self) -> SyncResult<Option<i64>> {
        self.with_db(|db| {
            let read_txn = db.begin_read()?;
            let rows = read_txn.open_table(RECORDS_TABLE)?;
            let first = rows.first()?;
            Ok(first.and_then(|(key, _)| ts_from_sort_key(key.value())))
        })
    }
}
