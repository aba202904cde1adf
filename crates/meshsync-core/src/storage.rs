//! Sync index storage.
//!
//! The sync index holds one row per accepted operation, ordered by
//! `(ts, id)`. Two backends implement [`OperationSyncStore`]:
//! - [`MemorySyncStore`] for tests and in-process peers
//! - [`RedbSyncStore`] for durable, crash-recoverable persistence
//!
//! Rows are never updated in place. A second upsert of an existing id is a
//! no-op and rows only disappear through [`OperationSyncStore::reset`].

use crate::error::SyncResult;
use crate::types::{IterateOptions, SyncOperationRecord, SyncRecord};

// Submodules
mod memory;
mod redb_store;

pub use memory::MemorySyncStore;
pub use redb_store::RedbSyncStore;

/// Ordered, idempotent index of sync records
pub trait OperationSyncStore: Send + Sync {
    /// Acquire connection/file handles
    fn start(&self) -> SyncResult<()>;

    /// Release connection/file handles
    fn stop(&self) -> SyncResult<()>;

    /// Remove every record
    fn reset(&self) -> SyncResult<()>;

    /// Insert records whose id is not present yet.
    ///
    /// Returns the number of rows actually inserted; existing ids (including
    /// repeats within `records`) are skipped and not counted.
    fn upsert_many(&self, records: &[SyncRecord]) -> SyncResult<usize>;

    /// Fetch the records for the ids that exist, in input order
    fn get_by_ids(&self, ids: &[String]) -> SyncResult<Vec<SyncOperationRecord>>;

    fn has(&self, id: &str) -> SyncResult<bool>;

    fn count(&self) -> SyncResult<usize>;

    /// Ascending `(ts, id)` scan with keyset pagination.
    fn iterate_sorted(&self, options: &IterateOptions) -> SyncResult<Vec<SyncOperationRecord>>;

    /// Timestamp of the oldest record, if any
    fn earliest_ts(&self) -> SyncResult<Option<i64>> {
        let first = self.iterate_sorted(&IterateOptions::new().with_limit(1))?;
        Ok(first.first().map(|r| r.ts))
    }
}

impl<S: OperationSyncStore + ?Sized> OperationSyncStore for std::sync::Arc<S> {
    fn start(&self) -> SyncResult<()> {
        (**self).start()
    }

    fn stop(&self) -> SyncResult<()> {
        (**self).stop()
    }

    fn reset(&self) -> SyncResult<()> {
        (**self).reset()
    }

    fn upsert_many(&self, records: &[SyncRecord]) -> SyncResult<usize> {
        (**self).upsert_many(records)
    }

    fn get_by_ids(&self, ids: &[String]) -> SyncResult<Vec<SyncOperationRecord>> {
        (**self).get_by_ids(ids)
    }

    fn has(&self, id: &str) -> SyncResult<bool> {
        (**self).has(id)
    }

    fn count(&self) -> SyncResult<usize> {
        (**self).count()
    }

    fn iterate_sorted(&self, options: &IterateOptions) -> SyncResult<Vec<SyncOperationRecord>> {
        (**self).iterate_sorted(options)
    }

    fn earliest_ts(&self) -> SyncResult<Option<i64>> {
        (**self).earliest_ts()
    }
}
