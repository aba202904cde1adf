//! Sync index bootstrap
//!
//! Seeds the sync store from the canonical ledger before reconciliation
//! starts, and rebuilds it when its record count has drifted too far from
//! the ledger's.

use std::collections::HashSet;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};
use crate::ledger::ExportableLedger;
use crate::mapping::map_accepted_operations_to_sync_records;
use crate::storage::OperationSyncStore;

/// Rebuild when the index is off by 1% or more
pub const DEFAULT_DRIFT_THRESHOLD: f64 = 0.01;

/// DIDs exported per ledger call
pub const DEFAULT_EXPORT_CHUNK_SIZE: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BootstrapOptions {
    /// Fraction in `[0, 1]`
    pub drift_threshold: f64,
    pub export_chunk_size: usize,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            drift_threshold: DEFAULT_DRIFT_THRESHOLD,
            export_chunk_size: DEFAULT_EXPORT_CHUNK_SIZE,
        }
    }
}

impl BootstrapOptions {
    pub fn validate(&self) -> SyncResult<()> {
        if !self.drift_threshold.is_finite() || !(0.0..=1.0).contains(&self.drift_threshold) {
            return Err(SyncError::config(
                "driftThresholdPct",
                "expected a number between 0 and 1",
            ));
        }
        if self.export_chunk_size == 0 {
            return Err(SyncError::config(
                "exportChunkSize",
                "expected a positive integer",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapSkipReason {
    /// Count drift is below the threshold
    StoreWithinDriftTolerance,
    /// Zero drift, or the ledger exported nothing usable
    StoreNotEmpty,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapResult {
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<BootstrapSkipReason>,
    pub count_before: usize,
    pub count_after: usize,
    pub exported: usize,
    pub mapped: usize,
    pub invalid: usize,
    pub inserted: usize,
    pub drift_pct: f64,
    pub drift_threshold_pct: f64,
    pub duration_ms: u64,
}

/// Populate `store` from `ledger` unless it is already close enough.
///
/// Ledger errors propagate; a partial export never reaches the store.
pub async fn bootstrap_sync_store_if_empty<S, L>(
    store: &S,
    ledger: &L,
    options: &BootstrapOptions,
) -> SyncResult<BootstrapResult>
where
    S: OperationSyncStore + ?Sized,
    L: ExportableLedger + ?Sized,
{
    options.validate()?;
    let started = Instant::now();
    let count_before = store.count()?;

    let dids = ledger.get_dids().await?;
    let mut operations = Vec::new();
    for chunk in dids.chunks(options.export_chunk_size) {
        let events = ledger.export_batch(Some(chunk)).await?;
        operations.extend(events.into_iter().filter_map(|event| event.operation));
        debug!(dids = chunk.len(), total = operations.len(), "bootstrap export chunk");
    }

    let mapped = map_accepted_operations_to_sync_records(&operations);
    let canonical_count = mapped
        .records
        .iter()
        .map(|r| r.id.as_str())
        .collect::<HashSet<_>>()
        .len();
    let drift_pct =
        count_before.abs_diff(canonical_count) as f64 / canonical_count.max(1) as f64;

    let mut result = BootstrapResult {
        skipped: false,
        reason: None,
        count_before,
        count_after: count_before,
        exported: operations.len(),
        mapped: mapped.records.len(),
        invalid: mapped.invalid,
        inserted: 0,
        drift_pct,
        drift_threshold_pct: options.drift_threshold,
        duration_ms: 0,
    };

    let skip_reason = if count_before == 0 {
        None
    } else if canonical_count == 0 || drift_pct == 0.0 {
        Some(BootstrapSkipReason::StoreNotEmpty)
    } else if drift_pct < options.drift_threshold {
        Some(BootstrapSkipReason::StoreWithinDriftTolerance)
    } else {
        None
    };

    if let Some(reason) = skip_reason {
        result.skipped = true;
        result.reason = Some(reason);
    } else {
        if count_before > 0 {
            store.reset()?;
        }
        result.inserted = store.upsert_many(&mapped.records)?;
        result.count_after = store.count()?;
    }
    result.duration_ms = started.elapsed().as_millis() as u64;

    info!(
        skipped = result.skipped,
        reason = ?result.reason,
        count_before = result.count_before,
        count_after = result.count_after,
        exported = result.exported,
        mapped = result.mapped,
        invalid = result.invalid,
        inserted = result.inserted,
        drift_pct = result.drift_pct,
        duration_ms = result.duration_ms,
        "sync store bootstrap"
    );
    Ok(result)
}
