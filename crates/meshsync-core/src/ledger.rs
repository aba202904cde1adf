//! Ledger collaborator interfaces
//!
//! The mediator never owns the canonical ledger. It reads exports from it,
//! submits received operations to its apply queue, and drains operations
//! submitted locally. Each capability is a narrow trait so tests can use
//! [`MemoryLedger`].

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SyncResult;
use crate::types::{is_canonical_id_hex, Operation};

/// Registry name stamped on events this mediator imports
pub const REGISTRY: &str = "hyperswarm";

/// An operation as recorded by the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub registry: String,
    /// ISO-8601 receive time
    pub time: String,
    /// `[receive_ms, index_in_batch]`
    #[serde(default)]
    pub ordinal: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,
}

impl LedgerEvent {
    /// Wrap received operations as events for import, preserving batch order.
    pub fn wrap_batch(registry: &str, operations: &[Operation], now_ms: i64) -> Vec<Self> {
        let time = chrono::DateTime::from_timestamp_millis(now_ms)
            .unwrap_or_default()
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        operations
            .iter()
            .enumerate()
            .map(|(i, op)| LedgerEvent {
                registry: registry.to_string(),
                time: time.clone(),
                ordinal: vec![now_ms, i as i64],
                operation: Some(op.clone()),
            })
            .collect()
    }
}

/// Outcome of submitting one batch to the apply queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub queued: usize,
    pub processed: usize,
    pub rejected: usize,
    pub total: usize,
    /// Positions in the submitted batch that were rejected
    #[serde(default)]
    pub rejected_indices: Vec<usize>,
}

/// Outcome of applying queued events
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessReport {
    pub added: usize,
    pub merged: usize,
    pub rejected: usize,
    pub pending: usize,
}

/// Read side of the ledger used for bootstrap and legacy sharing
#[async_trait]
pub trait ExportableLedger: Send + Sync {
    async fn get_dids(&self) -> SyncResult<Vec<String>>;

    /// Export events for `dids`, or for every DID when `None`
    async fn export_batch(&self, dids: Option<&[String]>) -> SyncResult<Vec<LedgerEvent>>;
}

/// Write side of the ledger; applications are serialized by the caller
#[async_trait]
pub trait ApplyQueue: Send + Sync {
    async fn import_batch(&self, events: Vec<LedgerEvent>) -> SyncResult<ImportReport>;

    async fn process_events(&self) -> SyncResult<ProcessReport>;
}

/// Operations submitted on this node that still need to be shared
#[async_trait]
pub trait LocalQueue: Send + Sync {
    async fn get_queue(&self, registry: &str) -> SyncResult<Vec<Operation>>;

    async fn clear_queue(&self, registry: &str, operations: &[Operation]) -> SyncResult<()>;
}

/// Every capability the mediator needs from a ledger
pub trait Ledger: ExportableLedger + ApplyQueue + LocalQueue {}

impl<T: ExportableLedger + ApplyQueue + LocalQueue> Ledger for T {}

#[derive(Default)]
struct LedgerState {
    /// DID -> operations in apply order
    dids: BTreeMap<String, Vec<Operation>>,
    hashes: HashSet<String>,
    pending: Vec<Operation>,
    local_queue: Vec<Operation>,
}

/// In-memory ledger.
///
/// An operation belongs to the DID named in its `did` field; operations
/// without one (creates) found a DID keyed by their own hash.
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

fn did_for(operation: &Operation) -> Option<String> {
    if let Some(did) = operation.as_value().get("did").and_then(|v| v.as_str()) {
        return Some(did.to_string());
    }
    operation
        .signature_hash()
        .map(|hash| format!("did:mdip:{}", hash.to_ascii_lowercase()))
}

fn valid_hash(operation: &Operation) -> Option<String> {
    let hash = operation.signature_hash()?.to_ascii_lowercase();
    is_canonical_id_hex(&hash).then_some(hash)
}

impl LedgerState {
    /// Returns false if the operation was already present
    fn apply(&mut self, operation: Operation) -> bool {
        let (Some(hash), Some(did)) = (valid_hash(&operation), did_for(&operation)) else {
            return false;
        };
        if !self.hashes.insert(hash) {
            return false;
        }
        self.dids.entry(did).or_default().push(operation);
        true
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger pre-populated with already-applied operations
    pub fn with_operations(operations: impl IntoIterator<Item = Operation>) -> Self {
        let ledger = Self::new();
        {
            let mut state = ledger.state.lock();
            for operation in operations {
                state.apply(operation);
            }
        }
        ledger
    }

    /// Apply an operation created on this node and queue it for sharing
    pub fn submit(&self, operation: Operation) -> bool {
        let mut state = self.state.lock();
        let added = state.apply(operation.clone());
        if added {
            state.local_queue.push(operation);
        }
        added
    }

    /// Every applied operation, grouped by DID
    pub fn operations(&self) -> Vec<Operation> {
        self.state.lock().dids.values().flatten().cloned().collect()
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.state.lock().hashes.contains(&hash.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.state.lock().hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ExportableLedger for MemoryLedger {
    async fn get_dids(&self) -> SyncResult<Vec<String>> {
        Ok(self.state.lock().dids.keys().cloned().collect())
    }

    async fn export_batch(&self, dids: Option<&[String]>) -> SyncResult<Vec<LedgerEvent>> {
        let state = self.state.lock();
        let selected: Vec<&Operation> = match dids {
            None => state.dids.values().flatten().collect(),
            Some(dids) => dids
                .iter()
                .filter_map(|did| state.dids.get(did))
                .flatten()
                .collect(),
        };
        Ok(selected
            .into_iter()
            .map(|op| LedgerEvent {
                registry: "local".to_string(),
                time: op.signed_at().unwrap_or_default().to_string(),
                ordinal: Vec::new(),
                operation: Some(op.clone()),
            })
            .collect())
    }
}

#[async_trait]
impl ApplyQueue for MemoryLedger {
    async fn import_batch(&self, events: Vec<LedgerEvent>) -> SyncResult<ImportReport> {
        let mut state = self.state.lock();
        let mut report = ImportReport {
            total: events.len(),
            ..ImportReport::default()
        };

        for (index, event) in events.into_iter().enumerate() {
            match event.operation {
                Some(op) if valid_hash(&op).is_some() && did_for(&op).is_some() => {
                    state.pending.push(op);
                    report.queued += 1;
                }
                _ => {
                    report.rejected += 1;
                    report.rejected_indices.push(index);
                }
            }
        }

        debug!(
            queued = report.queued,
            rejected = report.rejected,
            "memory ledger import"
        );
        Ok(report)
    }

    async fn process_events(&self) -> SyncResult<ProcessReport> {
        let mut state = self.state.lock();
        let pending = std::mem::take(&mut state.pending);
        let mut report = ProcessReport::default();
        for op in pending {
            if state.apply(op) {
                report.added += 1;
            } else {
                report.merged += 1;
            }
        }
        Ok(report)
    }
}

#[async_trait]
impl LocalQueue for MemoryLedger {
    async fn get_queue(&self, _registry: &str) -> SyncResult<Vec<Operation>> {
        Ok(self.state.lock().local_queue.clone())
    }

    async fn clear_queue(&self, _registry: &str, operations: &[Operation]) -> SyncResult<()> {
        let cleared: HashSet<String> = operations.iter().filter_map(valid_hash).collect();
        self.state
            .lock()
            .local_queue
            .retain(|op| valid_hash(op).map_or(false, |h| !cleared.contains(&h)));
        Ok(())
    }
}
