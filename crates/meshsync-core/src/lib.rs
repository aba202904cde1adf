//! MeshSync Core Library
//!
//! Windowed set reconciliation for a peer-to-peer operation ledger.
//!
//! ## Overview
//!
//! Mediators exchange signed ledger operations over an unreliable mesh.
//! Instead of re-sending the whole ledger on every contact, each node keeps
//! a sync index of `(ts, id)` rows and reconciles it window by window with
//! range-based set reconciliation; only the operations one side is missing
//! cross the wire.
//!
//! ## Core Pieces
//!
//! - **Sync index**: [`OperationSyncStore`], in memory or on redb
//! - **Mapping**: ledger operation -> `(id, ts)` sync key
//! - **Reconciliation**: [`NegentropyAdapter`] over planned [`SyncWindow`]s
//! - **Mediator**: negotiation, sessions, import/export/sync queues and loops
//!
//! ## Quick Start
//!
//! ```ignore
//! use meshsync_core::{MemorySyncStore, NegentropyAdapter, AdapterOptions, SessionOptions};
//!
//! let mut local = NegentropyAdapter::create(MemorySyncStore::new(), AdapterOptions::default())?;
//! let mut remote = NegentropyAdapter::create(MemorySyncStore::new(), AdapterOptions::default())?;
//!
//! let stats = local.run_windowed_session_with_peer(&mut remote, SessionOptions::default())?;
//! println!("have {} need {}", stats.have_ids.len(), stats.need_ids.len());
//! ```

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod ledger;
pub mod mapping;
pub mod mediator;
pub mod metrics;
pub mod storage;
pub mod sync;
pub mod types;

// Re-exports
pub use bootstrap::{
    bootstrap_sync_store_if_empty, BootstrapOptions, BootstrapResult, BootstrapSkipReason,
};
pub use config::MediatorConfig;
pub use error::{SyncError, SyncResult};
pub use ledger::{
    ApplyQueue, ExportableLedger, ImportReport, Ledger, LedgerEvent, LocalQueue, MemoryLedger,
    ProcessReport,
};
pub use mapping::{
    filter_index_rejected_operations, filter_operations_by_accepted_hashes,
    map_accepted_operations_to_sync_records, map_operation_to_sync_key, MappedRecords,
    MappingError, MappingErrorCode, SyncKey, MDIP_EPOCH_SECONDS,
};
pub use mediator::Mediator;
pub use metrics::{
    collect_queue_delay_samples, message_bytes, safe_rate, AggregateMetric, MetricsSnapshot,
    SyncMetrics,
};
pub use storage::{MemorySyncStore, OperationSyncStore, RedbSyncStore};
pub use sync::{
    AdapterOptions, ChannelTransport, MediatorEvent, MediatorMessage, NegentropyAdapter,
    PeerTransport, SessionOptions, SessionStats, SyncMode, SyncWindow, WindowPlanner, WindowStats,
};
pub use types::*;
