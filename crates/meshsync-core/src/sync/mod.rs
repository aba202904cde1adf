//! Operation synchronization layer
//!
//! Windowed set reconciliation between mediators, with a legacy
//! full-ledger flood as fallback.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Mediator (crate::mediator)                                     │
//! │  ├── ConnectionManager (peer key -> negotiated mode, sessions) │
//! │  ├── WorkQueue "import" (ledger apply, then sync index)        │
//! │  ├── WorkQueue "export" (full-ledger shares)                   │
//! │  ├── WorkQueue "sync" (legacy sync requests after imports)     │
//! │  └── Ticker x3 (local queue, connection health, repair)        │
//! │                                                                 │
//! │  NegentropyAdapter (one per session)                           │
//! │  ├── WindowPlanner (recent window first, then older windows)   │
//! │  └── OperationSyncStore snapshot per window rebuild            │
//! │                                                                 │
//! │  TransferBatcher                                               │
//! │  ├── id chunks for ops_req                                     │
//! │  └── count/byte-bounded batches for ops_push                   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modes
//!
//! - **Negentropy**: range-based reconciliation per window; only the
//!   differing operations cross the wire
//! - **Legacy**: `sync` asks the peer for its whole ledger, answered with
//!   `batch` messages; new operations flood as `queue`
//!
//! Mode choice and repair scheduling are pure functions in [`policy`].

pub mod adapter;
pub mod connections;
pub mod events;
pub mod policy;
pub mod protocol;
pub mod queue;
pub mod ticker;
pub mod transfer;
pub mod transport;
pub mod windows;

pub use adapter::{
    AdapterOptions, AdapterState, NegentropyAdapter, ReconcileResult, ResolvedIds, RoundOutcome,
    SessionOptions, SessionStats, WindowStats,
};
pub use connections::{ConnectionManager, ConnectionState};
pub use events::{ImportSource, ImportSummary, MediatorEvent};
pub use policy::{
    should_accept_legacy_sync, should_schedule_periodic_repair,
    should_start_connect_time_negentropy, RepairContext,
};
pub use protocol::{
    choose_connect_sync_mode, choose_sync_mode, decode_negentropy_frame, encode_negentropy_frame,
    extract_operation_hashes, normalize_negentropy_ids, normalize_peer_capabilities,
    supports_peer_negentropy, ConnectSyncModeDecision, ConnectSyncModeReason, FrameEncoding,
    FramePayload, MediatorMessage, NegentropyFrame, NegotiatedCapabilities, PeerCapabilities,
    RawId, SyncMode, NEGENTROPY_PROTOCOL_VERSION,
};
pub use queue::{QueueTracker, WorkQueue};
pub use ticker::Ticker;
pub use transfer::{
    chunk_ids, chunk_operations_for_push, estimate_operation_bytes, PushLimits, TransferBatcher,
};
pub use transport::{ChannelTransport, PeerTransport};
pub use windows::{SyncWindow, WindowPlanner};
