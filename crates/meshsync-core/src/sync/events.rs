//! Events broadcast by the mediator
//!
//! Consumers (logging sinks, metrics exporters, tests) subscribe through
//! [`crate::Mediator::subscribe`].

use serde::Serialize;

use super::adapter::{SessionStats, WindowStats};
use super::protocol::{ConnectSyncModeReason, SyncMode};
use crate::bootstrap::BootstrapResult;
use crate::metrics::MetricsSnapshot;

/// Where received operations came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportSource {
    /// `ops_push` after reconciliation
    Negentropy,
    /// Legacy full-ledger `batch`
    LegacyBatch,
    /// Relayed `queue` of newly submitted operations
    Queue,
    /// Operations submitted on this node
    Local,
}

/// Totals from one import queue task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub received: usize,
    pub rejected: usize,
    pub invalid: usize,
    pub inserted: usize,
    pub failed_chunks: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MediatorEvent {
    PeerConnected {
        peer_key: String,
        is_initiator: bool,
    },
    PeerDisconnected {
        peer_key: String,
        expired: bool,
    },
    ModeNegotiated {
        peer_key: String,
        node_name: String,
        mode: Option<SyncMode>,
        reason: ConnectSyncModeReason,
    },
    Bootstrapped(BootstrapResult),
    WindowCompleted {
        peer_key: String,
        stats: WindowStats,
        have: usize,
        need: usize,
    },
    SessionCompleted {
        peer_key: String,
        session_id: u64,
        stats: SessionStats,
    },
    SessionFailed {
        peer_key: String,
        session_id: u64,
        error: String,
    },
    OperationsImported {
        peer_key: String,
        source: ImportSource,
        summary: ImportSummary,
    },
    MessageDropped {
        peer_key: String,
        reason: String,
    },
    Metrics(MetricsSnapshot),
}
