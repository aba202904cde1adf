//! Sync policy gates
//!
//! Pure decisions with no I/O. The mediator consults these before accepting
//! legacy traffic or starting a reconciliation session.

use super::protocol::SyncMode;

/// Accept a legacy `sync`/`batch` only from a peer negotiated as legacy.
///
/// An unknown or negentropy-capable peer is never silently downgraded.
pub fn should_accept_legacy_sync(peer_mode: Option<SyncMode>, legacy_sync_enabled: bool) -> bool {
    legacy_sync_enabled && peer_mode == Some(SyncMode::Legacy)
}

/// Only the connection initiator opens a session at connect time
pub fn should_start_connect_time_negentropy(
    mode: Option<SyncMode>,
    has_active_session: bool,
    is_initiator: bool,
) -> bool {
    is_initiator && mode == Some(SyncMode::Negentropy) && !has_active_session
}

/// Inputs for [`should_schedule_periodic_repair`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairContext {
    pub sync_mode: Option<SyncMode>,
    pub has_active_session: bool,
    pub import_queue_length: usize,
    /// Negentropy sessions active across the whole process
    pub active_negentropy_sessions: usize,
    /// `None` if this connection was never repaired
    pub last_repair_at_ms: Option<i64>,
    pub now_ms: i64,
    pub repair_interval_ms: i64,
    pub is_initiator: bool,
}

/// Periodic repair runs only when every gate is open.
///
/// At most one negentropy session runs process-wide, and repair yields to a
/// non-empty import queue.
pub fn should_schedule_periodic_repair(ctx: &RepairContext) -> bool {
    if ctx.sync_mode != Some(SyncMode::Negentropy) {
        return false;
    }
    if !ctx.is_initiator || ctx.has_active_session {
        return false;
    }
    if ctx.import_queue_length > 0 || ctx.active_negentropy_sessions > 0 {
        return false;
    }
    match ctx.last_repair_at_ms {
        None => true,
        Some(last) => ctx.now_ms.saturating_sub(last) >= ctx.repair_interval_ms,
    }
}
