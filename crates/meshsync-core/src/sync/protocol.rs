//! Wire protocol for mediator-to-mediator sync
//!
//! Covers capability negotiation, the negentropy frame envelope, id
//! normalization, and the JSON message set exchanged between mediators.
//!
//! ## Message flow (negentropy mode)
//!
//! ```text
//!   initiator                                   responder
//!      │── hello {capabilities} ─────────────────▶│
//!      │◀──────────────── hello {capabilities} ───│
//!      │── neg_open {window, frame} ─────────────▶│  (rebuild for window)
//!      │◀───────────────────── neg_msg {frame} ───│
//!      │── neg_msg {frame} ──────────────────────▶│  ... until converged
//!      │◀──────────────────── neg_msg {null} ─────│
//!      │── ops_push {have ops} ──────────────────▶│
//!      │── ops_req {need ids} ───────────────────▶│
//!      │◀───────────────────── ops_push {ops} ────│
//!      │── neg_open {next window} ───────────────▶│
//!      │── neg_close ────────────────────────────▶│
//! ```

use std::collections::HashSet;
use std::fmt;

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use super::windows::SyncWindow;
use crate::error::{SyncError, SyncResult};
use crate::types::{is_canonical_id_hex, Operation, SyncId};

/// Negentropy protocol version this node speaks
pub const NEGENTROPY_PROTOCOL_VERSION: u32 = 1;

// ═══════════════════════════════════════════════════════════════════════
// Capability negotiation
// ═══════════════════════════════════════════════════════════════════════

/// Strategy used to sync with a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Negentropy,
    Legacy,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Negentropy => write!(f, "negentropy"),
            SyncMode::Legacy => write!(f, "legacy"),
        }
    }
}

/// Capability payload advertised at connection time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerCapabilities {
    #[serde(default)]
    pub negentropy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negentropy_version: Option<u32>,
}

impl PeerCapabilities {
    /// What this node advertises
    pub fn local(negentropy_enabled: bool) -> Self {
        Self {
            negentropy: negentropy_enabled,
            negentropy_version: negentropy_enabled.then_some(NEGENTROPY_PROTOCOL_VERSION),
        }
    }
}

/// Capabilities as seen after normalization
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NegotiatedCapabilities {
    /// The peer sent a capability payload at all
    pub advertised: bool,
    pub negentropy: bool,
    pub version: Option<u32>,
}

pub fn normalize_peer_capabilities(caps: Option<&PeerCapabilities>) -> NegotiatedCapabilities {
    match caps {
        None => NegotiatedCapabilities::default(),
        Some(caps) => NegotiatedCapabilities {
            advertised: true,
            negentropy: caps.negentropy,
            version: caps.negentropy_version,
        },
    }
}

/// A peer that advertises negentropy without a version is assumed current.
pub fn supports_peer_negentropy(caps: &NegotiatedCapabilities, min_version: u32) -> bool {
    caps.advertised && caps.negentropy && caps.version.map_or(true, |v| v >= min_version)
}

/// Pick a mode from the peer's capabilities alone.
///
/// Absent or explicitly legacy capabilities mean legacy; a negentropy peer
/// below `min_version` is incompatible and gets `None`.
pub fn choose_sync_mode(caps: &NegotiatedCapabilities, min_version: u32) -> Option<SyncMode> {
    if supports_peer_negentropy(caps, min_version) {
        Some(SyncMode::Negentropy)
    } else if !caps.advertised || !caps.negentropy {
        Some(SyncMode::Legacy)
    } else {
        None
    }
}

/// Why a connect-time mode was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectSyncModeReason {
    NegentropySupported,
    MissingCapabilities,
    NegentropyDisabled,
    VersionMismatch,
    LegacyDisabled,
}

impl fmt::Display for ConnectSyncModeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectSyncModeReason::NegentropySupported => "negentropy_supported",
            ConnectSyncModeReason::MissingCapabilities => "missing_capabilities",
            ConnectSyncModeReason::NegentropyDisabled => "negentropy_disabled",
            ConnectSyncModeReason::VersionMismatch => "version_mismatch",
            ConnectSyncModeReason::LegacyDisabled => "legacy_disabled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectSyncModeDecision {
    /// `None` refuses sync with this peer
    pub mode: Option<SyncMode>,
    pub reason: ConnectSyncModeReason,
}

/// Combine peer capabilities with the local enable flags
pub fn choose_connect_sync_mode(
    caps: &NegotiatedCapabilities,
    min_version: u32,
    legacy_sync_enabled: bool,
    negentropy_enabled: bool,
) -> ConnectSyncModeDecision {
    use ConnectSyncModeReason::*;

    let (mode, reason) = if negentropy_enabled && supports_peer_negentropy(caps, min_version) {
        (Some(SyncMode::Negentropy), NegentropySupported)
    } else if !legacy_sync_enabled {
        (None, LegacyDisabled)
    } else if !negentropy_enabled {
        (Some(SyncMode::Legacy), NegentropyDisabled)
    } else if !caps.advertised {
        (Some(SyncMode::Legacy), MissingCapabilities)
    } else if !caps.negentropy {
        (Some(SyncMode::Legacy), NegentropyDisabled)
    } else {
        (Some(SyncMode::Legacy), VersionMismatch)
    };
    ConnectSyncModeDecision { mode, reason }
}

// ═══════════════════════════════════════════════════════════════════════
// Frame envelope
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameEncoding {
    Utf8,
    Base64,
}

/// Tagged negentropy payload as carried inside JSON messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegentropyFrame {
    pub encoding: FrameEncoding,
    pub payload: String,
}

/// Decoded frame content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramePayload {
    Text(String),
    Binary(Vec<u8>),
}

impl FramePayload {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            FramePayload::Text(text) => text.into_bytes(),
            FramePayload::Binary(bytes) => bytes,
        }
    }
}

impl From<Vec<u8>> for FramePayload {
    fn from(bytes: Vec<u8>) -> Self {
        FramePayload::Binary(bytes)
    }
}

impl From<&[u8]> for FramePayload {
    fn from(bytes: &[u8]) -> Self {
        FramePayload::Binary(bytes.to_vec())
    }
}

impl From<String> for FramePayload {
    fn from(text: String) -> Self {
        FramePayload::Text(text)
    }
}

impl From<&str> for FramePayload {
    fn from(text: &str) -> Self {
        FramePayload::Text(text.to_string())
    }
}

/// Wrap text as `utf8` and binary as `base64`
pub fn encode_negentropy_frame(payload: impl Into<FramePayload>) -> NegentropyFrame {
    match payload.into() {
        FramePayload::Text(text) => NegentropyFrame {
            encoding: FrameEncoding::Utf8,
            payload: text,
        },
        FramePayload::Binary(bytes) => NegentropyFrame {
            encoding: FrameEncoding::Base64,
            payload: base64::engine::general_purpose::STANDARD.encode(bytes),
        },
    }
}

/// Exact inverse of [`encode_negentropy_frame`]
pub fn decode_negentropy_frame(frame: &NegentropyFrame) -> SyncResult<FramePayload> {
    match frame.encoding {
        FrameEncoding::Utf8 => Ok(FramePayload::Text(frame.payload.clone())),
        FrameEncoding::Base64 => base64::engine::general_purpose::STANDARD
            .decode(&frame.payload)
            .map(FramePayload::Binary)
            .map_err(|e| SyncError::InvalidFrame(format!("bad base64 payload: {e}"))),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Ids
// ═══════════════════════════════════════════════════════════════════════

/// An id as received from a peer or the primitive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawId {
    Hex(String),
    Bytes(Vec<u8>),
}

impl From<&str> for RawId {
    fn from(s: &str) -> Self {
        RawId::Hex(s.to_string())
    }
}

impl From<String> for RawId {
    fn from(s: String) -> Self {
        RawId::Hex(s)
    }
}

impl From<&String> for RawId {
    fn from(s: &String) -> Self {
        RawId::Hex(s.clone())
    }
}

impl From<Vec<u8>> for RawId {
    fn from(bytes: Vec<u8>) -> Self {
        RawId::Bytes(bytes)
    }
}

impl From<&[u8]> for RawId {
    fn from(bytes: &[u8]) -> Self {
        RawId::Bytes(bytes.to_vec())
    }
}

impl From<SyncId> for RawId {
    fn from(id: SyncId) -> Self {
        RawId::Bytes(id.as_bytes().to_vec())
    }
}

/// Lowercase, de-duplicate (first seen wins), and drop malformed ids.
pub fn normalize_negentropy_ids<I>(ids: impl IntoIterator<Item = I>) -> Vec<String>
where
    I: Into<RawId>,
{
    let mut seen = HashSet::new();
    ids.into_iter()
        .map(|id| match id.into() {
            RawId::Hex(s) => s.to_ascii_lowercase(),
            RawId::Bytes(bytes) => hex::encode(bytes),
        })
        .filter(|hex| is_canonical_id_hex(hex))
        .filter(|hex| seen.insert(hex.clone()))
        .collect()
}

/// Unique lowercase hashes of operations with a well-formed `signature.hash`
pub fn extract_operation_hashes(operations: &[Operation]) -> Vec<String> {
    normalize_negentropy_ids(operations.iter().filter_map(|op| op.signature_hash()))
}

// ═══════════════════════════════════════════════════════════════════════
// Mediator messages
// ═══════════════════════════════════════════════════════════════════════

/// JSON message exchanged between mediators, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MediatorMessage {
    /// Identify this node and advertise capabilities
    Hello {
        node: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        capabilities: Option<PeerCapabilities>,
    },

    /// Liveness check listing the sender's peers
    Ping {
        node: String,
        #[serde(default)]
        peers: Vec<String>,
    },

    /// Legacy: ask the receiver to share its whole ledger
    Sync { node: String },

    /// Legacy: operations shared in answer to `sync`
    Batch { node: String, data: Vec<Operation> },

    /// Legacy: newly submitted operations, relayed across the mesh
    Queue {
        node: String,
        relays: Vec<String>,
        data: Vec<Operation>,
    },

    /// Open reconciliation of one window
    NegOpen {
        session_id: u64,
        window: SyncWindow,
        frame: NegentropyFrame,
    },

    /// Reconciliation round; `frame: null` ends the window
    NegMsg {
        session_id: u64,
        frame: Option<NegentropyFrame>,
    },

    /// Session finished
    NegClose { session_id: u64 },

    /// Request operations by id
    OpsReq { session_id: u64, ids: Vec<String> },

    /// Operations pushed to the receiver
    OpsPush {
        session_id: u64,
        data: Vec<Operation>,
    },
}

impl MediatorMessage {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            MediatorMessage::Hello { .. } => "hello",
            MediatorMessage::Ping { .. } => "ping",
            MediatorMessage::Sync { .. } => "sync",
            MediatorMessage::Batch { .. } => "batch",
            MediatorMessage::Queue { .. } => "queue",
            MediatorMessage::NegOpen { .. } => "neg_open",
            MediatorMessage::NegMsg { .. } => "neg_msg",
            MediatorMessage::NegClose { .. } => "neg_close",
            MediatorMessage::OpsReq { .. } => "ops_req",
            MediatorMessage::OpsPush { .. } => "ops_push",
        }
    }

    /// Whether this message belongs to the negentropy flow
    pub fn is_negentropy(&self) -> bool {
        matches!(
            self,
            MediatorMessage::NegOpen { .. }
                | MediatorMessage::NegMsg { .. }
                | MediatorMessage::NegClose { .. }
                | MediatorMessage::OpsReq { .. }
                | MediatorMessage::OpsPush { .. }
        )
    }

    /// Whether this message belongs to the legacy flood flow
    pub fn is_legacy(&self) -> bool {
        matches!(
            self,
            MediatorMessage::Sync { .. }
                | MediatorMessage::Batch { .. }
                | MediatorMessage::Queue { .. }
        )
    }

    pub fn encode(&self) -> SyncResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| SyncError::Serialization(e.to_string()))
    }

    /// Decode a message; unknown types and malformed JSON are protocol errors.
    pub fn decode(bytes: &[u8]) -> SyncResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| SyncError::Protocol(e.to_string()))
    }
}
