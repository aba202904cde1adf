//! Core data model for the sync index
//!
//! A sync record is the `(id, ts)` projection of a signed ledger operation,
//! carried together with the opaque operation payload so that resolved ids
//! can be turned back into pushable operations without a ledger round trip.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default page size for `iterate_sorted` when no limit is given
pub const DEFAULT_ITERATE_LIMIT: usize = 1000;

/// Opaque signed ledger operation.
///
/// The engine never interprets the document body; it only reads
/// `signature.hash` and `signature.signed` when mapping to a sync key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Operation(Value);

impl Operation {
    /// Wrap a JSON value as an operation
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Borrow the raw JSON value
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Consume into the raw JSON value
    pub fn into_value(self) -> Value {
        self.0
    }

    /// The `signature` object, if present and not null
    pub fn signature(&self) -> Option<&Value> {
        self.0.get("signature").filter(|v| !v.is_null())
    }

    /// `signature.hash` when it is a string
    pub fn signature_hash(&self) -> Option<&str> {
        self.signature()?.get("hash")?.as_str()
    }

    /// `signature.signed` when it is a string
    pub fn signed_at(&self) -> Option<&str> {
        self.signature()?.get("signed")?.as_str()
    }
}

impl From<Value> for Operation {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// 32-byte operation digest used as the reconciliation id
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SyncId([u8; 32]);

impl SyncId {
    /// Length in bytes
    pub const LEN: usize = 32;

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse a 64-character hex string, accepting either case.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != Self::LEN * 2 {
            return None;
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).ok()?;
        Some(Self(bytes))
    }

    /// Lowercase hex encoding (the wire format)
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for SyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for SyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SyncId({})", &self.to_hex()[..16])
    }
}

impl From<negentropy::Id> for SyncId {
    fn from(id: negentropy::Id) -> Self {
        Self(id.to_bytes())
    }
}

impl From<SyncId> for negentropy::Id {
    fn from(id: SyncId) -> Self {
        negentropy::Id::from_byte_array(id.0)
    }
}

/// Check the canonical id wire format: exactly 64 lowercase hex chars.
pub fn is_canonical_id_hex(s: &str) -> bool {
    s.len() == SyncId::LEN * 2 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// A record ready to be upserted into a sync store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    /// Lowercase hex digest
    pub id: String,
    /// Epoch seconds
    pub ts: i64,
    /// Full signed operation
    pub operation: Operation,
}

impl SyncRecord {
    pub fn new(id: impl Into<String>, ts: i64, operation: Operation) -> Self {
        Self {
            id: id.into(),
            ts,
            operation,
        }
    }
}

/// A record as held by a sync store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperationRecord {
    /// Lowercase hex digest, unique within a store
    pub id: String,
    /// Epoch seconds
    pub ts: i64,
    /// Full signed operation
    pub operation: Operation,
    /// Local insertion sequence. Never compared across peers.
    pub inserted_at: u64,
}

impl SyncOperationRecord {
    /// Keyset cursor positioned on this record
    pub fn cursor(&self) -> SyncCursor {
        SyncCursor {
            ts: self.ts,
            id: self.id.clone(),
        }
    }
}

/// Keyset cursor over the `(ts, id)` ordering.
///
/// Field order matters: the derived `Ord` compares `ts` first, then `id`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SyncCursor {
    pub ts: i64,
    pub id: String,
}

impl SyncCursor {
    pub fn new(ts: i64, id: impl Into<String>) -> Self {
        Self { ts, id: id.into() }
    }
}

/// Query options for `iterate_sorted`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IterateOptions {
    /// Maximum rows returned (defaults to [`DEFAULT_ITERATE_LIMIT`])
    pub limit: Option<usize>,
    /// Inclusive lower timestamp bound
    pub from_ts: Option<i64>,
    /// Inclusive upper timestamp bound
    pub to_ts: Option<i64>,
    /// Only rows strictly after this `(ts, id)` pair
    pub after: Option<SyncCursor>,
}

impl IterateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_range(mut self, from_ts: i64, to_ts: i64) -> Self {
        self.from_ts = Some(from_ts);
        self.to_ts = Some(to_ts);
        self
    }

    pub fn with_after(mut self, after: Option<SyncCursor>) -> Self {
        self.after = after;
        self
    }

    /// Effective page size
    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_ITERATE_LIMIT)
    }

    /// Whether a record falls within the bounds and after the cursor
    pub fn admits(&self, ts: i64, id: &str) -> bool {
        if self.from_ts.is_some_and(|from| ts < from) {
            return false;
        }
        if self.to_ts.is_some_and(|to| ts > to) {
            return false;
        }
        match &self.after {
            Some(after) => (ts, id) > (after.ts, after.id.as_str()),
            None => true,
        }
    }
}
