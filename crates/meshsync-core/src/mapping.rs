//! Mapping of signed ledger operations to sync keys
//!
//! `map_operation_to_sync_key` is pure: it reads `signature.hash` and
//! `signature.signed` and either produces the `(id, ts)` projection or a
//! typed failure code that callers can tally without string matching.
//!
//! The persistence helpers at the bottom turn the result of a ledger import
//! into the records that get upserted into a sync store.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::types::{Operation, SyncId, SyncRecord};

/// Protocol genesis (2024-01-01T00:00:00Z).
///
/// Operations signed at the unix epoch are placed here so they sort after
/// real genesis time instead of at the absolute minimum.
pub const MDIP_EPOCH_SECONDS: i64 = 1_704_067_200;

/// Why an operation could not be mapped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingErrorCode {
    MissingSignature,
    MissingSignatureHash,
    InvalidSignatureHashType,
    InvalidSignatureHashFormat,
    MissingSignatureSigned,
    InvalidSignatureSignedType,
    InvalidSignatureSignedValue,
}

impl MappingErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingErrorCode::MissingSignature => "missing_signature",
            MappingErrorCode::MissingSignatureHash => "missing_signature_hash",
            MappingErrorCode::InvalidSignatureHashType => "invalid_signature_hash_type",
            MappingErrorCode::InvalidSignatureHashFormat => "invalid_signature_hash_format",
            MappingErrorCode::MissingSignatureSigned => "missing_signature_signed",
            MappingErrorCode::InvalidSignatureSignedType => "invalid_signature_signed_type",
            MappingErrorCode::InvalidSignatureSignedValue => "invalid_signature_signed_value",
        }
    }
}

impl fmt::Display for MappingErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A per-record mapping failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {reason}")]
pub struct MappingError {
    pub code: MappingErrorCode,
    pub reason: &'static str,
}

impl MappingError {
    fn new(code: MappingErrorCode, reason: &'static str) -> Self {
        Self { code, reason }
    }
}

/// Successful projection of an operation onto the sync key space
#[derive(Debug, Clone, PartialEq)]
pub struct SyncKey {
    /// Lowercase hex digest
    pub id_hex: String,
    /// Decoded digest bytes
    pub id_bytes: SyncId,
    /// Epoch seconds (floored)
    pub ts_sec: i64,
}

fn is_missing(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

/// Map an operation to its sync key, validating in a fixed order.
pub fn map_operation_to_sync_key(operation: &Operation) -> Result<SyncKey, MappingError> {
    use MappingErrorCode::*;

    let signature = operation
        .signature()
        .ok_or_else(|| MappingError::new(MissingSignature, "operation.signature is required"))?;

    let hash = signature.get("hash");
    if is_missing(hash) {
        return Err(MappingError::new(
            MissingSignatureHash,
            "operation.signature.hash is required",
        ));
    }
    let hash = hash.and_then(Value::as_str).ok_or_else(|| {
        MappingError::new(
            InvalidSignatureHashType,
            "operation.signature.hash must be a string",
        )
    })?;

    let id_hex = hash.to_ascii_lowercase();
    let id_bytes = SyncId::from_hex(&id_hex).ok_or_else(|| {
        MappingError::new(
            InvalidSignatureHashFormat,
            "operation.signature.hash must be 64 hex characters",
        )
    })?;

    let signed = signature.get("signed");
    if is_missing(signed) {
        return Err(MappingError::new(
            MissingSignatureSigned,
            "operation.signature.signed is required",
        ));
    }
    let signed = signed.and_then(Value::as_str).ok_or_else(|| {
        MappingError::new(
            InvalidSignatureSignedType,
            "operation.signature.signed must be a string",
        )
    })?;

    let ts_ms = parse_signed_timestamp_ms(signed).ok_or_else(|| {
        MappingError::new(
            InvalidSignatureSignedValue,
            "operation.signature.signed must be a parseable timestamp",
        )
    })?;

    let ts_sec = if ts_ms == 0 {
        MDIP_EPOCH_SECONDS
    } else {
        ts_ms.div_euclid(1000)
    };

    Ok(SyncKey {
        id_hex,
        id_bytes,
        ts_sec,
    })
}

/// Parse a `signature.signed` value into epoch milliseconds.
///
/// RFC 3339 is tried first; offset-less ISO-8601 forms are read as UTC.
pub fn parse_signed_timestamp_ms(value: &str) -> Option<i64> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.timestamp_millis());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc().timestamp_millis());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().timestamp_millis())
}

// ═══════════════════════════════════════════════════════════════════════
// Persistence helpers
// ═══════════════════════════════════════════════════════════════════════

/// Drop the operations the ledger rejected by index.
///
/// Indices outside the batch are ignored.
pub fn filter_index_rejected_operations(
    batch: &[Operation],
    rejected_indices: &[usize],
) -> Vec<Operation> {
    if rejected_indices.is_empty() {
        return batch.to_vec();
    }
    let rejected: HashSet<usize> = rejected_indices
        .iter()
        .copied()
        .filter(|&i| i < batch.len())
        .collect();

    batch
        .iter()
        .enumerate()
        .filter(|(i, _)| !rejected.contains(i))
        .map(|(_, op)| op.clone())
        .collect()
}

/// Keep only operations whose hash is in `accepted_hashes` (case-insensitive).
///
/// An empty accepted list accepts nothing.
pub fn filter_operations_by_accepted_hashes(
    operations: &[Operation],
    accepted_hashes: &[String],
) -> Vec<Operation> {
    let accepted: HashSet<String> = accepted_hashes
        .iter()
        .filter(|h| !h.is_empty())
        .map(|h| h.to_ascii_lowercase())
        .collect();
    if accepted.is_empty() {
        return Vec::new();
    }

    operations
        .iter()
        .filter(|op| {
            op.signature_hash()
                .is_some_and(|h| accepted.contains(&h.to_ascii_lowercase()))
        })
        .cloned()
        .collect()
}

/// Records mapped from accepted operations, plus the number that failed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappedRecords {
    pub records: Vec<SyncRecord>,
    pub invalid: usize,
}

/// Map accepted operations to sync records, counting the failures.
pub fn map_accepted_operations_to_sync_records(operations: &[Operation]) -> MappedRecords {
    let mut mapped = MappedRecords::default();
    for operation in operations {
        match map_operation_to_sync_key(operation) {
            Ok(key) => mapped
                .records
                .push(SyncRecord::new(key.id_hex, key.ts_sec, operation.clone())),
            Err(_) => mapped.invalid += 1,
        }
    }
    mapped
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn h(c: &str) -> String {
        c.repeat(64)
    }

    fn make_op(hash: Value, signed: Value) -> Operation {
        Operation::new(json!({
            "type": "create",
            "signature": { "hash": hash, "signed": signed, "value": "sig-a" }
        }))
    }

    fn valid_op(hash: &str) -> Operation {
        make_op(json!(hash), json!("2026-02-13T00:00:00.000Z"))
    }

    fn expect_failure(operation: Operation, code: MappingErrorCode) {
        let err = map_operation_to_sync_key(&operation).unwrap_err();
        assert_eq!(err.code, code);
    }

    #[test]
    fn test_maps_valid_operation_and_normalizes_case() {
        let key = map_operation_to_sync_key(&valid_op(&h("A"))).unwrap();
        assert_eq!(key.id_hex, h("a"));
        assert_eq!(key.id_bytes.as_bytes(), &[0xaa; 32]);
        assert_eq!(key.ts_sec, 1_770_940_800);
    }

    #[test]
    fn test_unix_epoch_remapped_to_genesis() {
        let op = make_op(json!(h("a")), json!("1970-01-01T00:00:00.000Z"));
        let key = map_operation_to_sync_key(&op).unwrap();
        assert_eq!(key.ts_sec, MDIP_EPOCH_SECONDS);
    }

    #[test]
    fn test_failure_codes() {
        use MappingErrorCode::*;
        expect_failure(Operation::new(json!({ "type": "create" })), MissingSignature);
        expect_failure(make_op(json!(""), json!("2026-01-01")), MissingSignatureHash);
        expect_failure(make_op(Value::Null, json!("2026-01-01")), MissingSignatureHash);
        expect_failure(make_op(json!(123), json!("2026-01-01")), InvalidSignatureHashType);
        expect_failure(make_op(json!("xyz"), json!("2026-01-01")), InvalidSignatureHashFormat);
        expect_failure(make_op(json!(h("a")), json!("")), MissingSignatureSigned);
        expect_failure(make_op(json!(h("a")), json!(123)), InvalidSignatureSignedType);
        expect_failure(make_op(json!(h("a")), json!("not-a-date")), InvalidSignatureSignedValue);
    }

    #[test]
    fn test_hash_with_sign_prefix_rejected() {
        let hash = format!("+{}", "a".repeat(63));
        expect_failure(
            make_op(json!(hash), json!("2026-01-01")),
            MappingErrorCode::InvalidSignatureHashFormat,
        );
    }

    #[test]
    fn test_error_code_strings() {
        assert_eq!(
            MappingErrorCode::InvalidSignatureSignedValue.to_string(),
            "invalid_signature_signed_value"
        );
    }

    #[test]
    fn test_parse_signed_timestamp_variants() {
        assert_eq!(parse_signed_timestamp_ms("1970-01-01T00:00:01Z"), Some(1000));
        assert_eq!(parse_signed_timestamp_ms("1970-01-01T00:00:01.500"), Some(1500));
        assert_eq!(parse_signed_timestamp_ms("1970-01-02"), Some(86_400_000));
        assert_eq!(parse_signed_timestamp_ms("garbage"), None);
    }

    #[test]
    fn test_filter_index_rejected_ignores_out_of_range() {
        let batch = vec![valid_op(&h("a")), valid_op(&h("b")), valid_op(&h("c"))];
        let kept = filter_index_rejected_operations(&batch, &[1, 7]);
        assert_eq!(kept, vec![batch[0].clone(), batch[2].clone()]);
        assert_eq!(filter_index_rejected_operations(&batch, &[]).len(), 3);
    }

    #[test]
    fn test_filter_by_accepted_hashes() {
        let batch = vec![valid_op(&h("a")), valid_op(&h("B"))];
        let kept = filter_operations_by_accepted_hashes(&batch, &[h("b").to_uppercase()]);
        assert_eq!(kept, vec![batch[1].clone()]);
        assert!(filter_operations_by_accepted_hashes(&batch, &[]).is_empty());
        assert!(filter_operations_by_accepted_hashes(&batch, &[String::new()]).is_empty());
    }

    #[test]
    fn test_map_accepted_counts_invalid() {
        let batch = vec![
            valid_op(&h("a")),
            make_op(json!("bad"), json!("2026-01-01")),
            make_op(json!(h("c")), json!("1970-01-01T00:00:00Z")),
        ];
        let mapped = map_accepted_operations_to_sync_records(&batch);
        assert_eq!(mapped.invalid, 1);
        assert_eq!(mapped.records.len(), 2);
        assert_eq!(mapped.records[1].ts, MDIP_EPOCH_SECONDS);
    }
}
