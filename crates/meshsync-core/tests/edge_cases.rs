//! Edge case and boundary condition tests
//!
//! These tests verify the system handles unusual inputs,
//! error conditions, and boundary values correctly.

use std::sync::Arc;

use meshsync_core::sync::protocol::{decode_negentropy_frame, FrameEncoding, NegentropyFrame};
use meshsync_core::sync::transfer::{chunk_ids, chunk_operations_for_push};
use meshsync_core::sync::PushLimits;
use meshsync_core::{
    bootstrap_sync_store_if_empty, filter_index_rejected_operations,
    map_accepted_operations_to_sync_records, map_operation_to_sync_key, safe_rate,
    AdapterOptions, AggregateMetric, BootstrapOptions, MappingErrorCode, MediatorConfig,
    MediatorMessage, MemoryLedger, MemorySyncStore, NegentropyAdapter, Operation,
    OperationSyncStore, SyncError, SyncRecord, WindowPlanner, MDIP_EPOCH_SECONDS,
};
use serde_json::json;

fn op(hash: &str, signed: &str) -> Operation {
    Operation::new(json!({ "signature": { "hash": hash, "signed": signed } }))
}

// ============================================================================
// Mapping
// ============================================================================

/// Zero-timestamped operations land on the protocol epoch, not 1970
#[test]
fn test_epoch_zero_is_remapped() {
    let key = map_operation_to_sync_key(&op(&"a".repeat(64), "1970-01-01T00:00:00.000Z")).unwrap();
    assert_eq!(key.ts_sec, MDIP_EPOCH_SECONDS);
}

/// Sub-second timestamps floor to the second
#[test]
fn test_fractional_seconds_floor() {
    let key = map_operation_to_sync_key(&op(&"b".repeat(64), "2025-03-01T10:00:00.999Z")).unwrap();
    let whole = map_operation_to_sync_key(&op(&"b".repeat(64), "2025-03-01T10:00:00Z")).unwrap();
    assert_eq!(key.ts_sec, whole.ts_sec);
}

/// Every failure mode is reported with its own code
#[test]
fn test_each_failure_has_a_code() {
    let cases = [
        (json!({}), MappingErrorCode::MissingSignature),
        (json!({ "signature": {} }), MappingErrorCode::MissingSignatureHash),
        (json!({ "signature": { "hash": 7 } }), MappingErrorCode::InvalidSignatureHashType),
        (json!({ "signature": { "hash": "abc" } }), MappingErrorCode::InvalidSignatureHashFormat),
        (
            json!({ "signature": { "hash": "c".repeat(64) } }),
            MappingErrorCode::MissingSignatureSigned,
        ),
        (
            json!({ "signature": { "hash": "c".repeat(64), "signed": 12 } }),
            MappingErrorCode::InvalidSignatureSignedType,
        ),
        (
            json!({ "signature": { "hash": "c".repeat(64), "signed": "yesterday" } }),
            MappingErrorCode::InvalidSignatureSignedValue,
        ),
    ];
    for (value, code) in cases {
        let err = map_operation_to_sync_key(&Operation::new(value)).unwrap_err();
        assert_eq!(err.code, code);
    }
}

/// A 64-character hash that is not hex is a format error
#[test]
fn test_non_hex_hash_rejected() {
    let err = map_operation_to_sync_key(&op(&"z".repeat(64), "2025-01-01T00:00:00Z")).unwrap_err();
    assert_eq!(err.code, MappingErrorCode::InvalidSignatureHashFormat);
}

/// Invalid operations are counted, never fatal
#[test]
fn test_mixed_batch_maps_valid_only() {
    let batch = vec![
        op(&"a".repeat(64), "2025-01-01T00:00:00Z"),
        Operation::new(json!({ "nope": true })),
        op(&"B".repeat(64), "2025-01-02T00:00:00Z"),
    ];
    let mapped = map_accepted_operations_to_sync_records(&batch);
    assert_eq!(mapped.records.len(), 2);
    assert_eq!(mapped.invalid, 1);
    assert_eq!(mapped.records[1].id, "b".repeat(64));
}

/// Rejected indices outside the batch are ignored
#[test]
fn test_out_of_range_rejections_ignored() {
    let batch = vec![op(&"a".repeat(64), "x"), op(&"b".repeat(64), "y")];
    let kept = filter_index_rejected_operations(&batch, &[1, 5, 99]);
    assert_eq!(kept, vec![batch[0].clone()]);
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_planner_rejects_zero_bounds() {
    assert!(WindowPlanner::new(0, 30, 10).is_err());
    assert!(WindowPlanner::new(7, 0, 10).is_err());
    assert!(WindowPlanner::new(7, 30, 0).is_err());
}

#[test]
fn test_planner_rejects_negative_now() {
    let planner = WindowPlanner::new(7, 30, 10).unwrap();
    assert!(matches!(planner.plan(-1, Some(0)), Err(SyncError::InvalidTimestamp(_))));
}

#[test]
fn test_future_records_yield_recent_window_only() {
    let planner = WindowPlanner::new(7, 30, 10).unwrap();
    let windows = planner.plan(1_000_000, Some(5_000_000)).unwrap();
    assert_eq!(windows.len(), 1);
    assert_eq!(windows[0].name, "recent");
}

#[test]
fn test_frame_limit_boundary() {
    let store = || Arc::new(MemorySyncStore::new());
    for (limit, ok) in [(0u64, true), (4095, false), (4096, true), (1 << 20, true)] {
        let options = AdapterOptions {
            frame_size_limit: limit,
            ..AdapterOptions::default()
        };
        assert_eq!(NegentropyAdapter::create(store(), options).is_ok(), ok, "limit {limit}");
    }
}

#[test]
fn test_zero_chunk_sizes_are_config_errors() {
    let ids = vec!["a".to_string()];
    assert!(matches!(chunk_ids(&ids, 0), Err(SyncError::Config { .. })));

    let limits = PushLimits {
        max_ops_per_push: 0,
        max_bytes_per_push: 10,
    };
    assert!(chunk_operations_for_push(Vec::new(), limits).is_err());
}

#[test]
fn test_empty_inputs_yield_no_chunks() {
    let ids: Vec<String> = Vec::new();
    assert!(chunk_ids(&ids, 10).unwrap().is_empty());
    assert!(chunk_operations_for_push(Vec::new(), PushLimits::default())
        .unwrap()
        .is_empty());
}

#[test]
fn test_config_error_names_setting() {
    let err = MediatorConfig::from_vars([("MESHSYNC_NEGENTROPY_FRAME_SIZE_LIMIT", "100")]).unwrap_err();
    assert!(err.to_string().contains("expected 0 or >= 4096"));

    let err = MediatorConfig::from_vars([("MESHSYNC_NEGENTROPY_ENABLE", "yes")]).unwrap_err();
    assert!(err.to_string().contains("expected true or false"));
}

// ============================================================================
// Wire
// ============================================================================

#[test]
fn test_bad_base64_frame() {
    let frame = NegentropyFrame {
        encoding: FrameEncoding::Base64,
        payload: "***".into(),
    };
    assert!(matches!(decode_negentropy_frame(&frame), Err(SyncError::InvalidFrame(_))));
}

#[test]
fn test_unknown_message_type() {
    let err = MediatorMessage::decode(br#"{"type":"gossip","node":"x"}"#).unwrap_err();
    assert!(matches!(err, SyncError::Protocol(_)));
    assert!(MediatorMessage::decode(b"").is_err());
}

#[test]
fn test_garbage_frame_is_reconciliation_error() {
    let mut adapter =
        NegentropyAdapter::create(Arc::new(MemorySyncStore::new()), AdapterOptions::default())
            .unwrap();
    assert!(matches!(
        adapter.respond(&[0xff, 0x00, 0x13]),
        Err(SyncError::Reconciliation(_))
    ));
}

// ============================================================================
// Observability
// ============================================================================

#[test]
fn test_empty_aggregate_average_is_zero() {
    let mut metric = AggregateMetric::new();
    assert_eq!(metric.average(), 0.0);
    metric.add_sample(-3.0);
    assert_eq!(metric.count, 0);
    metric.add_sample(4.0);
    metric.add_sample(2.0);
    assert_eq!(metric.average(), 3.0);
    assert_eq!(metric.max, 4.0);
}

#[test]
fn test_safe_rate_never_nan() {
    assert_eq!(safe_rate(5.0, 0.0), 0.0);
    assert_eq!(safe_rate(5.0, -1.0), 0.0);
    assert_eq!(safe_rate(1.0, 4.0), 0.25);
}

// ============================================================================
// Bootstrap
// ============================================================================

/// An empty export never wipes a populated store
#[tokio::test]
async fn test_empty_ledger_keeps_store() {
    let store = MemorySyncStore::new();
    store
        .upsert_many(&[SyncRecord::new("d".repeat(64), 1, op(&"d".repeat(64), "x"))])
        .unwrap();
    let ledger = MemoryLedger::new();

    let result = bootstrap_sync_store_if_empty(&store, &ledger, &BootstrapOptions::default())
        .await
        .unwrap();
    assert!(result.skipped);
    assert_eq!(store.count().unwrap(), 1);
}

/// Empty store and empty ledger: nothing to do, nothing skipped
#[tokio::test]
async fn test_both_empty() {
    let store = MemorySyncStore::new();
    let result = bootstrap_sync_store_if_empty(&store, &MemoryLedger::new(), &BootstrapOptions::default())
        .await
        .unwrap();
    assert!(!result.skipped);
    assert_eq!(result.inserted, 0);
    assert_eq!(result.count_after, 0);
}
