//! Transfer batching
//!
//! One size-limiting algorithm for everything that goes on the wire: id
//! lists are split into fixed-size chunks, operation payloads into batches
//! bounded by both count and estimated serialized size.

use std::collections::HashSet;
use std::io;

use serde::Serialize;

use crate::error::{SyncError, SyncResult};
use crate::types::Operation;

pub const DEFAULT_MAX_IDS_PER_REQUEST: usize = 1000;
pub const DEFAULT_MAX_OPS_PER_PUSH: usize = 200;
pub const DEFAULT_MAX_BYTES_PER_PUSH: usize = 1024 * 1024;

/// De-duplicate `ids` (first occurrence wins) and split into groups.
///
/// Empty input yields no chunks.
pub fn chunk_ids<S>(ids: &[S], max_per_chunk: usize) -> SyncResult<Vec<Vec<S>>>
where
    S: AsRef<str> + Clone,
{
    if max_per_chunk == 0 {
        return Err(SyncError::config("maxPerChunk", "expected a positive integer"));
    }

    let mut seen = HashSet::new();
    let unique: Vec<S> = ids
        .iter()
        .filter(|id| seen.insert(id.as_ref().to_string()))
        .cloned()
        .collect();

    Ok(unique
        .chunks(max_per_chunk)
        .map(|chunk| chunk.to_vec())
        .collect())
}

/// Byte and count limits for operation batches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushLimits {
    pub max_ops_per_push: usize,
    pub max_bytes_per_push: usize,
}

impl Default for PushLimits {
    fn default() -> Self {
        Self {
            max_ops_per_push: DEFAULT_MAX_OPS_PER_PUSH,
            max_bytes_per_push: DEFAULT_MAX_BYTES_PER_PUSH,
        }
    }
}

impl PushLimits {
    pub fn validate(&self) -> SyncResult<()> {
        if self.max_ops_per_push == 0 {
            return Err(SyncError::config("maxOpsPerPush", "expected a positive integer"));
        }
        if self.max_bytes_per_push == 0 {
            return Err(SyncError::config("maxBytesPerPush", "expected a positive integer"));
        }
        Ok(())
    }
}

/// Greedily pack operations into batches within `limits`.
///
/// A batch is closed when adding the next operation would exceed either
/// limit. An operation larger than the byte budget on its own still gets a
/// batch of its own.
pub fn chunk_operations_for_push(
    operations: impl IntoIterator<Item = Operation>,
    limits: PushLimits,
) -> SyncResult<Vec<Vec<Operation>>> {
    limits.validate()?;

    let mut batches = Vec::new();
    let mut current: Vec<Operation> = Vec::new();
    let mut current_bytes = 0;

    for operation in operations {
        let bytes = estimate_operation_bytes(&operation);
        let exceeds_count = current.len() >= limits.max_ops_per_push;
        let exceeds_bytes =
            !current.is_empty() && current_bytes + bytes > limits.max_bytes_per_push;

        if exceeds_count || exceeds_bytes {
            batches.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current.push(operation);
        current_bytes += bytes;
    }

    if !current.is_empty() {
        batches.push(current);
    }
    Ok(batches)
}

/// Writer that only counts bytes
#[derive(Default)]
struct ByteCounter(usize);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Serialized JSON length of `value`, computed without allocating the output.
pub fn serialized_len<T: Serialize + ?Sized>(value: &T) -> usize {
    let mut counter = ByteCounter::default();
    match serde_json::to_writer(&mut counter, value) {
        Ok(()) => counter.0,
        Err(_) => 0,
    }
}

/// Estimated wire size of one operation
pub fn estimate_operation_bytes(operation: &Operation) -> usize {
    serialized_len(operation)
}

/// Batching front-end configured once from mediator settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferBatcher {
    max_ids_per_request: usize,
    limits: PushLimits,
}

impl TransferBatcher {
    pub fn new(max_ids_per_request: usize, limits: PushLimits) -> SyncResult<Self> {
        if max_ids_per_request == 0 {
            return Err(SyncError::config(
                "maxIdsPerRequest",
                "expected a positive integer",
            ));
        }
        limits.validate()?;
        Ok(Self {
            max_ids_per_request,
            limits,
        })
    }

    pub fn limits(&self) -> PushLimits {
        self.limits
    }

    /// Split ids for outbound requests
    pub fn id_chunks(&self, ids: &[String]) -> Vec<Vec<String>> {
        chunk_ids(ids, self.max_ids_per_request).unwrap_or_default()
    }

    /// Pack operations for outbound pushes
    pub fn push_batches(&self, operations: Vec<Operation>) -> Vec<Vec<Operation>> {
        chunk_operations_for_push(operations, self.limits).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op(payload: &str) -> Operation {
        Operation::new(json!({ "data": payload }))
    }

    #[test]
    fn test_chunk_ids_dedupes_and_splits() {
        let ids = vec!["a", "b", "a", "c", "d", "b", "e"];
        let chunks = chunk_ids(&ids, 2).unwrap();
        assert_eq!(chunks, vec![vec!["a", "b"], vec!["c", "d"], vec!["e"]]);
    }

    #[test]
    fn test_chunk_ids_empty_and_invalid() {
        let empty: Vec<String> = Vec::new();
        assert!(chunk_ids(&empty, 3).unwrap().is_empty());
        let err = chunk_ids(&["a"][..], 0).unwrap_err();
        assert!(err.to_string().contains("maxPerChunk"));
    }

    #[test]
    fn test_push_respects_count() {
        let ops: Vec<_> = (0..5).map(|i| op(&i.to_string())).collect();
        let limits = PushLimits {
            max_ops_per_push: 2,
            max_bytes_per_push: 1_000_000,
        };
        let sizes: Vec<_> = chunk_operations_for_push(ops, limits)
            .unwrap()
            .iter()
            .map(Vec::len)
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn test_push_respects_bytes_and_isolates_oversized() {
        let small = op("x");
        let small_bytes = estimate_operation_bytes(&small);
        let big = op(&"y".repeat(500));
        let limits = PushLimits {
            max_ops_per_push: 100,
            max_bytes_per_push: small_bytes * 2,
        };

        let batches =
            chunk_operations_for_push(vec![small.clone(), small.clone(), big, small.clone()], limits)
                .unwrap();
        let sizes: Vec<_> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 1, 1]);
    }

    #[test]
    fn test_push_rejects_zero_limits() {
        let limits = PushLimits {
            max_ops_per_push: 0,
            max_bytes_per_push: 10,
        };
        assert!(chunk_operations_for_push(vec![op("a")], limits).is_err());
        let limits = PushLimits {
            max_ops_per_push: 1,
            max_bytes_per_push: 0,
        };
        assert!(chunk_operations_for_push(Vec::new(), limits).is_err());
    }

    #[test]
    fn test_estimate_matches_serialized_length() {
        let operation = op("héllo");
        assert_eq!(
            estimate_operation_bytes(&operation),
            serde_json::to_vec(&operation).unwrap().len()
        );
    }
}
