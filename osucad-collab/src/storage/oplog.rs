//! LZ4-compressed operation log.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              OperationLog                    │
//! │                                              │
//! │  version seq ◄── op ◄── op ◄── op ◄── op     │
//! │  (compacted)    (LZ4)  (LZ4)  (LZ4)  (LZ4)   │
//! │                                              │
//! │  compact(seq): drop ops covered by a version │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Operations are appended in sequence order. Everything up to the
//! sequence number of the latest stored version is redundant and is
//! dropped by `compact`.

use crate::codec::{decode_operation, encode_operation};
use crate::op::Operation;

use super::StoreError;

/// A compressed operation entry.
#[derive(Debug, Clone)]
pub struct CompressedOperation {
    pub sequence_number: u64,
    /// Uncompressed encoded size in bytes
    pub original_size: u32,
    /// LZ4-compressed payload, size prepended
    pub compressed: Vec<u8>,
}

impl CompressedOperation {
    pub fn compress(op: &Operation) -> Result<Self, StoreError> {
        let bytes = encode_operation(op).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Self {
            sequence_number: op.sequence_number,
            original_size: bytes.len() as u32,
            compressed: lz4_flex::compress_prepend_size(&bytes),
        })
    }

    pub fn decompress(&self) -> Result<Operation, StoreError> {
        let bytes = lz4_flex::decompress_size_prepended(&self.compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        decode_operation(&bytes).map_err(|e| StoreError::Deserialization(e.to_string()))
    }

    pub fn compressed_size(&self) -> usize {
        self.compressed.len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct OperationLogStats {
    pub operation_count: u64,
    pub total_original_bytes: u64,
    pub total_compressed_bytes: u64,
    /// Last sequence number dropped by compaction
    pub base_sequence: u64,
    pub head_sequence: u64,
}

impl OperationLogStats {
    pub fn compression_ratio(&self) -> f64 {
        if self.total_compressed_bytes == 0 {
            return 0.0;
        }
        self.total_original_bytes as f64 / self.total_compressed_bytes as f64
    }
}

#[derive(Debug, Clone, Default)]
pub struct OperationLog {
    entries: Vec<CompressedOperation>,
    base_sequence: u64,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append operations. Operations at or below the current head are
    /// skipped, so replaying a batch twice is harmless.
    pub fn append(&mut self, ops: &[Operation]) -> Result<usize, StoreError> {
        let mut appended = 0;
        for op in ops {
            if op.sequence_number <= self.head_sequence() {
                continue;
            }
            self.entries.push(CompressedOperation::compress(op)?);
            appended += 1;
        }
        Ok(appended)
    }

    /// Decompress every operation after `after`.
    pub fn since(&self, after: u64) -> Result<Vec<Operation>, StoreError> {
        let start = self.entries.partition_point(|e| e.sequence_number <= after);
        self.entries[start..]
            .iter()
            .map(CompressedOperation::decompress)
            .collect()
    }

    /// Drop every operation up to and including `up_to`. Returns how many
    /// were dropped.
    pub fn compact(&mut self, up_to: u64) -> usize {
        let end = self.entries.partition_point(|e| e.sequence_number <= up_to);
        self.entries.drain(..end);
        self.base_sequence = self.base_sequence.max(up_to);
        end
    }

    pub fn head_sequence(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.sequence_number)
            .unwrap_or(self.base_sequence)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> OperationLogStats {
        let mut total_original = 0u64;
        let mut total_compressed = 0u64;
        for entry in &self.entries {
            total_original += entry.original_size as u64;
            total_compressed += entry.compressed.len() as u64;
        }
        OperationLogStats {
            operation_count: self.entries.len() as u64,
            total_original_bytes: total_original,
            total_compressed_bytes: total_compressed,
            base_sequence: self.base_sequence,
            head_sequence: self.head_sequence(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{MutationPayload, ObjectId};
    use crate::op::Mutation;
    use uuid::Uuid;

    fn op(seq: u64) -> Operation {
        Operation {
            sequence_number: seq,
            reference_sequence_number: seq - 1,
            mutation: Mutation {
                target: ObjectId::new("hitObjects"),
                payload: MutationPayload::set("startTime", seq as f64 * 100.0),
                client_id: Uuid::nil(),
                local_sequence: seq,
            },
        }
    }

    #[test]
    fn test_compressed_operation_roundtrip() {
        let entry = CompressedOperation::compress(&op(7)).unwrap();
        assert_eq!(entry.sequence_number, 7);
        assert!(entry.compressed_size() > 0);
        assert_eq!(entry.decompress().unwrap(), op(7));
    }

    #[test]
    fn test_append_and_since() {
        let mut log = OperationLog::new();
        let ops: Vec<Operation> = (1..=5).map(op).collect();
        assert_eq!(log.append(&ops).unwrap(), 5);
        assert_eq!(log.head_sequence(), 5);

        let tail = log.since(3).unwrap();
        assert_eq!(tail, vec![op(4), op(5)]);
        assert!(log.since(5).unwrap().is_empty());
        assert_eq!(log.since(0).unwrap().len(), 5);
    }

    #[test]
    fn test_append_skips_known_sequences() {
        let mut log = OperationLog::new();
        log.append(&[op(1), op(2)]).unwrap();
        assert_eq!(log.append(&[op(2), op(3)]).unwrap(), 1);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_compact() {
        let mut log = OperationLog::new();
        log.append(&(1..=10).map(op).collect::<Vec<_>>()).unwrap();

        assert_eq!(log.compact(6), 6);
        assert_eq!(log.len(), 4);
        assert_eq!(log.since(0).unwrap().first().map(|o| o.sequence_number), Some(7));

        assert_eq!(log.compact(20), 4);
        assert!(log.is_empty());
        // Head survives compaction so stale appends are still rejected.
        assert_eq!(log.head_sequence(), 20);
        assert_eq!(log.append(&[op(12)]).unwrap(), 0);
    }

    #[test]
    fn test_stats() {
        let mut log = OperationLog::new();
        log.append(&(1..=50).map(op).collect::<Vec<_>>()).unwrap();
        log.compact(10);

        let stats = log.stats();
        assert_eq!(stats.operation_count, 40);
        assert_eq!(stats.base_sequence, 10);
        assert_eq!(stats.head_sequence, 50);
        assert!(stats.total_original_bytes > 0);
        assert!(stats.compression_ratio() > 0.0);
    }
}
