//! Reassembly of payloads that agents stream as indexed chunks.
//!
//! An assembly is created by `transferStart`, fed by `transferChunk`, and
//! consumed by either `transferEnd` or `transferError`. Slots are write-once
//! and the payload is always concatenated in index order, whatever order the
//! chunks arrived in.

use std::time::Instant;

use base64::Engine;
use fleet_relay_error::RelayError;
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::protocol::{CommandReply, TransferEnd, TransferStart};

pub const DEFAULT_MAX_CHUNKS: usize = 65_536;

/// Reasons a transfer signal is dropped without changing any state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferRejection {
    #[error("no pending request for correlation id")]
    NoPendingRequest,
    #[error("transfer already started")]
    DuplicateStart,
    #[error("no transfer in progress")]
    UnknownTransfer,
    #[error("invalid chunk count {total} (max {max})")]
    InvalidChunkCount { total: i64, max: usize },
    #[error("chunk index {index} out of range 0..{total}")]
    IndexOutOfRange { index: i64, total: usize },
    #[error("chunk data is not valid base64: {0}")]
    InvalidEncoding(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkReceipt {
    /// Length of the bytes held in the slot, which for a duplicate is the
    /// first delivery.
    pub size: usize,
    pub duplicate: bool,
}

#[derive(Debug)]
pub struct ChunkAssembly {
    correlation_id: String,
    slots: Vec<Option<Vec<u8>>>,
    received_count: usize,
    declared_checksum: Option<String>,
    filepath_hint: Option<String>,
    started_at: Instant,
}

impl ChunkAssembly {
    pub fn start(start: TransferStart, max_chunks: usize) -> Result<Self, TransferRejection> {
        let total = usize::try_from(start.total_chunks)
            .ok()
            .filter(|total| (1..=max_chunks).contains(total))
            .ok_or(TransferRejection::InvalidChunkCount {
                total: start.total_chunks,
                max: max_chunks,
            })?;

        Ok(Self {
            correlation_id: start.correlation_id,
            slots: vec![None; total],
            received_count: 0,
            declared_checksum: start.checksum.filter(|value| !value.trim().is_empty()),
            filepath_hint: start.filepath_hint,
            started_at: Instant::now(),
        })
    }

    pub fn total_chunks(&self) -> usize {
        self.slots.len()
    }

    pub fn received_count(&self) -> usize {
        self.received_count
    }

    pub fn is_complete(&self) -> bool {
        self.received_count == self.slots.len()
    }

    pub fn chunk(&self, index: usize) -> Option<&[u8]> {
        self.slots.get(index).and_then(|slot| slot.as_deref())
    }

    pub fn missing_indices(&self) -> Vec<u64> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(index, _)| index as u64)
            .collect()
    }

    /// Stores `bytes` at `index` unless that slot is already filled. A repeat
    /// delivery is acknowledged but leaves the first bytes in place.
    pub fn accept_chunk(
        &mut self,
        index: i64,
        bytes: Vec<u8>,
    ) -> Result<ChunkReceipt, TransferRejection> {
        let total = self.slots.len();
        let slot_index = usize::try_from(index)
            .ok()
            .filter(|slot_index| *slot_index < total)
            .ok_or(TransferRejection::IndexOutOfRange { index, total })?;

        let slot = &mut self.slots[slot_index];
        if let Some(existing) = slot {
            return Ok(ChunkReceipt {
                size: existing.len(),
                duplicate: true,
            });
        }

        let size = bytes.len();
        *slot = Some(bytes);
        self.received_count += 1;
        Ok(ChunkReceipt {
            size,
            duplicate: false,
        })
    }

    /// Consumes the assembly on `transferEnd`.
    pub fn finish(self, end: &TransferEnd) -> Result<CommandReply, RelayError> {
        if !self.is_complete() {
            let missing = self.missing_indices();
            return Err(RelayError::IncompleteTransfer {
                message: format!(
                    "received {} of {} chunks",
                    self.received_count,
                    self.slots.len()
                ),
                correlation_id: self.correlation_id,
                missing_chunks: missing,
                failed_chunks: end.failed_chunks.clone(),
            });
        }

        let total_chunks = self.slots.len();
        let payload: Vec<u8> = self.slots.into_iter().flatten().flatten().collect();

        if let Some(declared) = self.declared_checksum.as_deref() {
            verify_checksum(&self.correlation_id, declared, &payload)?;
        }

        tracing::debug!(
            correlation_id = %self.correlation_id,
            bytes = payload.len(),
            total_chunks,
            elapsed_ms = self.started_at.elapsed().as_millis() as u64,
            "transfer assembled"
        );

        Ok(CommandReply {
            success: true,
            message: format!("received {} bytes in {} chunks", payload.len(), total_chunks),
            output: Some(json!({
                "payload": base64::engine::general_purpose::STANDARD.encode(&payload),
                "size": payload.len(),
                "filepathHint": self.filepath_hint,
                "durationMs": end.duration_ms,
                "sentChunks": end.sent_chunks,
                "totalChunks": total_chunks,
            })),
        })
    }

    /// Consumes the assembly on `transferError`, regardless of progress.
    pub fn fail(self, message: String, failed_chunks: Vec<i64>) -> RelayError {
        let missing_chunks = self.missing_indices();
        RelayError::IncompleteTransfer {
            correlation_id: self.correlation_id,
            message: if message.is_empty() {
                "agent aborted the transfer".to_string()
            } else {
                message
            },
            missing_chunks,
            failed_chunks,
        }
    }
}

pub fn decode_chunk(data: &str) -> Result<Vec<u8>, TransferRejection> {
    base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|err| TransferRejection::InvalidEncoding(err.to_string()))
}

pub fn sha256_hex(payload: &[u8]) -> String {
    format!("{:x}", Sha256::digest(payload))
}

fn verify_checksum(correlation_id: &str, declared: &str, payload: &[u8]) -> Result<(), RelayError> {
    let declared = declared.trim();
    let expected = declared
        .strip_prefix("sha256:")
        .unwrap_or(declared)
        .to_ascii_lowercase();
    let actual = sha256_hex(payload);
    if expected == actual {
        return Ok(());
    }
    Err(RelayError::ChecksumMismatch {
        correlation_id: correlation_id.to_string(),
        expected,
        actual,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(total_chunks: i64, checksum: Option<String>) -> ChunkAssembly {
        ChunkAssembly::start(
            TransferStart {
                correlation_id: "c2".to_string(),
                total_chunks,
                filepath_hint: Some("shot.png".to_string()),
                checksum,
            },
            DEFAULT_MAX_CHUNKS,
        )
        .expect("start transfer")
    }

    fn end() -> TransferEnd {
        TransferEnd {
            correlation_id: "c2".to_string(),
            sent_chunks: 3,
            failed_chunks: Vec::new(),
            duration_ms: 42,
        }
    }

    fn payload_of(reply: &CommandReply) -> Vec<u8> {
        let encoded = reply.output.as_ref().expect("output")["payload"]
            .as_str()
            .expect("payload string")
            .to_string();
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .expect("decode payload")
    }

    #[test]
    fn out_of_order_chunks_assemble_by_index() {
        let mut assembly = start(3, None);
        assembly.accept_chunk(1, b"BB".to_vec()).expect("chunk 1");
        assembly.accept_chunk(0, b"A".to_vec()).expect("chunk 0");
        assembly.accept_chunk(2, b"CCC".to_vec()).expect("chunk 2");

        let reply = assembly.finish(&end()).expect("complete");
        assert!(reply.success);
        assert_eq!(payload_of(&reply), b"ABBCCC");
        let output = reply.output.expect("output");
        assert_eq!(output["filepathHint"], "shot.png");
        assert_eq!(output["durationMs"], 42);
        assert_eq!(output["size"], 6);
    }

    #[test]
    fn every_arrival_order_yields_the_same_payload() {
        let chunks: [&[u8]; 4] = [b"zero", b"one", b"two", b"three"];
        let orders = [
            [0, 1, 2, 3],
            [3, 2, 1, 0],
            [2, 0, 3, 1],
            [1, 3, 0, 2],
        ];
        for order in orders {
            let mut assembly = start(4, None);
            for index in order {
                assembly
                    .accept_chunk(index as i64, chunks[index].to_vec())
                    .expect("accept chunk");
            }
            let reply = assembly.finish(&end()).expect("complete");
            assert_eq!(payload_of(&reply), b"zeroonetwothree", "order {order:?}");
        }
    }

    #[test]
    fn duplicate_chunk_is_a_no_op() {
        let mut assembly = start(2, None);
        let first = assembly.accept_chunk(0, b"first".to_vec()).expect("first");
        assert!(!first.duplicate);
        let again = assembly.accept_chunk(0, b"second!".to_vec()).expect("again");
        assert!(again.duplicate);
        assert_eq!(again.size, b"first".len());
        assert_eq!(assembly.received_count(), 1);
        assert_eq!(assembly.chunk(0), Some(&b"first"[..]));
    }

    #[test]
    fn out_of_range_index_is_rejected_without_state_change() {
        let mut assembly = start(2, None);
        assert_eq!(
            assembly.accept_chunk(2, vec![1]),
            Err(TransferRejection::IndexOutOfRange { index: 2, total: 2 })
        );
        assert_eq!(
            assembly.accept_chunk(-1, vec![1]),
            Err(TransferRejection::IndexOutOfRange { index: -1, total: 2 })
        );
        assert_eq!(assembly.received_count(), 0);
    }

    #[test]
    fn end_with_missing_chunk_reports_indices() {
        let mut assembly = start(3, None);
        assembly.accept_chunk(0, vec![0]).expect("chunk 0");
        assembly.accept_chunk(2, vec![2]).expect("chunk 2");

        let mut signal = end();
        signal.failed_chunks = vec![1];
        match assembly.finish(&signal) {
            Err(RelayError::IncompleteTransfer {
                missing_chunks,
                failed_chunks,
                ..
            }) => {
                assert_eq!(missing_chunks, vec![1]);
                assert_eq!(failed_chunks, vec![1]);
            }
            other => panic!("expected incomplete transfer, got {other:?}"),
        }
    }

    #[test]
    fn error_signal_forces_failure_even_when_complete() {
        let mut assembly = start(1, None);
        assembly.accept_chunk(0, vec![9]).expect("chunk 0");
        let err = assembly.fail("disk full".to_string(), vec![]);
        assert_eq!(
            err,
            RelayError::IncompleteTransfer {
                correlation_id: "c2".to_string(),
                message: "disk full".to_string(),
                missing_chunks: vec![],
                failed_chunks: vec![],
            }
        );
    }

    #[test]
    fn declared_checksum_is_verified() {
        let digest = sha256_hex(b"hello world");
        let mut ok = start(2, Some(format!("sha256:{}", digest.to_uppercase())));
        ok.accept_chunk(0, b"hello ".to_vec()).expect("chunk 0");
        ok.accept_chunk(1, b"world".to_vec()).expect("chunk 1");
        assert!(ok.finish(&end()).is_ok());

        let mut bad = start(2, Some(digest.clone()));
        bad.accept_chunk(0, b"hello ".to_vec()).expect("chunk 0");
        bad.accept_chunk(1, b"there".to_vec()).expect("chunk 1");
        match bad.finish(&end()) {
            Err(RelayError::ChecksumMismatch { expected, actual, .. }) => {
                assert_eq!(expected, digest);
                assert_eq!(actual, sha256_hex(b"hello there"));
            }
            other => panic!("expected checksum mismatch, got {other:?}"),
        }
    }

    #[test]
    fn rejects_zero_and_oversized_chunk_counts() {
        for total in [0, -3] {
            let err = ChunkAssembly::start(
                TransferStart {
                    correlation_id: "c".to_string(),
                    total_chunks: total,
                    filepath_hint: None,
                    checksum: None,
                },
                4,
            )
            .expect_err("invalid count");
            assert_eq!(err, TransferRejection::InvalidChunkCount { total, max: 4 });
        }
        assert!(ChunkAssembly::start(
            TransferStart {
                correlation_id: "c".to_string(),
                total_chunks: 5,
                filepath_hint: None,
                checksum: None,
            },
            4,
        )
        .is_err());
    }

    #[test]
    fn decode_chunk_rejects_garbage() {
        assert_eq!(decode_chunk("AQI=").expect("decode"), vec![1, 2]);
        assert!(matches!(
            decode_chunk("not base64!"),
            Err(TransferRejection::InvalidEncoding(_))
        ));
    }
}
