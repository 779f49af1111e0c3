//! Rolling-hash signatures and delta computation (rsync-style), plus
//! chunked reassembly of outbound delta/full-file payloads.

use crate::crypto::sha256;
use crate::types::now_secs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const ADLER_MOD: u32 = 65521;

/// Adler-32-style rolling checksum over a fixed-size window.
#[derive(Debug, Clone, Copy)]
pub struct RollingChecksum {
    a: u32,
    b: u32,
    window_len: u32,
}

impl RollingChecksum {
    pub fn from_block(block: &[u8]) -> Self {
        let mut a: u32 = 0;
        let mut b: u32 = 0;
        for &byte in block {
            a = (a + byte as u32) % ADLER_MOD;
            b = (b + a) % ADLER_MOD;
        }
        Self { a, b, window_len: block.len() as u32 }
    }

    pub fn value(&self) -> u32 {
        (self.b << 16) | self.a
    }

    /// Slide the window forward by one byte: `old_byte` leaves, `new_byte`
    /// enters.
    pub fn roll(&mut self, old_byte: u8, new_byte: u8) {
        self.a = (self.a + ADLER_MOD - old_byte as u32 % ADLER_MOD + new_byte as u32) % ADLER_MOD;
        self.b = (self.b + ADLER_MOD - (self.window_len * old_byte as u32) % ADLER_MOD + self.a) % ADLER_MOD;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockSignature {
    pub block_index: u32,
    pub weak: u32,
    pub strong: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Signature {
    pub block_size: usize,
    pub blocks: Vec<BlockSignature>,
}

/// Divide `content` into fixed-size blocks and record `(weak, strong)` for
/// each, for the receiver to ship back as the sender's basis.
pub fn compute_signature(content: &[u8], block_size: usize) -> Signature {
    let block_size = block_size.max(1);
    let blocks = content
        .chunks(block_size)
        .enumerate()
        .map(|(index, block)| BlockSignature {
            block_index: index as u32,
            weak: RollingChecksum::from_block(block).value(),
            strong: sha256(block),
        })
        .collect();
    Signature { block_size, blocks }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeltaOp {
    Copy { block_index: u32 },
    Literal { bytes: Vec<u8> },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Delta {
    pub ops: Vec<DeltaOp>,
}

/// Build a weak-hash -> candidate block-index map for a signature, so the
/// sender can do O(1) average-case lookups while sliding its window.
fn build_weak_index(signature: &Signature) -> HashMap<u32, Vec<&BlockSignature>> {
    let mut index: HashMap<u32, Vec<&BlockSignature>> = HashMap::new();
    for block in &signature.blocks {
        index.entry(block.weak).or_default().push(block);
    }
    index
}

/// Compute a delta that reconstructs `new_content` given the receiver's
/// `basis_signature`. Slides a window of `block_size` bytes one byte at a
/// time via [`RollingChecksum::roll`], only reseeding from scratch when the
/// window jumps forward by `block_size` after a match; on a weak+strong
/// match, emits a copy instruction, otherwise emits the current byte as a
/// literal and advances by one.
pub fn compute_delta(new_content: &[u8], basis_signature: &Signature) -> Delta {
    let block_size = basis_signature.block_size.max(1);
    let weak_index = build_weak_index(basis_signature);
    let mut ops: Vec<DeltaOp> = Vec::new();
    let mut literal_run: Vec<u8> = Vec::new();

    let mut pos = 0usize;
    let len = new_content.len();
    // Carries the rolling checksum across single-byte advances; `None`
    // means the next window must be seeded fresh (start of scan, or right
    // after a block-sized jump).
    let mut window_checksum: Option<RollingChecksum> = None;

    while pos < len {
        let window_end = pos + block_size;
        // Only a full-size window can match a basis block; a trailing
        // partial window at EOF can never be a candidate.
        if window_end > len {
            literal_run.push(new_content[pos]);
            pos += 1;
            window_checksum = None;
            continue;
        }
        let window = &new_content[pos..window_end];
        let checksum = window_checksum.take().unwrap_or_else(|| RollingChecksum::from_block(window));

        let matched = weak_index.get(&checksum.value()).and_then(|candidates| {
            let strong = sha256(window);
            candidates.iter().find(|c| c.strong == strong)
        });

        match matched {
            Some(block) => {
                if !literal_run.is_empty() {
                    ops.push(DeltaOp::Literal { bytes: std::mem::take(&mut literal_run) });
                }
                ops.push(DeltaOp::Copy { block_index: block.block_index });
                pos += block_size;
                window_checksum = None;
            }
            None => {
                let mut rolled = checksum;
                if window_end < len {
                    rolled.roll(new_content[pos], new_content[window_end]);
                    window_checksum = Some(rolled);
                }
                literal_run.push(new_content[pos]);
                pos += 1;
            }
        }
    }
    if !literal_run.is_empty() {
        ops.push(DeltaOp::Literal { bytes: literal_run });
    }

    Delta { ops }
}

/// Reconstruct the target content from `basis` (the receiver's current
/// file) and `delta`.
pub fn apply_delta(basis: &[u8], delta: &Delta, block_size: usize) -> Vec<u8> {
    let block_size = block_size.max(1);
    let mut out = Vec::new();
    for op in &delta.ops {
        match op {
            DeltaOp::Copy { block_index } => {
                let start = *block_index as usize * block_size;
                let end = (start + block_size).min(basis.len());
                if start < basis.len() {
                    out.extend_from_slice(&basis[start..end]);
                }
            }
            DeltaOp::Literal { bytes } => out.extend_from_slice(bytes),
        }
    }
    out
}

/// Split a serialized payload into ordered chunks, each tagged with its
/// index and total count, when it exceeds `max_chunk_bytes`.
pub fn chunk_payload(payload: &[u8], max_chunk_bytes: usize) -> Vec<Vec<u8>> {
    let max_chunk_bytes = max_chunk_bytes.max(1);
    if payload.is_empty() {
        return vec![Vec::new()];
    }
    payload.chunks(max_chunk_bytes).map(|c| c.to_vec()).collect()
}

pub struct PendingAssembly {
    pub total_chunks: u32,
    pub received_count: u32,
    pub chunk_slots: Vec<Option<Vec<u8>>>,
    pub last_activity: u64,
}

impl PendingAssembly {
    pub fn new(total_chunks: u32) -> Self {
        Self {
            total_chunks,
            received_count: 0,
            chunk_slots: vec![None; total_chunks as usize],
            last_activity: now_secs(),
        }
    }

    /// Idempotent: re-delivering a chunk index that's already filled is a
    /// no-op.
    pub fn add_chunk(&mut self, chunk_index: u32, data: Vec<u8>) {
        self.last_activity = now_secs();
        if let Some(slot) = self.chunk_slots.get_mut(chunk_index as usize) {
            if slot.is_none() {
                *slot = Some(data);
                self.received_count += 1;
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.received_count == self.total_chunks
    }

    pub fn assemble(&self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        let mut out = Vec::new();
        for slot in &self.chunk_slots {
            out.extend_from_slice(slot.as_deref()?);
        }
        Some(out)
    }

    pub fn is_stale(&self, timeout_secs: u64) -> bool {
        now_secs().saturating_sub(self.last_activity) > timeout_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_roundtrip_identical_content() {
        let content = b"hello world, this is a test of signatures";
        let sig = compute_signature(content, 8);
        let delta = compute_delta(content, &sig);
        let rebuilt = apply_delta(content, &delta, 8);
        assert_eq!(rebuilt, content);
    }

    #[test]
    fn delta_on_modification_reuses_unmodified_blocks() {
        let basis = b"hello world";
        let sig = compute_signature(basis, 5);
        let new_content = b"hello world everyone";
        let delta = compute_delta(new_content, &sig);

        let has_copy = delta.ops.iter().any(|op| matches!(op, DeltaOp::Copy { .. }));
        assert!(has_copy);

        let rebuilt = apply_delta(basis, &delta, 5);
        assert_eq!(rebuilt, new_content);
    }

    #[test]
    fn empty_basis_produces_all_literal() {
        let sig = compute_signature(b"", 4);
        let delta = compute_delta(b"brand new content", &sig);
        assert!(delta.ops.iter().all(|op| matches!(op, DeltaOp::Literal { .. })));
    }

    #[test]
    fn chunk_and_reassemble_idempotent_duplicate() {
        let payload: Vec<u8> = (0..20u8).collect();
        let chunks = chunk_payload(&payload, 6);
        assert_eq!(chunks.len(), 4);

        let mut pending = PendingAssembly::new(chunks.len() as u32);
        for (i, chunk) in chunks.iter().enumerate() {
            pending.add_chunk(i as u32, chunk.clone());
        }
        // duplicate delivery of an already-filled slot
        pending.add_chunk(0, chunks[0].clone());
        assert!(pending.is_complete());
        assert_eq!(pending.assemble().unwrap(), payload);
    }

    #[test]
    fn rolling_checksum_matches_recompute_after_roll() {
        let data = b"abcdefgh";
        let mut rolling = RollingChecksum::from_block(&data[0..4]);
        rolling.roll(data[0], data[4]);
        let direct = RollingChecksum::from_block(&data[1..5]);
        assert_eq!(rolling.value(), direct.value());
    }
}
