//! # Fragmentation
//!
//! A message too large for one datagram is split into chunks that travel as
//! ordinary channel messages with the fragment flag set. Each chunk carries
//! a byte-aligned preamble of variable-length integers — `(group_id,
//! chunk_count, chunk_size, chunk_index)` — followed by its slice of the
//! original bytes. The final chunk's bit count recovers the exact original
//! bit length on reassembly.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use quanta::Instant;

use crate::buffer::BitBuffer;
use crate::error::{CourierError, Result};
use crate::wire::HEADER_SIZE;

/// Worst-case preamble size: four variable ints (5 + 3 + 3 + 3 bytes).
pub const FRAGMENT_PREAMBLE_MAX: usize = 14;

/// Refuse to track groups claiming more than this much reassembled data.
const MAX_GROUP_BYTES: usize = 1 << 24;

/// Chunk payload size for a given MTU.
pub fn chunk_size_for(mtu: usize) -> usize {
    mtu.saturating_sub(HEADER_SIZE + FRAGMENT_PREAMBLE_MAX)
}

/// Whether a message of `byte_length` needs fragmenting at `mtu`.
pub fn needs_split(byte_length: usize, mtu: usize) -> bool {
    byte_length > mtu.saturating_sub(HEADER_SIZE)
}

/// Split `payload` (`bit_length` bits) into chunk buffers ready to enqueue.
pub fn split(payload: &[u8], bit_length: usize, mtu: usize, group_id: u32) -> Vec<BitBuffer> {
    let chunk_size = chunk_size_for(mtu);
    debug_assert!(chunk_size > 0);
    let total_bytes = bit_length.div_ceil(8);
    debug_assert!(payload.len() >= total_bytes);
    let chunk_count = total_bytes.div_ceil(chunk_size).max(1);

    let mut chunks = Vec::with_capacity(chunk_count);
    for index in 0..chunk_count {
        let start = index * chunk_size;
        let end = (start + chunk_size).min(total_bytes);
        let mut buf = BitBuffer::with_capacity(FRAGMENT_PREAMBLE_MAX + (end - start));
        buf.write_var_u32(group_id);
        buf.write_var_u32(chunk_count as u32);
        buf.write_var_u32(chunk_size as u32);
        buf.write_var_u32(index as u32);

        let slice = &payload[start..end];
        if index == chunk_count - 1 {
            let data_bits = bit_length - start * 8;
            let whole = data_bits / 8;
            let rem = (data_bits % 8) as u32;
            buf.write_bytes(&slice[..whole]);
            if rem > 0 {
                buf.write_bits(u64::from(slice[whole]), rem);
            }
        } else {
            buf.write_bytes(slice);
        }
        chunks.push(buf);
    }
    chunks
}

// ─── Reassembly ─────────────────────────────────────────────────────────────

#[derive(Debug)]
struct FragmentGroup {
    chunk_count: usize,
    chunk_size: usize,
    received: Vec<bool>,
    received_count: usize,
    buffer: Vec<u8>,
    total_bits: Option<usize>,
    created_at: Instant,
}

/// Per-connection reassembly state, keyed by group id.
#[derive(Debug, Default)]
pub struct FragmentAssembler {
    groups: HashMap<u32, FragmentGroup>,
    /// Groups dropped by the TTL sweep.
    pub expired_groups: u64,
    /// Duplicate chunks ignored.
    pub duplicate_chunks: u64,
}

impl FragmentAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one released chunk. Returns the reassembled `(bytes, bit_length)`
    /// when this chunk completes its group.
    pub fn receive(
        &mut self,
        payload: &[u8],
        bit_length: usize,
        now: Instant,
    ) -> Result<Option<(Bytes, usize)>> {
        let mut reader = BitBuffer::from_slice(payload, bit_length);
        let group_id = reader.read_var_u32()?;
        let chunk_count = reader.read_var_u32()? as usize;
        let chunk_size = reader.read_var_u32()? as usize;
        let chunk_index = reader.read_var_u32()? as usize;

        if chunk_count == 0 || chunk_size == 0 || chunk_index >= chunk_count {
            return Err(CourierError::Malformed("bad fragment preamble"));
        }
        if chunk_count.saturating_mul(chunk_size) > MAX_GROUP_BYTES {
            return Err(CourierError::Malformed("fragment group too large"));
        }

        let data_bits = reader.remaining_bits();
        if data_bits > chunk_size * 8 || (chunk_index + 1 < chunk_count && data_bits != chunk_size * 8) {
            return Err(CourierError::Malformed("fragment chunk length mismatch"));
        }

        let group = self.groups.entry(group_id).or_insert_with(|| FragmentGroup {
            chunk_count,
            chunk_size,
            received: vec![false; chunk_count],
            received_count: 0,
            buffer: vec![0; chunk_count * chunk_size],
            total_bits: None,
            created_at: now,
        });
        if group.chunk_count != chunk_count || group.chunk_size != chunk_size {
            return Err(CourierError::Malformed("fragment preamble disagrees with group"));
        }
        if group.received[chunk_index] {
            self.duplicate_chunks += 1;
            return Ok(None);
        }

        let whole = data_bits / 8;
        let rem = (data_bits % 8) as u32;
        let base = chunk_index * chunk_size;
        let bytes = reader.read_bytes(whole)?;
        group.buffer[base..base + whole].copy_from_slice(&bytes);
        if rem > 0 {
            group.buffer[base + whole] = reader.read_bits(rem)? as u8;
        }

        if chunk_index + 1 == chunk_count {
            group.total_bits = Some((chunk_count - 1) * chunk_size * 8 + data_bits);
        }
        group.received[chunk_index] = true;
        group.received_count += 1;

        if group.received_count == group.chunk_count {
            let group = self
                .groups
                .remove(&group_id)
                .expect("group present while completing");
            let total_bits = group
                .total_bits
                .expect("final chunk seen before completion");
            let mut buffer = group.buffer;
            buffer.truncate(total_bits.div_ceil(8));
            return Ok(Some((Bytes::from(buffer), total_bits)));
        }
        Ok(None)
    }

    /// Drop groups older than `ttl`. Returns how many were abandoned.
    pub fn expire(&mut self, now: Instant, ttl: Duration) -> usize {
        let before = self.groups.len();
        self.groups.retain(|group_id, group| {
            let keep = now.duration_since(group.created_at) < ttl;
            if !keep {
                tracing::warn!(group_id, "dropping abandoned fragment group");
            }
            keep
        });
        let dropped = before - self.groups.len();
        self.expired_groups += dropped as u64;
        dropped
    }

    /// Groups still being assembled.
    pub fn in_progress(&self) -> usize {
        self.groups.len()
    }
}
