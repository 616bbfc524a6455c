//! Chunk wire framing between the coordinator and the muxer task.
//!
//! One chunk = four sequential segments: 1-byte flags, 8-byte LE output
//! timestamp, 8-byte LE duration (0 if absent), raw payload. Segment
//! boundaries are message boundaries; there are no embedded lengths, so the
//! transport must preserve segment identity.

use bytes::Bytes;

use crate::chunk::EncodedChunk;

// chunk header flags
pub const KEY_FLAG: u8 = 0b010;
pub const NEW_CLUSTER_FLAG: u8 = 0b100;

/// Serializes one chunk as its four wire segments, payload last.
pub fn chunk_segments(chunk: &EncodedChunk) -> [Bytes; 4] {
    let mut flags = 0u8;
    if chunk.is_key {
        flags |= KEY_FLAG;
    }
    if chunk.new_cluster {
        flags |= NEW_CLUSTER_FLAG;
    }

    [
        Bytes::copy_from_slice(&[flags]),
        encode_u64(chunk.timestamp.max(0) as u64),
        encode_u64(chunk.duration.unwrap_or(0).max(0) as u64),
        chunk.data.clone(),
    ]
}

pub fn encode_u64(value: u64) -> Bytes {
    Bytes::copy_from_slice(&value.to_le_bytes())
}

pub fn encode_u32(value: u32) -> Bytes {
    Bytes::copy_from_slice(&value.to_le_bytes())
}

/// Decodes an 8-byte LE segment (muxer side / tests).
pub fn decode_u64(segment: &[u8]) -> anyhow::Result<u64> {
    let bytes: [u8; 8] = segment
        .try_into()
        .map_err(|_| anyhow::anyhow!("expected 8-byte segment, got {}", segment.len()))?;
    Ok(u64::from_le_bytes(bytes))
}

/// Decodes a flag segment into (is_key, new_cluster).
pub fn decode_flags(segment: &[u8]) -> anyhow::Result<(bool, bool)> {
    if segment.len() != 1 {
        return Err(anyhow::anyhow!(
            "expected 1-byte flag segment, got {}",
            segment.len()
        ));
    }
    let flags = segment[0];
    Ok((flags & KEY_FLAG != 0, flags & NEW_CLUSTER_FLAG != 0))
}

#[cfg(test)]
#[path = "protocol_test.rs"]
mod protocol_test;
