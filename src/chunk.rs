use std::fmt;

use bytes::Bytes;

pub type ChunkSender = tokio::sync::mpsc::Sender<ChunkCmd>;
pub type ChunkReceiver = tokio::sync::mpsc::Receiver<ChunkCmd>;

/// Messages from an encoder (producer) task to the coordinator. Delivery from
/// a single producer is in send order; ordering across producers is not
/// guaranteed and is reconciled by timestamp.
#[derive(Clone, Debug)]
pub enum ChunkCmd {
    Audio(EncodedChunk),
    Video(EncodedChunk),
    Error(String),
    Exit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkKind {
    Audio,
    Video,
}

impl fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkKind::Audio => write!(f, "audio"),
            ChunkKind::Video => write!(f, "video"),
        }
    }
}

/// One encoded unit of audio or video. The producer supplies the raw
/// timestamp/duration; the coordinator rewrites `timestamp` onto the output
/// timeline and may set `new_cluster` before framing.
#[derive(Clone, Debug)]
pub struct EncodedChunk {
    pub kind: ChunkKind,
    /// Producer-supplied units on arrival; output-timeline units once emitted.
    pub timestamp: i64,
    pub duration: Option<i64>,
    pub is_key: bool,
    /// Forces the muxer to open a new cluster for this chunk.
    pub new_cluster: bool,
    pub data: Bytes,
}

impl EncodedChunk {
    /// Audio chunks are always independently decodable.
    pub fn audio(timestamp: i64, duration: Option<i64>, data: Bytes) -> Self {
        Self {
            kind: ChunkKind::Audio,
            timestamp,
            duration,
            is_key: true,
            new_cluster: false,
            data,
        }
    }

    pub fn video(timestamp: i64, duration: Option<i64>, is_key: bool, data: Bytes) -> Self {
        Self {
            kind: ChunkKind::Video,
            timestamp,
            duration,
            is_key,
            new_cluster: false,
            data,
        }
    }
}
