//! Output timeline state and audio timestamp synchronization.
//!
//! Exactly one stream's state is active at a time; all mutation happens on
//! the coordinator's sequential message handler, so no locking is needed.

use crate::chunk::EncodedChunk;
use crate::metadata::StreamOptions;

pub const MAX_TIMESTAMP_MISMATCH_WARNINGS: u32 = 10;

/// Per-stream output timeline counters. Reset by construction at stream
/// start, discarded at stream end.
#[derive(Debug)]
pub struct TimelineState {
    /// Last emitted output timestamp across both streams; -1 before the first
    /// emission. Monotonic invariant: never decreases.
    last_timestamp: i64,
    /// Anchor: raw timestamp of the first audio chunk observed.
    first_audio_timestamp: Option<i64>,
    /// Accumulator for duration mode; -1 means duration mode is disabled.
    next_audio_timestamp: i64,
    last_audio_in_timestamp: i64,
    last_audio_out_timestamp: i64,
    /// Consecutive over-limit emissions since the last forced cluster.
    pub(crate) audio_msgs_since_last_cluster: usize,
    mismatch_warnings: u32,
}

impl TimelineState {
    pub fn new(options: &StreamOptions) -> Self {
        Self {
            last_timestamp: -1,
            first_audio_timestamp: None,
            next_audio_timestamp: if options.use_audio_timestamps { -1 } else { 0 },
            last_audio_in_timestamp: 0,
            last_audio_out_timestamp: 0,
            audio_msgs_since_last_cluster: 0,
            mismatch_warnings: 0,
        }
    }

    pub fn last_timestamp(&self) -> i64 {
        self.last_timestamp
    }

    pub fn mismatch_warnings(&self) -> u32 {
        self.mismatch_warnings
    }

    /// True while timestamps are derived by accumulating chunk durations.
    pub fn duration_mode(&self) -> bool {
        self.next_audio_timestamp >= 0
    }

    /// Rewrites an incoming audio chunk's timestamp onto the stream timeline.
    ///
    /// The first chunk's raw timestamp becomes the anchor. In duration mode
    /// the output timestamp is the running duration sum; a chunk without a
    /// duration permanently disables that mode. In raw mode the output
    /// timestamp is anchor-relative.
    pub fn ingest_audio(&mut self, chunk: &mut EncodedChunk) {
        let anchor = *self.first_audio_timestamp.get_or_insert(chunk.timestamp);
        let relative = chunk.timestamp - anchor;

        if chunk.duration.is_none() && self.next_audio_timestamp >= 0 {
            log::warn!("no audio duration, switching to chunk timestamps");
            self.next_audio_timestamp = -1;
        }

        if self.next_audio_timestamp >= 0 {
            chunk.timestamp = self.next_audio_timestamp;
            self.next_audio_timestamp += chunk.duration.unwrap_or(0);
            if chunk.timestamp != relative {
                self.mismatch_warnings += 1;
                if self.mismatch_warnings <= MAX_TIMESTAMP_MISMATCH_WARNINGS {
                    log::warn!(
                        "timestamp mismatch: timestamp={} durations={}",
                        relative,
                        chunk.timestamp
                    );
                    if self.mismatch_warnings == MAX_TIMESTAMP_MISMATCH_WARNINGS {
                        log::warn!("suppressing further timestamp mismatch warnings");
                    }
                }
            }
        } else {
            chunk.timestamp = relative;
        }
    }

    /// Re-expresses a queued audio chunk's timestamp onto the output
    /// timeline: delta-translated from the last translated chunk, clamped to
    /// stay ahead of the last emitted timestamp.
    pub fn translate_audio(&self, chunk: &EncodedChunk) -> i64 {
        let translated =
            self.last_audio_out_timestamp + (chunk.timestamp - self.last_audio_in_timestamp);
        if translated <= self.last_timestamp {
            if translated < self.last_timestamp {
                log::warn!(
                    "audio timestamp {} is older than last timestamp {}",
                    translated,
                    self.last_timestamp
                );
            }
            return self.last_timestamp + 1;
        }
        translated
    }

    /// Records the translation anchors and rewrites the chunk's timestamp.
    pub fn apply_translation(&mut self, chunk: &mut EncodedChunk, timestamp: i64) {
        self.last_audio_in_timestamp = chunk.timestamp;
        chunk.timestamp = timestamp;
        self.last_audio_out_timestamp = timestamp;
    }

    /// Final monotonicity clamp before emission, for audio and video alike.
    /// A colliding or older timestamp is rewritten to `last + 1`; the shared
    /// last emitted timestamp then advances.
    pub fn finalize(&mut self, chunk: &mut EncodedChunk) {
        if chunk.timestamp <= self.last_timestamp {
            if chunk.timestamp < self.last_timestamp {
                log::warn!(
                    "{} timestamp {} is older than last timestamp {}",
                    chunk.kind,
                    chunk.timestamp,
                    self.last_timestamp
                );
            }
            chunk.timestamp = self.last_timestamp + 1;
        }
        self.last_timestamp = chunk.timestamp;
    }
}

#[cfg(test)]
#[path = "sync_test.rs"]
mod sync_test;
