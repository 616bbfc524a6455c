//! Audio queue management: bounds memory and latency while preserving
//! arrival order.

use std::collections::VecDeque;

use crate::chunk::EncodedChunk;
use crate::sync::TimelineState;

/// FIFO of pending audio chunks, owned by the coordinator loop. Chunks only
/// leave by emission; flushing rewrites timestamps through the timeline
/// state, so returned chunks are ready for framing as-is.
#[derive(Debug, Default)]
pub struct AudioQueue {
    queued: VecDeque<EncodedChunk>,
}

impl AudioQueue {
    pub fn new() -> Self {
        Self {
            queued: VecDeque::new(),
        }
    }

    pub fn push(&mut self, chunk: EncodedChunk) {
        self.queued.push_back(chunk);
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    /// Flush pass. Without video the whole queue drains directly. With video
    /// every queued chunk is first drained with translated timestamps, then
    /// the depth-limited retention pass applies `audio_queue_limit`.
    ///
    /// The unconditional drain empties the queue before the retention pass
    /// can act; the retention pass still matters as the latency/memory
    /// safety valve for callers entering with a backlog (notably the forced
    /// end-of-stream flush with a limit of zero).
    pub fn flush(
        &mut self,
        state: &mut TimelineState,
        video: bool,
        audio_queue_limit: Option<usize>,
    ) -> Vec<EncodedChunk> {
        if !video {
            let mut out = Vec::with_capacity(self.queued.len());
            while let Some(mut chunk) = self.queued.pop_front() {
                state.finalize(&mut chunk);
                out.push(chunk);
            }
            return out;
        }

        let mut out = Vec::new();
        while !self.queued.is_empty() {
            let timestamp = state.translate_audio(&self.queued[0]);
            if let Some(mut chunk) = self.queued.pop_front() {
                state.apply_translation(&mut chunk, timestamp);
                state.finalize(&mut chunk);
                out.push(chunk);
            }
        }

        out.extend(self.flush_retained(state, audio_queue_limit));
        out
    }

    /// Depth-limited retention pass: emits chunks while the queue is over the
    /// limit. Each emission that brings the queue back down to the limit
    /// bumps `audio_msgs_since_last_cluster`; once that counter exceeds the
    /// limit the emitted chunk forces a new cluster and the counter resets.
    pub fn flush_retained(
        &mut self,
        state: &mut TimelineState,
        audio_queue_limit: Option<usize>,
    ) -> Vec<EncodedChunk> {
        let mut out = Vec::new();
        let limit = match audio_queue_limit {
            Some(limit) => limit,
            None => return out,
        };

        while self.queued.len() > limit {
            if let Some(mut chunk) = self.queued.pop_front() {
                if self.queued.len() == limit {
                    state.audio_msgs_since_last_cluster += 1;
                    if state.audio_msgs_since_last_cluster > limit {
                        chunk.new_cluster = true;
                        state.audio_msgs_since_last_cluster = 0;
                    }
                }
                let timestamp = state.translate_audio(&chunk);
                state.apply_translation(&mut chunk, timestamp);
                state.finalize(&mut chunk);
                out.push(chunk);
            }
        }
        out
    }

    /// End-of-stream flush: forces a new cluster on the first queued chunk,
    /// then drains with an effective limit of zero so nothing stays behind.
    pub fn flush_end(&mut self, state: &mut TimelineState, video: bool) -> Vec<EncodedChunk> {
        if let Some(front) = self.queued.front_mut() {
            front.new_cluster = true;
        }
        self.flush(state, video, Some(0))
    }
}

#[cfg(test)]
#[path = "queue_test.rs"]
mod queue_test;
