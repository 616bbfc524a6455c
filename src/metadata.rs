//! Stream metadata, options and the one-time stream-open header block.

use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::{encode_u32, encode_u64};

// metadata flags
pub const AUDIO_FLAG: u8 = 0b10;

pub const OPUS_CODEC_ID: &str = "A_OPUS";

/// Default Opus seek pre-roll in nanoseconds (RFC 7845 decoders need 80ms of
/// pre-roll after a seek).
pub const OPUS_SEEK_PRE_ROLL: u64 = 80_000;

/// Audio sub-record of the stream metadata.
#[derive(Clone, Debug)]
pub struct AudioMetadata {
    pub sample_rate: u32,
    pub channels: u32,
    /// 0 for compressed codecs.
    pub bit_depth: u32,
    /// Container codec identifier, e.g. "A_OPUS" or "A_PCM/FLOAT/IEEE".
    pub codec_id: String,
    pub pre_skip: Option<u16>,
    pub output_gain: Option<u16>,
    /// None = codec default (80000 for Opus, 0 otherwise).
    pub seek_pre_roll: Option<u64>,
}

impl AudioMetadata {
    pub fn opus(sample_rate: u32, channels: u32) -> Self {
        Self {
            sample_rate,
            channels,
            bit_depth: 0,
            codec_id: OPUS_CODEC_ID.to_string(),
            pre_skip: None,
            output_gain: None,
            seek_pre_roll: None,
        }
    }

    pub fn is_opus(&self) -> bool {
        self.codec_id == OPUS_CODEC_ID
    }
}

/// Immutable per-stream configuration, established once at stream start.
#[derive(Clone, Debug)]
pub struct StreamMetadata {
    /// Maximum cluster duration in nanoseconds; None = muxer default.
    pub max_segment_duration: Option<u64>,
    pub video: bool,
    pub audio: Option<AudioMetadata>,
}

impl StreamMetadata {
    pub fn audio_only(audio: AudioMetadata) -> Self {
        Self {
            max_segment_duration: None,
            video: false,
            audio: Some(audio),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.video && self.audio.is_none() {
            anyhow::bail!("stream metadata has neither audio nor video");
        }
        if let Some(audio) = &self.audio {
            if audio.sample_rate == 0 {
                anyhow::bail!("audio sample_rate must be non-zero");
            }
            if audio.channels == 0 {
                anyhow::bail!("audio channels must be non-zero");
            }
            if audio.codec_id.is_empty() {
                anyhow::bail!("audio codec_id must not be empty");
            }
            if audio.is_opus() && audio.channels > u8::MAX as u32 {
                anyhow::bail!("opus channel count {} exceeds 255", audio.channels);
            }
        }
        Ok(())
    }
}

/// Recognized stream options, immutable after start.
#[derive(Clone, Debug)]
pub struct StreamOptions {
    /// Maximum buffered audio chunks before a cluster is forced; None = unbounded.
    pub audio_queue_limit: Option<usize>,
    /// Use producer timestamps directly instead of accumulating durations.
    pub use_audio_timestamps: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            audio_queue_limit: None,
            use_audio_timestamps: false,
        }
    }
}

/// Serializes the stream-open header as wire segments, in order: max segment
/// duration, flags, then (audio only) sample rate, channels, bit depth, codec
/// id, codec-private data, seek pre-roll. Must be acknowledged by the muxer
/// before any chunk data follows.
pub fn metadata_segments(metadata: &StreamMetadata) -> Vec<Bytes> {
    let mut segments = Vec::new();

    segments.push(encode_u64(metadata.max_segment_duration.unwrap_or(0)));

    let flags = if metadata.audio.is_some() {
        AUDIO_FLAG
    } else {
        0
    };
    segments.push(Bytes::copy_from_slice(&[flags]));

    if let Some(audio) = &metadata.audio {
        segments.push(encode_u32(audio.sample_rate));
        segments.push(encode_u32(audio.channels));
        segments.push(encode_u32(audio.bit_depth));
        // raw ASCII, no length prefix; one segment = one field
        segments.push(Bytes::copy_from_slice(audio.codec_id.as_bytes()));
        segments.push(codec_private(audio));

        let default_pre_roll = if audio.is_opus() {
            OPUS_SEEK_PRE_ROLL
        } else {
            0
        };
        segments.push(encode_u64(audio.seek_pre_roll.unwrap_or(default_pre_roll)));
    }

    segments
}

/// Codec-private data: the fixed 19-byte OpusHead identification header
/// (RFC 7845 section 5.1) for Opus, empty for any other codec.
fn codec_private(audio: &AudioMetadata) -> Bytes {
    if !audio.is_opus() {
        return Bytes::new();
    }

    let mut buf = BytesMut::with_capacity(19);
    buf.put_slice(b"OpusHead"); // magic
    buf.put_u8(1); // version
    buf.put_u8(audio.channels as u8);
    buf.put_u16_le(audio.pre_skip.unwrap_or(0));
    buf.put_u32_le(audio.sample_rate);
    buf.put_u16_le(audio.output_gain.unwrap_or(0));
    buf.put_u8(0); // mapping family
    buf.freeze()
}

#[cfg(test)]
#[path = "metadata_test.rs"]
mod metadata_test;
