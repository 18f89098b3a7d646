//! # Decode Collaborators
//!
//! Interfaces for the video and audio decoders the pipeline drives. The
//! pipeline only hands over compressed bytes and consumes borrowed output;
//! implementations live in `mjpeg` and `audio_codec`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Video decode failed: {0}")]
    Video(String),
    /// `consumed` input bytes may be skipped before retrying; zero means the
    /// rest of the chunk must be abandoned.
    #[error("Audio decode failed after {consumed} bytes: {reason}")]
    Audio { consumed: usize, reason: String },
    #[error("Unsupported format: {0}")]
    Unsupported(String),
}

impl DecodeError {
    /// Input bytes the decoder got through before failing.
    pub fn consumed(&self) -> usize {
        match self {
            DecodeError::Audio { consumed, .. } => *consumed,
            _ => 0,
        }
    }
}

// ============================================================================
// Video
// ============================================================================

/// A decoded picture, borrowed from the decoder until its next call.
#[derive(Debug, Clone, Copy)]
pub struct Picture<'a> {
    /// Packed RGB24 rows, top-down.
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
}

pub trait VideoDecoder {
    /// Decode one complete compressed frame.
    fn decode(&mut self, compressed: &[u8]) -> Result<Picture<'_>, DecodeError>;

    fn name(&self) -> &str;
}

// ============================================================================
// Audio
// ============================================================================

/// One block of interleaved PCM produced from the front of an input span.
#[derive(Debug, Clone, Copy)]
pub struct DecodedAudio<'a> {
    /// Input bytes used to produce this block.
    pub consumed: usize,
    pub samples: &'a [i16],
    pub sample_rate: u32,
    pub channels: u16,
}

impl DecodedAudio<'_> {
    /// Sample frames (one sample per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }
}

/// Runs on the audio task; a chunk may hold several codec frames, so the
/// caller loops on `consumed` until the span is used up.
pub trait AudioDecoder: Send {
    fn decode(&mut self, input: &[u8]) -> Result<DecodedAudio<'_>, DecodeError>;

    fn name(&self) -> &str;

    /// Forget inter-frame state.
    fn reset(&mut self) {}
}
