//! # riffplay core
//!
//! Streaming AVI playback: a chunk demuxer feeding a fixed-slot video ring
//! and a bounded audio queue, paced against a wall clock that starts after
//! pre-buffering.

// ============================================================================
// Container
// ============================================================================
pub mod avi_demux;

// ============================================================================
// Buffering
// ============================================================================
pub mod frame_ring;
pub mod audio_queue;

// ============================================================================
// Timing
// ============================================================================
pub mod sync;
pub mod pacer;

// ============================================================================
// Codecs / Output
// ============================================================================
pub mod decode;
pub mod mjpeg;
pub mod audio_codec;
pub mod output;

// ============================================================================
// Playback
// ============================================================================
pub mod audio_task;
pub mod session;

// ============================================================================
// Configuration
// ============================================================================
pub mod config;
pub mod playlist;

#[cfg(test)]
mod testing;

pub use avi_demux::{AviDemuxer, Chunk, ChunkKind, ContainerInfo, DemuxError};
pub use config::{ConfigError, PlayerConfig};
pub use output::{AudioSink, NullDisplay, NullSink, VideoOutput};
pub use pacer::PlaybackState;
pub use playlist::{Playlist, PlaylistEntry, PlaylistError};
pub use session::{PlaybackError, PlaybackSession, SessionBuilder, SessionStats, StopReport, TickOutcome};

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
