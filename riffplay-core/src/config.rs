//! Player configuration
//!
//! Buffer sizes, timeouts and pacing knobs. Every field has a default, so a
//! JSON file only needs the values it changes.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::avi_demux::DEFAULT_MAX_CHUNK_BYTES;
use crate::frame_ring::{DEFAULT_RING_CAPACITY, DEFAULT_SLOT_BYTES};

/// Upper bound for `pre_buffer_ms`.
pub const MAX_PRE_BUFFER_MS: u64 = 60_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Video ring slots.
    pub ring_capacity: usize,
    /// Per-slot capacity; larger video chunks are skipped.
    pub max_video_frame_bytes: usize,
    /// Demuxer destination capacity.
    pub max_chunk_bytes: usize,
    pub pre_buffer_ms: u64,
    pub audio_queue_capacity: usize,
    pub audio_push_wait_ms: u64,
    pub audio_pop_timeout_ms: u64,
    /// Demux reads per pacing tick.
    pub max_chunks_per_tick: usize,
    pub stop_timeout_ms: u64,
    pub silence_flush_blocks: usize,
    pub sink_write_timeout_ms: u64,
    /// Used when the container declares no frame rate.
    pub fallback_fps: u32,
    pub stats_interval_frames: u64,
    /// Software gain applied to decoded PCM, 0.0-1.0.
    pub audio_gain: f32,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            ring_capacity: DEFAULT_RING_CAPACITY,
            max_video_frame_bytes: DEFAULT_SLOT_BYTES,
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            pre_buffer_ms: 300,
            audio_queue_capacity: 8,
            audio_push_wait_ms: 20,
            audio_pop_timeout_ms: 50,
            max_chunks_per_tick: 8,
            stop_timeout_ms: 500,
            silence_flush_blocks: 4,
            sink_write_timeout_ms: 1000,
            fallback_fps: 30,
            stats_interval_frames: 30,
            audio_gain: 0.5,
        }
    }
}

impl PlayerConfig {
    /// Load from a JSON file and validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        tracing::debug!("Loaded config from {:?}", path.as_ref());
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ring_capacity < 3 {
            return Err(ConfigError::Invalid(format!(
                "ring_capacity must be at least 3, got {}",
                self.ring_capacity
            )));
        }
        let nonzero = [
            ("max_video_frame_bytes", self.max_video_frame_bytes),
            ("max_chunk_bytes", self.max_chunk_bytes),
            ("audio_queue_capacity", self.audio_queue_capacity),
            ("max_chunks_per_tick", self.max_chunks_per_tick),
            ("fallback_fps", self.fallback_fps as usize),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be non-zero", name)));
            }
        }
        if self.pre_buffer_ms > MAX_PRE_BUFFER_MS {
            return Err(ConfigError::Invalid(format!(
                "pre_buffer_ms must be at most {}, got {}",
                MAX_PRE_BUFFER_MS, self.pre_buffer_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.audio_gain) {
            return Err(ConfigError::Invalid(format!(
                "audio_gain must be within 0.0-1.0, got {}",
                self.audio_gain
            )));
        }
        Ok(())
    }

    /// Frames to buffer before the clock starts.
    pub fn pre_buffer_target(&self, fps: u32) -> usize {
        crate::pacer::pre_buffer_target(self.pre_buffer_ms, fps, self.ring_capacity)
    }

    /// Container rate, or the fallback when it declares none.
    pub fn effective_fps(&self, declared: u32) -> u32 {
        if declared > 0 {
            declared
        } else {
            self.fallback_fps
        }
    }

    pub fn audio_push_wait(&self) -> Duration {
        Duration::from_millis(self.audio_push_wait_ms)
    }

    pub fn audio_pop_timeout(&self) -> Duration {
        Duration::from_millis(self.audio_pop_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn sink_write_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_write_timeout_ms)
    }
}
