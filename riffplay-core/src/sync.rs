//! Playback clock and audio position.
//!
//! Wall clock is master. The audio task publishes how many sample frames it
//! has handed to the sink; the driver reads that for drift diagnostics.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Sample rate assumed until the container or decoder reports one.
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

/// Wall-clock frame schedule, started once pre-buffering completes.
#[derive(Debug, Clone)]
pub struct PlaybackClock {
    start: Option<Instant>,
    fps: u32,
    frame_duration_ms: u64,
}

impl PlaybackClock {
    pub fn new(fps: u32) -> Self {
        let fps = fps.max(1);
        Self {
            start: None,
            fps,
            frame_duration_ms: (1000 / fps as u64).max(1),
        }
    }

    pub fn start(&mut self) {
        self.start_at(Instant::now());
    }

    pub fn start_at(&mut self, at: Instant) {
        if self.start.is_none() {
            self.start = Some(at);
        }
    }

    pub fn is_started(&self) -> bool {
        self.start.is_some()
    }

    /// Time since `start`; zero before the clock runs.
    pub fn elapsed(&self) -> Duration {
        self.start.map(|s| s.elapsed()).unwrap_or_default()
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn frame_duration_ms(&self) -> u64 {
        self.frame_duration_ms
    }

    /// Index of the frame that should be on screen after `elapsed`.
    pub fn expected_frame(&self, elapsed: Duration) -> u64 {
        elapsed.as_millis() as u64 / self.frame_duration_ms
    }

    /// Presentation time of `frame` on this schedule.
    pub fn frame_time_ms(&self, frame: u64) -> u64 {
        frame * self.frame_duration_ms
    }
}

/// Samples-written counter shared between the audio task and the driver.
///
/// Written only by the audio task, read by everyone else.
#[derive(Debug)]
pub struct AudioPosition {
    samples_written: AtomicU64,
    sample_rate: AtomicU32,
}

impl AudioPosition {
    pub fn new(sample_rate: u32) -> Self {
        let sample_rate = if sample_rate == 0 {
            DEFAULT_SAMPLE_RATE
        } else {
            sample_rate
        };
        Self {
            samples_written: AtomicU64::new(0),
            sample_rate: AtomicU32::new(sample_rate),
        }
    }

    pub fn add_samples(&self, n: u64) {
        self.samples_written.fetch_add(n, Ordering::SeqCst);
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written.load(Ordering::SeqCst)
    }

    /// Decoders report the real rate; the container value is only a hint.
    pub fn set_sample_rate(&self, sample_rate: u32) {
        if sample_rate > 0 {
            self.sample_rate.store(sample_rate, Ordering::SeqCst);
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::SeqCst)
    }

    pub fn position_ms(&self) -> u64 {
        self.samples_written() * 1000 / self.sample_rate() as u64
    }

    pub fn reset(&self) {
        self.samples_written.store(0, Ordering::SeqCst);
    }
}

impl Default for AudioPosition {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_RATE)
    }
}

/// One periodic sync measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSnapshot {
    pub wall_ms: u64,
    pub audio_ms: Option<u64>,
    pub video_ms: u64,
    pub frame: u64,
}

impl SyncSnapshot {
    /// Drift in ms. Positive = video ahead of audio.
    pub fn drift_ms(&self) -> Option<i64> {
        self.audio_ms.map(|a| self.video_ms as i64 - a as i64)
    }
}
