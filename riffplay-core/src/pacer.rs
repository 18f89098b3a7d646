//! Frame pacing.
//!
//! Decides, per tick, whether the front of the video ring should be shown,
//! waited on, or dropped to catch up with the wall clock. The pacer never
//! blocks; "wait" just means the caller polls again later.

use std::time::Duration;

use serde::Serialize;

use crate::frame_ring::VideoRingBuffer;
use crate::sync::PlaybackClock;

/// Minimum pre-buffer depth in frames.
pub const MIN_PRE_BUFFER_FRAMES: usize = 3;

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlaybackState {
    PreBuffering,
    Running,
    /// Demuxer hit end of file; showing what is left in the ring.
    Draining,
    Ended,
}

impl PlaybackState {
    pub fn is_active(self) -> bool {
        matches!(self, PlaybackState::Running | PlaybackState::Draining)
    }
}

/// Pre-buffer depth: `pre_buffer_ms` worth of frames, at least 3 and leaving
/// two ring slots free.
pub fn pre_buffer_target(pre_buffer_ms: u64, fps: u32, ring_capacity: usize) -> usize {
    let wanted = pre_buffer_ms.saturating_mul(fps as u64) / 1000;
    let wanted = usize::try_from(wanted).unwrap_or(usize::MAX);
    let upper = ring_capacity.saturating_sub(2).max(1);
    wanted.max(MIN_PRE_BUFFER_FRAMES).min(upper)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    /// Nothing buffered.
    Empty,
    /// The next frame is not due yet.
    Ahead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaceOutcome {
    Wait(WaitReason),
    Shown {
        frame_index: u64,
        expected_frame: u64,
        /// Frames popped without decoding before this one.
        dropped: u64,
    },
}

/// Display-side counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PacerStats {
    pub current_frame: u64,
    pub frames_shown: u64,
    pub frames_dropped: u64,
    pub ticks_waiting: u64,
}

pub struct Pacer {
    clock: PlaybackClock,
    current_frame: u64,
    stats: PacerStats,
}

impl Pacer {
    pub fn new(clock: PlaybackClock) -> Self {
        Self {
            clock,
            current_frame: 0,
            stats: PacerStats::default(),
        }
    }

    pub fn clock(&self) -> &PlaybackClock {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut PlaybackClock {
        &mut self.clock
    }

    /// Next frame index the display expects.
    pub fn current_frame(&self) -> u64 {
        self.current_frame
    }

    /// Run one pacing decision at `elapsed` since clock start.
    ///
    /// When a frame is selected, `show` gets its compressed bytes and index
    /// before the slot is released. Stale frames are dropped while more than
    /// one is buffered; the last buffered frame is always shown.
    pub fn pace<F>(&mut self, ring: &mut VideoRingBuffer, elapsed: Duration, show: F) -> PaceOutcome
    where
        F: FnOnce(&[u8], u64),
    {
        let expected = self.clock.expected_frame(elapsed);

        if ring.is_empty() {
            self.stats.ticks_waiting += 1;
            return PaceOutcome::Wait(WaitReason::Empty);
        }
        if self.current_frame > expected {
            self.stats.ticks_waiting += 1;
            return PaceOutcome::Wait(WaitReason::Ahead);
        }

        let mut dropped = 0;
        while ring.len() > 1 {
            match ring.front_index() {
                Some(index) if index < expected => {
                    ring.pop_front();
                    dropped += 1;
                }
                _ => break,
            }
        }

        let Some((bytes, frame_index)) = ring.peek_front() else {
            // Unreachable while len() >= 1.
            return PaceOutcome::Wait(WaitReason::Empty);
        };
        show(bytes, frame_index);
        ring.pop_front();

        if dropped > 0 {
            tracing::debug!(
                "Dropped {} late frames, showing {} (expected {})",
                dropped,
                frame_index,
                expected
            );
        }

        self.current_frame = frame_index + 1;
        self.stats.current_frame = self.current_frame;
        self.stats.frames_shown += 1;
        self.stats.frames_dropped += dropped;

        PaceOutcome::Shown {
            frame_index,
            expected_frame: expected,
            dropped,
        }
    }

    pub fn stats(&self) -> PacerStats {
        self.stats
    }
}
