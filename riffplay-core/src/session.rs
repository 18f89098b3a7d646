//! # Playback Session
//!
//! Owns one playback from open to stop: the demuxer, the video ring, the
//! audio feed and task, and the pacer. The driver thread calls `tick()` in a
//! loop; every call does a bounded amount of work and never blocks for long.
//!
//! ```text
//!                  ┌──────────────┐ video ┌─────────────────┐ pace ┌─────────┐
//!  AviDemuxer ───► │ buffer_one_  │──────►│ VideoRingBuffer │─────►│ decoder │──► display
//!                  │ chunk        │       └─────────────────┘      └─────────┘
//!                  │ (stash first)│ audio ┌───────────┐  queue  ┌────────────┐
//!                  └──────────────┘──────►│ AudioFeed │────────►│ AudioTask  │──► sink
//!                                         └───────────┘         └────────────┘
//! ```
//!
//! States: PreBuffering → Running → Draining → Ended.

use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use crate::audio_codec;
use crate::audio_queue::{AudioChunkQueue, AudioFeed, Offer};
use crate::audio_task::{AudioStopReport, AudioTask, AudioTaskConfig, SharedSink};
use crate::avi_demux::{AviDemuxer, ChunkKind, ContainerInfo, DemuxError};
use crate::config::{ConfigError, PlayerConfig};
use crate::decode::{AudioDecoder, VideoDecoder};
use crate::frame_ring::{SlotWrite, VideoRingBuffer};
use crate::mjpeg::MjpegDecoder;
use crate::output::{NullDisplay, VideoOutput};
use crate::pacer::{PaceOutcome, Pacer, PlaybackState};
use crate::sync::{AudioPosition, PlaybackClock, SyncSnapshot};

/// Longest pre-buffer may wait on a queue that is not draining before
/// playback starts with what is buffered.
const MAX_PRE_BUFFER_AUDIO_STALL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error(transparent)]
    Demux(#[from] DemuxError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Failed to start audio: {0}")]
    AudioStart(String),
}

/// Result of one `buffer_one_chunk` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferResult {
    /// A chunk was read and routed (or deliberately skipped).
    Read(ChunkKind),
    /// Ring is full; nothing was read.
    VideoFull,
    /// The stash is still occupied and the next chunk is audio; nothing was
    /// read.
    AudioBlocked,
    EndOfFile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A frame was selected and handed to the decoder.
    Displayed { frame_index: u64, dropped: u64 },
    /// Nothing due (ahead of schedule, or ring empty awaiting data).
    Waiting,
    Ended,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub chunks_read: u64,
    pub video_frames_read: u64,
    pub frames_displayed: u64,
    pub frames_dropped: u64,
    pub current_frame: u64,
    pub video_decode_errors: u64,
    /// Skipped by the demuxer (larger than the chunk buffer).
    pub oversized_chunks: u64,
    /// Video chunks larger than a ring slot.
    pub video_frames_too_large: u64,
    pub audio_chunks_read: u64,
    pub audio_chunks_stashed: u64,
    /// Stashed chunks given up on (replaced while the queue stayed full,
    /// or still pending at end of stream).
    pub audio_chunks_dropped: u64,
    /// Read with no audio path running.
    pub audio_chunks_discarded: u64,
    /// Reads deferred because the next chunk was audio and the stash was
    /// still occupied.
    pub audio_backpressure_stalls: u64,
    pub progress_percent: u8,
    pub audio_position_ms: Option<u64>,
}

/// Returned by `PlaybackSession::stop`.
#[derive(Debug)]
pub struct StopReport {
    pub stats: SessionStats,
    pub audio: Option<AudioStopReport>,
    /// Reset ring, kept for the next session.
    pub ring: VideoRingBuffer,
}

// ============================================================================
// Builder
// ============================================================================

/// Collects collaborators before the container is opened.
pub struct SessionBuilder {
    config: PlayerConfig,
    video: Option<Box<dyn VideoDecoder>>,
    display: Option<Box<dyn VideoOutput>>,
    audio_sink: Option<SharedSink>,
    audio_decoder: Option<Box<dyn AudioDecoder>>,
    ring: Option<VideoRingBuffer>,
    #[cfg(test)]
    audio_feed: Option<AudioFeed>,
}

impl SessionBuilder {
    pub fn new(config: PlayerConfig) -> Self {
        Self {
            config,
            video: None,
            display: None,
            audio_sink: None,
            audio_decoder: None,
            ring: None,
            #[cfg(test)]
            audio_feed: None,
        }
    }

    /// Defaults to `MjpegDecoder`.
    pub fn video_decoder(mut self, decoder: Box<dyn VideoDecoder>) -> Self {
        self.video = Some(decoder);
        self
    }

    /// Defaults to `NullDisplay`.
    pub fn display(mut self, display: Box<dyn VideoOutput>) -> Self {
        self.display = Some(display);
        self
    }

    /// Without a sink, audio chunks are read and discarded.
    pub fn audio_sink(mut self, sink: SharedSink) -> Self {
        self.audio_sink = Some(sink);
        self
    }

    /// Overrides the decoder picked from the container's audio format.
    pub fn audio_decoder(mut self, decoder: Box<dyn AudioDecoder>) -> Self {
        self.audio_decoder = Some(decoder);
        self
    }

    /// Reuse a ring from a previous session if its geometry still matches.
    pub fn reuse_ring(mut self, ring: VideoRingBuffer) -> Self {
        self.ring = Some(ring);
        self
    }

    /// Attach a bare feed with no audio task, so tests control the consumer.
    #[cfg(test)]
    pub(crate) fn audio_feed(mut self, feed: AudioFeed) -> Self {
        self.audio_feed = Some(feed);
        self
    }

    pub fn open_path<P: AsRef<Path>>(
        self,
        path: P,
    ) -> Result<PlaybackSession<BufReader<File>>, PlaybackError> {
        self.config.validate()?;
        let demuxer = AviDemuxer::open_path(path, self.config.max_chunk_bytes)?;
        self.start(demuxer)
    }

    pub fn open<R: Read + Seek>(self, reader: R) -> Result<PlaybackSession<R>, PlaybackError> {
        self.config.validate()?;
        let demuxer = AviDemuxer::open(reader, self.config.max_chunk_bytes)?;
        self.start(demuxer)
    }

    fn start<R: Read + Seek>(
        mut self,
        demuxer: AviDemuxer<R>,
    ) -> Result<PlaybackSession<R>, PlaybackError> {
        let config = self.config;
        let info = demuxer.info().clone();

        let fps = config.effective_fps(info.fps);
        if info.fps == 0 {
            tracing::warn!("Container declares no frame rate, using {} fps", fps);
        }
        if self.video.is_none() && !MjpegDecoder::supports(info.video_codec.as_deref()) {
            tracing::warn!(
                "Video codec {} is not MJPEG, frames will likely fail to decode",
                info.video_codec.as_deref().unwrap_or("?")
            );
        }

        let ring = match self.ring.take() {
            Some(mut ring)
                if ring.capacity() == config.ring_capacity
                    && ring.slot_bytes() == config.max_video_frame_bytes =>
            {
                ring.reset();
                ring
            }
            _ => VideoRingBuffer::new(config.ring_capacity, config.max_video_frame_bytes),
        };

        let (feed, audio) = match (self.audio_sink.take(), info.has_audio) {
            (Some(sink), true) => match start_audio(&config, &info, sink, self.audio_decoder.take())? {
                Some((feed, task)) => (Some(feed), Some(task)),
                None => (None, None),
            },
            (Some(_), false) => {
                tracing::debug!("Container has no audio stream");
                (None, None)
            }
            (None, _) => (None, None),
        };
        #[cfg(test)]
        let feed = feed.or(self.audio_feed.take());

        let pre_buffer_target = config.pre_buffer_target(fps);
        tracing::info!(
            "Session ready: {}x{} @ {} fps, pre-buffer {} frames, audio {}",
            info.width,
            info.height,
            fps,
            pre_buffer_target,
            if audio.is_some() { "on" } else { "off" }
        );

        Ok(PlaybackSession {
            demuxer,
            ring,
            feed,
            audio,
            video: self
                .video
                .unwrap_or_else(|| Box::new(MjpegDecoder::new())),
            display: self.display.unwrap_or_else(|| Box::new(NullDisplay::new())),
            pacer: Pacer::new(PlaybackClock::new(fps)),
            state: PlaybackState::PreBuffering,
            eof: false,
            finish_requested: false,
            next_frame_index: 0,
            pre_buffer_target,
            stats: SessionStats::default(),
            diag: FrameTiming::default(),
            config,
        })
    }
}

/// Spawn the audio task. `Ok(None)` means audio is off for this session.
fn start_audio(
    config: &PlayerConfig,
    info: &ContainerInfo,
    sink: SharedSink,
    decoder: Option<Box<dyn AudioDecoder>>,
) -> Result<Option<(AudioFeed, AudioTask)>, PlaybackError> {
    let sample_rate = info.audio.map(|a| a.sample_rate).unwrap_or(0);
    let decoder = match decoder {
        Some(decoder) => decoder,
        None => {
            let Some(format) = info.audio else {
                tracing::warn!("Audio stream has no format record, continuing without audio");
                return Ok(None);
            };
            match audio_codec::decoder_for(&format) {
                Ok(decoder) => decoder,
                Err(e) => {
                    tracing::warn!("{}, continuing without audio", e);
                    return Ok(None);
                }
            }
        }
    };

    let queue = Arc::new(AudioChunkQueue::new(config.audio_queue_capacity));
    let position = Arc::new(AudioPosition::new(sample_rate));
    let task = AudioTask::spawn(
        queue.clone(),
        decoder,
        sink,
        position,
        AudioTaskConfig {
            pop_timeout: config.audio_pop_timeout(),
            sink_write_timeout: config.sink_write_timeout(),
            gain: config.audio_gain,
        },
    )
    .map_err(|e| PlaybackError::AudioStart(e.to_string()))?;

    Ok(Some((AudioFeed::new(queue, config.audio_push_wait()), task)))
}

// ============================================================================
// Session
// ============================================================================

/// Decode timing, reset every stats interval.
#[derive(Debug, Default)]
struct FrameTiming {
    frames: u64,
    decode_total: Duration,
}

pub struct PlaybackSession<R: Read + Seek> {
    config: PlayerConfig,
    demuxer: AviDemuxer<R>,
    ring: VideoRingBuffer,
    feed: Option<AudioFeed>,
    audio: Option<AudioTask>,
    video: Box<dyn VideoDecoder>,
    display: Box<dyn VideoOutput>,
    pacer: Pacer,
    state: PlaybackState,
    eof: bool,
    finish_requested: bool,
    next_frame_index: u64,
    pre_buffer_target: usize,
    stats: SessionStats,
    diag: FrameTiming,
}

impl PlaybackSession<BufReader<File>> {
    /// Open a file with default collaborators and the given audio sink.
    pub fn open_path<P: AsRef<Path>>(
        path: P,
        config: PlayerConfig,
        audio_sink: Option<SharedSink>,
    ) -> Result<Self, PlaybackError> {
        let mut builder = SessionBuilder::new(config);
        if let Some(sink) = audio_sink {
            builder = builder.audio_sink(sink);
        }
        builder.open_path(path)
    }
}

impl<R: Read + Seek> PlaybackSession<R> {
    pub fn info(&self) -> &ContainerInfo {
        self.demuxer.info()
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn ring(&self) -> &VideoRingBuffer {
        &self.ring
    }

    pub fn current_frame(&self) -> u64 {
        self.pacer.current_frame()
    }

    pub fn pre_buffer_target(&self) -> usize {
        self.pre_buffer_target
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    pub fn has_pending_audio(&self) -> bool {
        self.feed.as_ref().is_some_and(|f| f.has_pending())
    }

    /// Audio position from samples handed to the sink.
    pub fn audio_position_ms(&self) -> Option<u64> {
        self.audio.as_ref().map(|task| task.position().position_ms())
    }

    // ========================================================================
    // Buffering
    // ========================================================================

    /// Retry the pending audio chunk, then read and route one chunk.
    ///
    /// Audio pushes wait at most what is left of the feed's per-tick budget.
    /// While the stash is occupied, video chunks are still read but the next
    /// audio chunk is left in the container until the stash drains.
    pub fn buffer_one_chunk(&mut self) -> BufferResult {
        let stash_stuck = match self.feed.as_mut() {
            Some(feed) => !feed.retry_pending(),
            None => false,
        };

        if self.eof {
            return BufferResult::EndOfFile;
        }
        if self.ring.is_full() {
            return BufferResult::VideoFull;
        }
        if stash_stuck && self.demuxer.peek_kind() == ChunkKind::Audio {
            self.stats.audio_backpressure_stalls += 1;
            return BufferResult::AudioBlocked;
        }

        let chunk = self.demuxer.next_chunk();
        let kind = chunk.kind;
        match kind {
            ChunkKind::End => {
                self.eof = true;
                tracing::info!("End of file after {} chunks", self.stats.chunks_read);
                return BufferResult::EndOfFile;
            }
            ChunkKind::Video => {
                let frame_index = self.next_frame_index;
                // Index advances even for frames we cannot hold, keeping
                // later frames on schedule.
                self.next_frame_index += 1;
                self.stats.video_frames_read += 1;
                match self.ring.try_write(chunk.data, frame_index) {
                    SlotWrite::Written => {}
                    SlotWrite::Oversized => {
                        self.stats.video_frames_too_large += 1;
                        tracing::warn!(
                            "Video frame too large: {} > {}, skipping",
                            chunk.size(),
                            self.ring.slot_bytes()
                        );
                    }
                    // Checked above.
                    SlotWrite::Full => {}
                }
            }
            ChunkKind::Audio => {
                self.stats.audio_chunks_read += 1;
                match self.feed.as_mut() {
                    Some(feed) => match feed.offer(chunk.data) {
                        Offer::Queued => {}
                        Offer::Stashed | Offer::StashedReplacing => {
                            self.stats.audio_chunks_stashed += 1
                        }
                    },
                    None => self.stats.audio_chunks_discarded += 1,
                }
            }
            ChunkKind::Other => {}
        }

        self.stats.chunks_read += 1;
        BufferResult::Read(kind)
    }

    /// Fill the ring to the pre-buffer target (or EOF), then start the clock.
    pub fn prebuffer(&mut self) -> usize {
        if self.state != PlaybackState::PreBuffering {
            return self.ring.len();
        }

        tracing::info!(
            "Pre-buffering {} frames ({} ms at {} fps)...",
            self.pre_buffer_target,
            self.config.pre_buffer_ms,
            self.pacer.clock().fps()
        );
        let started = Instant::now();
        let mut audio_stall = Duration::ZERO;
        while self.ring.len() < self.pre_buffer_target {
            // The clock is not running yet, so every read may use the full
            // audio wait.
            if let Some(feed) = self.feed.as_mut() {
                feed.refill_wait_budget();
            }
            let attempt = Instant::now();
            match self.buffer_one_chunk() {
                BufferResult::Read(_) => {}
                BufferResult::AudioBlocked => {
                    audio_stall += attempt.elapsed();
                    if audio_stall >= MAX_PRE_BUFFER_AUDIO_STALL {
                        tracing::warn!(
                            "Audio queue not draining, starting with {} of {} frames",
                            self.ring.len(),
                            self.pre_buffer_target
                        );
                        break;
                    }
                }
                BufferResult::VideoFull | BufferResult::EndOfFile => break,
            }
        }
        tracing::info!(
            "Pre-buffered {} video frames in {} ms",
            self.ring.len(),
            started.elapsed().as_millis()
        );

        self.pacer.clock_mut().start();
        if self.eof {
            self.enter_draining();
        } else {
            self.state = PlaybackState::Running;
            tracing::info!("Playback starting");
        }
        self.ring.len()
    }

    /// Audio end-of-stream goes out once the stash is delivered, which may
    /// take several more ticks.
    fn enter_draining(&mut self) {
        self.state = PlaybackState::Draining;
        if !self.finish_requested {
            self.finish_requested = true;
            if let Some(feed) = self.feed.as_mut() {
                if !feed.finish() {
                    tracing::debug!("Audio end of stream waits for the pending chunk");
                }
            }
            tracing::info!("Draining {} buffered frames", self.ring.len());
        }
    }

    /// Keep delivering the stash after the video has ended. True once audio
    /// end-of-stream is out (or there is no audio path).
    fn finish_audio(&mut self) -> bool {
        match self.feed.as_mut() {
            Some(feed) => {
                feed.refill_wait_budget();
                feed.poll_finish()
            }
            None => true,
        }
    }

    /// Bounded top-up: at most `max_chunks_per_tick` reads and one audio
    /// wait budget.
    fn top_up(&mut self) {
        if let Some(feed) = self.feed.as_mut() {
            feed.refill_wait_budget();
        }
        for _ in 0..self.config.max_chunks_per_tick {
            match self.buffer_one_chunk() {
                BufferResult::Read(_) => {}
                BufferResult::VideoFull
                | BufferResult::AudioBlocked
                | BufferResult::EndOfFile => break,
            }
        }
        if self.eof && self.state == PlaybackState::Running {
            self.enter_draining();
        }
        if let Some(feed) = self.feed.as_mut() {
            feed.poll_finish();
        }
    }

    // ========================================================================
    // Pacing
    // ========================================================================

    /// One driver iteration against the wall clock.
    pub fn tick(&mut self) -> TickOutcome {
        if self.state == PlaybackState::PreBuffering {
            self.prebuffer();
        }
        let elapsed = self.pacer.clock().elapsed();
        self.tick_at(elapsed)
    }

    /// One driver iteration at an explicit elapsed time.
    pub fn tick_at(&mut self, elapsed: Duration) -> TickOutcome {
        match self.state {
            PlaybackState::PreBuffering => {
                self.prebuffer();
            }
            PlaybackState::Ended => {
                self.finish_audio();
                return TickOutcome::Ended;
            }
            PlaybackState::Running | PlaybackState::Draining => {}
        }
        self.top_up();
        self.pace_at(elapsed)
    }

    /// Pacing step only: show, drop or wait. No demux reads.
    pub fn pace_at(&mut self, elapsed: Duration) -> TickOutcome {
        if self.state == PlaybackState::Ended {
            return TickOutcome::Ended;
        }
        if self.ring.is_empty() && self.eof {
            self.enter_draining();
            if !self.finish_audio() {
                tracing::debug!("Video ended before the pending audio chunk was queued");
            }
            self.state = PlaybackState::Ended;
            tracing::info!("=== VIDEO END: frame={} ===", self.pacer.current_frame());
            return TickOutcome::Ended;
        }

        let video = &mut self.video;
        let display = &mut self.display;
        let stats = &mut self.stats;
        let diag = &mut self.diag;

        let outcome = self.pacer.pace(&mut self.ring, elapsed, |bytes, frame_index| {
            let t0 = Instant::now();
            match video.decode(bytes) {
                Ok(picture) => display.present(&picture, frame_index),
                Err(e) => {
                    stats.video_decode_errors += 1;
                    tracing::warn!("Frame {} decode failed: {}", frame_index, e);
                }
            }
            diag.decode_total += t0.elapsed();
            diag.frames += 1;
        });

        match outcome {
            PaceOutcome::Wait(_) => TickOutcome::Waiting,
            PaceOutcome::Shown {
                frame_index,
                dropped,
                ..
            } => {
                self.stats.frames_displayed += 1;
                self.stats.frames_dropped += dropped;
                self.stats.current_frame = self.pacer.current_frame();
                if self.diag.frames >= self.config.stats_interval_frames.max(1) {
                    self.log_timing(elapsed);
                }
                TickOutcome::Displayed {
                    frame_index,
                    dropped,
                }
            }
        }
    }

    fn log_timing(&mut self, elapsed: Duration) {
        let frames = self.diag.frames.max(1);
        let avg_ms = self.diag.decode_total.as_secs_f64() * 1000.0 / frames as f64;
        let current = self.pacer.current_frame();
        let snapshot = SyncSnapshot {
            wall_ms: elapsed.as_millis() as u64,
            audio_ms: self.audio_position_ms(),
            video_ms: self.pacer.clock().frame_time_ms(current),
            frame: current,
        };

        tracing::info!(
            "Timing (avg {}): decode={:.1}ms | buf={}",
            frames,
            avg_ms,
            self.ring.len()
        );
        match snapshot.audio_ms {
            Some(audio_ms) => tracing::info!(
                "Sync: wall={}ms audio={}ms video={}ms frame={} drift={:+}ms",
                snapshot.wall_ms,
                audio_ms,
                snapshot.video_ms,
                snapshot.frame,
                snapshot.drift_ms().unwrap_or(0)
            ),
            None => tracing::info!(
                "Sync: wall={}ms video={}ms frame={}",
                snapshot.wall_ms,
                snapshot.video_ms,
                snapshot.frame
            ),
        }
        self.diag = FrameTiming::default();
    }

    /// Tick until the session ends or `max_frames` have been displayed,
    /// sleeping `idle` between iterations.
    pub fn run(&mut self, max_frames: Option<u64>, idle: Duration) -> SessionStats {
        loop {
            if self.tick() == TickOutcome::Ended {
                break;
            }
            if max_frames.is_some_and(|max| self.stats.frames_displayed >= max) {
                tracing::info!("Frame limit reached");
                break;
            }
            thread::sleep(idle);
        }
        self.stats()
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    pub fn stats(&self) -> SessionStats {
        let mut stats = self.stats.clone();
        stats.oversized_chunks = self.demuxer.oversized_skipped();
        stats.progress_percent = self.demuxer.progress_percent();
        stats.current_frame = self.pacer.current_frame();
        stats.audio_position_ms = self.audio_position_ms();
        if let Some(feed) = &self.feed {
            stats.audio_chunks_dropped = feed.stats().chunks_dropped;
        }
        stats
    }

    /// Stop audio (bounded wait, then force), flush silence and hand back
    /// the reset ring.
    pub fn stop(mut self) -> StopReport {
        tracing::info!("Stopping playback");
        let mut stats = self.stats();

        let audio = self.audio.take().map(|task| {
            let position = task.position().clone();
            let report = task.stop(self.config.stop_timeout(), self.config.silence_flush_blocks);
            stats.audio_position_ms = Some(position.position_ms());
            report
        });

        tracing::info!(
            "Session stats: displayed={}, dropped={}, decode_errors={}, audio_stashed={}, audio_dropped={}",
            stats.frames_displayed,
            stats.frames_dropped,
            stats.video_decode_errors,
            stats.audio_chunks_stashed,
            stats.audio_chunks_dropped
        );

        self.ring.reset();
        StopReport {
            stats,
            audio,
            ring: self.ring,
        }
    }
}
