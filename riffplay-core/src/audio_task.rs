//! # Audio Task
//!
//! Dedicated thread that drains the audio chunk queue, decodes each chunk
//! (several codec frames per chunk when the codec packs them), applies the
//! software gain and writes PCM to the sink.
//!
//! ```text
//!   AudioChunkQueue ──try_pop──► decode loop ──gain──► sink.write ──► samples_written
//!          ▲                        │  (consumed)                        (AudioPosition)
//!     stop / EOS                    └── error: skip `consumed`, or abandon the chunk
//! ```
//!
//! Stopping is bounded: `stop` raises the stop flag, waits up to the given
//! timeout, and if the thread is still stuck (usually inside a sink write)
//! raises `abandon` and detaches it. The sink is always flushed with silence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::audio_queue::AudioChunkQueue;
use crate::decode::AudioDecoder;
use crate::output::{AudioSink, SinkError};
use crate::sync::AudioPosition;

/// Sink shared between the task and teardown.
pub type SharedSink = Arc<Mutex<Box<dyn AudioSink>>>;

pub fn shared_sink<S: AudioSink + 'static>(sink: S) -> SharedSink {
    Arc::new(Mutex::new(Box::new(sink)))
}

/// Frames per silence block written at teardown.
pub const SILENCE_BLOCK_FRAMES: usize = 1024;

/// Per-block write timeout for the teardown flush.
const SILENCE_WRITE_TIMEOUT: Duration = Duration::from_millis(20);

/// Audio written between sync log lines.
const SYNC_LOG_INTERVAL_MS: u64 = 3000;

#[derive(Debug, Clone)]
pub struct AudioTaskConfig {
    pub pop_timeout: Duration,
    pub sink_write_timeout: Duration,
    pub gain: f32,
}

impl Default for AudioTaskConfig {
    fn default() -> Self {
        Self {
            pop_timeout: Duration::from_millis(50),
            sink_write_timeout: Duration::from_millis(1000),
            gain: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum AudioTaskExit {
    #[default]
    Running,
    /// Queue drained after end-of-stream.
    EndOfStream,
    /// Stop flag observed.
    Stopped,
    /// Did not exit within the stop timeout; detached.
    Abandoned,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AudioTaskStats {
    pub chunks_received: u64,
    /// Codec frames (decode calls) that produced PCM.
    pub blocks_decoded: u64,
    pub decode_errors: u64,
    /// Chunk bytes left undecoded after a zero-progress error.
    pub bytes_abandoned: u64,
    pub samples_written: u64,
    /// Frames the sink did not accept (partial or failed writes).
    pub samples_lost: u64,
    pub sink_timeouts: u64,
    pub sink_errors: u64,
    pub exit: AudioTaskExit,
}

struct TaskShared {
    stop: AtomicBool,
    abandon: AtomicBool,
    done: Mutex<bool>,
    done_cond: Condvar,
    stats: Mutex<AudioTaskStats>,
}

impl TaskShared {
    fn finish(&self, exit: AudioTaskExit) {
        self.stats.lock().exit = exit;
        *self.done.lock() = true;
        self.done_cond.notify_all();
    }

    fn wait_done(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock();
        while !*done {
            if self.done_cond.wait_until(&mut done, deadline).timed_out() {
                return *done;
            }
        }
        true
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Owner handle for the running audio thread.
pub struct AudioTask {
    handle: Option<JoinHandle<()>>,
    shared: Arc<TaskShared>,
    queue: Arc<AudioChunkQueue>,
    sink: SharedSink,
    position: Arc<AudioPosition>,
}

/// What `stop` did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AudioStopReport {
    /// Exited within the timeout.
    pub clean: bool,
    pub silence_blocks: usize,
    pub stats: AudioTaskStats,
}

impl AudioTask {
    pub fn spawn(
        queue: Arc<AudioChunkQueue>,
        decoder: Box<dyn AudioDecoder>,
        sink: SharedSink,
        position: Arc<AudioPosition>,
        config: AudioTaskConfig,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(TaskShared {
            stop: AtomicBool::new(false),
            abandon: AtomicBool::new(false),
            done: Mutex::new(false),
            done_cond: Condvar::new(),
            stats: Mutex::new(AudioTaskStats::default()),
        });

        let mut worker = AudioWorker {
            queue: queue.clone(),
            decoder,
            sink: sink.clone(),
            position: position.clone(),
            shared: shared.clone(),
            config,
            stats: AudioTaskStats::default(),
            scaled: Vec::new(),
            format: None,
            started: Instant::now(),
            next_sync_log_ms: SYNC_LOG_INTERVAL_MS,
        };

        let handle = thread::Builder::new()
            .name("riffplay-audio".into())
            .spawn(move || worker.run())?;

        Ok(Self {
            handle: Some(handle),
            shared,
            queue,
            sink,
            position,
        })
    }

    pub fn position(&self) -> &Arc<AudioPosition> {
        &self.position
    }

    pub fn is_finished(&self) -> bool {
        *self.shared.done.lock()
    }

    /// Snapshot of the task counters.
    pub fn stats(&self) -> AudioTaskStats {
        self.shared.stats.lock().clone()
    }

    /// Stop the task, waiting at most `timeout`, then flush the sink with
    /// `silence_blocks` blocks of silence.
    pub fn stop(mut self, timeout: Duration, silence_blocks: usize) -> AudioStopReport {
        tracing::info!("Stopping audio task");
        self.shared.stop.store(true, Ordering::SeqCst);
        // Wakes a consumer parked in try_pop.
        self.queue.end_of_stream();

        let clean = self.shared.wait_done(timeout);
        if clean {
            if let Some(handle) = self.handle.take() {
                if handle.join().is_err() {
                    tracing::warn!("Audio task panicked");
                }
            }
        } else {
            tracing::warn!(
                "Audio task did not exit within {} ms, abandoning it",
                timeout.as_millis()
            );
            self.shared.abandon.store(true, Ordering::SeqCst);
            // Detach; the thread drops out at its next abandon check.
            self.handle.take();
        }

        let silence_blocks = flush_silence(&self.sink, silence_blocks, timeout);

        let mut stats = self.stats();
        if !clean {
            stats.exit = AudioTaskExit::Abandoned;
        }
        stats.samples_written = self.position.samples_written();

        AudioStopReport {
            clean,
            silence_blocks,
            stats,
        }
    }
}

impl Drop for AudioTask {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shared.stop.store(true, Ordering::SeqCst);
            self.shared.abandon.store(true, Ordering::SeqCst);
            self.queue.end_of_stream();
        }
    }
}

/// Write silence blocks to cut off residual sound. Returns blocks written.
///
/// Waits up to `lock_timeout` for a detached task to release the sink; once
/// the lock is held, `abandon` guarantees the task never writes again.
pub fn flush_silence(sink: &SharedSink, blocks: usize, lock_timeout: Duration) -> usize {
    let Some(mut sink) = sink.try_lock_for(lock_timeout) else {
        tracing::warn!("Audio sink still busy, skipping silence flush");
        return 0;
    };

    let mut written = 0;
    for _ in 0..blocks {
        match sink.write_silence(SILENCE_BLOCK_FRAMES, SILENCE_WRITE_TIMEOUT) {
            Ok(_) => written += 1,
            Err(e) => tracing::debug!("Silence flush write: {}", e),
        }
    }
    written
}

// ============================================================================
// Worker
// ============================================================================

struct AudioWorker {
    queue: Arc<AudioChunkQueue>,
    decoder: Box<dyn AudioDecoder>,
    sink: SharedSink,
    position: Arc<AudioPosition>,
    shared: Arc<TaskShared>,
    config: AudioTaskConfig,
    stats: AudioTaskStats,
    scaled: Vec<i16>,
    /// Last (sample_rate, channels) the sink was configured for.
    format: Option<(u32, u16)>,
    started: Instant,
    next_sync_log_ms: u64,
}

impl AudioWorker {
    fn run(&mut self) {
        tracing::info!("Audio task started (decoder: {})", self.decoder.name());
        self.started = Instant::now();

        let exit = loop {
            if self.shared.stop.load(Ordering::SeqCst) {
                break AudioTaskExit::Stopped;
            }

            let Some(chunk) = self.queue.try_pop(self.config.pop_timeout) else {
                if self.queue.is_drained() {
                    break if self.shared.stop.load(Ordering::SeqCst) {
                        AudioTaskExit::Stopped
                    } else {
                        AudioTaskExit::EndOfStream
                    };
                }
                continue;
            };

            self.stats.chunks_received += 1;
            self.decode_chunk(chunk.as_bytes());
            self.queue.recycle(chunk);

            self.publish_stats();
            self.log_sync();
        };

        self.publish_stats();
        let elapsed_ms = self.started.elapsed().as_millis();
        tracing::info!(
            "Audio task ending ({:?}): elapsed={}ms, audio_pos={}ms, samples={}",
            exit,
            elapsed_ms,
            self.position.position_ms(),
            self.position.samples_written()
        );
        tracing::info!(
            "Audio stats: chunks={}, decoded={}, errors={}, samples_lost={}, timeouts={}",
            self.stats.chunks_received,
            self.stats.blocks_decoded,
            self.stats.decode_errors,
            self.stats.samples_lost,
            self.stats.sink_timeouts
        );
        self.shared.finish(exit);
    }

    /// Decode every codec frame in `bytes`, writing each PCM block out.
    fn decode_chunk(&mut self, bytes: &[u8]) {
        let mut offset = 0;

        while offset < bytes.len() {
            if self.shared.stop.load(Ordering::SeqCst) {
                return;
            }

            let consumed = match self.decoder.decode(&bytes[offset..]) {
                Ok(block) => {
                    let consumed = block.consumed;
                    let format = (block.sample_rate, block.channels);
                    let gain = self.config.gain;
                    self.scaled.clear();
                    self.scaled
                        .extend(block.samples.iter().map(|&s| (s as f32 * gain) as i16));

                    if !self.scaled.is_empty() {
                        self.stats.blocks_decoded += 1;
                        self.write_block(format);
                    }
                    consumed
                }
                Err(e) => {
                    self.stats.decode_errors += 1;
                    tracing::warn!("Audio decode error at offset {}: {}", offset, e);
                    e.consumed()
                }
            };

            if consumed == 0 {
                // No progress; abandon the rest of this chunk.
                self.stats.bytes_abandoned += (bytes.len() - offset) as u64;
                return;
            }
            offset += consumed;
        }
    }

    fn write_block(&mut self, format: (u32, u16)) {
        let mut sink = self.sink.lock();
        if self.shared.abandon.load(Ordering::SeqCst) {
            return;
        }

        if self.format != Some(format) {
            let (sample_rate, channels) = format;
            tracing::info!("Audio format: {} Hz, {} ch", sample_rate, channels);
            if let Err(e) = sink.configure(sample_rate, channels) {
                tracing::warn!("Audio sink rejected format: {}", e);
                self.stats.sink_errors += 1;
                return;
            }
            self.position.set_sample_rate(sample_rate);
            self.format = Some(format);
        }

        let channels = format.1.max(1) as usize;
        let frames = self.scaled.len() / channels;
        let written = match sink.write(&self.scaled, self.config.sink_write_timeout) {
            Ok(written) => written,
            Err(SinkError::Timeout { written }) => {
                self.stats.sink_timeouts += 1;
                tracing::warn!("Audio sink write timed out ({}/{} frames)", written, frames);
                written
            }
            Err(e) => {
                self.stats.sink_errors += 1;
                tracing::warn!("Audio sink write failed: {}", e);
                0
            }
        };

        // Frames finishing after abandonment are not counted.
        if self.shared.abandon.load(Ordering::SeqCst) {
            return;
        }
        let written = written.min(frames);
        self.position.add_samples(written as u64);
        self.stats.samples_lost += (frames - written) as u64;
    }

    fn publish_stats(&mut self) {
        self.stats.samples_written = self.position.samples_written();
        let mut shared = self.shared.stats.lock();
        let exit = shared.exit;
        *shared = self.stats.clone();
        shared.exit = exit;
    }

    fn log_sync(&mut self) {
        let audio_ms = self.position.position_ms();
        if audio_ms < self.next_sync_log_ms {
            return;
        }
        self.next_sync_log_ms = audio_ms + SYNC_LOG_INTERVAL_MS;

        let elapsed_ms = self.started.elapsed().as_millis() as i64;
        tracing::info!(
            "Audio sync: elapsed={}ms, audio_pos={}ms, drift={:+}ms, timeouts={}",
            elapsed_ms,
            audio_ms,
            audio_ms as i64 - elapsed_ms,
            self.stats.sink_timeouts
        );
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{DecodeError, DecodedAudio};
    use std::sync::atomic::AtomicU64;

    const NO_WAIT: Duration = Duration::ZERO;

    fn test_config() -> AudioTaskConfig {
        AudioTaskConfig {
            pop_timeout: Duration::from_millis(10),
            sink_write_timeout: Duration::from_millis(100),
            gain: 1.0,
        }
    }

    /// Each input byte decodes to one mono frame whose value is the byte.
    /// 0xEE bytes fail with one byte consumed; 0xFF fails with no progress.
    /// Frames are produced `frame_len` bytes at a time.
    struct ScriptedDecoder {
        frame_len: usize,
        out: Vec<i16>,
    }

    impl ScriptedDecoder {
        fn boxed(frame_len: usize) -> Box<dyn AudioDecoder> {
            Box::new(Self {
                frame_len,
                out: Vec::new(),
            })
        }
    }

    impl AudioDecoder for ScriptedDecoder {
        fn decode(&mut self, input: &[u8]) -> Result<DecodedAudio<'_>, DecodeError> {
            match input[0] {
                0xEE => {
                    return Err(DecodeError::Audio {
                        consumed: 1,
                        reason: "corrupt".into(),
                    })
                }
                0xFF => {
                    return Err(DecodeError::Audio {
                        consumed: 0,
                        reason: "lost sync".into(),
                    })
                }
                _ => {}
            }
            let n = input
                .iter()
                .take(self.frame_len)
                .take_while(|&&b| b != 0xEE && b != 0xFF)
                .count();
            self.out.clear();
            self.out.extend(input[..n].iter().map(|&b| b as i16));
            Ok(DecodedAudio {
                consumed: n,
                samples: &self.out,
                sample_rate: 1000,
                channels: 1,
            })
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    /// Records every sample; optionally sleeps per write.
    struct RecordingSink {
        samples: Arc<Mutex<Vec<i16>>>,
        writes: Arc<AtomicU64>,
        delay: Duration,
        accept_frames: Option<usize>,
    }

    impl RecordingSink {
        fn new() -> (Self, Arc<Mutex<Vec<i16>>>, Arc<AtomicU64>) {
            let samples = Arc::new(Mutex::new(Vec::new()));
            let writes = Arc::new(AtomicU64::new(0));
            (
                Self {
                    samples: samples.clone(),
                    writes: writes.clone(),
                    delay: Duration::ZERO,
                    accept_frames: None,
                },
                samples,
                writes,
            )
        }
    }

    impl AudioSink for RecordingSink {
        fn configure(&mut self, _sample_rate: u32, _channels: u16) -> Result<(), SinkError> {
            Ok(())
        }

        fn write(&mut self, samples: &[i16], _timeout: Duration) -> Result<usize, SinkError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            match self.accept_frames {
                Some(n) if n < samples.len() => {
                    self.samples.lock().extend_from_slice(&samples[..n]);
                    Err(SinkError::Timeout { written: n })
                }
                _ => {
                    self.samples.lock().extend_from_slice(samples);
                    Ok(samples.len())
                }
            }
        }

        fn channels(&self) -> u16 {
            1
        }
    }

    fn spawn(
        queue: &Arc<AudioChunkQueue>,
        decoder: Box<dyn AudioDecoder>,
        sink: SharedSink,
        config: AudioTaskConfig,
    ) -> (AudioTask, Arc<AudioPosition>) {
        let position = Arc::new(AudioPosition::new(1000));
        let task = AudioTask::spawn(queue.clone(), decoder, sink, position.clone(), config).unwrap();
        (task, position)
    }

    fn wait_finished(task: &AudioTask) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !task.is_finished() {
            assert!(Instant::now() < deadline, "audio task did not finish");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_drains_queue_then_ends() {
        let queue = Arc::new(AudioChunkQueue::new(8));
        let (sink, samples, _) = RecordingSink::new();
        let (task, position) = spawn(&queue, ScriptedDecoder::boxed(2), shared_sink(sink), test_config());

        queue.push_chunk(&[1, 2, 3], NO_WAIT).unwrap();
        queue.push_chunk(&[4, 5], NO_WAIT).unwrap();
        queue.end_of_stream();
        wait_finished(&task);

        assert_eq!(*samples.lock(), vec![1, 2, 3, 4, 5]);
        assert_eq!(position.samples_written(), 5);
        assert_eq!(position.position_ms(), 5);

        let stats = task.stats();
        assert_eq!(stats.exit, AudioTaskExit::EndOfStream);
        assert_eq!(stats.chunks_received, 2);
        // [1,2] [3] [4,5]
        assert_eq!(stats.blocks_decoded, 3);

        let report = task.stop(Duration::from_millis(500), 0);
        assert!(report.clean);
        assert_eq!(report.stats.samples_written, 5);
    }

    #[test]
    fn test_decode_errors_skip_or_abandon() {
        let queue = Arc::new(AudioChunkQueue::new(8));
        let (sink, samples, _) = RecordingSink::new();
        let (task, _) = spawn(&queue, ScriptedDecoder::boxed(8), shared_sink(sink), test_config());

        // 0xEE skips one byte; 0xFF abandons the remaining 3 bytes.
        queue.push_chunk(&[1, 0xEE, 2, 0xFF, 3, 4], NO_WAIT).unwrap();
        queue.push_chunk(&[9], NO_WAIT).unwrap();
        queue.end_of_stream();
        wait_finished(&task);

        assert_eq!(*samples.lock(), vec![1, 2, 9]);
        let stats = task.stats();
        assert_eq!(stats.decode_errors, 2);
        assert_eq!(stats.bytes_abandoned, 3);
    }

    #[test]
    fn test_gain_applied() {
        let queue = Arc::new(AudioChunkQueue::new(2));
        let (sink, samples, _) = RecordingSink::new();
        let config = AudioTaskConfig {
            gain: 0.5,
            ..test_config()
        };
        let (task, _) = spawn(&queue, ScriptedDecoder::boxed(4), shared_sink(sink), config);

        queue.push_chunk(&[100, 7], NO_WAIT).unwrap();
        queue.end_of_stream();
        wait_finished(&task);
        assert_eq!(*samples.lock(), vec![50, 3]);
    }

    #[test]
    fn test_partial_write_counts_lost() {
        let queue = Arc::new(AudioChunkQueue::new(2));
        let (mut sink, _, _) = RecordingSink::new();
        sink.accept_frames = Some(3);
        let (task, position) = spawn(&queue, ScriptedDecoder::boxed(5), shared_sink(sink), test_config());

        queue.push_chunk(&[1, 2, 3, 4, 5], NO_WAIT).unwrap();
        queue.end_of_stream();
        wait_finished(&task);

        assert_eq!(position.samples_written(), 3);
        let stats = task.stats();
        assert_eq!(stats.samples_lost, 2);
        assert_eq!(stats.sink_timeouts, 1);
    }

    #[test]
    fn test_stop_mid_decode_is_bounded() {
        let queue = Arc::new(AudioChunkQueue::new(4));
        let (mut sink, _, writes) = RecordingSink::new();
        sink.delay = Duration::from_millis(20);
        let (task, position) = spawn(&queue, ScriptedDecoder::boxed(1), shared_sink(sink), test_config());

        // 200 one-frame blocks at 20 ms each: far longer than the stop timeout.
        queue.push_chunk(&[1; 200], NO_WAIT).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while writes.load(Ordering::SeqCst) < 3 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(2));
        }

        let start = Instant::now();
        let report = task.stop(Duration::from_millis(500), 4);
        assert!(start.elapsed() < Duration::from_millis(900));
        assert!(report.clean);
        assert_eq!(report.stats.exit, AudioTaskExit::Stopped);
        assert_eq!(report.silence_blocks, 4);

        let frozen = position.samples_written();
        assert_eq!(report.stats.samples_written, frozen);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(position.samples_written(), frozen);
    }

    #[test]
    fn test_stuck_sink_is_abandoned() {
        let queue = Arc::new(AudioChunkQueue::new(4));
        let (mut sink, _, writes) = RecordingSink::new();
        sink.delay = Duration::from_millis(300);
        let (task, position) = spawn(&queue, ScriptedDecoder::boxed(1), shared_sink(sink), test_config());

        queue.push_chunk(&[1, 2, 3], NO_WAIT).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while writes.load(Ordering::SeqCst) < 1 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(2));
        }

        // The task is inside a 300 ms write; a 50 ms stop cannot wait it out.
        let report = task.stop(Duration::from_millis(50), 1);
        assert!(!report.clean);
        assert_eq!(report.stats.exit, AudioTaskExit::Abandoned);

        let frozen = position.samples_written();
        thread::sleep(Duration::from_millis(400));
        assert_eq!(position.samples_written(), frozen);
    }
}
