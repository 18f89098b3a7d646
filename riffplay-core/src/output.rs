//! # Output Collaborators
//!
//! Audio sinks and picture displays. The pipeline only needs blocking PCM
//! writes with a timeout and a place to present decoded pictures.
//!
//! - `NullSink` / `NullDisplay` - headless, used by the player and tests
//! - `CpalSink` (feature `audio`) - cpal output stream fed through a ringbuf

use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::decode::Picture;

#[derive(Debug, Error)]
pub enum SinkError {
    /// The deadline passed with only `written` frames accepted.
    #[error("Sink write timed out after {written} frames")]
    Timeout { written: usize },
    #[error("Sink closed")]
    Closed,
    #[error("Audio device error: {0}")]
    Device(String),
}

// ============================================================================
// Traits
// ============================================================================

/// PCM output. Samples are interleaved i16.
pub trait AudioSink: Send {
    /// Called before the first write and whenever the decoded format changes.
    fn configure(&mut self, sample_rate: u32, channels: u16) -> Result<(), SinkError>;

    /// Blocking write, bounded by `timeout`. Returns sample frames written.
    fn write(&mut self, samples: &[i16], timeout: Duration) -> Result<usize, SinkError>;

    fn channels(&self) -> u16;

    /// Write `frames` frames of silence.
    fn write_silence(&mut self, frames: usize, timeout: Duration) -> Result<usize, SinkError> {
        let silence = vec![0i16; frames * self.channels().max(1) as usize];
        self.write(&silence, timeout)
    }
}

/// Presents decoded pictures.
pub trait VideoOutput {
    fn present(&mut self, picture: &Picture<'_>, frame_index: u64);
}

// ============================================================================
// Null Sink
// ============================================================================

/// Discards PCM. When paced, writes block as if a device were draining at
/// the configured rate, so the audio position tracks real time.
#[derive(Debug)]
pub struct NullSink {
    paced: bool,
    sample_rate: u32,
    channels: u16,
    started: Option<Instant>,
    frames_written: u64,
}

impl NullSink {
    pub fn new() -> Self {
        Self {
            paced: false,
            sample_rate: crate::sync::DEFAULT_SAMPLE_RATE,
            channels: 2,
            started: None,
            frames_written: 0,
        }
    }

    pub fn realtime() -> Self {
        Self {
            paced: true,
            ..Self::new()
        }
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// How long until the virtual device has played everything written.
    fn backlog(&self) -> Duration {
        let Some(started) = self.started else {
            return Duration::ZERO;
        };
        let played_until =
            Duration::from_micros(self.frames_written * 1_000_000 / self.sample_rate.max(1) as u64);
        played_until.saturating_sub(started.elapsed())
    }
}

impl Default for NullSink {
    fn default() -> Self {
        Self::new()
    }
}

/// Device-side buffering the virtual device allows before writes block.
const NULL_SINK_LATENCY: Duration = Duration::from_millis(100);

impl AudioSink for NullSink {
    fn configure(&mut self, sample_rate: u32, channels: u16) -> Result<(), SinkError> {
        if sample_rate == 0 || channels == 0 {
            return Err(SinkError::Device(format!(
                "invalid format {} Hz x {}",
                sample_rate, channels
            )));
        }
        if self.sample_rate != sample_rate || self.channels != channels {
            tracing::debug!("Null sink configured: {} Hz, {} ch", sample_rate, channels);
            self.sample_rate = sample_rate;
            self.channels = channels;
            self.started = None;
            self.frames_written = 0;
        }
        Ok(())
    }

    fn write(&mut self, samples: &[i16], timeout: Duration) -> Result<usize, SinkError> {
        let frames = samples.len() / self.channels.max(1) as usize;
        if self.paced {
            self.started.get_or_insert_with(Instant::now);
            let wait = self.backlog().saturating_sub(NULL_SINK_LATENCY);
            if wait > timeout {
                thread::sleep(timeout);
                return Err(SinkError::Timeout { written: 0 });
            }
            if !wait.is_zero() {
                thread::sleep(wait);
            }
        }
        self.frames_written += frames as u64;
        Ok(frames)
    }

    fn channels(&self) -> u16 {
        self.channels
    }
}

// ============================================================================
// Null Display
// ============================================================================

/// Counts presented pictures.
#[derive(Debug, Default)]
pub struct NullDisplay {
    presented: u64,
    last_frame: Option<u64>,
    last_size: (u32, u32),
}

impl NullDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn presented(&self) -> u64 {
        self.presented
    }

    pub fn last_frame(&self) -> Option<u64> {
        self.last_frame
    }

    pub fn last_size(&self) -> (u32, u32) {
        self.last_size
    }
}

impl VideoOutput for NullDisplay {
    fn present(&mut self, picture: &Picture<'_>, frame_index: u64) {
        self.presented += 1;
        self.last_frame = Some(frame_index);
        self.last_size = (picture.width, picture.height);
    }
}

// ============================================================================
// cpal Sink
// ============================================================================

#[cfg(feature = "audio")]
pub use self::device::CpalSink;

#[cfg(feature = "audio")]
mod device {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread::{self, JoinHandle};
    use std::time::{Duration, Instant};

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{SampleFormat, StreamConfig};
    use ringbuf::traits::{Consumer, Observer, Producer, Split};
    use ringbuf::{HeapCons, HeapProd, HeapRb};

    use super::{AudioSink, SinkError};

    /// Default output device. `cpal::Stream` is not `Send`, so the stream
    /// lives on its own holder thread and this sink only owns the producer
    /// half of the ring.
    pub struct CpalSink {
        producer: Option<HeapProd<f32>>,
        sample_rate: u32,
        channels: u16,
        scratch: Vec<f32>,
        shutdown: Arc<AtomicBool>,
        stream_thread: Option<JoinHandle<()>>,
    }

    impl CpalSink {
        pub fn new() -> Self {
            Self {
                producer: None,
                sample_rate: 0,
                channels: 0,
                scratch: Vec::new(),
                shutdown: Arc::new(AtomicBool::new(false)),
                stream_thread: None,
            }
        }

        fn close_stream(&mut self) {
            self.shutdown.store(true, Ordering::SeqCst);
            if let Some(handle) = self.stream_thread.take() {
                let _ = handle.join();
            }
            self.producer = None;
        }

        fn open_stream(&mut self, sample_rate: u32, channels: u16) -> Result<(), SinkError> {
            self.close_stream();

            // 500 ms of device-side buffering
            let ring = HeapRb::<f32>::new((sample_rate as usize * channels as usize / 2).max(1024));
            let (producer, consumer) = ring.split();

            let shutdown = Arc::new(AtomicBool::new(false));
            let (ready_tx, ready_rx) = mpsc::channel();
            let stop = shutdown.clone();

            let handle = thread::Builder::new()
                .name("riffplay-cpal".into())
                .spawn(move || match build_stream(sample_rate, channels, consumer) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        while !stop.load(Ordering::SeqCst) {
                            thread::sleep(Duration::from_millis(10));
                        }
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                })
                .map_err(|e| SinkError::Device(format!("Failed to spawn stream thread: {}", e)))?;

            match ready_rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    let _ = handle.join();
                    return Err(e);
                }
                Err(_) => {
                    let _ = handle.join();
                    return Err(SinkError::Closed);
                }
            }

            tracing::info!("Audio output open: {} Hz, {} ch", sample_rate, channels);
            self.producer = Some(producer);
            self.shutdown = shutdown;
            self.stream_thread = Some(handle);
            self.sample_rate = sample_rate;
            self.channels = channels;
            Ok(())
        }
    }

    impl Default for CpalSink {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Drop for CpalSink {
        fn drop(&mut self) {
            self.close_stream();
        }
    }

    fn build_stream(
        sample_rate: u32,
        channels: u16,
        mut consumer: HeapCons<f32>,
    ) -> Result<cpal::Stream, SinkError> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| SinkError::Device("No default output device found".into()))?;
        let sample_format = device
            .default_output_config()
            .map_err(|e| SinkError::Device(format!("Failed to get output config: {}", e)))?
            .sample_format();

        let config = StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let err_fn = |err| tracing::warn!("Audio stream error: {}", err);

        let stream = match sample_format {
            SampleFormat::F32 => device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    for sample in data.iter_mut() {
                        *sample = consumer.try_pop().unwrap_or(0.0);
                    }
                },
                err_fn,
                None,
            ),
            SampleFormat::I16 => device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    for sample in data.iter_mut() {
                        let s = consumer.try_pop().unwrap_or(0.0);
                        *sample = (s * i16::MAX as f32) as i16;
                    }
                },
                err_fn,
                None,
            ),
            other => {
                return Err(SinkError::Device(format!(
                    "Unsupported sample format {:?}",
                    other
                )))
            }
        }
        .map_err(|e| SinkError::Device(format!("Failed to build stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| SinkError::Device(format!("Failed to start stream: {}", e)))?;
        Ok(stream)
    }

    impl AudioSink for CpalSink {
        fn configure(&mut self, sample_rate: u32, channels: u16) -> Result<(), SinkError> {
            if self.producer.is_some() && self.sample_rate == sample_rate && self.channels == channels {
                return Ok(());
            }
            self.open_stream(sample_rate, channels)
        }

        fn write(&mut self, samples: &[i16], timeout: Duration) -> Result<usize, SinkError> {
            let channels = self.channels.max(1) as usize;
            let producer = self.producer.as_mut().ok_or(SinkError::Closed)?;

            self.scratch.clear();
            self.scratch
                .extend(samples.iter().map(|&s| s as f32 / 32768.0));

            let deadline = Instant::now() + timeout;
            let mut pushed = 0;
            while pushed < self.scratch.len() {
                pushed += producer.push_slice(&self.scratch[pushed..]);
                if pushed == self.scratch.len() {
                    break;
                }
                if Instant::now() >= deadline {
                    return Err(SinkError::Timeout {
                        written: pushed / channels,
                    });
                }
                if producer.vacant_len() == 0 {
                    thread::sleep(Duration::from_millis(2));
                }
            }
            Ok(pushed / channels)
        }

        fn channels(&self) -> u16 {
            self.channels
        }
    }
}
