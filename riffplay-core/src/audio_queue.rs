//! # Audio Chunk Queue
//!
//! Bounded FIFO of compressed audio chunks between the pipeline driver and
//! the audio task, plus the single-slot stash that keeps the driver from
//! ever blocking on audio backpressure.
//!
//! ```text
//! ┌────────┐ offer ┌──────────┐ push_chunk ┌─────────────────┐ try_pop ┌────────────┐
//! │ Driver │──────►│ AudioFeed│───────────►│ AudioChunkQueue │────────►│ Audio task │
//! └────────┘       │ + stash  │            │ (bounded)       │         └────────────┘
//!                  └──────────┘            └─────────────────┘
//! ```
//!
//! Chunks are copied in at the queue boundary since the demuxer's buffer is
//! only borrowed. Buffers are recycled through a small pool so steady-state
//! playback does not allocate.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Returned when the queue stayed full for the whole bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull;

// ============================================================================
// Audio Chunk
// ============================================================================

/// An owned copy of one compressed audio chunk.
#[derive(Debug)]
pub struct AudioChunk {
    /// Demux-order sequence number among audio chunks.
    pub seq: u64,
    data: Vec<u8>,
}

impl AudioChunk {
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// ============================================================================
// Queue
// ============================================================================

pub struct AudioChunkQueue {
    capacity: usize,
    chunks: Mutex<VecDeque<AudioChunk>>,
    /// Spare buffers returned by the consumer.
    pool: Mutex<Vec<Vec<u8>>>,
    ready_cond: Condvar,
    space_cond: Condvar,
    eos: AtomicBool,
    next_seq: AtomicU64,
    chunks_pushed: AtomicU64,
    chunks_popped: AtomicU64,
    push_timeouts: AtomicU64,
}

impl AudioChunkQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            chunks: Mutex::new(VecDeque::with_capacity(capacity)),
            pool: Mutex::new(Vec::with_capacity(capacity + 1)),
            ready_cond: Condvar::new(),
            space_cond: Condvar::new(),
            eos: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
            chunks_pushed: AtomicU64::new(0),
            chunks_popped: AtomicU64::new(0),
            push_timeouts: AtomicU64::new(0),
        }
    }

    // ========================================================================
    // Producer API (pipeline driver)
    // ========================================================================

    /// Copy `bytes` into the queue, waiting at most `wait` for space.
    pub fn push_chunk(&self, bytes: &[u8], wait: Duration) -> Result<(), QueueFull> {
        let deadline = Instant::now() + wait;
        let mut queue = self.chunks.lock();

        while queue.len() >= self.capacity {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.push_timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(QueueFull);
            }
            self.space_cond.wait_for(&mut queue, remaining);
        }

        let mut data = self.pool.lock().pop().unwrap_or_default();
        data.clear();
        data.extend_from_slice(bytes);

        queue.push_back(AudioChunk {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            data,
        });
        self.chunks_pushed.fetch_add(1, Ordering::Relaxed);
        drop(queue);

        self.ready_cond.notify_one();
        Ok(())
    }

    /// No more chunks will be pushed. The consumer drains what is queued.
    pub fn end_of_stream(&self) {
        self.eos.store(true, Ordering::SeqCst);
        // Take the lock so a consumer between its empty check and its wait
        // cannot miss the wakeup.
        let _queue = self.chunks.lock();
        self.ready_cond.notify_all();
    }

    // ========================================================================
    // Consumer API (audio task)
    // ========================================================================

    /// Pop the oldest chunk, waiting up to `timeout`.
    ///
    /// Returns immediately with `None` once end-of-stream is set and the
    /// queue is empty.
    pub fn try_pop(&self, timeout: Duration) -> Option<AudioChunk> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.chunks.lock();

        while queue.is_empty() {
            if self.eos.load(Ordering::SeqCst) {
                return None;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            self.ready_cond.wait_for(&mut queue, remaining);
        }

        let chunk = queue.pop_front();
        drop(queue);

        if chunk.is_some() {
            self.chunks_popped.fetch_add(1, Ordering::Relaxed);
            self.space_cond.notify_one();
        }
        chunk
    }

    /// Return a consumed chunk's buffer to the pool.
    pub fn recycle(&self, chunk: AudioChunk) {
        let mut pool = self.pool.lock();
        if pool.len() <= self.capacity {
            pool.push(chunk.data);
        }
    }

    // ========================================================================
    // Control / Status API
    // ========================================================================

    /// Drop queued chunks and clear end-of-stream for a new session.
    pub fn reset(&self) {
        let mut queue = self.chunks.lock();
        let mut pool = self.pool.lock();
        while let Some(chunk) = queue.pop_front() {
            if pool.len() <= self.capacity {
                pool.push(chunk.data);
            }
        }
        drop(pool);
        drop(queue);

        self.eos.store(false, Ordering::SeqCst);
        self.next_seq.store(0, Ordering::Relaxed);
        self.chunks_pushed.store(0, Ordering::Relaxed);
        self.chunks_popped.store(0, Ordering::Relaxed);
        self.push_timeouts.store(0, Ordering::Relaxed);
        self.space_cond.notify_all();
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.eos.load(Ordering::SeqCst)
    }

    /// End-of-stream set and nothing left to pop.
    pub fn is_drained(&self) -> bool {
        self.is_end_of_stream() && self.chunks.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> AudioQueueStats {
        AudioQueueStats {
            queued: self.len(),
            capacity: self.capacity,
            chunks_pushed: self.chunks_pushed.load(Ordering::Relaxed),
            chunks_popped: self.chunks_popped.load(Ordering::Relaxed),
            push_timeouts: self.push_timeouts.load(Ordering::Relaxed),
            end_of_stream: self.is_end_of_stream(),
        }
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioQueueStats {
    pub queued: usize,
    pub capacity: usize,
    pub chunks_pushed: u64,
    pub chunks_popped: u64,
    pub push_timeouts: u64,
    pub end_of_stream: bool,
}

// ============================================================================
// Pending Stash
// ============================================================================

/// Holds at most one audio chunk that the queue refused.
#[derive(Debug, Default)]
pub struct PendingChunkStash {
    data: Vec<u8>,
    occupied: bool,
}

impl PendingChunkStash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        !self.occupied
    }

    pub fn len(&self) -> usize {
        if self.occupied {
            self.data.len()
        } else {
            0
        }
    }

    pub fn peek(&self) -> Option<&[u8]> {
        self.occupied.then_some(self.data.as_slice())
    }

    /// Keep a copy of `bytes`. Returns true if an older chunk was replaced.
    pub fn store(&mut self, bytes: &[u8]) -> bool {
        let replaced = self.occupied;
        self.data.clear();
        self.data.extend_from_slice(bytes);
        self.occupied = true;
        replaced
    }

    pub fn clear(&mut self) {
        self.occupied = false;
        self.data.clear();
    }
}

// ============================================================================
// Audio Feed (producer-side policy)
// ============================================================================

/// What happened to an offered chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Queued,
    Stashed,
    /// The stash was still occupied after a second retry; its chunk was
    /// dropped to make room for this one.
    StashedReplacing,
}

/// Driver-side wrapper enforcing the stash rule: the pending chunk is always
/// retried before the next demux read, and is cleared only once it is queued.
///
/// Pushes share a wait budget of `push_wait`, refilled by the driver once per
/// tick, so audio backpressure costs the driver at most one bounded wait per
/// tick however many chunks it reads.
pub struct AudioFeed {
    queue: Arc<AudioChunkQueue>,
    stash: PendingChunkStash,
    push_wait: Duration,
    wait_budget: Duration,
    finishing: bool,
    eos_sent: bool,
    stats: FeedStats,
}

/// Feed statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub chunks_offered: u64,
    pub chunks_stashed: u64,
    pub stash_retries: u64,
    pub chunks_dropped: u64,
}

/// Push with whatever is left of the wait budget, charging the time spent.
fn push_within_budget(
    queue: &AudioChunkQueue,
    budget: &mut Duration,
    bytes: &[u8],
) -> Result<(), QueueFull> {
    let started = Instant::now();
    let result = queue.push_chunk(bytes, *budget);
    *budget = budget.saturating_sub(started.elapsed());
    result
}

impl AudioFeed {
    pub fn new(queue: Arc<AudioChunkQueue>, push_wait: Duration) -> Self {
        Self {
            queue,
            stash: PendingChunkStash::new(),
            push_wait,
            wait_budget: push_wait,
            finishing: false,
            eos_sent: false,
            stats: FeedStats::default(),
        }
    }

    pub fn queue(&self) -> &Arc<AudioChunkQueue> {
        &self.queue
    }

    pub fn has_pending(&self) -> bool {
        !self.stash.is_empty()
    }

    pub fn stash(&self) -> &PendingChunkStash {
        &self.stash
    }

    /// Restore the full `push_wait` budget. Called once per driver tick.
    pub fn refill_wait_budget(&mut self) {
        self.wait_budget = self.push_wait;
    }

    pub fn wait_budget(&self) -> Duration {
        self.wait_budget
    }

    /// Retry the stashed chunk, if any. Returns true when nothing is pending
    /// afterwards.
    pub fn retry_pending(&mut self) -> bool {
        let Some(pending) = self.stash.peek() else {
            return true;
        };
        self.stats.stash_retries += 1;
        if push_within_budget(&self.queue, &mut self.wait_budget, pending).is_ok() {
            tracing::debug!("Pending audio chunk delivered");
            self.stash.clear();
            true
        } else {
            false
        }
    }

    /// Deliver a freshly demuxed audio chunk, stashing it if the queue is
    /// full. Order is preserved: a new chunk never overtakes the stash.
    ///
    /// Callers should not offer while a chunk is pending; if they do and the
    /// stash still cannot be delivered, the older chunk is replaced.
    pub fn offer(&mut self, bytes: &[u8]) -> Offer {
        self.stats.chunks_offered += 1;

        if self.has_pending() && !self.retry_pending() {
            self.stash.store(bytes);
            self.stats.chunks_stashed += 1;
            self.stats.chunks_dropped += 1;
            tracing::warn!(
                "Audio queue still full, dropping older pending chunk ({} queued)",
                self.queue.len()
            );
            return Offer::StashedReplacing;
        }

        match push_within_budget(&self.queue, &mut self.wait_budget, bytes) {
            Ok(()) => Offer::Queued,
            Err(QueueFull) => {
                self.stash.store(bytes);
                self.stats.chunks_stashed += 1;
                tracing::debug!("Audio queue full, stashing {} byte chunk", bytes.len());
                Offer::Stashed
            }
        }
    }

    /// No more chunks will be offered. End-of-stream reaches the queue once
    /// the stash has been delivered; until then `poll_finish` keeps retrying.
    /// Returns true once end-of-stream has been signalled.
    pub fn finish(&mut self) -> bool {
        self.finishing = true;
        self.poll_finish()
    }

    /// Retry the stash of a finishing feed and signal end-of-stream once it
    /// is delivered.
    pub fn poll_finish(&mut self) -> bool {
        if !self.finishing || self.eos_sent {
            return self.eos_sent;
        }
        if self.retry_pending() {
            self.queue.end_of_stream();
            self.eos_sent = true;
            tracing::debug!("Audio end of stream signalled");
        }
        self.eos_sent
    }

    pub fn is_finished(&self) -> bool {
        self.eos_sent
    }

    pub fn stats(&self) -> FeedStats {
        self.stats.clone()
    }
}

// ============================================================================
// Tests
// ============================================================================
