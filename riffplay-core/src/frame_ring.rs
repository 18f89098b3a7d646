//! # Video Frame Ring Buffer
//!
//! Fixed-capacity circular store of *compressed* video frames. It sits
//! between the demuxer's bursty reads and the display loop:
//!
//! ```text
//! ┌──────────┐  try_write  ┌──────────────────┐  peek/pop  ┌───────┐
//! │ Demuxer  │────────────►│ VideoRingBuffer  │───────────►│ Pacer │
//! └──────────┘             │ N fixed slots    │            └───────┘
//!                          └──────────────────┘
//! ```
//!
//! Producer and consumer run on the same thread, so slots are never locked;
//! `buffered` alone decides which slots are live. Slot memory is allocated
//! once and kept across sessions (`reset` only rewinds the cursors).

/// Default number of slots.
pub const DEFAULT_RING_CAPACITY: usize = 16;

/// Default per-slot capacity for one compressed frame.
pub const DEFAULT_SLOT_BYTES: usize = 64 * 1024;

// ============================================================================
// Slots
// ============================================================================

#[derive(Debug)]
struct RingSlot {
    data: Box<[u8]>,
    len: usize,
    frame_index: u64,
}

impl RingSlot {
    fn new(slot_bytes: usize) -> Self {
        Self {
            data: vec![0u8; slot_bytes].into_boxed_slice(),
            len: 0,
            frame_index: 0,
        }
    }
}

/// Result of offering a frame to the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotWrite {
    Written,
    /// All slots hold undisplayed frames; stop reading video this cycle.
    Full,
    /// The frame does not fit a slot. Nothing was stored.
    Oversized,
}

impl SlotWrite {
    pub fn is_written(self) -> bool {
        self == SlotWrite::Written
    }
}

// ============================================================================
// Ring Buffer
// ============================================================================

/// `Debug` lists cursors and counters, not slot contents.
pub struct VideoRingBuffer {
    slots: Vec<RingSlot>,
    slot_bytes: usize,
    write_index: usize,
    read_index: usize,
    buffered: usize,
    frames_written: u64,
    frames_popped: u64,
    full_rejections: u64,
}

impl std::fmt::Debug for VideoRingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoRingBuffer")
            .field("capacity", &self.slots.len())
            .field("slot_bytes", &self.slot_bytes)
            .field("buffered", &self.buffered)
            .field("read_index", &self.read_index)
            .field("write_index", &self.write_index)
            .field("front_frame", &self.front_index())
            .finish_non_exhaustive()
    }
}

impl VideoRingBuffer {
    pub fn new(capacity: usize, slot_bytes: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| RingSlot::new(slot_bytes)).collect(),
            slot_bytes,
            write_index: 0,
            read_index: 0,
            buffered: 0,
            frames_written: 0,
            frames_popped: 0,
            full_rejections: 0,
        }
    }

    // ========================================================================
    // Producer API
    // ========================================================================

    /// Copy a frame into the next free slot.
    pub fn try_write(&mut self, bytes: &[u8], frame_index: u64) -> SlotWrite {
        if self.is_full() {
            self.full_rejections += 1;
            return SlotWrite::Full;
        }
        if bytes.len() > self.slot_bytes {
            return SlotWrite::Oversized;
        }

        let slot = &mut self.slots[self.write_index];
        slot.data[..bytes.len()].copy_from_slice(bytes);
        slot.len = bytes.len();
        slot.frame_index = frame_index;

        self.write_index = (self.write_index + 1) % self.slots.len();
        self.buffered += 1;
        self.frames_written += 1;
        SlotWrite::Written
    }

    // ========================================================================
    // Consumer API
    // ========================================================================

    /// Oldest buffered frame and its demux-order index.
    pub fn peek_front(&self) -> Option<(&[u8], u64)> {
        if self.buffered == 0 {
            return None;
        }
        let slot = &self.slots[self.read_index];
        Some((&slot.data[..slot.len], slot.frame_index))
    }

    /// Frame index of the oldest buffered frame.
    pub fn front_index(&self) -> Option<u64> {
        self.peek_front().map(|(_, index)| index)
    }

    /// Release the oldest frame, returning its index.
    pub fn pop_front(&mut self) -> Option<u64> {
        if self.buffered == 0 {
            return None;
        }
        let index = self.slots[self.read_index].frame_index;
        self.read_index = (self.read_index + 1) % self.slots.len();
        self.buffered -= 1;
        self.frames_popped += 1;
        Some(index)
    }

    // ========================================================================
    // Control / Status API
    // ========================================================================

    /// Forget all buffered frames. Slot memory is kept.
    pub fn reset(&mut self) {
        self.write_index = 0;
        self.read_index = 0;
        self.buffered = 0;
        self.frames_written = 0;
        self.frames_popped = 0;
        self.full_rejections = 0;
    }

    pub fn len(&self) -> usize {
        self.buffered
    }

    pub fn is_empty(&self) -> bool {
        self.buffered == 0
    }

    pub fn is_full(&self) -> bool {
        self.buffered >= self.slots.len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_bytes(&self) -> usize {
        self.slot_bytes
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            buffered_frames: self.buffered,
            capacity: self.slots.len(),
            frames_written: self.frames_written,
            frames_popped: self.frames_popped,
            full_rejections: self.full_rejections,
        }
    }
}

/// Ring statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RingStats {
    pub buffered_frames: usize,
    pub capacity: usize,
    pub frames_written: u64,
    pub frames_popped: u64,
    pub full_rejections: u64,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_peek_pop_order() {
        let mut ring = VideoRingBuffer::new(4, 16);
        assert!(ring.try_write(&[1, 2, 3], 0).is_written());
        assert!(ring.try_write(&[4], 1).is_written());

        let (bytes, index) = ring.peek_front().unwrap();
        assert_eq!(bytes, &[1, 2, 3]);
        assert_eq!(index, 0);

        assert_eq!(ring.pop_front(), Some(0));
        assert_eq!(ring.peek_front().unwrap(), (&[4u8][..], 1));
        assert_eq!(ring.pop_front(), Some(1));
        assert_eq!(ring.pop_front(), None);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_full_is_not_an_error() {
        let mut ring = VideoRingBuffer::new(3, 8);
        for i in 0..3 {
            assert_eq!(ring.try_write(&[i as u8], i), SlotWrite::Written);
        }
        assert!(ring.is_full());
        assert_eq!(ring.try_write(&[9], 3), SlotWrite::Full);
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.stats().full_rejections, 1);

        // Front is untouched by the rejected write.
        assert_eq!(ring.front_index(), Some(0));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut ring = VideoRingBuffer::new(2, 4);
        assert_eq!(ring.try_write(&[0; 5], 0), SlotWrite::Oversized);
        assert!(ring.is_empty());
        assert!(ring.try_write(&[0; 4], 0).is_written());
    }

    #[test]
    fn test_wraparound_keeps_data() {
        let mut ring = VideoRingBuffer::new(3, 8);
        let mut next = 0u64;
        let mut expected = 0u64;

        for round in 0..10 {
            while ring.try_write(&[next as u8; 2], next).is_written() {
                next += 1;
            }
            // Pop a varying number each round.
            for _ in 0..(round % 3 + 1) {
                if let Some((bytes, index)) = ring.peek_front() {
                    assert_eq!(index, expected);
                    assert_eq!(bytes, &[expected as u8; 2]);
                    ring.pop_front();
                    expected += 1;
                }
            }
        }
    }

    #[test]
    fn test_buffered_count_bounds() {
        let mut ring = VideoRingBuffer::new(5, 1);
        // Deterministic pseudo-random sequence of writes and pops.
        let mut state = 0x2545_f491u32;
        let mut index = 0;
        for _ in 0..1000 {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            if state % 3 == 0 {
                ring.pop_front();
            } else {
                if ring.try_write(&[0], index).is_written() {
                    index += 1;
                }
            }
            assert!(ring.len() <= ring.capacity());
            let stats = ring.stats();
            assert_eq!(
                stats.frames_written - stats.frames_popped,
                stats.buffered_frames as u64
            );
        }
    }

    #[test]
    fn test_reset_keeps_capacity() {
        let mut ring = VideoRingBuffer::new(4, 32);
        ring.try_write(&[1; 32], 7);
        ring.try_write(&[2; 32], 8);
        ring.reset();

        assert!(ring.is_empty());
        assert_eq!(ring.capacity(), 4);
        assert_eq!(ring.slot_bytes(), 32);
        assert_eq!(ring.stats(), RingStats { capacity: 4, ..Default::default() });
        assert!(ring.try_write(&[3; 32], 0).is_written());
        assert_eq!(ring.front_index(), Some(0));
    }

    #[test]
    fn test_debug_skips_slot_contents() {
        let mut ring = VideoRingBuffer::new(3, 1024);
        ring.try_write(&[0xAB; 1024], 5);

        let text = format!("{:?}", ring);
        assert!(text.contains("buffered: 1"));
        assert!(text.contains("front_frame: Some(5)"));
        assert!(text.len() < 256);
    }
}
