//! PCM ingest ring buffer.
//!
//! A bounded, non-blocking FIFO of atomic 4096-byte PCM frames sitting
//! between the socket reader and the audio pump. Created once at process
//! start and shared for the process lifetime; it survives Station restarts
//! by construction because nothing on the reconnect path touches it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

/// Bounded frame FIFO with drop-newest overflow.
///
/// Overflow drops the incoming frame (the station is ahead of the pump and
/// the queued audio is older, i.e. closer to what listeners should hear
/// next); underflow returns `None`. Both paths are non-blocking: neither
/// clock ever sleeps on this lock, it is held only for a push or pop.
#[derive(Debug)]
pub struct FrameRingBuffer {
    frames: Mutex<VecDeque<Bytes>>,
    capacity: usize,
    overflow_count: AtomicU64,
    pushed: AtomicU64,
    popped: AtomicU64,
}

impl FrameRingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            overflow_count: AtomicU64::new(0),
            pushed: AtomicU64::new(0),
            popped: AtomicU64::new(0),
        }
    }

    /// Pushes a frame, returning `false` when the buffer was full and the
    /// frame was dropped. A dropped push has no side effect beyond the
    /// overflow counter.
    pub fn push(&self, frame: Bytes) -> bool {
        let mut frames = self.frames.lock();
        if frames.len() >= self.capacity {
            drop(frames);
            self.overflow_count.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        frames.push_back(frame);
        drop(frames);
        self.pushed.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Pops the oldest frame, or `None` when empty.
    pub fn pop(&self) -> Option<Bytes> {
        let frame = self.frames.lock().pop_front();
        if frame.is_some() {
            self.popped.fetch_add(1, Ordering::Relaxed);
        }
        frame
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current fill as a ratio in [0, 1]. The telemetry endpoint serves this.
    #[must_use]
    pub fn fill_ratio(&self) -> f64 {
        self.len() as f64 / self.capacity as f64
    }

    #[must_use]
    pub fn overflow_count(&self) -> u64 {
        self.overflow_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn frames_pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn frames_popped(&self) -> u64 {
        self.popped.load(Ordering::Relaxed)
    }
}
