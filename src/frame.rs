//! Frame samples and per-camera buffering.
//!
//! - `FrameSample`: One captured frame. Pixels are private and zeroized on drop.
//! - `FrameQueue`: Bounded FIFO between a camera's capture and detection workers.
//!
//! The queue favours freshness: when full, the oldest buffered frame is evicted to admit
//! the new one, so a slow recognizer never stalls capture.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use zeroize::Zeroize;

use crate::Timestamp;

// ----------------------------------------------------------------------------
// FrameSample
// ----------------------------------------------------------------------------

/// A single captured frame. Never mutated after creation.
///
/// Deliberately not `Clone`: a frame moves from the source into the queue and from the
/// queue into exactly one detection pass.
pub struct FrameSample {
    pub camera_id: String,
    pub timestamp: Timestamp,
    pub sequence_no: u64,
    pub width: u32,
    pub height: u32,
    pixels: Vec<u8>,
}

impl FrameSample {
    pub fn new(
        camera_id: impl Into<String>,
        timestamp: Timestamp,
        sequence_no: u64,
        width: u32,
        height: u32,
        pixels: Vec<u8>,
    ) -> Self {
        Self {
            camera_id: camera_id.into(),
            timestamp,
            sequence_no,
            width,
            height,
            pixels,
        }
    }

    /// Opaque image buffer handed to the recognizer.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }
}

impl std::fmt::Debug for FrameSample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Pixel content stays out of logs.
        f.debug_struct("FrameSample")
            .field("camera_id", &self.camera_id)
            .field("timestamp", &self.timestamp)
            .field("sequence_no", &self.sequence_no)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

impl Drop for FrameSample {
    fn drop(&mut self) {
        self.pixels.zeroize();
    }
}

// ----------------------------------------------------------------------------
// FrameQueue
// ----------------------------------------------------------------------------

/// Result of publishing a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    /// The queue was full; the oldest frame was evicted to make room.
    DroppedOldest,
    /// The queue is closed; the frame was discarded.
    Closed,
}

struct QueueInner {
    frames: VecDeque<FrameSample>,
    closed: bool,
    dropped: u64,
}

/// Bounded drop-oldest queue.
///
/// `push` never blocks beyond the internal lock. `pop_timeout` blocks up to the given
/// timeout so consumers can observe a stop signal between waits.
pub struct FrameQueue {
    inner: Mutex<QueueInner>,
    available: Condvar,
    capacity: usize,
}

impl FrameQueue {
    /// Create a queue holding at most `capacity` frames (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(QueueInner {
                frames: VecDeque::with_capacity(capacity),
                closed: false,
                dropped: 0,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, frame: FrameSample) -> PushOutcome {
        let mut inner = self.lock();
        if inner.closed {
            return PushOutcome::Closed;
        }
        let mut outcome = PushOutcome::Accepted;
        while inner.frames.len() >= self.capacity {
            inner.frames.pop_front(); // Drop triggers zeroize
            inner.dropped += 1;
            outcome = PushOutcome::DroppedOldest;
        }
        inner.frames.push_back(frame);
        drop(inner);
        self.available.notify_one();
        outcome
    }

    /// Pop the oldest frame, waiting up to `timeout` for one to arrive.
    ///
    /// Returns `None` on timeout, or immediately once the queue is closed and drained.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<FrameSample> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if let Some(frame) = inner.frames.pop_front() {
                return Some(frame);
            }
            if inner.closed {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .available
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            inner = guard;
        }
    }

    /// Close the queue: further pushes are discarded and waiting consumers wake up.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.frames.clear();
        drop(inner);
        self.available.notify_all();
    }

    /// Stop accepting frames but leave queued ones for consumers to drain.
    pub fn seal(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        drop(inner);
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames evicted by drop-oldest since creation.
    pub fn dropped_count(&self) -> u64 {
        self.lock().dropped
    }

    /// Memory usage estimate.
    pub fn memory_bytes(&self) -> usize {
        self.lock().frames.iter().map(|f| f.byte_len()).sum()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
