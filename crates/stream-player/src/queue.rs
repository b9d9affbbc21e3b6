//! Bounded frame queue between the decoder reader and the output writer.
//!
//! Each entry is one device block of raw interleaved PCM bytes. The queue is
//! single-producer/single-consumer in practice, but every method is safe to call from
//! any thread.
//!
//! Shutdown is deterministic: `close()` wakes every waiter, pushes are rejected from
//! then on, and pops keep draining what is left before reporting `Closed`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// One block of raw PCM bytes.
pub type Frame = Vec<u8>;

/// Thread-safe bounded FIFO of PCM frames.
///
/// - **Bounded** by `capacity` frames; producers wait (with a timeout) when full.
/// - A `closed` flag lives under the same mutex as the queue to avoid races.
/// - One [`Condvar`] is used as a general "state changed" signal.
pub struct FrameQueue {
    inner: Mutex<QueueInner>,
    cv: Condvar,
    capacity: usize,
    low_watermark_ms: AtomicU64,
}

struct QueueInner {
    frames: VecDeque<Frame>,
    closed: bool,
    high_watermark: usize,
}

/// Why a push did not enqueue its frame. The frame is handed back to the caller.
#[derive(Debug, PartialEq, Eq)]
pub enum PushError {
    /// The queue stayed full for the whole timeout.
    Full(Frame),
    /// The queue was closed; no more frames are accepted.
    Closed(Frame),
}

/// Result of a bounded pop.
#[derive(Debug, PartialEq, Eq)]
pub enum Popped {
    Frame(Frame),
    /// Nothing arrived within the timeout, but the producer is still running.
    Empty,
    /// Closed and fully drained.
    Closed,
}

impl FrameQueue {
    /// Create a queue holding at most `capacity` frames (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                frames: VecDeque::with_capacity(capacity.max(1)),
                closed: false,
                high_watermark: 0,
            }),
            cv: Condvar::new(),
            capacity: capacity.max(1),
            low_watermark_ms: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current queued frames (best-effort snapshot).
    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Largest queue length ever observed.
    pub fn high_watermark(&self) -> usize {
        self.lock().high_watermark
    }

    /// Whether the producer has closed the queue. Closed queues may still hold frames.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Mark the queue as finished and wake all waiters. Idempotent.
    pub fn close(&self) {
        let mut g = self.lock();
        g.closed = true;
        drop(g);
        self.cv.notify_all();
    }

    /// Push one frame, waiting up to `timeout` for free space.
    pub fn push_timeout(&self, frame: Frame, timeout: Duration) -> Result<(), PushError> {
        let deadline = Instant::now() + timeout;
        let mut g = self.lock();
        loop {
            if g.closed {
                return Err(PushError::Closed(frame));
            }
            if g.frames.len() < self.capacity {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(PushError::Full(frame));
            }
            let (ng, _timeout) = self
                .cv
                .wait_timeout(g, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            g = ng;
        }

        g.frames.push_back(frame);
        g.high_watermark = g.high_watermark.max(g.frames.len());
        drop(g);
        self.cv.notify_all();
        Ok(())
    }

    /// Pop the oldest frame, waiting up to `timeout` for one to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Popped {
        let deadline = Instant::now() + timeout;
        let mut g = self.lock();
        loop {
            if let Some(frame) = g.frames.pop_front() {
                let queued = g.frames.len();
                drop(g);
                self.cv.notify_all();
                self.log_low_watermark(queued);
                return Popped::Frame(frame);
            }
            if g.closed {
                return Popped::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return Popped::Empty;
            }
            let (ng, _timeout) = self
                .cv
                .wait_timeout(g, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            g = ng;
        }
    }

    /// Wait up to `timeout` until at least `depth` frames are queued or the queue closes.
    ///
    /// Returns `true` once the startup condition holds.
    pub fn wait_for_depth(&self, depth: usize, timeout: Duration) -> bool {
        let want = depth.min(self.capacity);
        let g = self.lock();
        let (g, _timeout) = self
            .cv
            .wait_timeout_while(g, timeout, |inner| {
                inner.frames.len() < want && !inner.closed
            })
            .unwrap_or_else(|e| e.into_inner());
        g.frames.len() >= want || g.closed
    }

    fn log_low_watermark(&self, queued: usize) {
        let threshold = (self.capacity / 8).max(1);
        if queued >= threshold {
            return;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_millis(0))
            .as_millis() as u64;
        let last = self.low_watermark_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) > 1000 {
            self.low_watermark_ms.store(now, Ordering::Relaxed);
            tracing::debug!(
                queued_frames = queued,
                threshold_frames = threshold,
                "frame queue low watermark"
            );
        }
    }
}
