//! Bounded drop-oldest frame buffer bridging capture and consumer

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

use crate::capture::Frame;

/// Result of a blocking [`FrameBuffer::get`]
#[derive(Debug)]
pub enum Pull {
    Frame(Frame),
    /// The caller's stop flag was raised while waiting
    Stopped,
}

/// Counters since construction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub written: usize,
    pub read: usize,
    pub dropped: usize,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicUsize,
    frames_read: AtomicUsize,
    frames_dropped: AtomicUsize,
}

/// Ring of frame slots. `put` overwrites the oldest unread frame when full;
/// `get` pops in capture order, so a frame is handed out at most once.
pub struct FrameBuffer {
    slots: Mutex<HeapRb<Frame>>,
    ready: Condvar,
    capacity: usize,
    poll_interval: Duration,

    /// Statistics
    stats: CachePadded<Stats>,
}

impl FrameBuffer {
    /// `capacity` of zero is treated as a single "latest frame" slot.
    pub fn new(capacity: usize, poll_interval: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Mutex::new(HeapRb::new(capacity)),
            ready: Condvar::new(),
            capacity,
            poll_interval,
            stats: CachePadded::new(Stats::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HeapRb<Frame>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Producer: store a frame, evicting the oldest unread one if full.
    /// Returns true when a frame was evicted.
    pub fn put(&self, frame: Frame) -> bool {
        let evicted = {
            let mut slots = self.lock();
            slots.push_overwrite(frame)
        };
        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
        self.ready.notify_one();

        match evicted {
            Some(old) => {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("framepipe_frames_dropped_total").increment(1);
                // Dropped outside the lock
                drop(old);
                true
            }
            None => false,
        }
    }

    /// Consumer: wait for the oldest unread frame, or until `stop` is raised.
    ///
    /// Waits in `poll_interval` slices so a stop flag set without a wakeup is
    /// still observed.
    pub fn get(&self, stop: &AtomicBool) -> Pull {
        let mut slots = self.lock();
        loop {
            if stop.load(Ordering::Acquire) {
                return Pull::Stopped;
            }
            if let Some(frame) = slots.try_pop() {
                self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
                return Pull::Frame(frame);
            }
            let (guard, _) = self
                .ready
                .wait_timeout(slots, self.poll_interval)
                .unwrap_or_else(|e| e.into_inner());
            slots = guard;
        }
    }

    /// Consumer: pop without waiting.
    pub fn try_get(&self) -> Option<Frame> {
        let frame = self.lock().try_pop();
        if frame.is_some() {
            self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        }
        frame
    }

    /// Discard every unread frame. Returns how many were discarded.
    pub fn clear(&self) -> usize {
        let drained: Vec<Frame> = {
            let mut slots = self.lock();
            std::iter::from_fn(|| slots.try_pop()).collect()
        };
        drained.len()
    }

    /// Wake all waiting consumers so they re-check their stop flag.
    pub fn wake_all(&self) {
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            written: self.stats.frames_written.load(Ordering::Relaxed),
            read: self.stats.frames_read.load(Ordering::Relaxed),
            dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }
}
