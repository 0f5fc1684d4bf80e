//! Bounded ring buffer handing frames from the decode worker to the renderer

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex, MutexGuard};
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::decode::frame::{Frame, FrameInfo};
use crate::error::{PushError, QueueError};
use crate::pipeline::pool::{FramePool, SlotOwner};
use crate::pipeline::StopSignal;

/// What `push` does when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait for the renderer to make room. Lossless.
    #[default]
    Block,
    /// Evict the oldest queued frame and release its slot
    DropOldest,
}

/// Result of a successful push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting this frame from the head
    Evicted(FrameInfo),
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicUsize,
    frames_read: AtomicUsize,
    frames_dropped: AtomicUsize,
}

/// Queue statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub buffered: usize,
    pub frames_written: usize,
    pub frames_read: usize,
    pub frames_dropped: usize,
}

/// FIFO of published frames.
///
/// Frames come out in push order. Timestamps are non-decreasing because the
/// decode worker only publishes in presentation order; the queue never
/// re-sorts.
///
/// Lock order: the ring lock may be held while calling into the pool, never
/// the other way round.
pub struct FrameQueue {
    ring: Mutex<HeapRb<Frame>>,
    space: Condvar,
    policy: OverflowPolicy,
    pool: Arc<FramePool>,
    stats: CachePadded<Stats>,
}

impl FrameQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy, pool: Arc<FramePool>) -> Self {
        Self {
            ring: Mutex::new(HeapRb::new(capacity.max(1))),
            space: Condvar::new(),
            policy,
            pool,
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: publish a frame, applying the overflow policy when full.
    ///
    /// Under [`OverflowPolicy::Block`] this waits for space until `stop`
    /// fires, then hands the frame back in [`PushError::Cancelled`].
    pub fn push(&self, frame: Frame, stop: &StopSignal) -> Result<PushOutcome, PushError> {
        let mut ring = self.ring.lock();

        if self.policy == OverflowPolicy::Block {
            while ring.is_full() {
                if stop.is_stopped() {
                    return Err(PushError::Cancelled(frame));
                }
                debug!("frame queue full, decoder waiting");
                self.space.wait(&mut ring);
            }
        }

        self.enqueue(ring, frame)
    }

    /// Producer: publish without waiting. A full queue under `Block` returns
    /// the frame in [`PushError::Full`].
    pub fn try_push(&self, frame: Frame) -> Result<PushOutcome, PushError> {
        let ring = self.ring.lock();
        if self.policy == OverflowPolicy::Block && ring.is_full() {
            return Err(PushError::Full(frame));
        }
        self.enqueue(ring, frame)
    }

    fn enqueue(
        &self,
        mut ring: MutexGuard<'_, HeapRb<Frame>>,
        frame: Frame,
    ) -> Result<PushOutcome, PushError> {
        let evicted = if ring.is_full() { ring.try_pop() } else { None };

        if let Err(e) = self.pool.transfer(frame.slot(), SlotOwner::Queue) {
            error!(slot = %frame.slot(), "publishing frame with bad slot: {e}");
        }
        if let Err(frame) = ring.try_push(frame) {
            return Err(PushError::Full(frame));
        }
        let depth = ring.occupied_len();
        drop(ring);

        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!("queue_depth").set(depth as f64);

        Ok(match evicted {
            Some(old) => {
                let info = old.info();
                debug!(timestamp_us = info.timestamp_us, "queue full, dropped oldest frame");
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("frames_dropped", "reason" => "overflow").increment(1);
                self.release(old);
                PushOutcome::Evicted(info)
            }
            None => PushOutcome::Queued,
        })
    }

    /// Consumer: take the head frame. The renderer now owns its slot.
    pub fn pop(&self) -> Result<Frame, QueueError> {
        let ring = self.ring.lock();
        self.take_head(ring).ok_or(QueueError::Empty)
    }

    /// Consumer: take the head frame only if `accept` says so, checking and
    /// removing under one lock hold so a concurrent eviction cannot swap the
    /// head in between. `accept` is not called on an empty queue.
    pub fn pop_if(&self, accept: impl FnOnce(&FrameInfo) -> bool) -> Option<Frame> {
        let ring = self.ring.lock();
        let head = ring.try_peek().map(Frame::info)?;
        if !accept(&head) {
            return None;
        }
        self.take_head(ring)
    }

    fn take_head(&self, mut ring: MutexGuard<'_, HeapRb<Frame>>) -> Option<Frame> {
        let frame = ring.try_pop()?;
        if let Err(e) = self.pool.transfer(frame.slot(), SlotOwner::Renderer) {
            error!(slot = %frame.slot(), "popped frame with bad slot: {e}");
        }
        drop(ring);

        self.space.notify_one();
        self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    /// Consumer: look at the head frame without removing it.
    pub fn peek(&self) -> Result<FrameInfo, QueueError> {
        self.ring
            .lock()
            .try_peek()
            .map(Frame::info)
            .ok_or(QueueError::Empty)
    }

    /// Give a frame's slot back to the pool.
    pub fn release(&self, frame: Frame) {
        if let Err(e) = self.pool.release(frame.slot()) {
            error!(slot = %frame.slot(), "failed to release frame: {e}");
        }
    }

    /// Drop every queued frame, releasing their slots. Returns how many.
    pub fn flush(&self) -> usize {
        let mut ring = self.ring.lock();
        let mut flushed = Vec::with_capacity(ring.occupied_len());
        while let Some(frame) = ring.try_pop() {
            flushed.push(frame);
        }
        drop(ring);

        let count = flushed.len();
        for frame in flushed {
            self.release(frame);
        }
        self.space.notify_all();
        if count > 0 {
            debug!(count, "queue flushed");
        }
        count
    }

    /// Wake a producer blocked on a full queue so it can see its stop signal.
    pub fn interrupt(&self) {
        let _ring = self.ring.lock();
        self.space.notify_all();
    }

    pub fn len(&self) -> usize {
        self.ring.lock().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().capacity().get()
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn pool(&self) -> &Arc<FramePool> {
        &self.pool
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            buffered: self.len(),
            frames_written: self.stats.frames_written.load(Ordering::Relaxed),
            frames_read: self.stats.frames_read.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::frame::PixelFormat;
    use std::thread;
    use std::time::Duration;

    fn decoded(pool: &FramePool, timestamp_ms: u64) -> Frame {
        let slot = pool.acquire().unwrap();
        Frame::new(
            slot,
            FrameInfo {
                timestamp_us: timestamp_ms * 1000,
                width: 2,
                height: 2,
                format: PixelFormat::Rgb8,
                len: 12,
            },
        )
    }

    fn queue(pool_capacity: usize, capacity: usize, policy: OverflowPolicy) -> FrameQueue {
        FrameQueue::new(capacity, policy, Arc::new(FramePool::new(pool_capacity, 2, 2)))
    }

    fn drain_ms(queue: &FrameQueue) -> Vec<u64> {
        let mut out = Vec::new();
        while let Ok(frame) = queue.pop() {
            out.push(frame.timestamp_us() / 1000);
            queue.release(frame);
        }
        out
    }

    #[test]
    fn block_policy_is_lossless_fifo() {
        let q = queue(8, 8, OverflowPolicy::Block);
        let stop = StopSignal::new();
        let pushed = [0, 16, 33, 50, 66, 83];
        for ts in pushed {
            let frame = decoded(q.pool(), ts);
            assert_eq!(q.push(frame, &stop).unwrap(), PushOutcome::Queued);
        }
        assert_eq!(drain_ms(&q), pushed);
        assert_eq!(q.stats().frames_dropped, 0);
        assert_eq!(q.pool().outstanding(), 0);
    }

    #[test]
    fn drop_oldest_keeps_most_recent() {
        let capacity = 3;
        let q = queue(8, capacity, OverflowPolicy::DropOldest);
        let stop = StopSignal::new();

        // capacity + 2 pushes
        let mut evicted = Vec::new();
        for ts in 0..5u64 {
            let frame = decoded(q.pool(), ts * 10);
            if let PushOutcome::Evicted(info) = q.push(frame, &stop).unwrap() {
                evicted.push(info.timestamp_us / 1000);
            }
        }

        assert_eq!(evicted, vec![0, 10]);
        // evicted slots went straight back to the pool
        assert_eq!(q.pool().outstanding(), capacity);
        assert_eq!(q.stats().frames_dropped, 2);
        assert_eq!(drain_ms(&q), vec![20, 30, 40]);
    }

    #[test]
    fn pop_and_peek_on_empty() {
        let q = queue(2, 2, OverflowPolicy::Block);
        assert_eq!(q.pop().unwrap_err(), QueueError::Empty);
        assert_eq!(q.peek().unwrap_err(), QueueError::Empty);
    }

    #[test]
    fn peek_does_not_consume() {
        let q = queue(2, 2, OverflowPolicy::Block);
        let stop = StopSignal::new();
        q.push(decoded(q.pool(), 7), &stop).unwrap();

        assert_eq!(q.peek().unwrap().timestamp_us, 7000);
        assert_eq!(q.len(), 1);
        let frame = q.pop().unwrap();
        assert_eq!(frame.timestamp_us(), 7000);
        assert_eq!(q.pool().owner(frame.slot()), Some(SlotOwner::Renderer));
        q.release(frame);
    }

    #[test]
    fn pop_if_only_takes_accepted_head() {
        let q = queue(4, 4, OverflowPolicy::Block);
        let stop = StopSignal::new();
        q.push(decoded(q.pool(), 10), &stop).unwrap();
        q.push(decoded(q.pool(), 20), &stop).unwrap();

        assert!(q.pop_if(|head| head.timestamp_us > 10_000).is_none());
        assert_eq!(q.len(), 2);
        assert_eq!(q.stats().frames_read, 0);

        let frame = q.pop_if(|head| head.timestamp_us == 10_000).unwrap();
        assert_eq!(q.pool().owner(frame.slot()), Some(SlotOwner::Renderer));
        q.release(frame);
        assert_eq!(q.stats().frames_read, 1);
        assert_eq!(drain_ms(&q), vec![20]);

        let mut called = false;
        assert!(q.pop_if(|_| { called = true; true }).is_none());
        assert!(!called);
    }

    #[test]
    fn try_push_reports_full() {
        let q = queue(3, 1, OverflowPolicy::Block);
        q.try_push(decoded(q.pool(), 0)).unwrap();
        let rejected = q.try_push(decoded(q.pool(), 1)).unwrap_err();
        assert!(matches!(rejected, PushError::Full(_)));
        q.release(rejected.into_frame());
        assert_eq!(drain_ms(&q), vec![0]);
    }

    #[test]
    fn blocked_push_resumes_after_pop() {
        // pool 4, queue 2, Block; frames at 0, 16, 33, 50 ms
        let q = Arc::new(queue(4, 2, OverflowPolicy::Block));
        let stop = StopSignal::new();
        let frames: Vec<Frame> = [0, 16, 33, 50].iter().map(|&ts| decoded(q.pool(), ts)).collect();

        let producer = {
            let q = q.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                for frame in frames {
                    q.push(frame, &stop).unwrap();
                }
            })
        };

        // third push is stuck behind the two queued frames
        while q.stats().frames_written < 2 {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(20));
        assert_eq!(q.stats().frames_written, 2);
        assert!(!producer.is_finished());

        let first = q.pop().unwrap();
        assert_eq!(first.timestamp_us(), 0);
        q.release(first);

        while q.stats().frames_written < 3 {
            thread::sleep(Duration::from_millis(1));
        }
        let second = q.pop().unwrap();
        assert_eq!(second.timestamp_us(), 16_000);
        q.release(second);

        producer.join().unwrap();
        assert_eq!(drain_ms(&q), vec![33, 50]);
        assert_eq!(q.pool().outstanding(), 0);
    }

    #[test]
    fn blocked_push_is_cancellable() {
        let q = Arc::new(queue(2, 1, OverflowPolicy::Block));
        let stop = StopSignal::new();
        q.push(decoded(q.pool(), 0), &stop).unwrap();
        let pending = decoded(q.pool(), 1);

        let producer = {
            let q = q.clone();
            let stop = stop.clone();
            thread::spawn(move || q.push(pending, &stop))
        };

        thread::sleep(Duration::from_millis(20));
        stop.stop();
        q.interrupt();

        match producer.join().unwrap() {
            Err(PushError::Cancelled(frame)) => q.release(frame),
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert_eq!(q.flush(), 1);
        assert_eq!(q.pool().outstanding(), 0);
    }
}
