//! Fixed-capacity arena of reusable frame buffers.
//!
//! Every slot is preallocated for the largest frame the pipeline accepts, so
//! steady-state decoding never allocates. Slots move between owners
//! (decoder → queue → renderer) by index; the pool keeps the owner ledger
//! and the pixel storage.
//!
//! Locking: the ledger mutex and a slot's storage lock are never held at the
//! same time.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error};

use crate::decode::frame::{PixelFormat, SlotId};
use crate::error::PoolError;
use crate::pipeline::StopSignal;
use crate::PipelineConfig;

/// Who currently holds a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOwner {
    Free,
    Decoder,
    Queue,
    Renderer,
}

struct Ledger {
    free: Vec<usize>,
    owners: Vec<SlotOwner>,
}

#[derive(Default)]
struct Counters {
    acquired: AtomicU64,
    released: AtomicU64,
    exhausted: AtomicU64,
}

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub available: usize,
    pub acquired_total: u64,
    pub released_total: u64,
    pub exhausted_total: u64,
}

pub struct FramePool {
    ledger: Mutex<Ledger>,
    freed: Condvar,
    storage: Box<[RwLock<Box<[u8]>>]>,
    slot_bytes: usize,
    max_width: u32,
    max_height: u32,
    counters: CachePadded<Counters>,
}

impl FramePool {
    /// Preallocate `capacity` slots big enough for a `max_width` x `max_height`
    /// frame in any supported pixel format.
    pub fn new(capacity: usize, max_width: u32, max_height: u32) -> Self {
        let slot_bytes =
            max_width as usize * max_height as usize * PixelFormat::MAX_BYTES_PER_PIXEL;

        tracing::info!(
            capacity,
            slot_bytes,
            total_mb = (capacity * slot_bytes) as f64 / (1024.0 * 1024.0),
            "Creating frame pool"
        );

        let storage = (0..capacity)
            .map(|_| RwLock::new(vec![0u8; slot_bytes].into_boxed_slice()))
            .collect();

        Self {
            ledger: Mutex::new(Ledger {
                // pop() hands out the lowest index first
                free: (0..capacity).rev().collect(),
                owners: vec![SlotOwner::Free; capacity],
            }),
            freed: Condvar::new(),
            storage,
            slot_bytes,
            max_width,
            max_height,
            counters: CachePadded::new(Counters::default()),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.pool_capacity, config.max_width, config.max_height)
    }

    /// Take a free slot for the decoder without waiting.
    pub fn acquire(&self) -> Result<SlotId, PoolError> {
        let mut ledger = self.ledger.lock();
        self.take_free(&mut ledger)
    }

    /// Take a free slot, waiting for a release while the pool is exhausted.
    ///
    /// Returns [`PoolError::Cancelled`] once `stop` fires; [`FramePool::interrupt`]
    /// wakes the waiter so it notices promptly.
    pub fn acquire_blocking(&self, stop: &StopSignal) -> Result<SlotId, PoolError> {
        let mut ledger = self.ledger.lock();
        loop {
            if stop.is_stopped() {
                return Err(PoolError::Cancelled);
            }
            match self.take_free(&mut ledger) {
                Err(PoolError::Exhausted) => {
                    debug!("pool exhausted, decoder waiting for a slot");
                    self.freed.wait(&mut ledger);
                }
                other => return other,
            }
        }
    }

    fn take_free(&self, ledger: &mut Ledger) -> Result<SlotId, PoolError> {
        match ledger.free.pop() {
            Some(index) => {
                ledger.owners[index] = SlotOwner::Decoder;
                self.counters.acquired.fetch_add(1, Ordering::Relaxed);
                Ok(SlotId(index))
            }
            None => {
                self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                Err(PoolError::Exhausted)
            }
        }
    }

    /// Record that an acquired slot changed hands.
    pub fn transfer(&self, slot: SlotId, to: SlotOwner) -> Result<(), PoolError> {
        let mut ledger = self.ledger.lock();
        let owner = ledger
            .owners
            .get_mut(slot.0)
            .ok_or(PoolError::UnknownSlot(slot))?;
        if *owner == SlotOwner::Free || to == SlotOwner::Free {
            return Err(PoolError::NotAcquired(slot));
        }
        *owner = to;
        Ok(())
    }

    /// Return a slot to the free list.
    pub fn release(&self, slot: SlotId) -> Result<(), PoolError> {
        let mut ledger = self.ledger.lock();
        let owner = ledger
            .owners
            .get_mut(slot.0)
            .ok_or(PoolError::UnknownSlot(slot))?;
        if *owner == SlotOwner::Free {
            error!(%slot, "slot released twice");
            return Err(PoolError::DoubleRelease(slot));
        }
        *owner = SlotOwner::Free;
        ledger.free.push(slot.0);
        drop(ledger);

        self.counters.released.fetch_add(1, Ordering::Relaxed);
        self.freed.notify_one();
        Ok(())
    }

    /// Wake every waiter so it can re-check its stop signal.
    pub fn interrupt(&self) {
        // Taking the lock orders this after any waiter's stop check.
        let _ledger = self.ledger.lock();
        self.freed.notify_all();
    }

    /// Exclusive access to a slot's bytes, for the decoder filling it.
    pub fn write(&self, slot: SlotId) -> Result<RwLockWriteGuard<'_, Box<[u8]>>, PoolError> {
        self.storage
            .get(slot.0)
            .map(|lock| lock.write())
            .ok_or(PoolError::UnknownSlot(slot))
    }

    /// Shared access to a slot's bytes, for the uploader reading it.
    pub fn read(&self, slot: SlotId) -> Result<RwLockReadGuard<'_, Box<[u8]>>, PoolError> {
        self.storage
            .get(slot.0)
            .map(|lock| lock.read())
            .ok_or(PoolError::UnknownSlot(slot))
    }

    pub fn owner(&self, slot: SlotId) -> Option<SlotOwner> {
        self.ledger.lock().owners.get(slot.0).copied()
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn available(&self) -> usize {
        self.ledger.lock().free.len()
    }

    /// Slots currently held by the decoder, queue or renderer.
    pub fn outstanding(&self) -> usize {
        self.capacity() - self.available()
    }

    pub fn slot_bytes(&self) -> usize {
        self.slot_bytes
    }

    pub fn max_dimensions(&self) -> (u32, u32) {
        (self.max_width, self.max_height)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity(),
            available: self.available(),
            acquired_total: self.counters.acquired.load(Ordering::Relaxed),
            released_total: self.counters.released.load(Ordering::Relaxed),
            exhausted_total: self.counters.exhausted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn acquire_until_exhausted() {
        let pool = FramePool::new(2, 4, 4);
        assert_eq!(pool.slot_bytes(), 64);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.outstanding(), 2);
        assert_eq!(pool.acquire(), Err(PoolError::Exhausted));
        assert_eq!(pool.stats().exhausted_total, 1);

        pool.release(a).unwrap();
        assert_eq!(pool.acquire(), Ok(a));
    }

    #[test]
    fn outstanding_never_exceeds_capacity() {
        let pool = FramePool::new(3, 2, 2);
        let mut held = Vec::new();
        for _ in 0..10 {
            if let Ok(slot) = pool.acquire() {
                held.push(slot);
            }
            assert!(pool.outstanding() <= pool.capacity());
        }
        assert_eq!(held.len(), 3);
    }

    #[test]
    fn double_release_is_rejected() {
        let pool = FramePool::new(1, 2, 2);
        let slot = pool.acquire().unwrap();
        pool.release(slot).unwrap();
        assert_eq!(pool.release(slot), Err(PoolError::DoubleRelease(slot)));
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn unknown_slot() {
        let pool = FramePool::new(1, 2, 2);
        assert_eq!(pool.release(SlotId(7)), Err(PoolError::UnknownSlot(SlotId(7))));
        assert!(pool.write(SlotId(7)).is_err());
    }

    #[test]
    fn ownership_follows_transfers() {
        let pool = FramePool::new(1, 2, 2);
        let slot = pool.acquire().unwrap();
        assert_eq!(pool.owner(slot), Some(SlotOwner::Decoder));

        pool.transfer(slot, SlotOwner::Queue).unwrap();
        pool.transfer(slot, SlotOwner::Renderer).unwrap();
        assert_eq!(pool.owner(slot), Some(SlotOwner::Renderer));

        pool.release(slot).unwrap();
        assert_eq!(pool.owner(slot), Some(SlotOwner::Free));
        assert_eq!(
            pool.transfer(slot, SlotOwner::Queue),
            Err(PoolError::NotAcquired(slot))
        );
    }

    #[test]
    fn storage_is_per_slot() {
        let pool = FramePool::new(2, 2, 2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        pool.write(a).unwrap()[0] = 0xAB;
        assert_eq!(pool.read(a).unwrap()[0], 0xAB);
        assert_eq!(pool.read(b).unwrap()[0], 0);
    }

    #[test]
    fn blocking_acquire_wakes_on_release() {
        let pool = Arc::new(FramePool::new(1, 2, 2));
        let held = pool.acquire().unwrap();
        let stop = StopSignal::new();

        let waiter = {
            let pool = pool.clone();
            let stop = stop.clone();
            thread::spawn(move || pool.acquire_blocking(&stop))
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        pool.release(held).unwrap();
        assert_eq!(waiter.join().unwrap(), Ok(held));
    }

    #[test]
    fn blocking_acquire_is_cancellable() {
        let pool = Arc::new(FramePool::new(1, 2, 2));
        let _held = pool.acquire().unwrap();
        let stop = StopSignal::new();

        let waiter = {
            let pool = pool.clone();
            let stop = stop.clone();
            thread::spawn(move || pool.acquire_blocking(&stop))
        };

        thread::sleep(Duration::from_millis(20));
        stop.stop();
        pool.interrupt();
        assert_eq!(waiter.join().unwrap(), Err(PoolError::Cancelled));
    }
}
