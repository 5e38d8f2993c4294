//! Bounded lock-free MPMC ring buffer.
//!
//! Heap-backed variant of Dmitry Vyukov's bounded queue with a capacity chosen
//! at runtime. Every slot carries a sequence number:
//!
//! - Initial: slot index (0, 1, 2, ..., N-1)
//! - After a producer write: position + 1 (signals "data ready")
//! - After a consumer read: position + N (signals "slot free")
//!
//! The sequence protocol needs at least two slots, so a ring with capacity 1
//! allocates two and enforces its capacity against `head - tail` instead.
//!
//! Producers reserve a position with a CAS on `head`, consumers with a CAS on
//! `tail`. Multiple consumers are allowed: the task queues rely on that so a
//! producer can evict the oldest entry under a drop-oldest policy while the
//! loop thread drains.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use minstant::Instant;
use serde::{Deserialize, Serialize};

/// Spins before a blocked producer starts yielding its time slice.
const SPINS_BEFORE_YIELD: u32 = 64;

/// Timeout specification for blocking operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Timeout {
    /// Wait indefinitely.
    Infinite,
    /// Wait for at most the specified duration.
    Duration(Duration),
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

/// A slot with its own sequence number, on its own cache line.
#[repr(align(64))]
struct Slot<T> {
    seq: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    fn new(seq: usize) -> Self {
        Self {
            seq: AtomicUsize::new(seq),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// Cache-line padded index so producers and consumers don't false-share.
#[repr(align(64))]
struct PaddedIndex(AtomicUsize);

/// Bounded MPMC ring.
pub struct Ring<T> {
    /// Next position to reserve for writing.
    head: PaddedIndex,
    /// Next position to read from.
    tail: PaddedIndex,
    mask: usize,
    /// Items the ring accepts; at most `mask + 1`.
    capacity: usize,
    buffer: Box<[Slot<T>]>,
}

// SAFETY: values move between threads through the ring, so `T: Send` suffices.
unsafe impl<T: Send> Send for Ring<T> {}

// SAFETY: concurrent access is mediated by the per-slot sequence protocol:
// a slot is written only by the producer that won the CAS on `head` for that
// position and read only by the consumer that won the CAS on `tail`.
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    /// Creates a ring holding at least `capacity` items (rounded up to a power
    /// of two, saturating at the largest one `usize` can hold).
    #[must_use]
    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        let cap = capacity
            .get()
            .checked_next_power_of_two()
            .unwrap_or(1 << (usize::BITS - 1));
        let slots = cap.max(2);
        let buffer = (0..slots).map(Slot::new).collect();
        Self {
            head: PaddedIndex(AtomicUsize::new(0)),
            tail: PaddedIndex(AtomicUsize::new(0)),
            mask: slots - 1,
            capacity: cap,
            buffer,
        }
    }

    /// Number of items the ring holds when full.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Approximate number of queued items (exact when quiescent).
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        // Read tail first: head only grows, so head >= the tail we saw.
        let tail = self.tail.0.load(Ordering::Acquire);
        let head = self.head.0.load(Ordering::Acquire);
        head.wrapping_sub(tail).min(self.capacity())
    }

    /// Returns `true` if nothing is queued.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attempts to push an item without blocking.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the ring is full.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut pos = self.head.0.load(Ordering::Relaxed);
        loop {
            let slot = &self.buffer[pos & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos) as isize;

            if diff == 0 {
                let queued = pos.wrapping_sub(self.tail.0.load(Ordering::Acquire)) as isize;
                if queued < 0 {
                    // Stale `pos`: consumers already moved past it.
                    pos = self.head.0.load(Ordering::Relaxed);
                    continue;
                }
                if queued.unsigned_abs() >= self.capacity {
                    return Err(item);
                }
                match self.head.0.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: winning the CAS gives exclusive write access to
                        // this slot until we publish it with the seq store below.
                        unsafe {
                            (*slot.value.get()).write(item);
                        }
                        slot.seq.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                // Slot not yet released by a consumer: full.
                return Err(item);
            } else {
                pos = self.head.0.load(Ordering::Relaxed);
            }
        }
    }

    /// Pushes, waiting for space until `timeout` passes.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` on timeout.
    pub fn push_blocking(&self, mut item: T, timeout: Timeout) -> Result<(), T> {
        let deadline = match timeout {
            Timeout::Infinite => None,
            Timeout::Duration(d) => Some(Instant::now() + d),
        };
        let mut spins = 0u32;
        loop {
            match self.push(item) {
                Ok(()) => return Ok(()),
                Err(returned) => {
                    item = returned;
                    if let Some(dl) = deadline
                        && Instant::now() > dl
                    {
                        return Err(item);
                    }
                    if spins < SPINS_BEFORE_YIELD {
                        spins += 1;
                        std::hint::spin_loop();
                    } else {
                        std::thread::yield_now();
                    }
                }
            }
        }
    }

    /// Attempts to pop the oldest item.
    pub fn pop(&self) -> Option<T> {
        let mut pos = self.tail.0.load(Ordering::Relaxed);
        loop {
            let slot = &self.buffer[pos & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos.wrapping_add(1)) as isize;

            if diff == 0 {
                match self.tail.0.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: seq == pos + 1 means the producer finished writing,
                        // and winning the CAS makes us the only reader of this slot.
                        let item = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.seq
                            .store(pos.wrapping_add(self.mask + 1), Ordering::Release);
                        return Some(item);
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                // Nothing published at this position yet.
                return None;
            } else {
                pos = self.tail.0.load(Ordering::Relaxed);
            }
        }
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn ring<T>(cap: usize) -> Ring<T> {
        Ring::with_capacity(NonZeroUsize::new(cap).unwrap())
    }

    #[test]
    fn fifo_single_thread() {
        let ring = ring::<u64>(8);
        for i in 1..=3 {
            ring.push(i).unwrap();
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.pop(), Some(1));
        assert_eq!(ring.pop(), Some(2));
        assert_eq!(ring.pop(), Some(3));
        assert_eq!(ring.pop(), None);
        assert!(ring.is_empty());
    }

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        let ring = ring::<u8>(5);
        assert_eq!(ring.capacity(), 8);
    }

    #[test]
    fn single_slot_ring_rejects_second_push() {
        let ring = ring::<u32>(1);
        assert_eq!(ring.capacity(), 1);
        ring.push(1).unwrap();
        assert_eq!(ring.push(2), Err(2));
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.pop(), Some(1));
        assert_eq!(ring.pop(), None);

        ring.push(3).unwrap();
        assert_eq!(ring.push(4), Err(4));
        assert_eq!(ring.pop(), Some(3));
        assert!(ring.is_empty());
    }

    #[test]
    fn single_slot_ring_drops_queued_item() {
        let marker = Arc::new(());
        {
            let ring = ring::<Arc<()>>(1);
            ring.push(Arc::clone(&marker)).unwrap();
            assert!(ring.push(Arc::clone(&marker)).is_err());
            assert_eq!(Arc::strong_count(&marker), 2);
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn queue_full_returns_item() {
        let ring = ring::<u64>(4);
        for i in 0..4 {
            ring.push(i).unwrap();
        }
        assert_eq!(ring.push(99), Err(99));

        assert_eq!(ring.pop(), Some(0));
        assert!(ring.push(4).is_ok());
        assert!(ring.push(5).is_err());
    }

    #[test]
    fn push_blocking_times_out_when_full() {
        let ring = ring::<u64>(1);
        ring.push(1).unwrap();
        let started = Instant::now();
        let res = ring.push_blocking(2, Timeout::Duration(Duration::from_millis(5)));
        assert_eq!(res, Err(2));
        assert!(started.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn push_blocking_completes_once_consumer_frees_space() {
        let ring = Arc::new(ring::<u64>(1));
        ring.push(1).unwrap();

        let consumer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(2));
                ring.pop()
            })
        };

        ring.push_blocking(2, Timeout::Infinite).unwrap();
        assert_eq!(consumer.join().unwrap(), Some(1));
        assert_eq!(ring.pop(), Some(2));
    }

    #[test]
    fn drop_releases_queued_items() {
        let marker = Arc::new(());
        {
            let ring = ring::<Arc<()>>(4);
            ring.push(Arc::clone(&marker)).unwrap();
            ring.push(Arc::clone(&marker)).unwrap();
            assert_eq!(Arc::strong_count(&marker), 3);
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn multiple_producers_preserve_per_producer_order() {
        let ring: Arc<Ring<u64>> = Arc::new(ring(64));
        let producers = 4u64;
        let per_producer = 200u64;

        let handles: Vec<_> = (0..producers)
            .map(|p| {
                let ring = Arc::clone(&ring);
                thread::spawn(move || {
                    for i in 0..per_producer {
                        ring.push_blocking(p * 1000 + i, Timeout::Infinite).unwrap();
                    }
                })
            })
            .collect();

        let mut last_seen = vec![None::<u64>; producers as usize];
        let mut received = 0;
        while received < producers * per_producer {
            if let Some(v) = ring.pop() {
                let p = (v / 1000) as usize;
                if let Some(prev) = last_seen[p] {
                    assert!(v > prev, "producer {p} reordered: {prev} then {v}");
                }
                last_seen[p] = Some(v);
                received += 1;
            } else {
                thread::yield_now();
            }
        }

        for h in handles {
            h.join().unwrap();
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn concurrent_consumers_see_each_item_once() {
        use std::sync::atomic::AtomicU64;

        let ring: Arc<Ring<u64>> = Arc::new(ring(128));
        let received = Arc::new(AtomicU64::new(0));
        let total = 2000u64;

        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                for i in 0..total {
                    ring.push_blocking(i, Timeout::Infinite).unwrap();
                }
            })
        };

        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let ring = Arc::clone(&ring);
                let received = Arc::clone(&received);
                thread::spawn(move || {
                    let mut got = Vec::new();
                    while received.load(Ordering::Acquire) < total {
                        match ring.pop() {
                            Some(v) => {
                                got.push(v);
                                received.fetch_add(1, Ordering::AcqRel);
                            }
                            None => thread::yield_now(),
                        }
                    }
                    got
                })
            })
            .collect();

        producer.join().unwrap();
        let mut all: Vec<u64> = consumers
            .into_iter()
            .flat_map(|c| c.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..total).collect::<Vec<_>>());
    }
}
