//! Bounded lock-free MPMC ring of slots.
//!
//! Each slot carries a tag `lap << 2 | state`. A thread first reserves a
//! position by advancing the push or pop cursor with a CAS, then claims the
//! slot itself with a CAS on its tag. Because the tag embeds the lap
//! (`position / capacity`), a thread that stalled between the two steps can
//! never claim the slot of a later lap.
//!
//! Used as the node pool free list and as the cursor work queue.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

const EMPTY: u64 = 0;
const LOCKED: u64 = 1;
const FILLED: u64 = 2;

#[inline(always)]
const fn tag(lap: u64, state: u64) -> u64 {
    lap << 2 | state
}

struct Slot<T> {
    tag: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
}

pub struct SlotRing<T> {
    slots: Box<[Slot<T>]>,
    push: CachePadded<AtomicU64>,
    pop: CachePadded<AtomicU64>,
}

// SAFETY: a value is only touched by the thread that holds its slot LOCKED.
unsafe impl<T: Send> Send for SlotRing<T> {}
unsafe impl<T: Send> Sync for SlotRing<T> {}

impl<T> SlotRing<T> {
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "slot ring needs at least one slot");
        let slots = (0..capacity)
            .map(|_| Slot {
                tag: AtomicU64::new(tag(0, EMPTY)),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            slots,
            push: CachePadded::new(AtomicU64::new(0)),
            pop: CachePadded::new(AtomicU64::new(0)),
        }
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Approximate number of queued values.
    pub fn len(&self) -> usize {
        let pop = self.pop.load(Ordering::Acquire);
        let push = self.push.load(Ordering::Acquire);
        push.saturating_sub(pop) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append `value`, handing it back if the ring is full.
    pub fn push(&self, value: T) -> Result<(), T> {
        let cap = self.slots.len() as u64;
        let backoff = Backoff::new();
        let mut pos = self.push.load(Ordering::Acquire);
        loop {
            let pop = self.pop.load(Ordering::Acquire);
            if pos.wrapping_sub(pop) >= cap {
                let current = self.push.load(Ordering::Acquire);
                if current == pos {
                    return Err(value);
                }
                pos = current;
                continue;
            }
            match self
                .push
                .compare_exchange_weak(pos, pos + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(current) => {
                    pos = current;
                    backoff.spin();
                }
            }
        }

        let slot = &self.slots[(pos % cap) as usize];
        let lap = pos / cap;
        // The popper of the previous lap may still be moving its value out.
        let backoff = Backoff::new();
        while slot
            .tag
            .compare_exchange_weak(
                tag(lap, EMPTY),
                tag(lap, LOCKED),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_err()
        {
            backoff.snooze();
        }
        // SAFETY: the slot is LOCKED by this thread for this lap.
        unsafe { (*slot.value.get()).write(value) };
        slot.tag.store(tag(lap, FILLED), Ordering::Release);
        Ok(())
    }

    /// Remove the oldest value, or `None` if the ring is empty.
    pub fn pop(&self) -> Option<T> {
        let cap = self.slots.len() as u64;
        let backoff = Backoff::new();
        let mut pos = self.pop.load(Ordering::Acquire);
        loop {
            let push = self.push.load(Ordering::Acquire);
            if pos >= push {
                let current = self.pop.load(Ordering::Acquire);
                if current == pos {
                    return None;
                }
                pos = current;
                continue;
            }
            match self
                .pop
                .compare_exchange_weak(pos, pos + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(current) => {
                    pos = current;
                    backoff.spin();
                }
            }
        }

        let slot = &self.slots[(pos % cap) as usize];
        let lap = pos / cap;
        // The pusher that reserved this position may not have stored yet.
        let backoff = Backoff::new();
        while slot
            .tag
            .compare_exchange_weak(
                tag(lap, FILLED),
                tag(lap, LOCKED),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_err()
        {
            backoff.snooze();
        }
        // SAFETY: FILLED guarantees an initialized value; LOCKED gives exclusive access.
        let value = unsafe { (*slot.value.get()).assume_init_read() };
        slot.tag.store(tag(lap + 1, EMPTY), Ordering::Release);
        Some(value)
    }
}

impl<T> Drop for SlotRing<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_fifo_order() {
        let ring = SlotRing::with_capacity(4);
        for i in 0..4 {
            ring.push(i).unwrap();
        }
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.push(99), Err(99));

        for i in 0..4 {
            assert_eq!(ring.pop(), Some(i));
        }
        assert_eq!(ring.pop(), None);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_many_laps() {
        let ring = SlotRing::with_capacity(3);
        for i in 0..1000u32 {
            ring.push(i).unwrap();
            ring.push(i + 1).unwrap();
            assert_eq!(ring.pop(), Some(i));
            assert_eq!(ring.pop(), Some(i + 1));
        }
    }

    #[test]
    fn test_drop_releases_values() {
        struct Counted(Arc<AtomicUsize>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        {
            let ring = SlotRing::with_capacity(8);
            for _ in 0..5 {
                assert!(ring.push(Counted(drops.clone())).is_ok());
            }
            drop(ring.pop());
        }
        assert_eq!(drops.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_concurrent_producers_consumers() {
        const PER_PRODUCER: u64 = 20_000;
        const PRODUCERS: u64 = 4;

        let ring = SlotRing::with_capacity(64);
        let popped = AtomicUsize::new(0);
        let seen = parking_lot::Mutex::new(HashSet::new());

        std::thread::scope(|s| {
            for p in 0..PRODUCERS {
                let ring = &ring;
                s.spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let mut v = p * PER_PRODUCER + i;
                        while let Err(back) = ring.push(v) {
                            v = back;
                            std::thread::yield_now();
                        }
                    }
                });
            }
            for _ in 0..4 {
                s.spawn(|| {
                    let mut local = Vec::new();
                    while popped.load(Ordering::Relaxed) < (PRODUCERS * PER_PRODUCER) as usize {
                        match ring.pop() {
                            Some(v) => {
                                popped.fetch_add(1, Ordering::Relaxed);
                                local.push(v);
                            }
                            None => std::thread::yield_now(),
                        }
                    }
                    let mut seen = seen.lock();
                    for v in local {
                        assert!(seen.insert(v), "value {v} popped twice");
                    }
                });
            }
        });

        assert_eq!(seen.lock().len(), (PRODUCERS * PER_PRODUCER) as usize);
        assert!(ring.is_empty());
    }
}
