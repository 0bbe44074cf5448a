//! Software view of the circular rings shared with the device.
//!
//! All ring state is guarded by a try-lock access bracket: a caller
//! acquires a [`RingAccess`] guard through [`SoftRing::begin_access`],
//! moves the head or tail while holding it, and releases the ring when the
//! guard drops. Contention never blocks, a busy ring is reported to the
//! caller, which backs off and retries on a later invocation.

use core::cell::UnsafeCell;

use alloc::{boxed::Box, vec};
use portable_atomic::{AtomicBool, Ordering};

struct RingInner<T> {
    entries: Box<[T]>,
    /// Producer index, next entry to write.
    head: usize,
    /// Consumer index, next entry to read.
    tail: usize,
    used: usize,
}

pub struct SoftRing<T> {
    in_use: AtomicBool,
    inner: UnsafeCell<RingInner<T>>,
}

// SAFETY: The inner state is only reachable through a RingAccess guard,
// and guard creation goes through the in_use compare-exchange, so at most
// one context touches the state at a time.
unsafe impl<T: Send> Sync for SoftRing<T> {}

impl<T: Default + Clone> SoftRing<T> {
    pub fn new(size: usize) -> Self {
        Self {
            in_use: AtomicBool::new(false),
            inner: UnsafeCell::new(RingInner {
                entries: vec![T::default(); size].into_boxed_slice(),
                head: 0,
                tail: 0,
                used: 0,
            }),
        }
    }
}

impl<T> SoftRing<T> {
    /// Tries to acquire exclusive access to the ring. Returns `None` when
    /// another context currently holds it.
    pub fn begin_access(&self) -> Option<RingAccess<'_, T>> {
        self.in_use
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RingAccess { ring: self })
    }
}

/// Exclusive access bracket over a [`SoftRing`]. Dropping the guard ends
/// the access and republishes the ring.
pub struct RingAccess<'a, T> {
    ring: &'a SoftRing<T>,
}

impl<T> RingAccess<'_, T> {
    fn inner(&mut self) -> &mut RingInner<T> {
        // SAFETY: Holding the guard means we won the compare-exchange and
        // no other reference to the inner state exists.
        unsafe { &mut *self.ring.inner.get() }
    }

    /// Entries currently queued.
    pub fn len(&mut self) -> usize {
        self.inner().used
    }
    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }
    /// Free entries left for the producer.
    pub fn remaining(&mut self) -> usize {
        let inner = self.inner();
        inner.entries.len() - inner.used
    }

    /// Claims the next producer entry. The caller fills the returned slot
    /// before the guard is dropped; dropping the guard publishes it.
    pub fn produce_next(&mut self) -> Option<&mut T> {
        let inner = self.inner();
        if inner.used == inner.entries.len() {
            return None;
        }
        let idx = inner.head;
        inner.head = (inner.head + 1) % inner.entries.len();
        inner.used += 1;
        Some(&mut inner.entries[idx])
    }
}

impl<T: Copy> RingAccess<'_, T> {
    /// Takes the next consumer entry, or `None` when the ring is drained.
    pub fn consume_next(&mut self) -> Option<T> {
        let inner = self.inner();
        if inner.used == 0 {
            return None;
        }
        let idx = inner.tail;
        inner.tail = (inner.tail + 1) % inner.entries.len();
        inner.used -= 1;
        Some(inner.entries[idx])
    }
}

impl<T> Drop for RingAccess<'_, T> {
    fn drop(&mut self) {
        self.ring.in_use.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_is_exclusive() {
        let ring = SoftRing::<u32>::new(4);
        let guard = ring.begin_access().unwrap();
        assert!(ring.begin_access().is_none());
        drop(guard);
        assert!(ring.begin_access().is_some());
    }

    #[test]
    fn produce_consume_wraps() {
        let ring = SoftRing::<u32>::new(3);
        for round in 0..5u32 {
            let mut access = ring.begin_access().unwrap();
            for i in 0..3 {
                *access.produce_next().unwrap() = round * 10 + i;
            }
            assert!(access.produce_next().is_none());
            for i in 0..3 {
                assert_eq!(access.consume_next(), Some(round * 10 + i));
            }
            assert!(access.consume_next().is_none());
        }
    }

    #[test]
    fn remaining_tracks_occupancy() {
        let ring = SoftRing::<u8>::new(2);
        let mut access = ring.begin_access().unwrap();
        assert_eq!(access.remaining(), 2);
        *access.produce_next().unwrap() = 1;
        assert_eq!(access.remaining(), 1);
        access.consume_next();
        assert_eq!(access.remaining(), 2);
    }
}
