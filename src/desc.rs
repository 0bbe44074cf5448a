//! Software transmit descriptor pools.
//!
//! Each in-flight frame owns exactly one descriptor slot for its whole
//! lifetime. Slot metadata that multiple contexts race on (flags,
//! reference count, recorded status) lives in atomics. The body of the
//! slot is phase-owned: from allocation to hardware enqueue it belongs to
//! the submitting context, afterwards to whichever context observes the
//! reference count hit zero. Only the owning phase may touch the body, so
//! it sits in an `UnsafeCell` without further locking.
//!
//! The free list is an intrusive singly-linked list threaded through the
//! slot bodies, guarded by a blocking mutex so whole chains of completed
//! descriptors can be returned with a single acquisition.

use core::cell::{RefCell, UnsafeCell};

use alloc::{boxed::Box, vec::Vec};
use embassy_sync::blocking_mutex::Mutex;
use macro_bits::{bit, check_bit};
use portable_atomic::{AtomicU8, Ordering};

use crate::{
    hal::{CompletionInfo, TxStatus},
    msdu::NetBuf,
    DefaultRawMutex,
};

/// Slot is out of the free list and carries a frame.
pub(crate) const DESC_FLAG_ALLOCATED: u8 = bit!(0);
/// Slot has been handed to the hardware and awaits completion.
pub(crate) const DESC_FLAG_QUEUED: u8 = bit!(1);

/// How the frame a descriptor carries is to be treated at release time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FrameKind {
    /// Regular data frame, buffer freed on release.
    Std,
    /// Non-linear frame with a scatter list attached.
    Sg,
    /// Pre-formed 802.11 frame.
    Raw,
    /// The buffer belongs to the caller and must never be freed here. It
    /// is handed back through the registered completion callback.
    NoFree,
    /// Management frame, completion reported through the callback table
    /// entry for the carried type index.
    Mgmt(u8),
}

/// Phase-owned portion of a descriptor slot.
pub(crate) struct DescBody {
    pub netbuf: Option<NetBuf>,
    pub kind: FrameKind,
    pub vdev_id: u8,
    /// TID the frame was classified into.
    pub tid: u8,
    /// Frame was routed through the firmware.
    pub to_fw: bool,
    /// Index of the attached scatter list, for [`FrameKind::Sg`].
    pub ext_idx: Option<u16>,
    /// Tick at which the frame entered the hardware ring.
    pub enqueue_ticks: u32,
    /// Completion words recorded by the dispatcher before release.
    pub comp: CompletionInfo,
    /// Free list / reaped list link.
    pub next: Option<u16>,
}

impl DescBody {
    const fn empty() -> Self {
        Self {
            netbuf: None,
            kind: FrameKind::Std,
            vdev_id: 0,
            tid: 0,
            to_fw: false,
            ext_idx: None,
            enqueue_ticks: 0,
            comp: CompletionInfo::new(),
            next: None,
        }
    }
}

pub(crate) struct DescSlot {
    flags: AtomicU8,
    ref_cnt: AtomicU8,
    status: AtomicU8,
    body: UnsafeCell<DescBody>,
}

impl DescSlot {
    fn new() -> Self {
        Self {
            flags: AtomicU8::new(0),
            ref_cnt: AtomicU8::new(0),
            status: AtomicU8::new(TxStatus::Ok.into_bits()),
            body: UnsafeCell::new(DescBody::empty()),
        }
    }

    pub(crate) fn set_flags(&self, flags: u8) {
        self.flags.fetch_or(flags, Ordering::Release);
    }
    pub(crate) fn clear_flags(&self, flags: u8) {
        self.flags.fetch_and(!flags, Ordering::Release);
    }
    pub(crate) fn has_flag(&self, flag: u8) -> bool {
        check_bit!(self.flags.load(Ordering::Acquire), flag)
    }

    /// Arms the reference count for a fresh submission. Two references for
    /// the dual-signal path, one for single-completion paths.
    pub(crate) fn ref_init(&self, refs: u8) {
        self.ref_cnt.store(refs, Ordering::Release);
    }
    /// Drops one reference, returns whether this was the last one.
    pub(crate) fn ref_dec_and_test(&self) -> bool {
        self.ref_cnt.fetch_sub(1, Ordering::AcqRel) == 1
    }
    /// Forces the count to zero, for error paths that bypass the second
    /// signal.
    pub(crate) fn ref_clear(&self) {
        self.ref_cnt.store(0, Ordering::Release);
    }
    pub(crate) fn refs(&self) -> u8 {
        self.ref_cnt.load(Ordering::Acquire)
    }

    pub(crate) fn record_status(&self, status: TxStatus) {
        self.status.store(status.into_bits(), Ordering::Release);
    }
    pub(crate) fn status(&self) -> TxStatus {
        TxStatus::from_bits(self.status.load(Ordering::Acquire))
    }

    /// Mutable access to the phase-owned body.
    ///
    /// # Safety
    /// The caller must be the current phase owner of the slot: the
    /// allocating context before the slot is queued, or the context that
    /// observed [`Self::ref_dec_and_test`] return `true` afterwards.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn body(&self) -> &mut DescBody {
        &mut *self.body.get()
    }
}

struct FreeList {
    head: Option<u16>,
    num_free: u16,
}

pub(crate) struct TxDescPool {
    pool_id: u8,
    slots: Box<[DescSlot]>,
    free: Mutex<DefaultRawMutex, RefCell<FreeList>>,
}

// SAFETY: Shared slot metadata is atomic, bodies follow the phase
// ownership rule documented on DescSlot::body, and the free list is behind
// a mutex.
unsafe impl Sync for TxDescPool {}
unsafe impl Send for TxDescPool {}

impl TxDescPool {
    pub(crate) fn new(pool_id: u8, size: u16) -> Self {
        let slots = (0..size).map(|_| DescSlot::new()).collect::<Vec<_>>();
        let pool = Self {
            pool_id,
            slots: slots.into_boxed_slice(),
            free: Mutex::new(RefCell::new(FreeList {
                head: None,
                num_free: 0,
            })),
        };
        // Thread the initial free list in slot order.
        for offset in 0..size {
            // SAFETY: Nothing else can reference the pool yet.
            unsafe { pool.slot_unchecked(offset).body().next = offset.checked_add(1).filter(|n| *n < size) };
        }
        pool.free.lock(|free| {
            let mut free = free.borrow_mut();
            free.head = if size > 0 { Some(0) } else { None };
            free.num_free = size;
        });
        pool
    }

    pub(crate) fn pool_id(&self) -> u8 {
        self.pool_id
    }
    pub(crate) fn size(&self) -> u16 {
        self.slots.len() as u16
    }
    pub(crate) fn num_free(&self) -> u16 {
        self.free.lock(|free| free.borrow().num_free)
    }

    fn slot_unchecked(&self, offset: u16) -> &DescSlot {
        &self.slots[offset as usize]
    }

    /// Slot lookup with the offset validated against the pool size. An out
    /// of range offset means a corrupted descriptor ID, which is fatal.
    pub(crate) fn slot(&self, offset: u16) -> &DescSlot {
        assert!(
            (offset as usize) < self.slots.len(),
            "tx desc offset {} out of range for pool {}",
            offset,
            self.pool_id
        );
        self.slot_unchecked(offset)
    }

    /// Takes a slot off the free list. The returned slot has its allocated
    /// flag set, zero references and a cleared body.
    pub(crate) fn alloc(&self) -> Option<u16> {
        let offset = self.free.lock(|free| {
            let mut free = free.borrow_mut();
            let offset = free.head?;
            let slot = self.slot_unchecked(offset);
            // SAFETY: Free slots are owned by the free list, which we hold
            // the lock for.
            free.head = unsafe { slot.body().next.take() };
            free.num_free -= 1;
            Some(offset)
        })?;
        let slot = self.slot_unchecked(offset);
        slot.set_flags(DESC_FLAG_ALLOCATED);
        slot.ref_clear();
        slot.record_status(TxStatus::Ok);
        Some(offset)
    }

    /// Returns one slot to the free list.
    pub(crate) fn free(&self, offset: u16) {
        self.free_chain(offset, offset, 1);
    }

    /// Returns a linked chain of slots under a single lock acquisition.
    /// The chain runs from `head` to `tail` through the body `next` links
    /// and must contain exactly `count` slots.
    pub(crate) fn free_chain(&self, head: u16, tail: u16, count: u16) {
        debug_assert!(count > 0);
        let mut offset = head;
        loop {
            let slot = self.slot(offset);
            debug_assert!(slot.has_flag(DESC_FLAG_ALLOCATED));
            debug_assert_eq!(slot.refs(), 0);
            slot.clear_flags(DESC_FLAG_ALLOCATED | DESC_FLAG_QUEUED);
            if offset == tail {
                break;
            }
            // SAFETY: Completed slots in the chain are owned by the
            // freeing context.
            match unsafe { slot.body().next } {
                Some(next) => offset = next,
                None => {
                    debug_assert!(false, "tx desc chain shorter than advertised");
                    break;
                }
            }
        }
        self.free.lock(|free| {
            let mut free = free.borrow_mut();
            // SAFETY: As above, the tail slot is owned by us until it is
            // linked back into the list.
            unsafe { self.slot_unchecked(tail).body().next = free.head };
            free.head = Some(head);
            free.num_free += count;
        });
    }
}

/// A scatter list handed to the device for non-linear frames.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct ScatterElem {
    pub addr: u64,
    pub len: u16,
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ExtDesc {
    pub elems: [ScatterElem; crate::msdu::MAX_FRAGS],
    pub num: u8,
}

struct ExtPoolInner {
    descs: Box<[ExtDesc]>,
    free: Vec<u16>,
}

/// Pool of extension descriptors carrying scatter lists. Allocation is
/// rarer and never happens from the hot completion path, so a plain
/// mutex-guarded stack is enough here.
pub(crate) struct ExtDescPool {
    inner: Mutex<DefaultRawMutex, RefCell<ExtPoolInner>>,
}

impl ExtDescPool {
    pub(crate) fn new(size: u16) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(ExtPoolInner {
                descs: alloc::vec![ExtDesc::default(); size as usize].into_boxed_slice(),
                free: (0..size).rev().collect(),
            })),
        }
    }

    pub(crate) fn alloc(&self, elems: &[ScatterElem]) -> Option<u16> {
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            let idx = inner.free.pop()?;
            let desc = &mut inner.descs[idx as usize];
            desc.num = elems.len() as u8;
            desc.elems = Default::default();
            desc.elems[..elems.len()].copy_from_slice(elems);
            Some(idx)
        })
    }

    pub(crate) fn get(&self, idx: u16) -> ExtDesc {
        self.inner.lock(|inner| inner.borrow().descs[idx as usize])
    }

    pub(crate) fn free(&self, idx: u16) {
        self.inner.lock(|inner| inner.borrow_mut().free.push(idx));
    }

    pub(crate) fn num_free(&self) -> u16 {
        self.inner.lock(|inner| inner.borrow().free.len() as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_to_exhaustion_and_back() {
        let pool = TxDescPool::new(0, 4);
        assert_eq!(pool.num_free(), 4);
        let mut offsets = Vec::new();
        while let Some(offset) = pool.alloc() {
            assert!(!offsets.contains(&offset));
            offsets.push(offset);
        }
        assert_eq!(offsets.len(), 4);
        assert_eq!(pool.num_free(), 0);
        for offset in offsets {
            pool.free(offset);
        }
        assert_eq!(pool.num_free(), 4);
    }

    #[test]
    fn freed_slots_are_reusable() {
        let pool = TxDescPool::new(0, 2);
        let a = pool.alloc().unwrap();
        pool.free(a);
        let b = pool.alloc().unwrap();
        assert_eq!(a, b);
        assert!(pool.slot(b).has_flag(DESC_FLAG_ALLOCATED));
    }

    #[test]
    fn free_chain_returns_all_slots_at_once() {
        let pool = TxDescPool::new(0, 8);
        let offsets: Vec<_> = (0..5).map(|_| pool.alloc().unwrap()).collect();
        for pair in offsets.windows(2) {
            unsafe { pool.slot(pair[0]).body().next = Some(pair[1]) };
        }
        unsafe { pool.slot(offsets[4]).body().next = None };
        pool.free_chain(offsets[0], offsets[4], 5);
        assert_eq!(pool.num_free(), 8);
    }

    #[test]
    fn refcount_dec_and_test() {
        let pool = TxDescPool::new(0, 1);
        let offset = pool.alloc().unwrap();
        let slot = pool.slot(offset);
        slot.ref_init(2);
        assert!(!slot.ref_dec_and_test());
        assert!(slot.ref_dec_and_test());
    }

    #[test]
    fn ext_pool_roundtrip() {
        let pool = ExtDescPool::new(2);
        let elems = [
            ScatterElem { addr: 0x1000, len: 64 },
            ScatterElem { addr: 0x2000, len: 128 },
        ];
        let idx = pool.alloc(&elems).unwrap();
        let desc = pool.get(idx);
        assert_eq!(desc.num, 2);
        assert_eq!(desc.elems[1].len, 128);
        pool.free(idx);
        assert_eq!(pool.num_free(), 2);
    }
}
