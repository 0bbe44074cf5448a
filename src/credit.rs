//! Target download credit tracking.
//!
//! Every frame handed to the target consumes one credit, every completion
//! or rejection restores it. The count is signed because the target may
//! push absolute corrections through credit update events while frames are
//! still in flight.

use portable_atomic::{AtomicI32, Ordering};

pub(crate) struct CreditTracker {
    credit: AtomicI32,
    lwm: i32,
}

impl CreditTracker {
    pub(crate) fn new(initial: u16, lwm: u16) -> Self {
        Self {
            credit: AtomicI32::new(initial as i32),
            lwm: lwm as i32,
        }
    }

    /// Tries to take `n` credits for a download. Fails without side
    /// effects when not enough credit is available.
    pub(crate) fn consume(&self, n: u16) -> bool {
        let n = n as i32;
        self.credit
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |credit| {
                (credit >= n).then(|| credit - n)
            })
            .is_ok()
    }

    /// Returns `n` credits, from completions or failed downloads.
    pub(crate) fn restore(&self, n: u16) {
        self.credit.fetch_add(n as i32, Ordering::AcqRel);
    }

    /// Applies a signed correction reported by the target.
    pub(crate) fn adjust(&self, delta: i32) {
        let credit = self.credit.fetch_add(delta, Ordering::AcqRel) + delta;
        if credit < 0 {
            warn!("target credit went negative: {}", credit);
        }
    }

    pub(crate) fn available(&self) -> i32 {
        self.credit.load(Ordering::Acquire)
    }

    /// Whether the submission path should start pushing for completion
    /// processing to reclaim credit.
    pub(crate) fn below_lwm(&self) -> bool {
        self.available() < self.lwm
    }
}
