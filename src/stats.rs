//! Transmit path counters.
//!
//! Counters are plain relaxed atomics, updated from the submission and
//! completion paths and read from anywhere. Consistency across counters is
//! not guaranteed and not needed.

use portable_atomic::{AtomicU32, AtomicU64, Ordering};

#[derive(Default)]
pub struct Counter(AtomicU32);

impl Counter {
    pub(crate) fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn add(&self, n: u32) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct ByteCounter(AtomicU64);

impl ByteCounter {
    pub(crate) fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per virtual device transmit counters.
#[derive(Default)]
pub struct VdevTxStats {
    /// Frames handed to [`TxEngine::send`](crate::TxEngine::send) and
    /// friends.
    pub rcvd_pkts: Counter,
    pub rcvd_bytes: ByteCounter,
    /// Frames successfully placed on a data ring.
    pub enqueued: Counter,
    pub raw_pkts: Counter,
    pub sg_pkts: Counter,
    pub mgmt_pkts: Counter,
    /// Frames the firmware asked to resubmit.
    pub reinjected: Counter,
    /// Frames returned through the inspect path.
    pub inspected: Counter,
    /// Frames fully completed and released.
    pub completed: Counter,
    pub comp_ok: Counter,
    pub comp_err: Counter,

    pub drop_no_desc: Counter,
    pub drop_no_credit: Counter,
    pub drop_ring_full: Counter,
    pub drop_ring_busy: Counter,
    pub drop_dma_error: Counter,
    pub drop_download_fail: Counter,
    /// Dropped by the firmware or aged out of a target queue.
    pub drop_fw: Counter,
    pub drop_ttl: Counter,
}

/// Engine wide counters.
#[derive(Default)]
pub struct SocTxStats {
    /// Completion ring drain invocations.
    pub drain_calls: Counter,
    /// Completion entries consumed across all rings.
    pub drained: Counter,
    /// Drains cut short by the budget.
    pub drain_budget_hit: Counter,
    /// Completion batches delivered through target messages.
    pub msg_batches: Counter,
    /// Completion entries whose descriptor flags were already clear.
    pub stale_completion: Counter,
    /// Completion entries with a release source this host never uses.
    pub invalid_release_source: Counter,
    /// begin_access lost the try-lock race.
    pub ring_busy: Counter,
}
