//! Completion processing.
//!
//! A descriptor is released by whichever of its two signals arrives last:
//! the download-done notification from the transport, and the transmit
//! completion from the device or target. Both paths decrement the
//! reference count armed at submission and the context that observes zero
//! takes over the slot body, tears down the buffer mapping, runs the
//! completion callbacks and returns the slot.
//!
//! Completions arrive either through the completion rings, drained with a
//! budget by [`TxEngine::drain_completions`], or through batched target
//! messages ([`TxEngine::completion_handler`],
//! [`TxEngine::inspect_handler`]). Both feed the same release routine, so
//! the paths cannot diverge in how a frame is torn down.

use alloc::vec::Vec;
use portable_atomic::Ordering;

use crate::{
    desc::{FrameKind, TxDescPool, DESC_FLAG_ALLOCATED, DESC_FLAG_QUEUED},
    hal::{CompletionInfo, FwTxStatus, ReleaseSource, TxDescId, TxStatus},
    tx::TxEngine,
};

/// Per-frame latency sample taken at release.
#[cfg_attr(not(feature = "tx-delay"), allow(dead_code))]
#[derive(Clone, Copy)]
pub(crate) struct DelaySample {
    pub tid: u8,
    pub entry_ticks: u32,
    pub ok: bool,
}

/// Reaped descriptor chain of one pool, linked through the slot bodies in
/// completion order.
#[derive(Clone, Copy)]
struct Reaped {
    head: u16,
    tail: u16,
    count: u16,
}

impl TxEngine {
    /// Resolves a completion-carried descriptor ID. An ID pointing at a
    /// pool this engine never configured means the host and device views
    /// of the descriptor space have diverged, which is unrecoverable.
    fn desc_from_id(&self, raw_id: u32) -> (&TxDescPool, u16) {
        let id = TxDescId::from(raw_id);
        let pool_idx = id.pool_id() as usize;
        assert!(
            pool_idx < self.pools.len(),
            "completion names pool {} of {}",
            pool_idx,
            self.pools.len()
        );
        let pool = &self.pools[pool_idx];
        assert!(
            pool.pool_id() as usize == pool_idx,
            "desc id pool {} does not match pool record {}",
            pool_idx,
            pool.pool_id()
        );
        (pool, id.offset())
    }

    /// Checks that a completion refers to a live, queued descriptor.
    fn completion_is_live(&self, pool: &TxDescPool, offset: u16) -> bool {
        let slot = pool.slot(offset);
        if slot.has_flag(DESC_FLAG_ALLOCATED) && slot.has_flag(DESC_FLAG_QUEUED) {
            true
        } else {
            warn!(
                "stale completion for pool {} desc {}",
                pool.pool_id(),
                offset
            );
            self.soc_stats.stale_completion.inc();
            false
        }
    }

    /// Tears down a released frame: unmaps and frees (or hands back) the
    /// buffer, releases the scatter list, updates accounting and runs the
    /// completion callbacks. The slot itself stays allocated, the caller
    /// chains it back to the pool.
    ///
    /// Only called by the context that saw the reference count reach zero.
    fn msdu_release(&self, pool: &TxDescPool, offset: u16, inspect: bool) -> DelaySample {
        let slot = pool.slot(offset);
        let status = slot.status();
        // SAFETY: Zero references, this context owns the body.
        let body = unsafe { slot.body() };
        if let Some(ext_idx) = body.ext_idx.take() {
            self.ext_pools[pool.pool_id() as usize].free(ext_idx);
        }
        let mut nbuf = body.netbuf.take();
        if let Some(nbuf) = &mut nbuf {
            nbuf.dma_unmap();
        }
        let sample = DelaySample {
            tid: body.tid,
            entry_ticks: body.enqueue_ticks,
            ok: status.is_ok(),
        };

        if let Ok(vdev) = self.vdev(body.vdev_id) {
            vdev.stats.completed.inc();
            if inspect {
                vdev.stats.inspected.inc();
            }
            match status {
                TxStatus::Ok => vdev.stats.comp_ok.inc(),
                TxStatus::Ttl => {
                    vdev.stats.comp_err.inc();
                    vdev.stats.drop_ttl.inc();
                }
                TxStatus::DownloadFail => {
                    vdev.stats.comp_err.inc();
                    vdev.stats.drop_download_fail.inc();
                }
                _ => {
                    vdev.stats.comp_err.inc();
                    vdev.stats.drop_fw.inc();
                }
            }
        }

        match body.kind {
            FrameKind::Mgmt(mgmt_type) => {
                if let Some(nbuf) = nbuf {
                    self.mgmt_cbs.lock(|table| {
                        match &table.borrow()[mgmt_type as usize].ota_cb {
                            Some(cb) => cb(nbuf, status),
                            None => drop(nbuf),
                        }
                    });
                }
            }
            FrameKind::NoFree => {
                if let Some(nbuf) = nbuf {
                    self.nonstd_cb.lock(|cb| match cb.borrow().as_ref() {
                        Some(cb) => cb(nbuf, status),
                        None => {
                            warn!("no-free frame completed without a handler");
                            drop(nbuf);
                        }
                    });
                }
            }
            // Std, Raw and Sg buffers are dropped here.
            _ => {}
        }

        if body.to_fw {
            self.num_tx_exception.fetch_sub(1, Ordering::Release);
        }
        self.num_tx_outstanding.fetch_sub(1, Ordering::Release);
        sample
    }

    /// Releases a frame and returns its slot to the pool immediately.
    fn release_desc(&self, pool: &TxDescPool, offset: u16, inspect: bool) -> DelaySample {
        let sample = self.msdu_release(pool, offset, inspect);
        pool.free(offset);
        sample
    }

    /// Drains up to `budget` entries from one completion ring.
    ///
    /// Descriptors whose last reference drops here are torn down and
    /// collected on per-pool chains, which are returned to their pools in
    /// one lock acquisition each after the ring access ends. Returns the
    /// number of entries consumed.
    pub fn drain_completions(&self, ring: usize, budget: u32) -> u32 {
        self.soc_stats.drain_calls.inc();
        let Some(mut access) = self.comp_rings[ring].begin_access() else {
            self.soc_stats.ring_busy.inc();
            return 0;
        };
        let now = (self.cfg.ticks)();
        let mut reaped: Vec<Option<Reaped>> = alloc::vec![None; self.pools.len()];
        #[cfg(feature = "tx-delay")]
        let mut samples: Vec<DelaySample> = Vec::new();
        let mut consumed = 0u32;
        let mut credit_reclaimed = 0u16;
        let mut fw_entries: Vec<CompletionInfo> = Vec::new();

        while consumed < budget {
            let Some(entry) = access.consume_next() else {
                break;
            };
            consumed += 1;
            let (pool, offset) = self.desc_from_id(entry.desc_id());
            if !self.completion_is_live(pool, offset) {
                continue;
            }
            match ReleaseSource::from_bits(entry.release_source()) {
                None => {
                    error!(
                        "completion with invalid release source {}",
                        entry.release_source()
                    );
                    self.soc_stats.invalid_release_source.inc();
                    // TODO: recover the buffer still attached to this
                    // descriptor instead of leaking it.
                    continue;
                }
                Some(ReleaseSource::Fw) => {
                    // Firmware exceptions may resubmit through the data
                    // path, which takes ring locks of its own. Defer until
                    // the access bracket is released.
                    fw_entries.push(entry);
                    continue;
                }
                Some(ReleaseSource::Hw) => {
                    let slot = pool.slot(offset);
                    slot.record_status(entry.tx_status());
                    // The target has released its copy either way.
                    credit_reclaimed += 1;
                    if !slot.ref_dec_and_test() {
                        // Download-done still pending, it will free.
                        continue;
                    }
                    // SAFETY: Last reference just dropped, we own the body.
                    unsafe { slot.body() }.comp = entry;
                    let sample = self.msdu_release(pool, offset, false);
                    #[cfg(feature = "tx-delay")]
                    samples.push(sample);
                    #[cfg(not(feature = "tx-delay"))]
                    let _ = sample;

                    let pool_idx = pool.pool_id() as usize;
                    // Append to this pool's chain, preserving completion
                    // order.
                    match &mut reaped[pool_idx] {
                        Some(chain) => {
                            // SAFETY: Chained slots are owned by this
                            // drain until freed.
                            unsafe {
                                pool.slot(chain.tail).body().next = Some(offset);
                                pool.slot(offset).body().next = None;
                            }
                            chain.tail = offset;
                            chain.count += 1;
                        }
                        none => {
                            unsafe { pool.slot(offset).body().next = None };
                            *none = Some(Reaped {
                                head: offset,
                                tail: offset,
                                count: 1,
                            });
                        }
                    }
                }
            }
        }
        if consumed == budget {
            self.soc_stats.drain_budget_hit.inc();
        }
        drop(access);

        for (pool_idx, chain) in reaped.into_iter().enumerate() {
            if let Some(chain) = chain {
                self.pools[pool_idx].free_chain(chain.head, chain.tail, chain.count);
            }
        }
        for entry in fw_entries {
            self.process_fw_completion(entry);
        }
        if credit_reclaimed > 0 {
            self.credit.restore(credit_reclaimed);
        }
        #[cfg(feature = "tx-delay")]
        self.delay.compute(now, &samples);
        #[cfg(not(feature = "tx-delay"))]
        let _ = now;
        self.soc_stats.drained.add(consumed);
        self.unpause_sweep();
        consumed
    }

    /// Handles one completion entry released by the firmware.
    fn process_fw_completion(&self, entry: CompletionInfo) {
        let (pool, offset) = self.desc_from_id(entry.desc_id());
        if !self.completion_is_live(pool, offset) {
            return;
        }
        let slot = pool.slot(offset);
        let fw_status = FwTxStatus::from_bits(entry.fw_status() as u8);
        let status = match fw_status {
            Some(FwTxStatus::Ok) => TxStatus::Ok,
            Some(FwTxStatus::Ttl) => TxStatus::Ttl,
            Some(FwTxStatus::Reinject) | Some(FwTxStatus::Inspect) => TxStatus::Ok,
            Some(FwTxStatus::Drop) => TxStatus::Discard,
            None => {
                warn!("unknown firmware tx status {}", entry.fw_status());
                TxStatus::Discard
            }
        };
        slot.record_status(status);
        self.credit.restore(1);
        if !slot.ref_dec_and_test() {
            if matches!(fw_status, Some(FwTxStatus::Reinject) | Some(FwTxStatus::Inspect)) {
                // The buffer can only be handed over by the freeing
                // context, which has no way of knowing the firmware wanted
                // it back.
                warn!("fw {:?} raced the download signal, frame completes normally", fw_status);
            }
            return;
        }
        match fw_status {
            Some(FwTxStatus::Reinject) => {
                // SAFETY: Last reference dropped above, we own the body.
                let body = unsafe { slot.body() };
                let mut nbuf = body.netbuf.take();
                if let Some(nbuf) = &mut nbuf {
                    nbuf.dma_unmap();
                }
                let vdev_id = body.vdev_id;
                self.release_desc(pool, offset, false);
                let mesh = self
                    .vdev(vdev_id)
                    .map(|vdev| {
                        vdev.stats.reinjected.inc();
                        vdev.cfg.mesh
                    })
                    .unwrap_or(true);
                match nbuf {
                    // Mesh copies are not resubmitted, the original
                    // already went out.
                    Some(nbuf) if !mesh => {
                        if let Err((err, nbuf)) = self.send(vdev_id, nbuf) {
                            warn!("reinject resubmission failed: {:?}", err);
                            drop(nbuf);
                        }
                    }
                    Some(nbuf) => drop(nbuf),
                    None => {}
                }
            }
            Some(FwTxStatus::Inspect) => {
                // SAFETY: As above.
                let body = unsafe { slot.body() };
                let mut nbuf = body.netbuf.take();
                if let Some(nbuf) = &mut nbuf {
                    nbuf.dma_unmap();
                }
                self.release_desc(pool, offset, true);
                if let Some(nbuf) = nbuf {
                    self.nonstd_cb.lock(|cb| match cb.borrow().as_ref() {
                        Some(cb) => cb(nbuf, TxStatus::Ok),
                        None => drop(nbuf),
                    });
                }
            }
            _ => {
                self.release_desc(pool, offset, false);
            }
        }
    }

    /// Download-done signal from the transport, the first half of the
    /// dual-signal release.
    ///
    /// On failure the frame never reached the target: its credit comes
    /// back, the transmit completion will never arrive and the descriptor
    /// is torn down immediately regardless of the reference count.
    pub fn download_done(&self, desc_id: u32, succeeded: bool) {
        let (pool, offset) = self.desc_from_id(desc_id);
        let slot = pool.slot(offset);
        if !self.completion_is_live(pool, offset) {
            return;
        }
        // Read-only peek at the kind, the body is not modified until the
        // last reference drops.
        // SAFETY: The kind field is written before the frame is queued and
        // never changes afterwards.
        let kind = unsafe { slot.body() }.kind;
        if let FrameKind::Mgmt(mgmt_type) = kind {
            self.mgmt_cbs.lock(|table| {
                if let Some(cb) = &table.borrow()[mgmt_type as usize].download_cb {
                    cb(!succeeded);
                }
            });
        }
        if !succeeded {
            warn!("download failed for desc {:#x}", desc_id);
            slot.record_status(TxStatus::DownloadFail);
            self.credit.restore(1);
            slot.ref_clear();
            self.release_desc(pool, offset, false);
            self.unpause_sweep();
            return;
        }
        if slot.ref_dec_and_test() {
            self.release_desc(pool, offset, false);
            self.unpause_sweep();
        }
    }

    /// Batched transmit-done message from the target, the second half of
    /// the dual-signal release for every named descriptor.
    pub fn completion_handler(&self, status: TxStatus, desc_ids: &[u32]) {
        self.complete_batch(status, desc_ids, false);
    }

    /// Target returned these frames for host inspection. They complete
    /// exactly like acknowledged frames, which keeps this path and
    /// [`Self::completion_handler`] interchangeable from the descriptor's
    /// point of view.
    pub fn inspect_handler(&self, desc_ids: &[u32]) {
        self.complete_batch(TxStatus::Ok, desc_ids, true);
    }

    fn complete_batch(&self, status: TxStatus, desc_ids: &[u32], inspect: bool) {
        if desc_ids.is_empty() {
            return;
        }
        self.soc_stats.msg_batches.inc();
        let now = (self.cfg.ticks)();
        let mut reaped: Vec<Option<Reaped>> = alloc::vec![None; self.pools.len()];
        #[cfg(feature = "tx-delay")]
        let mut samples: Vec<DelaySample> = Vec::new();
        let mut credit_reclaimed = 0u16;

        for &raw_id in desc_ids {
            let (pool, offset) = self.desc_from_id(raw_id);
            if !self.completion_is_live(pool, offset) {
                continue;
            }
            let slot = pool.slot(offset);
            slot.record_status(status);
            credit_reclaimed += 1;
            if !slot.ref_dec_and_test() {
                continue;
            }
            let sample = self.msdu_release(pool, offset, inspect);
            #[cfg(feature = "tx-delay")]
            samples.push(sample);
            #[cfg(not(feature = "tx-delay"))]
            let _ = sample;

            let pool_idx = pool.pool_id() as usize;
            match &mut reaped[pool_idx] {
                Some(chain) => {
                    // SAFETY: Chained slots are owned by this batch until
                    // freed.
                    unsafe {
                        pool.slot(chain.tail).body().next = Some(offset);
                        pool.slot(offset).body().next = None;
                    }
                    chain.tail = offset;
                    chain.count += 1;
                }
                none => {
                    unsafe { pool.slot(offset).body().next = None };
                    *none = Some(Reaped {
                        head: offset,
                        tail: offset,
                        count: 1,
                    });
                }
            }
        }
        for (pool_idx, chain) in reaped.into_iter().enumerate() {
            if let Some(chain) = chain {
                self.pools[pool_idx].free_chain(chain.head, chain.tail, chain.count);
            }
        }
        if credit_reclaimed > 0 {
            self.credit.restore(credit_reclaimed);
        }
        #[cfg(feature = "tx-delay")]
        self.delay.compute(now, &samples);
        #[cfg(not(feature = "tx-delay"))]
        let _ = now;
        self.unpause_sweep();
    }

    /// Simplified single-frame completion for targets that complete one
    /// frame per message. Releases the descriptor through the same
    /// dual-signal reference count as the batched paths.
    pub fn single_completion_handler(&self, status: TxStatus, desc_id: u32) {
        let (pool, offset) = self.desc_from_id(desc_id);
        // The target gave up its copy whether or not the descriptor is
        // still held on the host side.
        self.credit.restore(1);
        if !self.completion_is_live(pool, offset) {
            return;
        }
        let slot = pool.slot(offset);
        slot.record_status(status);
        if slot.ref_dec_and_test() {
            self.release_desc(pool, offset, false);
            self.unpause_sweep();
        }
    }

    /// Signed credit correction pushed by the target.
    pub fn credit_update_handler(&self, delta: i32) {
        trace!("target credit update: {}", delta);
        self.credit.adjust(delta);
    }

    /// Force-completes everything still queued, for teardown after the
    /// device has been quiesced. Buffers are unmapped and freed, statuses
    /// read [`TxStatus::Discard`].
    pub fn discard_inflight(&self) {
        let mut discarded = 0u32;
        for pool in self.pools.iter() {
            for offset in 0..pool.size() {
                let slot = pool.slot(offset);
                if slot.has_flag(DESC_FLAG_ALLOCATED) && slot.has_flag(DESC_FLAG_QUEUED) {
                    slot.record_status(TxStatus::Discard);
                    slot.ref_clear();
                    self.release_desc(pool, offset, false);
                    discarded += 1;
                }
            }
        }
        if discarded > 0 {
            warn!("discarded {} in-flight tx frames", discarded);
        }
    }
}
