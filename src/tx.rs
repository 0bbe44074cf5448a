//! Transmit engine and the frame submission paths.
//!
//! Submission runs entirely in the caller's context: classify the frame,
//! take a descriptor slot, map the buffer, consume a download credit and
//! push a two-word entry onto a transmit data ring inside a try-lock
//! access bracket. Any failure unwinds in reverse order, so a rejected
//! frame leaves no descriptor allocated and no credit consumed, and the
//! buffer is handed back to the caller.

use core::cell::RefCell;

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use embassy_sync::blocking_mutex::Mutex;
use portable_atomic::{AtomicBool, AtomicU32, Ordering};

use crate::{
    config::{RoutingPolicy, TxConfig},
    credit::CreditTracker,
    desc::{ExtDescPool, FrameKind, ScatterElem, TxDescPool, DESC_FLAG_QUEUED},
    hal::{
        EncapType, HwTxDesc, TxBufferInfo, TxDescId, TxFrameInfo, TxStatus, CompletionInfo,
        DEFAULT_DSCP_TID_MAP,
    },
    msdu::NetBuf,
    ring::SoftRing,
    stats::{SocTxStats, VdevTxStats},
    DefaultRawMutex,
};
#[cfg(feature = "tx-delay")]
use crate::delay::TxDelay;

/// Highest virtual device ID plus one.
pub const MAX_VDEVS: usize = 16;
/// Entries in the management completion callback table.
pub const MAX_MGMT_TYPES: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxError {
    InvalidConfig,
    InvalidVdev,
    InvalidFrame,
    InvalidMgmtType,
    /// Descriptor pool exhausted.
    NoDescriptors,
    /// Extension descriptor pool exhausted.
    NoExtDescriptors,
    /// Target download credit exhausted.
    NoCredit,
    /// Transmit ring had no space left.
    RingFull,
    /// Transmit ring lost the access try-lock race.
    RingBusy,
    DmaMapping,
}
pub type TxResult<T> = Result<T, TxError>;

/// Non-standard transmit parameters, see
/// [`TxEngine::send_nonstd`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxSpec {
    /// Frame is a pre-formed 802.11 frame, skip target encapsulation.
    pub raw: bool,
    /// The caller keeps ownership of the buffer. The frame is routed past
    /// the firmware and handed back through the non-standard completion
    /// callback once transmitted.
    pub no_free: bool,
}

/// Completion callbacks for one management frame type.
#[derive(Default)]
pub struct MgmtCallbacks {
    /// Invoked when the download phase finishes, with `true` on failure.
    pub download_cb: Option<Box<dyn Fn(bool) + Send + Sync>>,
    /// Invoked on final release with the frame and its over-the-air
    /// status.
    pub ota_cb: Option<Box<dyn Fn(NetBuf, TxStatus) + Send + Sync>>,
}

/// Flow control notification, `true` means transmit queues may resume.
pub type FlowControlFn = Box<dyn Fn(bool) + Send + Sync>;
/// Receives buffers of completed no-free frames together with their
/// status.
pub type NonStdCompletionFn = Box<dyn Fn(NetBuf, TxStatus) + Send + Sync>;

/// Configuration of one virtual device.
#[derive(Clone, Copy)]
pub struct VdevConfig {
    pub vdev_id: u8,
    pub encap: EncapType,
    /// Mesh forwarding frames, flagged to the target.
    pub mesh: bool,
    /// Custom DSCP to TID map, falls back to
    /// [`DEFAULT_DSCP_TID_MAP`] when unset.
    pub dscp_tid_map: Option<[u8; 64]>,
    /// Forces every frame of this device into one TID.
    pub tid_override: Option<u8>,
    /// Pool occupancy low watermark, at or below it the device is paused.
    pub fl_lwm: u16,
    /// Pool occupancy high watermark, above it a paused device resumes.
    pub fl_hwm: u16,
}

impl Default for VdevConfig {
    fn default() -> Self {
        Self {
            vdev_id: 0,
            encap: EncapType::Ethernet,
            mesh: false,
            dscp_tid_map: None,
            tid_override: None,
            fl_lwm: 8,
            fl_hwm: 32,
        }
    }
}

pub struct Vdev {
    pub(crate) cfg: VdevConfig,
    pub(crate) paused: AtomicBool,
    pub(crate) flow_cb: Mutex<DefaultRawMutex, RefCell<Option<FlowControlFn>>>,
    pub(crate) stats: VdevTxStats,
}

impl Vdev {
    pub fn config(&self) -> &VdevConfig {
        &self.cfg
    }
    pub fn stats(&self) -> &VdevTxStats {
        &self.stats
    }
    /// Whether flow control currently holds this device's queues.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub(crate) fn notify_flow(&self, resume: bool) {
        self.flow_cb.lock(|cb| {
            if let Some(cb) = cb.borrow().as_ref() {
                cb(resume);
            }
        });
    }
}

/// Pool and ring a frame is routed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TxQueue {
    pub pool: usize,
    pub ring: usize,
}

type VdevTable = [Option<Arc<Vdev>>; MAX_VDEVS];
type MgmtTable = [MgmtCallbacks; MAX_MGMT_TYPES];

/// The host-side transmit data path of one SoC.
///
/// Construction sizes every pool and ring up front, see [`TxConfig`].
/// Dropping the engine discards whatever is still in flight.
pub struct TxEngine {
    pub(crate) cfg: TxConfig,
    pub(crate) pools: Box<[TxDescPool]>,
    pub(crate) ext_pools: Box<[ExtDescPool]>,
    pub(crate) data_rings: Box<[SoftRing<HwTxDesc>]>,
    pub(crate) comp_rings: Box<[SoftRing<CompletionInfo>]>,
    pub(crate) credit: CreditTracker,
    pub(crate) vdevs: Mutex<DefaultRawMutex, RefCell<VdevTable>>,
    pub(crate) mgmt_cbs: Mutex<DefaultRawMutex, RefCell<MgmtTable>>,
    pub(crate) nonstd_cb: Mutex<DefaultRawMutex, RefCell<Option<NonStdCompletionFn>>>,
    /// Frames handed to the hardware and not yet released.
    pub(crate) num_tx_outstanding: AtomicU32,
    /// Subset of outstanding frames routed through the firmware.
    pub(crate) num_tx_exception: AtomicU32,
    pub(crate) soc_stats: SocTxStats,
    #[cfg(feature = "tx-delay")]
    pub(crate) delay: TxDelay,
}

impl TxEngine {
    pub fn new(cfg: TxConfig) -> TxResult<Self> {
        if !cfg.validate() {
            return Err(TxError::InvalidConfig);
        }
        let pools = (0..cfg.num_pools)
            .map(|id| TxDescPool::new(id as u8, cfg.pool_size))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let ext_pools = (0..cfg.num_pools)
            .map(|_| ExtDescPool::new(cfg.ext_pool_size))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let data_rings = (0..cfg.num_data_rings)
            .map(|_| SoftRing::new(cfg.data_ring_size))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let comp_rings = (0..cfg.num_data_rings)
            .map(|_| SoftRing::new(cfg.comp_ring_size))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        debug!(
            "tx engine up: {} pools of {} descs, {} rings",
            cfg.num_pools, cfg.pool_size, cfg.num_data_rings
        );
        Ok(Self {
            pools,
            ext_pools,
            data_rings,
            comp_rings,
            credit: CreditTracker::new(cfg.initial_credit, cfg.credit_lwm),
            vdevs: Mutex::new(RefCell::new(core::array::from_fn(|_| None))),
            mgmt_cbs: Mutex::new(RefCell::new(core::array::from_fn(|_| MgmtCallbacks::default()))),
            nonstd_cb: Mutex::new(RefCell::new(None)),
            num_tx_outstanding: AtomicU32::new(0),
            num_tx_exception: AtomicU32::new(0),
            soc_stats: SocTxStats::default(),
            #[cfg(feature = "tx-delay")]
            delay: TxDelay::new(cfg.delay),
            cfg,
        })
    }

    /// Registers a virtual device. Fails when the ID is out of range or
    /// already attached.
    pub fn vdev_attach(&self, cfg: VdevConfig) -> TxResult<Arc<Vdev>> {
        let vdev = Arc::new(Vdev {
            cfg,
            paused: AtomicBool::new(false),
            flow_cb: Mutex::new(RefCell::new(None)),
            stats: VdevTxStats::default(),
        });
        self.vdevs.lock(|vdevs| {
            let mut vdevs = vdevs.borrow_mut();
            let slot = vdevs
                .get_mut(cfg.vdev_id as usize)
                .ok_or(TxError::InvalidVdev)?;
            if slot.is_some() {
                return Err(TxError::InvalidVdev);
            }
            *slot = Some(Arc::clone(&vdev));
            Ok(vdev)
        })
    }

    /// Removes a virtual device. Frames still in flight complete normally,
    /// their per-device accounting is skipped.
    pub fn vdev_detach(&self, vdev_id: u8) -> TxResult<()> {
        self.vdevs.lock(|vdevs| {
            let mut vdevs = vdevs.borrow_mut();
            let slot = vdevs
                .get_mut(vdev_id as usize)
                .ok_or(TxError::InvalidVdev)?;
            slot.take().map(|_| ()).ok_or(TxError::InvalidVdev)
        })
    }

    pub fn vdev(&self, vdev_id: u8) -> TxResult<Arc<Vdev>> {
        self.vdevs.lock(|vdevs| {
            vdevs
                .borrow()
                .get(vdev_id as usize)
                .and_then(|slot| slot.as_ref().map(Arc::clone))
                .ok_or(TxError::InvalidVdev)
        })
    }

    /// Installs the flow control callback of a device.
    pub fn register_flow_control(&self, vdev_id: u8, cb: FlowControlFn) -> TxResult<()> {
        let vdev = self.vdev(vdev_id)?;
        vdev.flow_cb.lock(|slot| *slot.borrow_mut() = Some(cb));
        Ok(())
    }

    /// Installs the completion callbacks for one management frame type.
    pub fn register_mgmt_callbacks(&self, mgmt_type: u8, cbs: MgmtCallbacks) -> TxResult<()> {
        if mgmt_type as usize >= MAX_MGMT_TYPES {
            return Err(TxError::InvalidMgmtType);
        }
        self.mgmt_cbs
            .lock(|table| table.borrow_mut()[mgmt_type as usize] = cbs);
        Ok(())
    }

    /// Installs the completion callback receiving no-free buffers back.
    pub fn register_nonstd_completion(&self, cb: NonStdCompletionFn) {
        self.nonstd_cb.lock(|slot| *slot.borrow_mut() = Some(cb));
    }

    /// Sends one standard data frame. On rejection the frame comes back
    /// together with the reason, with all resources unwound.
    pub fn send(&self, vdev_id: u8, nbuf: NetBuf) -> Result<(), (TxError, NetBuf)> {
        let vdev = match self.vdev(vdev_id) {
            Ok(vdev) => vdev,
            Err(err) => return Err((err, nbuf)),
        };
        self.send_msdu_single(&vdev, nbuf, TxSpec::default(), None)
    }

    /// Sends a batch of data frames. Every rejected frame is returned;
    /// accepted ones proceed independently of the rejects.
    pub fn send_batch(&self, vdev_id: u8, frames: Vec<NetBuf>) -> Vec<NetBuf> {
        let vdev = match self.vdev(vdev_id) {
            Ok(vdev) => vdev,
            Err(_) => return frames,
        };
        let mut rejected = Vec::new();
        for nbuf in frames {
            if let Err((err, nbuf)) = self.send_msdu_single(&vdev, nbuf, TxSpec::default(), None)
            {
                trace!("batch frame rejected: {:?}", err);
                rejected.push(nbuf);
            }
        }
        rejected
    }

    /// Sends a frame with non-standard handling, see [`TxSpec`].
    pub fn send_nonstd(
        &self,
        vdev_id: u8,
        nbuf: NetBuf,
        spec: TxSpec,
    ) -> Result<(), (TxError, NetBuf)> {
        let vdev = match self.vdev(vdev_id) {
            Ok(vdev) => vdev,
            Err(err) => return Err((err, nbuf)),
        };
        self.send_msdu_single(&vdev, nbuf, spec, None)
    }

    /// Sends a management frame. Completion is reported through the
    /// callbacks registered for `mgmt_type`.
    pub fn send_mgmt(
        &self,
        vdev_id: u8,
        nbuf: NetBuf,
        mgmt_type: u8,
    ) -> Result<(), (TxError, NetBuf)> {
        if mgmt_type as usize >= MAX_MGMT_TYPES {
            return Err((TxError::InvalidMgmtType, nbuf));
        }
        let vdev = match self.vdev(vdev_id) {
            Ok(vdev) => vdev,
            Err(err) => return Err((err, nbuf)),
        };
        self.send_msdu_single(&vdev, nbuf, TxSpec::default(), Some(mgmt_type))
    }

    pub(crate) fn tx_get_queue(&self, vdev_id: u8) -> TxQueue {
        match self.cfg.routing {
            RoutingPolicy::PerPdev => TxQueue { pool: 0, ring: 0 },
            RoutingPolicy::PerVdev => TxQueue {
                pool: vdev_id as usize % self.pools.len(),
                ring: vdev_id as usize % self.data_rings.len(),
            },
            RoutingPolicy::PerCpu(ctx) => {
                let ctx = ctx();
                TxQueue {
                    pool: ctx % self.pools.len(),
                    ring: ctx % self.data_rings.len(),
                }
            }
        }
    }

    fn classify_tid(&self, vdev: &Vdev, nbuf: &NetBuf) -> u8 {
        if let Some(tid) = nbuf.tid() {
            return tid;
        }
        if let Some(tid) = vdev.cfg.tid_override {
            return tid;
        }
        let dscp = nbuf.dscp().unwrap_or(0) as usize & 0x3f;
        match &vdev.cfg.dscp_tid_map {
            Some(map) => map[dscp],
            None => DEFAULT_DSCP_TID_MAP[dscp],
        }
    }

    fn classify(nbuf: &NetBuf, spec: TxSpec, mgmt_type: Option<u8>) -> TxResult<FrameKind> {
        if let Some(mgmt_type) = mgmt_type {
            if nbuf.is_nonlinear() {
                return Err(TxError::InvalidFrame);
            }
            return Ok(FrameKind::Mgmt(mgmt_type));
        }
        if spec.no_free {
            if nbuf.is_nonlinear() {
                return Err(TxError::InvalidFrame);
            }
            return Ok(FrameKind::NoFree);
        }
        if nbuf.is_nonlinear() {
            return Ok(FrameKind::Sg);
        }
        if spec.raw {
            return Ok(FrameKind::Raw);
        }
        Ok(FrameKind::Std)
    }

    /// The single-frame submission path shared by all send variants.
    fn send_msdu_single(
        &self,
        vdev: &Arc<Vdev>,
        mut nbuf: NetBuf,
        spec: TxSpec,
        mgmt_type: Option<u8>,
    ) -> Result<(), (TxError, NetBuf)> {
        vdev.stats.rcvd_pkts.inc();
        vdev.stats.rcvd_bytes.add(nbuf.len() as u64);

        let kind = match Self::classify(&nbuf, spec, mgmt_type) {
            Ok(kind) => kind,
            Err(err) => return Err((err, nbuf)),
        };
        let queue = self.tx_get_queue(vdev.cfg.vdev_id);
        let pool = &self.pools[queue.pool];
        let tid = self.classify_tid(vdev, &nbuf);

        let Some(offset) = pool.alloc() else {
            vdev.stats.drop_no_desc.inc();
            self.pause_check(vdev, pool);
            return Err((TxError::NoDescriptors, nbuf));
        };
        let addr = match nbuf.dma_map() {
            Ok(addr) => addr,
            Err(err) => {
                pool.free(offset);
                vdev.stats.drop_dma_error.inc();
                return Err((err, nbuf));
            }
        };
        let ext_idx = if kind == FrameKind::Sg {
            let elems: Vec<ScatterElem> = nbuf
                .segment_addrs()
                .map(|(addr, len)| ScatterElem { addr, len })
                .collect();
            match self.ext_pools[queue.pool].alloc(&elems) {
                Some(idx) => Some(idx),
                None => {
                    nbuf.dma_unmap();
                    pool.free(offset);
                    return Err((TxError::NoExtDescriptors, nbuf));
                }
            }
        } else {
            None
        };
        if !self.credit.consume(1) {
            if let Some(idx) = ext_idx {
                self.ext_pools[queue.pool].free(idx);
            }
            nbuf.dma_unmap();
            pool.free(offset);
            vdev.stats.drop_no_credit.inc();
            if self.credit.below_lwm() {
                debug!("download credit exhausted, drain completions");
            }
            return Err((TxError::NoCredit, nbuf));
        }

        let desc_id = TxDescId::new()
            .with_pool_id(pool.pool_id())
            .with_offset(offset);
        let slot = pool.slot(offset);
        let to_fw = kind == FrameKind::NoFree || vdev.cfg.mesh;
        let data_len = nbuf.len().min(u16::MAX as usize) as u16;
        let checksum = nbuf.checksum_offload();
        let encap = if spec.raw { EncapType::Raw } else { vdev.cfg.encap };
        let now = (self.cfg.ticks)();
        {
            // SAFETY: The slot was just allocated and is not yet queued,
            // the submitting context owns the body.
            let body = unsafe { slot.body() };
            body.kind = kind;
            body.vdev_id = vdev.cfg.vdev_id;
            body.tid = tid;
            body.to_fw = to_fw;
            body.ext_idx = ext_idx;
            body.enqueue_ticks = now;
            body.next = None;
            body.netbuf = Some(nbuf);
        }
        slot.ref_init(2);

        if let Err(err) = self.hw_enqueue(
            queue,
            desc_id,
            addr,
            data_len,
            tid,
            encap,
            to_fw,
            checksum,
            vdev.cfg.mesh,
            ext_idx,
            mgmt_type,
        ) {
            // SAFETY: The enqueue failed, ownership of the body never left
            // this context.
            let mut nbuf = match unsafe { slot.body() }.netbuf.take() {
                Some(nbuf) => nbuf,
                None => unreachable!(),
            };
            nbuf.dma_unmap();
            if let Some(idx) = ext_idx {
                self.ext_pools[queue.pool].free(idx);
            }
            slot.ref_clear();
            pool.free(offset);
            self.credit.restore(1);
            match err {
                TxError::RingFull => vdev.stats.drop_ring_full.inc(),
                TxError::RingBusy => {
                    vdev.stats.drop_ring_busy.inc();
                    self.soc_stats.ring_busy.inc();
                }
                _ => {}
            }
            return Err((err, nbuf));
        }

        match kind {
            FrameKind::Raw => vdev.stats.raw_pkts.inc(),
            FrameKind::Sg => vdev.stats.sg_pkts.inc(),
            FrameKind::Mgmt(_) => vdev.stats.mgmt_pkts.inc(),
            _ => {}
        }
        vdev.stats.enqueued.inc();
        self.pause_check(vdev, pool);
        Ok(())
    }

    /// Fills one data ring entry inside an access bracket.
    #[allow(clippy::too_many_arguments)]
    fn hw_enqueue(
        &self,
        queue: TxQueue,
        desc_id: TxDescId,
        addr: u64,
        data_len: u16,
        tid: u8,
        encap: EncapType,
        to_fw: bool,
        checksum: bool,
        mesh: bool,
        ext_idx: Option<u16>,
        mgmt_type: Option<u8>,
    ) -> TxResult<()> {
        let ring = &self.data_rings[queue.ring];
        let mut access = ring.begin_access().ok_or(TxError::RingBusy)?;
        let entry = access.produce_next().ok_or(TxError::RingFull)?;

        // For scatter frames the device fetches the list through the
        // extension descriptor, the address field carries its index.
        let buffer_addr = match ext_idx {
            Some(idx) => idx as u64,
            None => addr & ((1 << 40) - 1),
        };
        entry.buffer = TxBufferInfo::new()
            .with_buffer_addr(buffer_addr)
            .with_return_ring(queue.ring as u8)
            .with_desc_id(u32::from(desc_id) & 0x000f_ffff);
        entry.frame = TxFrameInfo::new()
            .with_data_len(data_len)
            .with_packet_offset(0)
            .with_encap_type(encap.into_bits())
            .with_extension(ext_idx.is_some())
            .with_to_fw(to_fw)
            .with_checksum_offload(checksum)
            .with_tid(tid)
            .with_tid_valid(true)
            .with_mesh(mesh)
            .with_fw_metadata(mgmt_type.map(u16::from).unwrap_or(0));

        let pool = &self.pools[queue.pool];
        pool.slot(desc_id.offset()).set_flags(DESC_FLAG_QUEUED);
        self.num_tx_outstanding.fetch_add(1, Ordering::Release);
        if to_fw {
            self.num_tx_exception.fetch_add(1, Ordering::Release);
        }
        trace!(
            "enqueued desc {:#x} on ring {}, len {}",
            u32::from(desc_id),
            queue.ring,
            data_len
        );
        Ok(())
    }

    pub(crate) fn pause_check(&self, vdev: &Vdev, pool: &TxDescPool) {
        if pool.num_free() <= vdev.cfg.fl_lwm
            && !vdev.paused.swap(true, Ordering::AcqRel)
        {
            debug!("vdev {} paused, pool low", vdev.cfg.vdev_id);
            vdev.notify_flow(false);
        }
    }

    pub(crate) fn unpause_check(&self, vdev: &Vdev) {
        let queue = self.tx_get_queue(vdev.cfg.vdev_id);
        if vdev.paused.load(Ordering::Acquire)
            && self.pools[queue.pool].num_free() > vdev.cfg.fl_hwm
            && vdev.paused.swap(false, Ordering::AcqRel)
        {
            debug!("vdev {} resumed", vdev.cfg.vdev_id);
            vdev.notify_flow(true);
        }
    }

    /// Resumes every paused device whose pool has recovered. Run after
    /// completion processing returns descriptors.
    pub(crate) fn unpause_sweep(&self) {
        let vdevs: Vec<Arc<Vdev>> = self.vdevs.lock(|vdevs| {
            vdevs
                .borrow()
                .iter()
                .filter_map(|slot| slot.as_ref().map(Arc::clone))
                .collect()
        });
        for vdev in vdevs {
            self.unpause_check(&vdev);
        }
    }

    /// Device-side view of a transmit data ring.
    pub fn data_ring(&self, ring: usize) -> &SoftRing<HwTxDesc> {
        &self.data_rings[ring]
    }
    /// Device-side view of a completion ring.
    pub fn comp_ring(&self, ring: usize) -> &SoftRing<CompletionInfo> {
        &self.comp_rings[ring]
    }
    pub fn num_data_rings(&self) -> usize {
        self.data_rings.len()
    }
    pub fn num_free_desc(&self, pool: usize) -> u16 {
        self.pools[pool].num_free()
    }
    pub fn credit_available(&self) -> i32 {
        self.credit.available()
    }
    /// Frames handed to the hardware and not yet released.
    pub fn outstanding(&self) -> u32 {
        self.num_tx_outstanding.load(Ordering::Acquire)
    }
    /// Outstanding frames routed through the firmware.
    pub fn exceptions_outstanding(&self) -> u32 {
        self.num_tx_exception.load(Ordering::Acquire)
    }
    pub fn stats(&self) -> &SocTxStats {
        &self.soc_stats
    }
}

impl Drop for TxEngine {
    fn drop(&mut self) {
        self.discard_inflight();
    }
}
