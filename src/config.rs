//! Static configuration of the transmit engine.

use crate::hal::{MAX_DESC_POOLS, MAX_POOL_SIZE};

/// How submissions are spread across descriptor pools and data rings.
#[derive(Clone, Copy)]
pub enum RoutingPolicy {
    /// Everything through pool 0 and ring 0.
    PerPdev,
    /// Pool and ring selected by virtual device ID.
    PerVdev,
    /// Pool and ring selected by the calling execution context. The
    /// function returns an arbitrary context index, reduced modulo the
    /// pool and ring counts.
    PerCpu(fn() -> usize),
}

/// Initial parameters of the per-category delay accounting.
#[cfg(feature = "tx-delay")]
#[derive(Clone, Copy)]
pub struct DelayConfig {
    /// Length of one averaging interval in ticks.
    pub avg_period_ticks: u32,
    /// Histogram bin width, applied as `delay * mult >> shift`.
    pub hist_bin_width_mult: u32,
    pub hist_bin_width_shift: u32,
}

#[cfg(feature = "tx-delay")]
impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            // 5 second intervals, 1ms bins, with microsecond ticks.
            avg_period_ticks: 5_000_000,
            hist_bin_width_mult: 1,
            hist_bin_width_shift: 10,
        }
    }
}

/// Configuration handed to [`TxEngine::new`](crate::TxEngine::new).
///
/// All sizing is fixed for the lifetime of the engine. The `ticks` source
/// is expected to be a monotonically increasing microsecond counter, wrap
/// around is handled.
#[derive(Clone, Copy)]
pub struct TxConfig {
    pub num_pools: usize,
    /// Descriptor slots per pool.
    pub pool_size: u16,
    /// Extension (scatter list) descriptors per pool.
    pub ext_pool_size: u16,
    pub num_data_rings: usize,
    /// Entries per transmit data ring.
    pub data_ring_size: usize,
    /// Entries per completion ring. One completion ring is created per
    /// data ring.
    pub comp_ring_size: usize,
    /// Initial target download credit.
    pub initial_credit: u16,
    /// Credit level below which the submission path starts reporting
    /// starvation.
    pub credit_lwm: u16,
    pub routing: RoutingPolicy,
    pub ticks: fn() -> u32,
    #[cfg(feature = "tx-delay")]
    pub delay: DelayConfig,
}

fn no_ticks() -> u32 {
    0
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            num_pools: 1,
            pool_size: 1024,
            ext_pool_size: 256,
            num_data_rings: 1,
            data_ring_size: 512,
            comp_ring_size: 512,
            initial_credit: 256,
            credit_lwm: 16,
            routing: RoutingPolicy::PerPdev,
            ticks: no_ticks,
            #[cfg(feature = "tx-delay")]
            delay: DelayConfig::default(),
        }
    }
}

impl TxConfig {
    /// Checks the sizing against the descriptor ID packing limits.
    pub(crate) fn validate(&self) -> bool {
        self.num_pools >= 1
            && self.num_pools <= MAX_DESC_POOLS
            && (self.pool_size as usize) < MAX_POOL_SIZE
            && self.pool_size > 0
            && self.num_data_rings >= 1
            && self.data_ring_size > 0
            && self.comp_ring_size > 0
    }
}
