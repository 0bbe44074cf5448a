//! Per-category transmit latency accounting.
//!
//! Released frames are sorted into categories (one per TID) and two
//! delays are accumulated per category: the queueing delay from hardware
//! enqueue to release, and the transmit delay between consecutive
//! completion events. Queueing delays additionally feed a histogram with
//! configurable bin width.
//!
//! Each category keeps two copies of its accumulators in a ping-pong
//! arrangement: one in progress, one completed. When the averaging
//! interval of a category elapses the copies swap roles, so readers always
//! see a full, settled interval while the current one accumulates.

use core::cell::RefCell;

use alloc::boxed::Box;
use embassy_sync::blocking_mutex::Mutex;

use crate::{comp::DelaySample, config::DelayConfig, tx::TxEngine, DefaultRawMutex};

/// Delay categories, one per TID.
pub const NUM_DELAY_CATEGORIES: usize = 8;
/// Fine-grained histogram bins kept internally.
pub const DELAY_HIST_INTERNAL_BINS: usize = 512;
/// Bins of the logarithmically folded histogram handed to readers.
pub const DELAY_HIST_REPORT_BINS: usize = 10;

#[derive(Clone, Copy)]
struct DelayData {
    queue_sum_ticks: u64,
    queue_num: u32,
    transmit_sum_ticks: u64,
    transmit_num: u32,
    hist_bins: [u16; DELAY_HIST_INTERNAL_BINS],
}

impl DelayData {
    const ZERO: Self = Self {
        queue_sum_ticks: 0,
        queue_num: 0,
        transmit_sum_ticks: 0,
        transmit_num: 0,
        hist_bins: [0; DELAY_HIST_INTERNAL_BINS],
    };
}

struct CategoryState {
    /// Which of the two copies currently accumulates.
    in_progress: usize,
    interval_start_ticks: u32,
    copies: [DelayData; 2],
}

struct DelayState {
    cats: [CategoryState; NUM_DELAY_CATEGORIES],
    /// Tick of the previous completion event, for the transmit delay.
    last_compl_ticks: u32,
    avg_period_ticks: u32,
    bin_mult: u32,
    bin_shift: u32,
    packet_count: [u64; NUM_DELAY_CATEGORIES],
    packet_loss: [u64; NUM_DELAY_CATEGORIES],
}

pub(crate) struct TxDelay {
    state: Mutex<DefaultRawMutex, RefCell<Box<DelayState>>>,
}

fn rounded_avg(sum: u64, num: u32) -> u32 {
    if num == 0 {
        return 0;
    }
    ((sum + (num as u64 >> 1)) / num as u64) as u32
}

impl TxDelay {
    pub(crate) fn new(cfg: DelayConfig) -> Self {
        Self {
            state: Mutex::new(RefCell::new(Box::new(DelayState {
                cats: core::array::from_fn(|_| CategoryState {
                    in_progress: 0,
                    interval_start_ticks: 0,
                    copies: [DelayData::ZERO; 2],
                }),
                last_compl_ticks: 0,
                avg_period_ticks: cfg.avg_period_ticks,
                bin_mult: cfg.hist_bin_width_mult,
                bin_shift: cfg.hist_bin_width_shift,
                packet_count: [0; NUM_DELAY_CATEGORIES],
                packet_loss: [0; NUM_DELAY_CATEGORIES],
            }))),
        }
    }

    /// Folds one batch of released frames into the accounting.
    pub(crate) fn compute(&self, now: u32, samples: &[DelaySample]) {
        if samples.is_empty() {
            return;
        }
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let transmit_delay = now.wrapping_sub(state.last_compl_ticks);
            state.last_compl_ticks = now;
            let avg_period = state.avg_period_ticks;
            let (mult, shift) = (state.bin_mult, state.bin_shift);
            for sample in samples {
                let cat = (sample.tid as usize) % NUM_DELAY_CATEGORIES;
                state.packet_count[cat] += 1;
                if !sample.ok {
                    state.packet_loss[cat] += 1;
                    continue;
                }
                let cat_state = &mut state.cats[cat];
                if now.wrapping_sub(cat_state.interval_start_ticks) >= avg_period {
                    // Interval elapsed, swap the ping-pong copies and
                    // start accumulating into a cleared one.
                    cat_state.in_progress = 1 - cat_state.in_progress;
                    cat_state.copies[cat_state.in_progress] = DelayData::ZERO;
                    cat_state.interval_start_ticks = now;
                }
                let data = &mut cat_state.copies[cat_state.in_progress];
                let queue_delay = now.wrapping_sub(sample.entry_ticks);
                data.queue_sum_ticks += queue_delay as u64;
                data.queue_num += 1;
                data.transmit_sum_ticks += transmit_delay as u64;
                data.transmit_num += 1;
                let bin = ((queue_delay as u64 * mult as u64) >> shift) as usize;
                let bin = bin.min(DELAY_HIST_INTERNAL_BINS - 1);
                data.hist_bins[bin] = data.hist_bins[bin].saturating_add(1);
            }
        });
    }

    /// Average queueing and transmit delay of the last settled interval,
    /// in ticks.
    pub(crate) fn averages(&self, category: usize) -> (u32, u32) {
        self.state.lock(|state| {
            let state = state.borrow();
            let cat_state = &state.cats[category];
            let data = &cat_state.copies[1 - cat_state.in_progress];
            (
                rounded_avg(data.queue_sum_ticks, data.queue_num),
                rounded_avg(data.transmit_sum_ticks, data.transmit_num),
            )
        })
    }

    /// Queueing delay histogram of the last settled interval, folded into
    /// logarithmically growing report bins. The last bin collects
    /// everything beyond the internal range.
    pub(crate) fn histogram(&self, category: usize) -> [u32; DELAY_HIST_REPORT_BINS] {
        self.state.lock(|state| {
            let state = state.borrow();
            let cat_state = &state.cats[category];
            let bins = &cat_state.copies[1 - cat_state.in_progress].hist_bins;
            let mut report = [0u32; DELAY_HIST_REPORT_BINS];
            let mut j = 0usize;
            for (i, out) in report.iter_mut().enumerate() {
                let end = if i + 1 == DELAY_HIST_REPORT_BINS {
                    DELAY_HIST_INTERNAL_BINS
                } else {
                    1 << i
                };
                let mut sum = 0u32;
                while j < end {
                    sum += bins[j] as u32;
                    j += 1;
                }
                *out = sum;
            }
            report
        })
    }

    /// Completed and lost frame counts of a category, since attach.
    pub(crate) fn packet_counts(&self, category: usize) -> (u64, u64) {
        self.state.lock(|state| {
            let state = state.borrow();
            (state.packet_count[category], state.packet_loss[category])
        })
    }

    pub(crate) fn set_avg_period(&self, ticks: u32) {
        self.state
            .lock(|state| state.borrow_mut().avg_period_ticks = ticks);
    }

    pub(crate) fn set_hist_bin_width(&self, mult: u32, shift: u32) {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            state.bin_mult = mult;
            state.bin_shift = shift;
        });
    }
}

impl TxEngine {
    /// Average (queueing, transmit) delay of the last settled interval of
    /// a category, in ticks.
    pub fn queue_delay(&self, category: usize) -> Option<(u32, u32)> {
        (category < NUM_DELAY_CATEGORIES).then(|| self.delay.averages(category))
    }

    /// Queueing delay histogram of the last settled interval of a
    /// category.
    pub fn delay_histogram(&self, category: usize) -> Option<[u32; DELAY_HIST_REPORT_BINS]> {
        (category < NUM_DELAY_CATEGORIES).then(|| self.delay.histogram(category))
    }

    /// (completed, lost) frame counts of a category since attach.
    pub fn delay_packet_counts(&self, category: usize) -> Option<(u64, u64)> {
        (category < NUM_DELAY_CATEGORIES).then(|| self.delay.packet_counts(category))
    }

    /// Reconfigures the averaging interval at runtime.
    pub fn set_delay_avg_period(&self, ticks: u32) {
        self.delay.set_avg_period(ticks);
    }

    /// Reconfigures the histogram bin width, applied as
    /// `delay * mult >> shift`.
    pub fn set_delay_hist_bin_width(&self, mult: u32, shift: u32) {
        self.delay.set_hist_bin_width(mult, shift);
    }
}
