//! # `wifi-dp-tx`
//! This is the host-side transmit data path for a WLAN SoC, covering
//! everything between a frame leaving the network stack and its buffer
//! being reclaimed after the device is done with it.
//! ## Data path overview
//! This chapter gives a short overview of how a frame moves through the
//! engine.
//!
//! ### Submission
//! Every frame is pinned to a software descriptor taken from a fixed-size
//! pool, its buffer is DMA mapped and a download credit is consumed.
//! The descriptor ID, buffer address and per-frame parameters are then
//! packed into a two-word entry on a transmit data ring. Rings are never
//! blocked on: access goes through a try-lock bracket and a busy ring
//! rejects the frame back to the caller, with the descriptor and credit
//! unwound. Which pool and ring a frame uses is decided by the configured
//! [RoutingPolicy].
//!
//! ### Completion
//! The device reports finished frames through completion rings, drained
//! with a budget by [TxEngine::drain_completions], and some targets
//! additionally deliver batched completion messages. A descriptor is
//! armed with two references at submission, one for the download-done
//! signal and one for the transmit completion, and the signals may arrive
//! in either order. Whichever context drops the last reference owns the
//! slot from that point: it unmaps the buffer, runs the completion
//! callbacks, and chains the slot onto a reaped list that is returned to
//! the pool in a single lock acquisition.
//!
//! ### Flow control
//! Descriptor pool occupancy drives per-device flow control callbacks
//! through low and high watermarks, and the target's download credit is
//! tracked so submission stops cleanly when the target cannot accept more
//! frames.
//!
//! ### Delay accounting
//! With the `tx-delay` feature enabled, released frames feed per-TID
//! queueing and transmit delay averages and a histogram, kept in a
//! ping-pong arrangement so readers always see a settled interval.

#![no_std]

extern crate alloc;

pub(crate) mod fmt;

mod comp;
mod config;
mod credit;
#[cfg(feature = "tx-delay")]
mod delay;
mod desc;
mod hal;
mod msdu;
mod ring;
mod stats;
mod tx;

#[cfg(feature = "tx-delay")]
pub use config::DelayConfig;
pub use config::{RoutingPolicy, TxConfig};
#[cfg(feature = "tx-delay")]
pub use delay::{DELAY_HIST_REPORT_BINS, NUM_DELAY_CATEGORIES};
pub use hal::*;
pub use msdu::{NetBuf, MAX_FRAGS};
pub use ring::{RingAccess, SoftRing};
pub use stats::{ByteCounter, Counter, SocTxStats, VdevTxStats};
pub use tx::*;

cfg_if::cfg_if! {
    if #[cfg(feature = "critical_section")] {
        type DefaultRawMutex = embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    } else {
        type DefaultRawMutex = embassy_sync::blocking_mutex::raw::NoopRawMutex;
    }
}
