//! Wire formats shared with the device: descriptor IDs, transmit ring
//! entries and completion ring entries.
//!
//! The device never sees host pointers to descriptor slots. Every frame
//! handed to the hardware carries a packed [`TxDescId`], and every
//! completion returns one. The packing is part of the device ABI, so the
//! field widths here must not change independently of it.

use bitfield_struct::bitfield;

/// Maximum number of descriptor pools addressable by a [`TxDescId`].
pub const MAX_DESC_POOLS: usize = 1 << 4;
/// Maximum number of slots per pool addressable by a [`TxDescId`].
pub const MAX_POOL_SIZE: usize = 1 << 16;

/// Packed software descriptor ID, as carried through the hardware.
///
/// The low 16 bits index the slot within its pool, the next four bits
/// select the pool. The device treats this as an opaque cookie.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct TxDescId {
    #[bits(16)]
    pub offset: u16,
    #[bits(4)]
    pub pool_id: u8,
    #[bits(12)]
    __: u16,
}

/// First word of a transmit ring entry: where the payload lives and which
/// software descriptor it belongs to.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct TxBufferInfo {
    #[bits(40)]
    pub buffer_addr: u64,
    /// Return buffer manager, selects the completion ring the device
    /// releases this entry to.
    #[bits(4)]
    pub return_ring: u8,
    #[bits(20)]
    pub desc_id: u32,
}

/// Second word of a transmit ring entry: per-frame transmit parameters.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct TxFrameInfo {
    #[bits(16)]
    pub data_len: u16,
    /// Bytes of headroom before the actual payload.
    #[bits(8)]
    pub packet_offset: u8,
    #[bits(2)]
    pub encap_type: u8,
    /// Set when `buffer_addr` points at a scatter list rather than payload.
    pub extension: bool,
    /// Route this frame to the firmware instead of transmitting directly.
    pub to_fw: bool,
    pub checksum_offload: bool,
    #[bits(4)]
    pub tid: u8,
    pub tid_valid: bool,
    pub mesh: bool,
    #[bits(16)]
    pub fw_metadata: u16,
    #[bits(13)]
    __: u16,
}

/// A transmit data ring entry, two 64 bit words.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HwTxDesc {
    pub buffer: TxBufferInfo,
    pub frame: TxFrameInfo,
}

/// A completion ring entry, one 64 bit word.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct CompletionInfo {
    #[bits(20)]
    pub desc_id: u32,
    /// Which block of the device released this descriptor, see
    /// [`ReleaseSource`].
    #[bits(3)]
    pub release_source: u8,
    /// Hardware release reason, only meaningful for
    /// [`ReleaseSource::Hw`]. See [`HwReleaseReason`].
    #[bits(4)]
    pub release_reason: u8,
    pub first_msdu: bool,
    pub last_msdu: bool,
    #[bits(3)]
    __: u8,
    /// Firmware status word, only meaningful for [`ReleaseSource::Fw`].
    /// The low bits carry a [`FwTxStatus`].
    #[bits(32)]
    pub fw_status: u32,
}

/// Device block that released a completed descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ReleaseSource {
    /// Released by the transmit queue manager after over-the-air handling.
    Hw = 0,
    /// Released by the firmware, usually for exception frames.
    Fw = 3,
}
impl ReleaseSource {
    pub const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Hw),
            3 => Some(Self::Fw),
            _ => None,
        }
    }
    pub const fn into_bits(self) -> u8 {
        self as u8
    }
}

/// Release reason reported by the hardware queue manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum HwReleaseReason {
    /// Frame was acknowledged by the peer.
    Acked = 0,
    /// Frame aged out of the hardware queue before transmission.
    Expired = 1,
    /// Frame was transmitted but never acknowledged.
    NoAck = 2,
    /// Frame was flushed from the queue by a remove command.
    Removed = 3,
}
impl HwReleaseReason {
    pub const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Acked),
            1 => Some(Self::Expired),
            2 => Some(Self::NoAck),
            3 => Some(Self::Removed),
            _ => None,
        }
    }
    pub const fn into_bits(self) -> u8 {
        self as u8
    }
}

/// Status carried in the firmware status word of a completion entry with
/// [`ReleaseSource::Fw`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum FwTxStatus {
    Ok = 0,
    Drop = 1,
    Ttl = 2,
    /// Firmware wants the frame resubmitted through the regular path.
    Reinject = 3,
    /// Firmware returned a frame previously submitted with the inspect
    /// bit, the host keeps ownership of the buffer.
    Inspect = 4,
}
impl FwTxStatus {
    pub const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Ok),
            1 => Some(Self::Drop),
            2 => Some(Self::Ttl),
            3 => Some(Self::Reinject),
            4 => Some(Self::Inspect),
            _ => None,
        }
    }
    pub const fn into_bits(self) -> u8 {
        self as u8
    }
}

/// Final disposition of a frame, recorded on its descriptor before release
/// and reported to completion callbacks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum TxStatus {
    #[default]
    Ok = 0,
    /// Dropped by the target without transmission.
    Discard = 1,
    /// Transmitted but not acknowledged.
    NoAck = 2,
    /// Aged out of a target-side queue.
    Ttl = 3,
    /// Dropped on the host before reaching the target.
    Drop = 4,
    /// The download to the target itself failed.
    DownloadFail = 5,
}
impl TxStatus {
    pub const fn from_bits(bits: u8) -> Self {
        match bits {
            0 => Self::Ok,
            1 => Self::Discard,
            2 => Self::NoAck,
            3 => Self::Ttl,
            5 => Self::DownloadFail,
            _ => Self::Drop,
        }
    }
    pub const fn into_bits(self) -> u8 {
        self as u8
    }
    /// Whether the frame made it over the air.
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl CompletionInfo {
    /// Map this completion entry to the [`TxStatus`] recorded on the
    /// descriptor. Entries with an unrecognized source or reason map to
    /// [`TxStatus::Drop`].
    pub fn tx_status(&self) -> TxStatus {
        match ReleaseSource::from_bits(self.release_source()) {
            Some(ReleaseSource::Hw) => {
                match HwReleaseReason::from_bits(self.release_reason()) {
                    Some(HwReleaseReason::Acked) => TxStatus::Ok,
                    Some(HwReleaseReason::Expired) => TxStatus::Ttl,
                    Some(HwReleaseReason::NoAck) => TxStatus::NoAck,
                    Some(HwReleaseReason::Removed) | None => TxStatus::Drop,
                }
            }
            Some(ReleaseSource::Fw) => match FwTxStatus::from_bits(self.fw_status() as u8) {
                Some(FwTxStatus::Ok) => TxStatus::Ok,
                Some(FwTxStatus::Ttl) => TxStatus::Ttl,
                _ => TxStatus::Drop,
            },
            None => TxStatus::Drop,
        }
    }
}

/// Frame encapsulation on the transmit buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum EncapType {
    #[default]
    Ethernet = 0,
    NativeWifi = 1,
    /// Pre-formed 802.11 frames, bypasses target-side encapsulation.
    Raw = 2,
}
impl EncapType {
    pub const fn into_bits(self) -> u8 {
        self as u8
    }
}

/// Default DSCP to TID mapping, applied when a virtual device carries no
/// custom map.
///
/// ```text
/// DSCP        TID     AC
/// 000xxx      0       best effort
/// 001xxx      1       background
/// 010xxx      1       background
/// 011xxx      0       best effort
/// 100xxx      5       video
/// 101xxx      5       video
/// 110xxx      6       voice
/// 111xxx      6       voice
/// ```
#[rustfmt::skip]
pub const DEFAULT_DSCP_TID_MAP: [u8; 64] = [
    0, 0, 0, 0, 0, 0, 0, 0,
    1, 1, 1, 1, 1, 1, 1, 1,
    1, 1, 1, 1, 1, 1, 1, 1,
    0, 0, 0, 0, 0, 0, 0, 0,
    5, 5, 5, 5, 5, 5, 5, 5,
    5, 5, 5, 5, 5, 5, 5, 5,
    6, 6, 6, 6, 6, 6, 6, 6,
    6, 6, 6, 6, 6, 6, 6, 6,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desc_id_packs_pool_and_offset() {
        let id = TxDescId::new().with_pool_id(3).with_offset(0x1234);
        assert_eq!(id.pool_id(), 3);
        assert_eq!(id.offset(), 0x1234);
        let raw: u32 = id.into();
        assert_eq!(TxDescId::from(raw), id);
    }

    #[test]
    fn completion_status_mapping() {
        let acked = CompletionInfo::new()
            .with_release_source(ReleaseSource::Hw.into_bits())
            .with_release_reason(HwReleaseReason::Acked.into_bits());
        assert_eq!(acked.tx_status(), TxStatus::Ok);

        let expired = acked.with_release_reason(HwReleaseReason::Expired.into_bits());
        assert_eq!(expired.tx_status(), TxStatus::Ttl);

        let fw_drop = CompletionInfo::new()
            .with_release_source(ReleaseSource::Fw.into_bits())
            .with_fw_status(FwTxStatus::Drop.into_bits() as u32);
        assert_eq!(fw_drop.tx_status(), TxStatus::Drop);
    }

    #[test]
    fn unknown_release_reason_is_a_drop() {
        let entry = CompletionInfo::new()
            .with_release_source(ReleaseSource::Hw.into_bits())
            .with_release_reason(0xf);
        assert_eq!(entry.tx_status(), TxStatus::Drop);
    }
}
