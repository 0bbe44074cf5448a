//! Network buffers handed to the transmit path.
//!
//! A [`NetBuf`] owns one or more payload segments. Linear frames have a
//! single segment, non-linear frames carry additional fragments which the
//! submission path describes to the device through a scatter list. The
//! buffer tracks its DMA mapping so the completion path can assert it is
//! torn down exactly once.

use alloc::vec::Vec;

use crate::tx::{TxError, TxResult};

/// Maximum fragments of a non-linear frame, bounded by the scatter list
/// layout.
pub const MAX_FRAGS: usize = 6;

pub struct NetBuf {
    segments: Vec<Vec<u8>>,
    dscp: Option<u8>,
    tid: Option<u8>,
    checksum_offload: bool,
    mapped: Option<u64>,
}

impl NetBuf {
    /// A linear frame with the given payload.
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            segments: alloc::vec![data],
            dscp: None,
            tid: None,
            checksum_offload: false,
            mapped: None,
        }
    }

    /// A non-linear frame. The first segment is the head, the rest are
    /// fragments.
    pub fn from_segments(segments: Vec<Vec<u8>>) -> TxResult<Self> {
        if segments.is_empty() || segments.len() > MAX_FRAGS {
            return Err(TxError::InvalidFrame);
        }
        Ok(Self {
            segments,
            dscp: None,
            tid: None,
            checksum_offload: false,
            mapped: None,
        })
    }

    pub fn set_dscp(&mut self, dscp: u8) {
        self.dscp = Some(dscp & 0x3f);
    }
    pub fn dscp(&self) -> Option<u8> {
        self.dscp
    }
    /// Overrides the TID classification for this frame.
    pub fn set_tid(&mut self, tid: u8) {
        self.tid = Some(tid & 0xf);
    }
    pub fn tid(&self) -> Option<u8> {
        self.tid
    }
    pub fn set_checksum_offload(&mut self, enable: bool) {
        self.checksum_offload = enable;
    }
    pub fn checksum_offload(&self) -> bool {
        self.checksum_offload
    }

    /// Total payload length across all segments.
    pub fn len(&self) -> usize {
        self.segments.iter().map(Vec::len).sum()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn is_nonlinear(&self) -> bool {
        self.segments.len() > 1
    }
    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }
    pub fn head(&self) -> &[u8] {
        &self.segments[0]
    }

    /// Bus address and length of each segment. Only valid while mapped.
    pub(crate) fn segment_addrs(&self) -> impl Iterator<Item = (u64, u16)> + '_ {
        self.segments
            .iter()
            .map(|seg| (seg.as_ptr() as u64, seg.len() as u16))
    }

    /// Maps the buffer for device access and returns the bus address of
    /// the head segment.
    pub(crate) fn dma_map(&mut self) -> TxResult<u64> {
        if self.mapped.is_some() {
            return Err(TxError::DmaMapping);
        }
        if self.is_empty() {
            return Err(TxError::InvalidFrame);
        }
        let addr = self.segments[0].as_ptr() as u64;
        self.mapped = Some(addr);
        Ok(addr)
    }

    /// Tears down the device mapping. Must be called exactly once before
    /// the buffer is freed or handed back to its owner.
    pub(crate) fn dma_unmap(&mut self) {
        debug_assert!(self.mapped.is_some());
        self.mapped = None;
    }

    pub(crate) fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }
}

// Payload bytes are not interesting in logs, summarize the shape instead.
impl core::fmt::Debug for NetBuf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NetBuf")
            .field("segments", &self.segments.len())
            .field("len", &self.len())
            .field("mapped", &self.mapped.is_some())
            .finish()
    }
}

impl Drop for NetBuf {
    fn drop(&mut self) {
        if self.mapped.is_some() {
            warn!("netbuf dropped while still DMA mapped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_unmap_cycle() {
        let mut nbuf = NetBuf::new(alloc::vec![0u8; 64]);
        assert!(!nbuf.is_mapped());
        let addr = nbuf.dma_map().unwrap();
        assert_ne!(addr, 0);
        assert!(nbuf.dma_map().is_err());
        nbuf.dma_unmap();
        assert!(!nbuf.is_mapped());
    }

    #[test]
    fn nonlinear_segments() {
        let nbuf =
            NetBuf::from_segments(alloc::vec![alloc::vec![0u8; 32], alloc::vec![0u8; 128]])
                .unwrap();
        assert!(nbuf.is_nonlinear());
        assert_eq!(nbuf.len(), 160);
        assert_eq!(nbuf.segment_addrs().count(), 2);
    }

    #[test]
    fn debug_summarizes_without_payload() {
        let nbuf = NetBuf::new(alloc::vec![0xabu8; 64]);
        let rendered = alloc::format!("{:?}", nbuf);
        assert!(rendered.contains("segments: 1"));
        assert!(rendered.contains("len: 64"));
        // 0xab payload bytes must not leak into the rendering.
        assert!(!rendered.contains("171"));
    }

    #[test]
    fn rejects_empty_and_oversized_chains() {
        assert!(NetBuf::from_segments(Vec::new()).is_err());
        let too_many = (0..=MAX_FRAGS).map(|_| alloc::vec![0u8; 8]).collect();
        assert!(NetBuf::from_segments(too_many).is_err());
    }
}
