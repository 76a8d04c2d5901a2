//! Single DMA buffers and the per-session utility buffers.

use crate::addr::PlatformAddress;
use crate::error::{Error, ErrorKind};
use crate::gateway::Gateway;
use crate::{DeviceSession, Result};
use log::{debug, warn};

/// Size of one sample in bytes.
pub const SAMPLE_BYTES: u32 = 2;

/// A physically contiguous buffer mapped into this process.
///
/// The address is only valid in the process that allocated the buffer, and only until the
/// buffer is freed through the session (or the session's handle is closed).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DmaBuffer {
    addr: PlatformAddress,
    samples: u32,
}

impl DmaBuffer {
    pub(crate) fn new(addr: PlatformAddress, samples: u32) -> Self {
        Self { addr, samples }
    }

    /// Returns the process address of the buffer.
    pub fn addr(&self) -> PlatformAddress {
        self.addr
    }

    /// Returns the size of the buffer in samples.
    pub fn samples(&self) -> u32 {
        self.samples
    }

    /// Returns the size of the buffer in bytes.
    pub fn bytes(&self) -> u64 {
        u64::from(self.samples) * u64::from(SAMPLE_BYTES)
    }
}

/// One of the two utility buffer slots of a session.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UtilitySlot {
    First,
    Second,
}

impl UtilitySlot {
    fn index(self) -> usize {
        match self {
            UtilitySlot::First => 0,
            UtilitySlot::Second => 1,
        }
    }
}

pub(crate) fn samples_to_bytes(samples: u32) -> Result<u32> {
    samples.checked_mul(SAMPLE_BYTES).ok_or_else(|| {
        Error::new(
            ErrorKind::InvalidArg,
            format!("{} samples exceed the addressable buffer size", samples),
        )
    })
}

impl<G: Gateway> DeviceSession<G> {
    /// Allocates a DMA buffer of `samples` samples.
    ///
    /// Fails with `DmaBufAllocFail` if the driver cannot provide the buffer, and with `Generic`
    /// if the buffer could be allocated but not mapped into the process (the allocation is
    /// released again in that case).
    pub fn allocate_dma_buffer(&mut self, samples: u32) -> Result<DmaBuffer> {
        if samples == 0 {
            return Err(Error::new(
                ErrorKind::InvalidArg,
                "cannot allocate an empty DMA buffer",
            ));
        }
        let bytes = samples_to_bytes(samples)?;

        let driver_addr = self.gateway.dma_alloc(bytes)?;
        let addr = match self.gateway.dma_map(driver_addr, bytes) {
            Ok(addr) => addr,
            Err(e) => {
                if let Err(free_err) = self.gateway.dma_free(driver_addr) {
                    warn!(
                        "failed to release unmapped DMA buffer {:#x}: {}",
                        driver_addr, free_err
                    );
                }
                return Err(e);
            }
        };

        debug!("allocated DMA buffer: {} samples at {:?}", samples, addr);
        Ok(DmaBuffer::new(addr, samples))
    }

    /// Frees a DMA buffer.
    ///
    /// Passing `None` does nothing.
    pub fn free_dma_buffer(&mut self, buffer: impl Into<Option<DmaBuffer>>) -> Result<()> {
        match buffer.into() {
            Some(buffer) => {
                debug!("freeing DMA buffer at {:?}", buffer.addr());
                self.gateway.dma_free(buffer.addr().raw())
            }
            None => Ok(()),
        }
    }

    /// Frees every DMA buffer allocated through this session's handle.
    ///
    /// This includes the utility buffers and the utility chain.
    pub fn free_all_dma_buffers(&mut self) -> Result<()> {
        debug!("freeing all DMA buffers");
        self.utility = [None, None];
        self.utility_chain = None;
        self.gateway.dma_free_all()
    }

    /// Makes sure a utility buffer of at least `samples` samples exists.
    ///
    /// An existing, large enough buffer is returned unchanged. Otherwise the old buffer (and its
    /// contents) is released and a new one allocated.
    pub fn ensure_utility_buffer(&mut self, slot: UtilitySlot, samples: u32) -> Result<DmaBuffer> {
        if let Some(buffer) = self.utility[slot.index()] {
            if buffer.samples() >= samples {
                return Ok(buffer);
            }
        }

        self.free_utility_buffer(slot)?;
        let buffer = self.allocate_dma_buffer(samples)?;
        self.utility[slot.index()] = Some(buffer);
        Ok(buffer)
    }

    /// Frees a utility buffer. Does nothing if the slot is empty.
    pub fn free_utility_buffer(&mut self, slot: UtilitySlot) -> Result<()> {
        let buffer = self.utility[slot.index()].take();
        self.free_dma_buffer(buffer)
    }

    /// Returns the current utility buffer of a slot.
    pub fn utility_buffer(&self, slot: UtilitySlot) -> Option<DmaBuffer> {
        self.utility[slot.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimBoard;
    use crate::tests::init_logger;

    #[test]
    fn zero_samples_rejected() {
        init_logger();
        let board = SimBoard::new();
        let mut session = DeviceSession::new(board.open());
        let err = session.allocate_dma_buffer(0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArg);
        assert!(board.alloc_requests().is_empty());
    }

    #[test]
    fn allocation_is_sized_in_bytes() {
        let board = SimBoard::new();
        let mut session = DeviceSession::new(board.open());
        let buf = session.allocate_dma_buffer(1000).unwrap();
        assert_eq!(buf.samples(), 1000);
        assert_eq!(board.alloc_requests(), vec![2000]);

        session.free_dma_buffer(buf).unwrap();
        assert_eq!(board.live_buffers(), 0);
        session.free_dma_buffer(None).unwrap();
    }

    #[test]
    fn mapping_failure_releases_allocation() {
        let board = SimBoard::new();
        board.set_map_fails(true);
        let mut session = DeviceSession::new(board.open());
        let err = session.allocate_dma_buffer(4096).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Generic);
        assert_eq!(board.live_buffers(), 0);

        board.set_map_fails(false);
        board.fail_next_allocs(1);
        let err = session.allocate_dma_buffer(4096).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DmaBufAllocFail);
    }

    #[test]
    fn utility_buffer_only_grows() {
        let board = SimBoard::new();
        let mut session = DeviceSession::new(board.open());
        assert_eq!(session.utility_buffer(UtilitySlot::First), None);

        let a = session
            .ensure_utility_buffer(UtilitySlot::First, 8192)
            .unwrap();
        let b = session
            .ensure_utility_buffer(UtilitySlot::First, 8192)
            .unwrap();
        let c = session
            .ensure_utility_buffer(UtilitySlot::First, 100)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(board.alloc_requests().len(), 1);

        let d = session
            .ensure_utility_buffer(UtilitySlot::First, 16384)
            .unwrap();
        assert_eq!(d.samples(), 16384);
        assert_eq!(board.live_buffers(), 1);

        session
            .ensure_utility_buffer(UtilitySlot::Second, 10)
            .unwrap();
        assert_eq!(board.live_buffers(), 2);

        session.free_utility_buffer(UtilitySlot::First).unwrap();
        assert_eq!(session.utility_buffer(UtilitySlot::First), None);
        assert_eq!(board.live_buffers(), 1);

        drop(session);
        assert_eq!(board.live_buffers(), 0);
    }
}
