//! Chains of DMA buffers covering one large transfer.

use crate::addr::PlatformAddress;
use crate::dma::DmaBuffer;
use crate::error::{Error, ErrorKind};
use crate::gateway::Gateway;
use crate::{DeviceSession, Result};
use bitflags::bitflags;
use log::{debug, warn};
use std::cmp;

/// Tag identifying a valid chain.
pub const CHAIN_MAGIC: u32 = 0x14DA_CA19;

/// Size (in samples) of the largest buffer requested for a chain.
pub const MAX_CHAIN_BUFFER_SAMPLES: u32 = 2 * 1024 * 1024;

/// Smallest buffer size (in samples) the chain builder falls back to.
///
/// This is also the smallest chain that can be requested.
pub const MIN_CHAIN_BUFFER_SAMPLES: u32 = 512 * 1024;

bitflags! {
    /// Options of [`DeviceSession::allocate_chain`].
    ///
    /// [`DeviceSession::allocate_chain`]: struct.DeviceSession.html#method.allocate_chain
    pub struct ChainFlags: u32 {
        /// Return a partial chain instead of failing if not all samples could be allocated.
        const LESS_IS_OKAY = 0x0000_0001;
    }
}

/// An ordered set of DMA buffers allocated together.
///
/// Buffers are in allocation order; their sizes never increase along the chain. A chain is
/// freed as a whole with [`DeviceSession::free_chain`]. Chains cannot be cloned, so every
/// chain is freed exactly once.
///
/// [`DeviceSession::free_chain`]: struct.DeviceSession.html#method.free_chain
#[derive(Debug, PartialEq, Eq, Default)]
pub struct DmaBufferChain {
    magic: u32,
    count: usize,
    buffers: Vec<DmaBuffer>,
    total_samples: u64,
}

impl DmaBufferChain {
    fn from_buffers(buffers: Vec<DmaBuffer>) -> Self {
        let total_samples = buffers.iter().map(|b| u64::from(b.samples())).sum();
        Self {
            magic: CHAIN_MAGIC,
            count: buffers.len(),
            buffers,
            total_samples,
        }
    }

    /// Returns the number of buffers in the chain.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Returns the total number of samples across all buffers.
    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    pub fn buffers(&self) -> &[DmaBuffer] {
        &self.buffers
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DmaBuffer> {
        self.buffers.iter()
    }

    /// Returns the chain's leading descriptor: the identity tag and the buffer count.
    pub fn header(&self) -> (u32, usize) {
        (self.magic, self.count)
    }

    /// Returns the chain's trailing descriptor: an always-null buffer address and the total
    /// sample count.
    pub fn trailer(&self) -> (Option<PlatformAddress>, u64) {
        (None, self.total_samples)
    }

    fn is_valid(&self) -> bool {
        self.magic == CHAIN_MAGIC && self.count == self.buffers.len()
    }
}

impl<'a> IntoIterator for &'a DmaBufferChain {
    type Item = &'a DmaBuffer;
    type IntoIter = std::slice::Iter<'a, DmaBuffer>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<G: Gateway> DeviceSession<G> {
    /// Allocates a chain of DMA buffers covering `total_samples` samples.
    ///
    /// Buffers of [`MAX_CHAIN_BUFFER_SAMPLES`] are requested until less than that remains. When
    /// the driver cannot satisfy a request, the size is halved and the request repeated, down to
    /// [`MIN_CHAIN_BUFFER_SAMPLES`].
    ///
    /// If not all samples could be allocated, every buffer is released again and the error is
    /// returned, unless `ChainFlags::LESS_IS_OKAY` is passed, in which case the partial chain is
    /// returned and the caller has to check [`DmaBufferChain::total_samples`].
    ///
    /// [`MAX_CHAIN_BUFFER_SAMPLES`]: constant.MAX_CHAIN_BUFFER_SAMPLES.html
    /// [`MIN_CHAIN_BUFFER_SAMPLES`]: constant.MIN_CHAIN_BUFFER_SAMPLES.html
    /// [`DmaBufferChain::total_samples`]: struct.DmaBufferChain.html#method.total_samples
    pub fn allocate_chain(
        &mut self,
        total_samples: u64,
        flags: ChainFlags,
    ) -> Result<DmaBufferChain> {
        if total_samples < u64::from(MIN_CHAIN_BUFFER_SAMPLES) {
            return Err(Error::new(
                ErrorKind::InvalidArg,
                format!(
                    "chain of {} samples is below the minimum of {}",
                    total_samples, MIN_CHAIN_BUFFER_SAMPLES
                ),
            ));
        }

        let mut buffers = Vec::new();
        let mut candidate = MAX_CHAIN_BUFFER_SAMPLES;
        let mut remaining = total_samples;
        let mut failure = None;

        while remaining > 0 {
            let request = cmp::min(u64::from(candidate), remaining) as u32;
            match self.allocate_dma_buffer(request) {
                Ok(buffer) => {
                    if buffers.try_reserve(1).is_err() {
                        failure = Some(Error::new(
                            ErrorKind::OutOfMemory,
                            "cannot grow chain descriptor list",
                        ));
                        // Not tracked yet, release it with the rest.
                        if let Err(e) = self.free_dma_buffer(buffer) {
                            warn!("failed to free DMA buffer: {}", e);
                        }
                        break;
                    }
                    buffers.push(buffer);
                    remaining -= u64::from(request);
                }
                Err(e) if e.kind() == ErrorKind::DmaBufAllocFail => {
                    candidate = request / 2;
                    if candidate < MIN_CHAIN_BUFFER_SAMPLES {
                        debug!(
                            "chain allocation gave up with {} of {} samples left",
                            remaining, total_samples
                        );
                        failure = Some(e);
                        break;
                    }
                    debug!("retrying chain buffer with {} samples", candidate);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if remaining > 0 {
            let error = failure.unwrap_or_else(|| {
                Error::new(ErrorKind::DmaBufAllocFail, "chain allocation incomplete")
            });
            if !flags.contains(ChainFlags::LESS_IS_OKAY) || buffers.is_empty() {
                for buffer in buffers {
                    if let Err(e) = self.free_dma_buffer(buffer) {
                        warn!("failed to free DMA buffer while unwinding chain: {}", e);
                    }
                }
                return Err(error);
            }
        }

        let chain = DmaBufferChain::from_buffers(buffers);
        debug!(
            "allocated chain: {} buffers, {} samples",
            chain.len(),
            chain.total_samples()
        );
        Ok(chain)
    }

    /// Makes sure the session's utility chain covers at least `total_samples` samples.
    ///
    /// A cached chain that is large enough is returned unchanged. Otherwise it is freed and
    /// replaced by a chain allocated as by [`allocate_chain`] with the same `flags`. The chain
    /// stays owned by the session; release it with [`free_utility_chain`] or by dropping the
    /// session.
    ///
    /// [`allocate_chain`]: #method.allocate_chain
    /// [`free_utility_chain`]: #method.free_utility_chain
    pub fn ensure_utility_chain(
        &mut self,
        total_samples: u64,
        flags: ChainFlags,
    ) -> Result<&DmaBufferChain> {
        match &self.utility_chain {
            Some(cached) if cached.total_samples() >= total_samples => {
                debug!("reusing utility chain of {} samples", cached.total_samples());
            }
            Some(_) => {
                debug!("utility chain too small, replacing");
                self.free_utility_chain()?;
                self.utility_chain = Some(self.allocate_chain(total_samples, flags)?);
            }
            None => {
                self.utility_chain = Some(self.allocate_chain(total_samples, flags)?);
            }
        }

        self.utility_chain.as_ref().ok_or_else(|| {
            Error::new(ErrorKind::Generic, "utility chain missing after allocation")
        })
    }

    /// Frees the session's utility chain. Does nothing if none is cached.
    pub fn free_utility_chain(&mut self) -> Result<()> {
        match self.utility_chain.take() {
            Some(chain) => self.free_chain(chain),
            None => Ok(()),
        }
    }

    /// Frees a chain and all of its buffers.
    pub fn free_chain(&mut self, chain: DmaBufferChain) -> Result<()> {
        if !chain.is_valid() {
            return Err(Error::new(ErrorKind::InvalidArg, "not a DMA buffer chain"));
        }

        let mut result = Ok(());
        for buffer in chain.buffers {
            if let Err(e) = self.free_dma_buffer(buffer) {
                warn!("failed to free chain buffer {:?}: {}", buffer.addr(), e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Returns the session's utility chain, if one is cached.
    pub fn utility_chain(&self) -> Option<&DmaBufferChain> {
        self.utility_chain.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::SAMPLE_BYTES;
    use crate::sim::SimBoard;
    use crate::tests::init_logger;

    const MAX_BYTES: u32 = MAX_CHAIN_BUFFER_SAMPLES * SAMPLE_BYTES;

    #[test]
    fn three_million_samples() {
        init_logger();
        let board = SimBoard::new();
        let mut session = DeviceSession::new(board.open());

        let chain = session
            .allocate_chain(3_000_000, ChainFlags::empty())
            .unwrap();
        let sizes: Vec<u32> = chain.iter().map(|b| b.samples()).collect();
        assert_eq!(sizes, vec![2_097_152, 902_848]);
        assert_eq!(chain.trailer(), (None, 3_000_000));
        assert_eq!(chain.header(), (CHAIN_MAGIC, 2));
        assert_eq!(chain.iter().count(), chain.header().1);

        session.free_chain(chain).unwrap();
        assert_eq!(board.live_buffers(), 0);
    }

    #[test]
    fn totals_match_buffers() {
        let board = SimBoard::new();
        board.set_max_alloc_bytes(Some(MAX_BYTES / 2));
        let mut session = DeviceSession::new(board.open());

        let chain = session
            .allocate_chain(5_000_001, ChainFlags::empty())
            .unwrap();
        let sum: u64 = chain.iter().map(|b| u64::from(b.samples())).sum();
        assert_eq!(sum, chain.total_samples());
        assert_eq!(sum, 5_000_001);
        assert!(chain
            .buffers()
            .windows(2)
            .all(|w| w[0].samples() >= w[1].samples()));
        assert!(chain
            .iter()
            .all(|b| b.samples() <= MAX_CHAIN_BUFFER_SAMPLES / 2));
    }

    #[test]
    fn retry_halves_down_to_floor() {
        let board = SimBoard::new();
        board.fail_next_allocs(100);
        let mut session = DeviceSession::new(board.open());

        let err = session
            .allocate_chain(3_000_000, ChainFlags::empty())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DmaBufAllocFail);
        let samples: Vec<u32> = board
            .alloc_requests()
            .iter()
            .map(|b| b / SAMPLE_BYTES)
            .collect();
        assert_eq!(samples, vec![2_097_152, 1_048_576, 524_288]);
    }

    #[test]
    fn retry_recovers_at_smaller_size() {
        let board = SimBoard::new();
        board.fail_next_allocs(1);
        let mut session = DeviceSession::new(board.open());

        let chain = session
            .allocate_chain(2_097_152, ChainFlags::empty())
            .unwrap();
        let sizes: Vec<u32> = chain.iter().map(|b| b.samples()).collect();
        assert_eq!(sizes, vec![1_048_576, 1_048_576]);
    }

    #[test]
    fn partial_chain_is_released_without_less_is_okay() {
        let board = SimBoard::new();
        // room for one 2 MiS and one 1 MiS buffer
        board.set_memory_limit(Some(u64::from(MAX_BYTES) * 3 / 2));
        let mut session = DeviceSession::new(board.open());

        let err = session
            .allocate_chain(5_000_000, ChainFlags::empty())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DmaBufAllocFail);
        assert_eq!(board.live_buffers(), 0);
    }

    #[test]
    fn less_is_okay_returns_partial() {
        let board = SimBoard::new();
        board.set_memory_limit(Some(u64::from(MAX_BYTES) * 3 / 2));
        let mut session = DeviceSession::new(board.open());

        let chain = session
            .allocate_chain(5_000_000, ChainFlags::LESS_IS_OKAY)
            .unwrap();
        let sizes: Vec<u32> = chain.iter().map(|b| b.samples()).collect();
        assert_eq!(sizes, vec![2_097_152, 1_048_576]);
        assert_eq!(chain.total_samples(), 3_145_728);
        assert!(chain.total_samples() < 5_000_000);
        session.free_chain(chain).unwrap();

        // nothing at all is still an error
        board.set_memory_limit(Some(0));
        let err = session
            .allocate_chain(1_000_000, ChainFlags::LESS_IS_OKAY)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DmaBufAllocFail);
        assert_eq!(board.live_buffers(), 0);
    }

    #[test]
    fn utility_chain_is_reused_and_replaced() {
        let board = SimBoard::new();
        let mut session = DeviceSession::new(board.open());

        let a = session
            .ensure_utility_chain(1_000_000, ChainFlags::empty())
            .unwrap()
            .buffers()
            .to_vec();
        let b = session
            .ensure_utility_chain(600_000, ChainFlags::empty())
            .unwrap()
            .buffers()
            .to_vec();
        assert_eq!(a, b);
        assert_eq!(board.alloc_requests().len(), 1);

        let total = session
            .ensure_utility_chain(3_000_000, ChainFlags::empty())
            .unwrap()
            .total_samples();
        assert_eq!(total, 3_000_000);
        assert_eq!(session.utility_chain().map(|c| c.len()), Some(2));
        assert_eq!(board.live_buffers(), 2);

        session.free_utility_chain().unwrap();
        assert_eq!(session.utility_chain(), None);
        assert_eq!(board.live_buffers(), 0);
        session.free_utility_chain().unwrap();
    }

    #[test]
    fn utility_chain_is_freed_once() {
        let board = SimBoard::new();
        let mut session = DeviceSession::new(board.open());

        session
            .ensure_utility_chain(1_000_000, ChainFlags::empty())
            .unwrap();
        let own = session
            .allocate_chain(1_000_000, ChainFlags::empty())
            .unwrap();
        assert_eq!(board.live_buffers(), 2);

        // freeing an unrelated chain leaves the cached one alone
        session.free_chain(own).unwrap();
        assert_eq!(board.live_buffers(), 1);
        assert!(session.utility_chain().is_some());

        session.free_utility_chain().unwrap();
        assert_eq!(board.live_buffers(), 0);
        drop(session);
        assert_eq!(board.live_buffers(), 0);
    }

    #[test]
    fn invalid_chain_and_small_requests_rejected() {
        let board = SimBoard::new();
        let mut session = DeviceSession::new(board.open());

        let err = session.free_chain(DmaBufferChain::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArg);

        let err = session
            .allocate_chain(u64::from(MIN_CHAIN_BUFFER_SAMPLES) - 1, ChainFlags::empty())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArg);
    }

    #[test]
    fn utility_chain_freed_on_drop() {
        let board = SimBoard::new();
        let mut session = DeviceSession::new(board.open());
        session
            .ensure_utility_chain(3_000_000, ChainFlags::empty())
            .unwrap();
        assert_eq!(board.live_buffers(), 2);
        drop(session);
        assert_eq!(board.live_buffers(), 0);
    }
}
