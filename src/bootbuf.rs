//! Boot buffers.
//!
//! The driver allocates up to four large DMA buffers while it loads, when physically contiguous
//! memory is still plentiful. Their requested sizes live in EEPROM. A process checks a buffer
//! out to use it and checks it back in when done; the driver returns buffers checked out
//! through a handle when that handle is closed.

use crate::addr::PlatformAddress;
use crate::dma::{samples_to_bytes, DmaBuffer, SAMPLE_BYTES};
use crate::eeprom::EA_BOOTBUF_BASE;
use crate::error::{Error, ErrorKind};
use crate::gateway::{BootBufOp, BootBufRequest, Gateway};
use crate::{DeviceSession, Result};
use log::debug;

/// Number of boot buffers.
pub const BOOT_BUFFER_COUNT: usize = 4;

/// State of a boot buffer as reported by the driver.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BootBufStatus {
    /// Whether the buffer is currently checked out (by any handle).
    pub checked_out: bool,
    /// Size of the buffer in samples; 0 if the driver did not allocate it.
    pub samples: u32,
}

fn check_index(index: usize) -> Result<u16> {
    if index < BOOT_BUFFER_COUNT {
        Ok(index as u16)
    } else {
        Err(Error::new(
            ErrorKind::OutOfBounds,
            format!("boot buffer index {} out of range", index),
        ))
    }
}

fn config_addrs(index: u16) -> (u16, u16) {
    let low = EA_BOOTBUF_BASE + index * 2;
    (low, low + 1)
}

impl<G: Gateway> DeviceSession<G> {
    /// Checks out a boot buffer for exclusive use through this session.
    ///
    /// Fails with `BufferCheckedOut` if another handle has it, and with `BufferNotAllocated` if
    /// the driver did not allocate a buffer for `index`.
    pub fn check_out_boot_buffer(&mut self, index: usize) -> Result<DmaBuffer> {
        let mut req = BootBufRequest::new(BootBufOp::CheckOut);
        req.index = check_index(index)?;
        self.gateway.bootbuf_ctrl(&mut req)?;

        let addr = PlatformAddress::from_driver(req.addr)?.ok_or_else(|| {
            Error::new(
                ErrorKind::BufferNotAllocated,
                "driver returned a null boot buffer",
            )
        })?;
        debug!(
            "checked out boot buffer {}: {} samples at {:?}",
            index, req.samples, addr
        );
        Ok(DmaBuffer::new(addr, req.samples))
    }

    /// Checks a boot buffer back in.
    ///
    /// Fails with `Busy` while the buffer takes part in a DMA transfer; put the device into
    /// standby first.
    pub fn check_in_boot_buffer(&mut self, buffer: DmaBuffer) -> Result<()> {
        let mut req = BootBufRequest::new(BootBufOp::CheckIn);
        req.addr = buffer.addr().raw();
        self.gateway.bootbuf_ctrl(&mut req)?;
        debug!("checked in boot buffer at {:?}", buffer.addr());
        Ok(())
    }

    /// Queries the state of a boot buffer.
    pub fn query_boot_buffer(&self, index: usize) -> Result<BootBufStatus> {
        let mut req = BootBufRequest::new(BootBufOp::Query);
        req.index = check_index(index)?;
        self.gateway.bootbuf_ctrl(&mut req)?;
        Ok(BootBufStatus {
            checked_out: req.addr != 0,
            samples: req.samples,
        })
    }

    /// Makes the driver reallocate the boot buffers according to their configured sizes now,
    /// instead of at the next driver load.
    ///
    /// Fails with `Busy` while any boot buffer is checked out. If a buffer could not be sized as
    /// requested, `DmaBufAllocFail` is returned; query the buffers to learn what was allocated.
    pub fn realloc_boot_buffers(&mut self) -> Result<()> {
        debug!("reallocating boot buffers");
        let mut req = BootBufRequest::new(BootBufOp::Realloc);
        self.gateway.bootbuf_ctrl(&mut req)
    }

    /// Sets the requested size of a boot buffer, effective at the next reallocation.
    ///
    /// EEPROM words are only written if the stored size differs.
    pub fn set_boot_buffer_config(&mut self, index: usize, samples: u32) -> Result<()> {
        let index = check_index(index)?;
        let bytes = samples_to_bytes(samples)?;
        let (low_addr, high_addr) = config_addrs(index);

        let new_low = bytes as u16;
        let new_high = (bytes >> 16) as u16;
        let old_low = self.read_eeprom(low_addr)?;
        let old_high = self.read_eeprom(high_addr)?;

        let mut changed = false;
        if old_low != new_low {
            self.write_eeprom(low_addr, new_low)?;
            changed = true;
        }
        if old_high != new_high {
            self.write_eeprom(high_addr, new_high)?;
            changed = true;
        }

        if changed {
            debug!("boot buffer {} configured for {} samples", index, samples);
            self.reset_eeprom_checksum()?;
        }
        Ok(())
    }

    /// Returns the requested size of a boot buffer in samples.
    pub fn boot_buffer_config(&self, index: usize) -> Result<u32> {
        let (low_addr, high_addr) = config_addrs(check_index(index)?);
        let low = u32::from(self.read_eeprom(low_addr)?);
        let high = u32::from(self.read_eeprom(high_addr)?);
        Ok(((high << 16) | low) / SAMPLE_BYTES)
    }
}
