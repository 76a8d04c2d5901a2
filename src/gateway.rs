//! The request/response channel to the PX14400 kernel driver.
//!
//! Everything this library does with the hardware is expressed as a call on a [`Gateway`]. The
//! Linux implementation ([`DriverGateway`]) turns each call into one `ioctl` on the device node;
//! [`SimulatedGateway`] models the driver and board in-process.
//!
//! [`Gateway`]: trait.Gateway.html
//! [`DriverGateway`]: ../driver/struct.DriverGateway.html
//! [`SimulatedGateway`]: ../sim/struct.SimulatedGateway.html

use crate::addr::PlatformAddress;
use crate::eeprom::{EA_CHECKSUM, EEPROM_CHECKSUM_WORDS};
use crate::error::{Error, ErrorKind};
use crate::Result;
use bitflags::bitflags;
use log::{trace, warn};

/// Sentinel passed as the address of a "free" request to release every DMA buffer of a handle.
pub const FREE_ALL_SENTINEL: u32 = 0xFEEA_77BF;

/// Nature of the device behind a gateway.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeviceKind {
    /// A board attached to this machine.
    Local,
    /// A virtual board with no hardware behind it.
    ///
    /// Virtual boards accept every JTAG session, report a canned JTAG chain, skip hardware
    /// revision checks and never compare TDO data.
    Virtual,
    /// A board attached to another machine.
    Remote,
}

impl DeviceKind {
    /// Returns whether this is a virtual device.
    pub fn is_virtual(self) -> bool {
        self == DeviceKind::Virtual
    }

    /// Returns whether this is a remote device.
    pub fn is_remote(self) -> bool {
        self == DeviceKind::Remote
    }
}

bitflags! {
    /// Lines of the bit-banged JTAG interface.
    pub struct JtagLines: u32 {
        /// Hands JTAG control to the host (instead of the on-board configuration logic).
        const CTRL = 0x01;
        const TDI = 0x02;
        const TMS = 0x04;
        const TCK = 0x08;
        const TDO = 0x10;
    }
}

impl JtagLines {
    /// Creates a `JtagLines` from a raw value read back from the driver, logging any unknown
    /// bits.
    pub(crate) fn from_bits_warn(raw: u32) -> Self {
        let lines = Self::from_bits_truncate(raw);
        if lines.bits() != raw {
            warn!(
                "unknown JTAG line bits in driver response: {:#010x} (known: {:?})",
                raw, lines
            );
        }
        lines
    }
}

bitflags! {
    /// Control flags of a JTAG I/O request.
    pub struct JtagIoFlags: u32 {
        /// Pulse TCK after setting the lines.
        const PULSE_TCK = 0x01;
        /// Read the lines back after the write (and pulse).
        const POST_READ = 0x02;
        /// Pulse TCK `value` times instead of writing the lines.
        const PULSE_TCK_LOOP = 0x04;
        /// Claim exclusive ownership of the JTAG interface.
        const START_SESSION = 0x8000_0000;
        /// Release ownership of the JTAG interface.
        const END_SESSION = 0x4000_0000;
    }
}

bitflags! {
    /// Direction flags of a bulk JTAG shift.
    pub struct StreamFlags: u32 {
        /// Shift the buffer contents out on TDI (TDI is held low otherwise).
        const WRITE_TDI = 0x01;
        /// Capture TDO into the buffer.
        const READ_TDO = 0x02;
        /// Raise TMS on the last bit to leave the Shift state.
        const EXIT_SHIFT = 0x04;
    }
}

/// One JTAG I/O request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct JtagIo {
    /// Line values to drive (or the pulse count with `PULSE_TCK_LOOP`).
    pub value: u32,
    /// Lines affected by `value`.
    pub mask: u32,
    pub flags: JtagIoFlags,
}

/// Operation of a boot buffer control request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum BootBufOp {
    CheckOut = 0,
    CheckIn = 1,
    Query = 2,
    Realloc = 3,
}

/// A boot buffer control request, updated in place with the driver's answer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BootBufRequest {
    pub op: BootBufOp,
    /// Boot buffer index (checkout and query).
    pub index: u16,
    /// Buffer size in samples (output of checkout and query).
    pub samples: u32,
    /// Process address of the buffer (output of checkout and query, input of checkin).
    pub addr: u64,
}

impl BootBufRequest {
    pub fn new(op: BootBufOp) -> Self {
        Self {
            op,
            index: 0,
            samples: 0,
            addr: 0,
        }
    }
}

/// Synchronous request channel to a PX14400 driver instance.
///
/// One value corresponds to one open device handle. All methods block until the driver
/// responds.
pub trait Gateway {
    /// Returns the nature of the device.
    fn kind(&self) -> DeviceKind {
        DeviceKind::Local
    }

    /// Allocates a physically contiguous DMA buffer of `bytes` bytes.
    ///
    /// Returns the driver's address for the buffer, which still has to be passed through
    /// [`dma_map`] to obtain a process address.
    ///
    /// [`dma_map`]: #method.dma_map
    fn dma_alloc(&self, bytes: u32) -> Result<u64>;

    /// Maps a freshly allocated buffer into the process.
    ///
    /// The default implementation is for platforms where the driver already returns a process
    /// address.
    fn dma_map(&self, driver_addr: u64, bytes: u32) -> Result<PlatformAddress> {
        let _ = bytes;
        PlatformAddress::from_driver(driver_addr)?.ok_or_else(|| {
            Error::new(ErrorKind::Generic, "driver returned a null buffer address")
        })
    }

    /// Frees a DMA buffer given its process address (or its driver address, if mapping it
    /// failed).
    fn dma_free(&self, addr: u64) -> Result<()>;

    /// Frees every DMA buffer allocated through this handle.
    fn dma_free_all(&self) -> Result<()>;

    /// Performs a boot buffer control request.
    fn bootbuf_ctrl(&self, req: &mut BootBufRequest) -> Result<()>;

    /// Performs a JTAG I/O request, returning the lines read back.
    fn jtag_io(&self, io: JtagIo) -> Result<u32>;

    /// Shifts `bits` bits through the JTAG chain in one request.
    ///
    /// `data` holds at least `ceil(bits / 8)` bytes, LSB of byte 0 first. With
    /// `StreamFlags::READ_TDO` it is overwritten with the captured TDO bits.
    fn jtag_stream(&self, flags: StreamFlags, bits: u32, data: &mut [u8]) -> Result<()>;

    /// Reads a 16-bit word from the configuration EEPROM.
    fn eeprom_read(&self, addr: u16) -> Result<u16>;

    /// Writes a 16-bit word to the configuration EEPROM.
    fn eeprom_write(&self, addr: u16, value: u16) -> Result<()>;

    /// Recomputes the EEPROM checksum word after EEPROM contents have been changed.
    fn reset_eeprom_checksum(&self) -> Result<()> {
        if self.kind().is_virtual() {
            return Ok(());
        }

        let mut sum = 0u16;
        for addr in 0..EEPROM_CHECKSUM_WORDS {
            sum = sum.wrapping_add(self.eeprom_read(addr)?);
        }
        trace!("EEPROM checksum: {:#06x}", sum);
        self.eeprom_write(EA_CHECKSUM, sum)
    }

    /// Busy-waits for `us` microseconds in the driver.
    fn delay_us(&self, us: u32) -> Result<()>;
}

/// Number of bytes needed to hold `bits` bits.
pub(crate) fn stream_bytes(bits: u32) -> usize {
    (bits / 8 + (bits % 8 != 0) as u32) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_bytes_rounds_up() {
        assert_eq!(stream_bytes(0), 0);
        assert_eq!(stream_bytes(1), 1);
        assert_eq!(stream_bytes(8), 1);
        assert_eq!(stream_bytes(9), 2);
        assert_eq!(stream_bytes(u32::MAX), 536_870_912);
        assert_eq!(stream_bytes(u32::MAX - 7), 536_870_912);
    }
}
