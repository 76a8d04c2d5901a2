//! User-space access to PX14400 PCIe digitizers.
//!
//! This crate talks to the PX14400 kernel driver and implements the parts of board management
//! that live in user space:
//!
//! * DMA buffers: single buffers, two per-handle utility buffers, and *chains* of buffers that
//!   together cover transfers larger than the driver can allocate in one piece.
//! * Boot buffers: large buffers the driver allocates at load time, sized from EEPROM settings,
//!   that processes check out and in.
//! * Firmware upload over the board's JTAG chain, including chain discovery, firmware package
//!   (`.px14fw`) handling, XSVF playback and the EEPROM bookkeeping that records what firmware is
//!   installed.
//!
//! Everything goes through a [`Gateway`]: [`DriverGateway`] for real boards on Linux, and
//! [`SimulatedGateway`] for an in-process board model.
//!
//! ```no_run
//! # #[cfg(target_os = "linux")]
//! # fn main() -> px14400::Result<()> {
//! use px14400::{ChainFlags, DeviceSession, DriverGateway};
//!
//! let mut session = DeviceSession::new(DriverGateway::open_index(0)?);
//! let chain = session.allocate_chain(3_000_000, ChainFlags::empty())?;
//! for buf in chain.iter() {
//!     println!("{:?}: {} samples", buf.addr(), buf.samples());
//! }
//! session.free_chain(chain)?;
//! # Ok(())
//! # }
//! # #[cfg(not(target_os = "linux"))]
//! # fn main() {}
//! ```
//!
//! # Result codes
//!
//! Every failure carries an [`ErrorKind`] that maps to one of the signed status codes known from
//! the vendor tools; see [`ErrorKind::code`] and [`status_code`].
//!
//! [`Gateway`]: gateway/trait.Gateway.html
//! [`DriverGateway`]: driver/struct.DriverGateway.html
//! [`SimulatedGateway`]: sim/struct.SimulatedGateway.html
//! [`ErrorKind`]: enum.ErrorKind.html
//! [`ErrorKind::code`]: enum.ErrorKind.html#method.code
//! [`status_code`]: fn.status_code.html

#![doc(html_root_url = "https://docs.rs/px14400/0.1.0")]
// Deny a few warnings in doctests, since rustdoc `allow`s many warnings by default
#![doc(test(attr(deny(unused_imports, unused_must_use))))]
#![warn(missing_debug_implementations, rust_2018_idioms)]

pub mod addr;
mod bootbuf;
mod chain;
mod dma;
#[cfg(target_os = "linux")]
pub mod driver;
pub mod eeprom;
mod error;
pub mod fwctx;
pub mod gateway;
mod jtag;
mod package;
pub mod patch;
mod readme;
pub mod sim;
pub mod topology;
mod upload;
pub mod version;
pub mod xsvf;

pub use self::addr::{AddressWidth, PlatformAddress};
pub use self::bootbuf::{BootBufStatus, BOOT_BUFFER_COUNT};
pub use self::chain::{
    ChainFlags, DmaBufferChain, CHAIN_MAGIC, MAX_CHAIN_BUFFER_SAMPLES, MIN_CHAIN_BUFFER_SAMPLES,
};
pub use self::dma::{DmaBuffer, UtilitySlot, SAMPLE_BYTES};
#[cfg(target_os = "linux")]
pub use self::driver::DriverGateway;
pub use self::error::{status_code, Error, ErrorKind};
pub use self::fwctx::{
    ContextFlags, CustomLogicProvider, FirmwareChunk, FirmwareChunkFlags, FirmwareContext,
    NotesSeverity,
};
pub use self::gateway::{DeviceKind, Gateway};
pub use self::jtag::JtagClaim;
pub use self::package::FirmwarePackage;
pub use self::sim::{SimBoard, SimulatedGateway};
pub use self::topology::JtagChainItem;
pub use self::upload::{
    extract_firmware_notes, query_firmware_version_info, FirmwareNotes, FirmwareVersionInfo,
    UploadFlags, UploadOutcome, UploadStatus,
};
pub use self::xsvf::{Progress, XsvfFlags};

use self::eeprom::{
    EA_BOARD_REV, EA_BOARD_REV_SUB, EA_CUSTOM_HW_ENUM, EA_HW_REV, EA_SAB_FPGA_TYPE,
    EA_SYS_FPGA_TYPE,
};
use log::{debug, trace, warn};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::path::PathBuf;

/// A result type with the error hardwired to [`Error`].
///
/// [`Error`]: struct.Error.html
pub type Result<T> = std::result::Result<T, Error>;

/// Board revision (product) as stored in EEPROM.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BoardRevision {
    Px14400,
    Px12500,
    Px14400D,
    Px14400D2,
    Unknown(u16),
}

impl BoardRevision {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0 => BoardRevision::Px14400,
            1 => BoardRevision::Px12500,
            2 => BoardRevision::Px14400D,
            3 => BoardRevision::Px14400D2,
            other => BoardRevision::Unknown(other),
        }
    }

    pub fn raw(self) -> u16 {
        match self {
            BoardRevision::Px14400 => 0,
            BoardRevision::Px12500 => 1,
            BoardRevision::Px14400D => 2,
            BoardRevision::Px14400D2 => 3,
            BoardRevision::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for BoardRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoardRevision::Px14400 => f.write_str("PX14400A"),
            BoardRevision::Px12500 => f.write_str("PX12500A"),
            BoardRevision::Px14400D => f.write_str("PX14400D"),
            BoardRevision::Px14400D2 => f.write_str("PX14400D2"),
            BoardRevision::Unknown(raw) => write!(f, "<Unknown revision:{}>", raw),
        }
    }
}

/// Board sub-revision (front end variant).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BoardSubRevision {
    /// Signal-acquisition board with its own FPGA.
    Sp,
    /// Direct-record variant without a signal-acquisition FPGA.
    Dr,
    Unknown(u16),
}

impl BoardSubRevision {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0 => BoardSubRevision::Sp,
            1 => BoardSubRevision::Dr,
            other => BoardSubRevision::Unknown(other),
        }
    }
}

/// System FPGA part.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SysFpga {
    V5Lx50t,
    Unknown(u16),
}

impl SysFpga {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0 => SysFpga::V5Lx50t,
            other => SysFpga::Unknown(other),
        }
    }
}

/// Signal-acquisition board FPGA part.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SabFpga {
    V5Sx50t,
    V5Sx95t,
    Unknown(u16),
}

impl SabFpga {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0 => SabFpga::V5Sx50t,
            1 => SabFpga::V5Sx95t,
            other => SabFpga::Unknown(other),
        }
    }
}

/// Hardware configuration read from EEPROM.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HardwareConfig {
    pub board_rev: BoardRevision,
    pub board_rev_sub: BoardSubRevision,
    pub sys_fpga: SysFpga,
    pub sab_fpga: SabFpga,
    /// Custom hardware enumeration (0 for standard hardware).
    pub custom_hw: u16,
    /// Raw hardware revision word.
    pub hw_rev_raw: u16,
}

impl HardwareConfig {
    /// Returns the hardware revision as a 64-bit packed version.
    ///
    /// The EEPROM word holds the major revision in its upper byte and the minor revision in its
    /// lower byte.
    pub fn hardware_revision(&self) -> u64 {
        (u64::from(self.hw_rev_raw & 0xFF) << 32) | (u64::from(self.hw_rev_raw >> 8) << 48)
    }
}

/// Settings of a [`DeviceSession`].
///
/// [`DeviceSession`]: struct.DeviceSession.html
#[derive(Debug, Clone)]
pub struct SessionConfig {
    software_release: u64,
    xsvf_flags: XsvfFlags,
    temp_dir: Option<PathBuf>,
}

impl SessionConfig {
    /// Sets the 64-bit packed software release version checked against firmware requirements.
    pub fn with_software_release(mut self, version: u64) -> Self {
        self.software_release = version;
        self
    }

    /// Sets the flags used when playing XSVF files.
    pub fn with_xsvf_flags(mut self, flags: XsvfFlags) -> Self {
        self.xsvf_flags = flags;
        self
    }

    /// Sets the directory firmware files are extracted into.
    ///
    /// By default, every upload uses a fresh temporary directory.
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    pub fn software_release(&self) -> u64 {
        self.software_release
    }

    pub fn xsvf_flags(&self) -> XsvfFlags {
        self.xsvf_flags
    }

    pub fn temp_dir(&self) -> Option<&PathBuf> {
        self.temp_dir.as_ref()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            software_release: version::ver64(2, 20, 46, 0),
            xsvf_flags: XsvfFlags::LOW_CLOCK_ON_WAIT,
            temp_dir: None,
        }
    }
}

/// An open PX14400 device handle and the state this library keeps for it.
///
/// Dropping the session frees its utility buffers and utility chain. Boot buffers checked out
/// through the session are returned by the driver when the underlying handle closes.
pub struct DeviceSession<G: Gateway> {
    gateway: G,
    config: SessionConfig,
    hw: Cell<Option<HardwareConfig>>,
    utility: [Option<DmaBuffer>; 2],
    utility_chain: Option<DmaBufferChain>,
    error_extra: RefCell<Option<String>>,
}

impl<G: Gateway> DeviceSession<G> {
    /// Creates a session with the default configuration.
    pub fn new(gateway: G) -> Self {
        Self::with_config(gateway, SessionConfig::default())
    }

    /// Creates a session with an explicit configuration.
    pub fn with_config(gateway: G, config: SessionConfig) -> Self {
        debug!("new session on {:?} device", gateway.kind());
        Self {
            gateway,
            config,
            hw: Cell::new(None),
            utility: [None, None],
            utility_chain: None,
            error_extra: RefCell::new(None),
        }
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Returns the nature of the device.
    pub fn kind(&self) -> DeviceKind {
        self.gateway.kind()
    }

    pub fn is_virtual(&self) -> bool {
        self.kind().is_virtual()
    }

    /// Returns the descriptive text attached to the most recent failure that had one.
    pub fn error_extra(&self) -> Option<String> {
        self.error_extra.borrow().clone()
    }

    pub(crate) fn set_error_extra(&self, text: impl Into<String>) {
        *self.error_extra.borrow_mut() = Some(text.into());
    }

    /// Creates an error whose text is also made available through [`error_extra`].
    ///
    /// [`error_extra`]: #method.error_extra
    pub(crate) fn fail_with_extra(&self, kind: ErrorKind, text: String) -> Error {
        debug!("{:?}: {}", kind, text);
        self.set_error_extra(text.clone());
        Error::new(kind, text)
    }

    /// Reads the hardware configuration.
    ///
    /// The configuration is read from EEPROM on first use and cached for the lifetime of the
    /// session. Call [`refresh_hardware_config`] after the hardware has been changed.
    ///
    /// [`refresh_hardware_config`]: #method.refresh_hardware_config
    pub fn hardware_config(&self) -> Result<HardwareConfig> {
        if let Some(hw) = self.hw.get() {
            return Ok(hw);
        }

        let hw = HardwareConfig {
            board_rev: BoardRevision::from_raw(self.read_eeprom(EA_BOARD_REV)?),
            board_rev_sub: BoardSubRevision::from_raw(self.read_eeprom(EA_BOARD_REV_SUB)?),
            sys_fpga: SysFpga::from_raw(self.read_eeprom(EA_SYS_FPGA_TYPE)?),
            sab_fpga: SabFpga::from_raw(self.read_eeprom(EA_SAB_FPGA_TYPE)?),
            custom_hw: self.read_eeprom(EA_CUSTOM_HW_ENUM)?,
            hw_rev_raw: self.read_eeprom(EA_HW_REV)?,
        };
        debug!("hardware config: {:?}", hw);
        if let BoardRevision::Unknown(raw) = hw.board_rev {
            warn!("unknown board revision {}", raw);
        }
        self.hw.set(Some(hw));
        Ok(hw)
    }

    /// Drops the cached hardware configuration.
    pub fn refresh_hardware_config(&self) {
        self.hw.set(None);
    }

    /// Returns the hardware revision as a 64-bit packed version.
    pub fn hardware_revision(&self) -> Result<u64> {
        Ok(self.hardware_config()?.hardware_revision())
    }

    /// Reads a word from the configuration EEPROM.
    pub fn read_eeprom(&self, addr: u16) -> Result<u16> {
        let value = self.gateway.eeprom_read(addr)?;
        trace!("EEPROM[{:#04x}] -> {:#06x}", addr, value);
        Ok(value)
    }

    /// Writes a word to the configuration EEPROM.
    ///
    /// The checksum is not updated; call [`reset_eeprom_checksum`] after the last write.
    ///
    /// [`reset_eeprom_checksum`]: #method.reset_eeprom_checksum
    pub fn write_eeprom(&self, addr: u16, value: u16) -> Result<()> {
        trace!("EEPROM[{:#04x}] <- {:#06x}", addr, value);
        self.gateway.eeprom_write(addr, value)
    }

    /// Recomputes the EEPROM checksum.
    pub fn reset_eeprom_checksum(&self) -> Result<()> {
        debug!("updating EEPROM checksum");
        self.gateway.reset_eeprom_checksum()
    }
}

impl<G: Gateway> Drop for DeviceSession<G> {
    fn drop(&mut self) {
        for slot in &[UtilitySlot::First, UtilitySlot::Second] {
            if let Err(e) = self.free_utility_buffer(*slot) {
                warn!("failed to free utility buffer {:?}: {}", slot, e);
            }
        }
        if let Err(e) = self.free_utility_chain() {
            warn!("failed to free utility chain: {}", e);
        }
    }
}

impl<G: Gateway + fmt::Debug> fmt::Debug for DeviceSession<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("gateway", &self.gateway)
            .field("hw", &self.hw.get())
            .field("utility", &self.utility)
            .field("utility_chain", &self.utility_chain)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn hardware_config_is_cached() {
        init_logger();
        let board = SimBoard::new();
        board.set_eeprom(EA_BOARD_REV, 2);
        board.set_eeprom(EA_HW_REV, 0x0201);
        let session = DeviceSession::new(board.open());

        let hw = session.hardware_config().unwrap();
        assert_eq!(hw.board_rev, BoardRevision::Px14400D);
        assert_eq!(hw.hardware_revision(), version::ver64(2, 1, 0, 0));

        // cached until refreshed
        board.set_eeprom(EA_BOARD_REV, 1);
        assert_eq!(
            session.hardware_config().unwrap().board_rev,
            BoardRevision::Px14400D
        );
        session.refresh_hardware_config();
        assert_eq!(
            session.hardware_config().unwrap().board_rev,
            BoardRevision::Px12500
        );
    }

    #[test]
    fn board_revision_names() {
        assert_eq!(BoardRevision::from_raw(0).to_string(), "PX14400A");
        assert_eq!(BoardRevision::from_raw(3).to_string(), "PX14400D2");
        assert_eq!(
            BoardRevision::from_raw(9).to_string(),
            "<Unknown revision:9>"
        );
    }
}
