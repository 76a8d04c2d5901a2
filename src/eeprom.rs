//! Configuration EEPROM layout.
//!
//! The EEPROM is an array of 16-bit words. Only the addresses used by this library are listed.

use bitflags::bitflags;
use log::warn;

/// First word of the boot buffer size table.
///
/// Each boot buffer uses two words holding the requested size in bytes: the low half at
/// `EA_BOOTBUF_BASE + 2 * index`, the high half in the following word.
pub const EA_BOOTBUF_BASE: u16 = 0x46;
/// Board sub-revision (SP/DR).
pub const EA_BOARD_REV_SUB: u16 = 0x4F;
/// Firmware info bits, see [`FwInfoFlags`](struct.FwInfoFlags.html).
pub const EA_FWINFO: u16 = 0x5A;
/// System FPGA part.
pub const EA_SYS_FPGA_TYPE: u16 = 0x5C;
/// Signal-acquisition board FPGA part.
pub const EA_SAB_FPGA_TYPE: u16 = 0x5D;
/// Custom enumeration of the last firmware package uploaded.
pub const EA_CUST_FWPKG_ENUM: u16 = 0x5E;
/// Upper half of the version of the last firmware package uploaded.
pub const EA_FWPKG_VER_HIGH: u16 = 0x5F;
/// Lower half of the version of the last firmware package uploaded.
pub const EA_FWPKG_VER_LOW: u16 = 0x6A;
pub const EA_CUSTOM_SAB_LOGIC_ENUM: u16 = 0x6B;
pub const EA_PREV_SAB_LOGIC_SUB_VER: u16 = 0x6C;
pub const EA_PREV_SAB_LOGIC_VER: u16 = 0x6D;
pub const EA_SAB_LOGIC_SUB_VER: u16 = 0x6E;
pub const EA_SAB_LOGIC_VER: u16 = 0x6F;
pub const EA_BOARD_REV: u16 = 0x74;
pub const EA_PREV_LOGIC_SUB_VER: u16 = 0x75;
pub const EA_PREV_LOGIC_VER: u16 = 0x76;
/// Pre-release bits, see [`PreReleaseFlags`](struct.PreReleaseFlags.html).
pub const EA_PRE_RELEASE: u16 = 0x77;
pub const EA_CUSTOM_HW_ENUM: u16 = 0x78;
pub const EA_CUSTOM_LOGIC_ENUM: u16 = 0x79;
pub const EA_HW_REV: u16 = 0x7B;
pub const EA_LOGIC_SUB_VER: u16 = 0x7C;
pub const EA_LOGIC_VER: u16 = 0x7D;
/// Checksum over words `0..EA_CHECKSUM`.
pub const EA_CHECKSUM: u16 = 0x7F;

/// Number of words covered by the checksum.
pub const EEPROM_CHECKSUM_WORDS: u16 = EA_CHECKSUM;

bitflags! {
    /// Marks firmware of a subsystem as a pre-release version.
    pub struct PreReleaseFlags: u16 {
        const SYS_FW = 0x0001;
        const HW = 0x0002;
        const SAB_FW = 0x0004;
    }
}

bitflags! {
    /// Firmware information bits.
    pub struct FwInfoFlags: u16 {
        /// The secondary system configuration EEPROM is known to be blank.
        const PCIE_EEPROM_2_BLANK = 0x0001;
        /// The secondary SAB configuration EEPROM is known to be blank.
        const SAB_EEPROM_2_BLANK = 0x0002;
    }
}

impl FwInfoFlags {
    pub(crate) fn from_bits_warn(raw: u16) -> Self {
        let flags = Self::from_bits_truncate(raw);
        if flags.bits() != raw {
            warn!("unknown firmware info bits: {:#06x} (known: {:?})", raw, flags);
        }
        flags
    }
}

/// EEPROM addresses tracking the firmware of one configuration EEPROM.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VersionAddrs {
    pub ver_low: u16,
    pub ver_high: u16,
    pub prev_ver_low: u16,
    pub prev_ver_high: u16,
    pub cust_enum: u16,
}

/// Version addresses of the system (PCIe) firmware.
pub const SYS_VERSION_ADDRS: VersionAddrs = VersionAddrs {
    ver_low: EA_LOGIC_SUB_VER,
    ver_high: EA_LOGIC_VER,
    prev_ver_low: EA_PREV_LOGIC_SUB_VER,
    prev_ver_high: EA_PREV_LOGIC_VER,
    cust_enum: EA_CUSTOM_LOGIC_ENUM,
};

/// Version addresses of the signal-acquisition board firmware.
pub const SAB_VERSION_ADDRS: VersionAddrs = VersionAddrs {
    ver_low: EA_SAB_LOGIC_SUB_VER,
    ver_high: EA_SAB_LOGIC_VER,
    prev_ver_low: EA_PREV_SAB_LOGIC_SUB_VER,
    prev_ver_high: EA_PREV_SAB_LOGIC_VER,
    cust_enum: EA_CUSTOM_SAB_LOGIC_ENUM,
};
