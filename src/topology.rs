//! JTAG chain discovery.
//!
//! The PX14400's JTAG chain contains the configuration EEPROMs and FPGAs of the system (PCIe)
//! logic and, on boards with a signal-acquisition board (SAB), those of the SAB as well. Which
//! parts are present depends on the board revision, its hardware revision and the FPGA parts
//! recorded in EEPROM. Resolving the chain turns the IDCODE count and that configuration into a
//! list of [`JtagChainItem`]s, each knowing which firmware chunk it takes, where its version
//! is recorded in EEPROM and how XSVF shifts must be padded to reach it.
//!
//! [`JtagChainItem`]: struct.JtagChainItem.html

use crate::eeprom::{
    FwInfoFlags, PreReleaseFlags, VersionAddrs, EA_SAB_FPGA_TYPE, EA_SYS_FPGA_TYPE,
    SAB_VERSION_ADDRS, SYS_VERSION_ADDRS,
};
use crate::error::{Error, ErrorKind};
use crate::fwctx::{
    CHUNK_SAB_V5SX50T_1, CHUNK_SAB_V5SX50T_2, CHUNK_SAB_V5SX95T_1, CHUNK_SAB_V5SX95T_2,
    CHUNK_SYS_V5LX50T_1, CHUNK_SYS_V5LX50T_2,
};
use crate::gateway::{Gateway, JtagIoFlags, JtagLines};
use crate::version::ver64;
use crate::xsvf::ShiftOffsets;
use crate::{BoardRevision, BoardSubRevision, DeviceSession, Result, SabFpga, SysFpga};
use log::debug;
use std::collections::VecDeque;

/// Maximum number of devices scanned before the chain is considered broken.
pub const MAX_JTAG_DEVICES: usize = 64;

const IR_LEN_EEPROM: u32 = 16;
const IR_LEN_XC5VLX50T: u32 = 10;
const IR_LEN_XC5VSX50T: u32 = 10;
const IR_LEN_XC5VSX95T: u32 = 10;

const IDCODE_XCF16P: u32 = 0xE505_8093;
const IDCODE_XCF32P: u32 = 0xF505_9093;
const IDCODE_XC5VLX50T: u32 = 0xC2A9_6093;
const IDCODE_XC5VSX50T: u32 = 0x52E9_A093;

/// One device on the JTAG chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JtagChainItem {
    /// Instruction register length in bits.
    pub ir_len: u32,
    /// Firmware chunk stored on this device, if it is a configuration EEPROM.
    pub chunk: Option<u32>,
    /// Where the installed firmware version is recorded. Only set for the primary EEPROM of a
    /// subsystem.
    pub version_addrs: Option<VersionAddrs>,
    /// Pre-release bit tracking this device's firmware.
    pub prerelease: PreReleaseFlags,
    /// Firmware info bit recording that this (secondary) EEPROM is blank.
    pub skip_flag: FwInfoFlags,
    /// Bitstreams for this device are made for an xcf32p and must be adapted.
    pub patch_32p_to_16p: bool,
    /// Padding needed to address this device, see [`compute_shift_info`].
    ///
    /// [`compute_shift_info`]: fn.compute_shift_info.html
    pub shift: ShiftOffsets,
}

impl JtagChainItem {
    /// A device that takes no firmware (an FPGA).
    fn device(ir_len: u32) -> Self {
        Self {
            ir_len,
            chunk: None,
            version_addrs: None,
            prerelease: PreReleaseFlags::empty(),
            skip_flag: FwInfoFlags::empty(),
            patch_32p_to_16p: false,
            shift: ShiftOffsets::default(),
        }
    }

    /// The EEPROM holding a subsystem's firmware.
    fn primary_eeprom(chunk: u32, addrs: VersionAddrs, prerelease: PreReleaseFlags) -> Self {
        Self {
            chunk: Some(chunk),
            version_addrs: Some(addrs),
            prerelease,
            ..Self::device(IR_LEN_EEPROM)
        }
    }

    /// An EEPROM that is normally kept blank.
    fn secondary_eeprom(chunk: u32, skip_flag: FwInfoFlags) -> Self {
        Self {
            chunk: Some(chunk),
            skip_flag,
            ..Self::device(IR_LEN_EEPROM)
        }
    }
}

/// Computes the shift padding of every item from its position in the chain.
///
/// Items are ordered from TDI to TDO. Must be called again whenever the chain changes.
pub fn compute_shift_info(items: &mut [JtagChainItem]) {
    let total_ir: u32 = items.iter().map(|item| item.ir_len).sum();
    let count = items.len() as u32;

    let mut ir_before = 0;
    for (i, item) in items.iter_mut().enumerate() {
        let i = i as u32;
        item.shift = ShiftOffsets {
            header_ir: total_ir - ir_before - item.ir_len,
            trailer_ir: ir_before,
            header_dr: count - 1 - i,
            trailer_dr: i,
            header_dr_fpga: (32 - i % 32) % 32,
        };
        ir_before += item.ir_len;
    }
}

/// Firmware chunks and FPGA IR length of one subsystem.
struct FwRequirements {
    primary: u32,
    secondary: u32,
    fpga_ir_len: u32,
}

impl<G: Gateway> DeviceSession<G> {
    /// Reads the IDCODEs of all devices on the JTAG chain, the device closest to TDI first.
    ///
    /// Devices without an IDCODE register are reported as 0. Virtual devices report the chain
    /// their configuration implies.
    pub fn read_jtag_idcodes(&self) -> Result<Vec<u32>> {
        if self.is_virtual() {
            return self.virtual_idcodes();
        }

        let _claim = self.claim_jtag()?;
        let res = self.scan_idcodes();
        // Leave the TAPs in Test-Logic-Reset, even after a failed scan
        let reset = self.reset_taps();
        let codes = res?;
        reset?;

        debug!("JTAG chain: {:08x?}", codes);
        Ok(codes)
    }

    fn virtual_idcodes(&self) -> Result<Vec<u32>> {
        let hw = self.hardware_config()?;
        let mut codes = vec![IDCODE_XCF16P, IDCODE_XC5VLX50T];
        if hw.board_rev_sub == BoardSubRevision::Sp {
            if hw.sab_fpga == SabFpga::V5Sx50t {
                codes.extend_from_slice(&[IDCODE_XCF32P, IDCODE_XC5VSX50T]);
            } else {
                codes.extend_from_slice(&[IDCODE_XCF16P, IDCODE_XCF32P, IDCODE_XC5VSX50T]);
            }
        }
        Ok(codes)
    }

    fn reset_taps(&self) -> Result<()> {
        self.write_jtag(JtagLines::TMS, JtagLines::TMS | JtagLines::TDI, JtagIoFlags::empty())?;
        for _ in 0..5 {
            self.write_jtag(JtagLines::empty(), JtagLines::empty(), JtagIoFlags::PULSE_TCK)?;
        }
        Ok(())
    }

    fn tdo_bit(&self) -> Result<bool> {
        Ok(self.read_jtag(JtagIoFlags::PULSE_TCK)?.contains(JtagLines::TDO))
    }

    fn scan_idcodes(&self) -> Result<Vec<u32>> {
        self.reset_taps()?;

        // Test-Logic-Reset -> Shift-DR, TDI held high so the end of the chain reads all ones
        self.write_jtag(JtagLines::TDI, JtagLines::TDI, JtagIoFlags::empty())?;
        for &tms in &[false, true, false, false] {
            let value = if tms { JtagLines::TMS } else { JtagLines::empty() };
            self.write_jtag(value, JtagLines::TMS, JtagIoFlags::PULSE_TCK)?;
        }

        let mut codes = VecDeque::new();
        for _ in 0..MAX_JTAG_DEVICES {
            // An IDCODE always has bit 0 set; devices without one capture a single 0 in BYPASS.
            if !self.tdo_bit()? {
                codes.push_front(0);
                continue;
            }

            let mut code = 1u32;
            for bit in 1..32 {
                if self.tdo_bit()? {
                    code |= 1 << bit;
                }
            }
            if code == 0xFFFF_FFFF {
                return Ok(codes.into());
            }
            codes.push_front(code);
        }

        Err(Error::new(
            ErrorKind::JtagIo,
            format!("no end of JTAG chain after {} devices", MAX_JTAG_DEVICES),
        ))
    }

    /// Returns the IDCODEs of the JTAG chain as space-separated decimal numbers.
    pub fn jtag_idcodes_string(&self) -> Result<String> {
        let codes = self.read_jtag_idcodes()?;
        Ok(codes
            .iter()
            .map(|code| code.to_string())
            .collect::<Vec<_>>()
            .join(" "))
    }

    /// Returns whether the board has the JTAG chain introduced with the November 2011 hardware
    /// revisions (single xcf16p for the system logic).
    pub fn uses_modern_jtag_chain(&self) -> Result<bool> {
        if self.is_virtual() {
            return Ok(true);
        }
        let hw = self.hardware_config()?;
        let first_modern = match hw.board_rev {
            BoardRevision::Px14400D | BoardRevision::Px14400D2 => ver64(2, 1, 0, 0),
            _ => ver64(3, 0, 0, 0),
        };
        Ok(hw.hardware_revision() >= first_modern)
    }

    /// Discovers the JTAG chain and returns its devices, TDI first, with shift padding
    /// computed.
    ///
    /// Fails with `UnknownJtagChain` if the number of devices does not fit the board, and with
    /// `CannotDetermineFwReq` if the FPGA parts are unknown. Both attach a description available
    /// through [`error_extra`](../struct.DeviceSession.html#method.error_extra).
    pub fn resolve_jtag_chain(&self) -> Result<Vec<JtagChainItem>> {
        let codes = self.read_jtag_idcodes()?;

        let mut items = if self.uses_modern_jtag_chain()? {
            self.modern_chain(codes.len())?
        } else {
            self.legacy_chain(codes.len())?
        };
        compute_shift_info(&mut items);

        debug!(
            "resolved JTAG chain of {} devices: chunks {:?}",
            items.len(),
            items.iter().map(|item| item.chunk).collect::<Vec<_>>()
        );
        Ok(items)
    }

    fn sys_fw_requirements(&self) -> Result<FwRequirements> {
        let raw = self.read_eeprom(EA_SYS_FPGA_TYPE)?;
        let fpga = if self.is_virtual() {
            SysFpga::V5Lx50t
        } else {
            SysFpga::from_raw(raw)
        };
        match fpga {
            SysFpga::V5Lx50t => Ok(FwRequirements {
                primary: CHUNK_SYS_V5LX50T_1,
                secondary: CHUNK_SYS_V5LX50T_2,
                fpga_ir_len: IR_LEN_XC5VLX50T,
            }),
            SysFpga::Unknown(raw) => Err(Error::new(
                ErrorKind::CannotDetermineFwReq,
                format!("unknown system FPGA type {}", raw),
            )),
        }
    }

    fn sab_fw_requirements(&self) -> Result<FwRequirements> {
        let raw = self.read_eeprom(EA_SAB_FPGA_TYPE)?;
        let fpga = if self.is_virtual() {
            SabFpga::V5Sx95t
        } else {
            SabFpga::from_raw(raw)
        };
        match fpga {
            SabFpga::V5Sx50t => Ok(FwRequirements {
                primary: CHUNK_SAB_V5SX50T_1,
                secondary: CHUNK_SAB_V5SX50T_2,
                fpga_ir_len: IR_LEN_XC5VSX50T,
            }),
            SabFpga::V5Sx95t => Ok(FwRequirements {
                primary: CHUNK_SAB_V5SX95T_1,
                secondary: CHUNK_SAB_V5SX95T_2,
                fpga_ir_len: IR_LEN_XC5VSX95T,
            }),
            SabFpga::Unknown(raw) => Err(Error::new(
                ErrorKind::CannotDetermineFwReq,
                format!("unknown SAB FPGA type {}", raw),
            )),
        }
    }

    /// Chain of the original hardware: an xcf16p (kept blank) and an xcf32p per subsystem.
    fn legacy_chain(&self, count: usize) -> Result<Vec<JtagChainItem>> {
        if count != 3 && count != 6 {
            return Err(self.fail_with_extra(
                ErrorKind::UnknownJtagChain,
                "Number of JTAG devices does not match any known configurations".to_string(),
            ));
        }

        let sys = self.sys_fw_requirements()?;
        let mut items = vec![
            JtagChainItem::secondary_eeprom(sys.secondary, FwInfoFlags::PCIE_EEPROM_2_BLANK),
            JtagChainItem::primary_eeprom(sys.primary, SYS_VERSION_ADDRS, PreReleaseFlags::SYS_FW),
            JtagChainItem::device(sys.fpga_ir_len),
        ];

        if count == 6 {
            let sab = self.sab_fw_requirements()?;
            items.extend(vec![
                JtagChainItem::secondary_eeprom(sab.secondary, FwInfoFlags::SAB_EEPROM_2_BLANK),
                JtagChainItem::primary_eeprom(
                    sab.primary,
                    SAB_VERSION_ADDRS,
                    PreReleaseFlags::SAB_FW,
                ),
                JtagChainItem::device(sab.fpga_ir_len),
            ]);
        }
        Ok(items)
    }

    /// Chain of newer hardware: a single xcf16p holds the system logic.
    ///
    /// The FPGA parts come from the cached hardware configuration.
    fn modern_chain(&self, count: usize) -> Result<Vec<JtagChainItem>> {
        let hw = self.hardware_config()?;

        if hw.sys_fpga != SysFpga::V5Lx50t {
            return Err(self.fail_with_extra(
                ErrorKind::CannotDetermineFwReq,
                "Unknown SYS1 FPGA type in configuration data".to_string(),
            ));
        }

        let mut items = vec![
            JtagChainItem {
                patch_32p_to_16p: true,
                ..JtagChainItem::primary_eeprom(
                    CHUNK_SYS_V5LX50T_1,
                    SYS_VERSION_ADDRS,
                    PreReleaseFlags::SYS_FW,
                )
            },
            JtagChainItem::device(IR_LEN_XC5VLX50T),
        ];

        let (expected, what) = if hw.board_rev_sub == BoardSubRevision::Sp {
            match hw.sab_fpga {
                SabFpga::V5Sx95t => {
                    items.extend(vec![
                        JtagChainItem::secondary_eeprom(
                            CHUNK_SAB_V5SX95T_2,
                            FwInfoFlags::SAB_EEPROM_2_BLANK,
                        ),
                        JtagChainItem::primary_eeprom(
                            CHUNK_SAB_V5SX95T_1,
                            SAB_VERSION_ADDRS,
                            PreReleaseFlags::SAB_FW,
                        ),
                        JtagChainItem::device(IR_LEN_XC5VSX95T),
                    ]);
                    (5, "-SP95")
                }
                SabFpga::V5Sx50t => {
                    items.extend(vec![
                        JtagChainItem::primary_eeprom(
                            CHUNK_SAB_V5SX50T_1,
                            SAB_VERSION_ADDRS,
                            PreReleaseFlags::SAB_FW,
                        ),
                        JtagChainItem::device(IR_LEN_XC5VSX50T),
                    ]);
                    (4, "-SP50")
                }
                SabFpga::Unknown(_) => {
                    return Err(self.fail_with_extra(
                        ErrorKind::CannotDetermineFwReq,
                        "Unknown SYS2 FPGA type in configuration data".to_string(),
                    ));
                }
            }
        } else {
            (2, "-DR")
        };

        if count != expected {
            return Err(self.fail_with_extra(
                ErrorKind::UnknownJtagChain,
                format!(
                    "{} card does not have {} components in JTAG chain",
                    what, expected
                ),
            ));
        }
        Ok(items)
    }
}
