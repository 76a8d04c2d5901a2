//! XSVF playback.
//!
//! XSVF is Xilinx' compact binary form of SVF: a sequence of one-byte opcodes followed by their
//! operands, with bit vectors stored big-endian (the last byte holds the least significant bit,
//! which is shifted first). Firmware bitstreams for the configuration EEPROMs on the PX14400 are
//! distributed in this format.
//!
//! Playback is split in three parts:
//!
//! * [`XsvfDecoder`] turns a file into [`XsvfCommand`]s that refer to their operands by byte
//!   range, which also lets [`patch`](../patch/index.html) rewrite operands in place.
//! * [`XsvfPlayer`] runs the commands: it tracks the TAP controller state, pads shifts for the
//!   target's position in a longer chain ([`ShiftOffsets`]) and verifies captured TDO data.
//! * [`XsvfPort`] is what the player drives. The PX14400 port sends everything through the
//!   session's JTAG transport.
//!
//! [`XsvfDecoder`]: struct.XsvfDecoder.html
//! [`XsvfCommand`]: enum.XsvfCommand.html
//! [`XsvfPlayer`]: struct.XsvfPlayer.html
//! [`ShiftOffsets`]: struct.ShiftOffsets.html
//! [`XsvfPort`]: trait.XsvfPort.html

use crate::error::{Error, ErrorKind};
use crate::gateway::{Gateway, JtagIoFlags, JtagLines};
use crate::jtag::JtagClaim;
use crate::DeviceSession;
use bitflags::bitflags;
use byteorder::{BigEndian, ReadBytesExt};
use log::{debug, trace};
use std::io::{self, Cursor};
use std::ops::Range;
use std::path::Path;
use std::{fmt, fs};

/// Largest supported XSDRSIZE, in bytes.
pub const MAX_SDR_BYTES: usize = 7000;

/// Waits longer than this are reported through the progress callback.
const LONG_WAIT_US: u32 = 1_000_000;

mod opcode {
    pub const XCOMPLETE: u8 = 0;
    pub const XTDOMASK: u8 = 1;
    pub const XSIR: u8 = 2;
    pub const XSDR: u8 = 3;
    pub const XRUNTEST: u8 = 4;
    pub const XREPEAT: u8 = 7;
    pub const XSDRSIZE: u8 = 8;
    pub const XSDRTDO: u8 = 9;
    pub const XSETSDRMASKS: u8 = 10;
    pub const XSDRINC: u8 = 11;
    pub const XSDRB: u8 = 12;
    pub const XSDRC: u8 = 13;
    pub const XSDRE: u8 = 14;
    pub const XSDRTDOB: u8 = 15;
    pub const XSDRTDOC: u8 = 16;
    pub const XSDRTDOE: u8 = 17;
    pub const XSTATE: u8 = 18;
    pub const XENDIR: u8 = 19;
    pub const XENDDR: u8 = 20;
    pub const XSIR2: u8 = 21;
    pub const XCOMMENT: u8 = 22;
    pub const XWAIT: u8 = 23;
}

/// States of the IEEE 1149.1 TAP controller, numbered as in XSVF files.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TapState {
    Reset = 0,
    RunTestIdle = 1,
    SelectDr = 2,
    CaptureDr = 3,
    ShiftDr = 4,
    Exit1Dr = 5,
    PauseDr = 6,
    Exit2Dr = 7,
    UpdateDr = 8,
    SelectIr = 9,
    CaptureIr = 10,
    ShiftIr = 11,
    Exit1Ir = 12,
    PauseIr = 13,
    Exit2Ir = 14,
    UpdateIr = 15,
}

impl TapState {
    pub fn from_raw(raw: u8) -> Option<Self> {
        use TapState::*;
        Some(match raw {
            0 => Reset,
            1 => RunTestIdle,
            2 => SelectDr,
            3 => CaptureDr,
            4 => ShiftDr,
            5 => Exit1Dr,
            6 => PauseDr,
            7 => Exit2Dr,
            8 => UpdateDr,
            9 => SelectIr,
            10 => CaptureIr,
            11 => ShiftIr,
            12 => Exit1Ir,
            13 => PauseIr,
            14 => Exit2Ir,
            15 => UpdateIr,
            _ => return None,
        })
    }

    /// Returns the state entered on a TCK edge with the given TMS level.
    pub fn next(self, tms: bool) -> Self {
        use TapState::*;
        match (self, tms) {
            (Reset, true) => Reset,
            (Reset, false) => RunTestIdle,
            (RunTestIdle, true) => SelectDr,
            (RunTestIdle, false) => RunTestIdle,
            (SelectDr, true) => SelectIr,
            (SelectDr, false) => CaptureDr,
            (CaptureDr, true) => Exit1Dr,
            (CaptureDr, false) => ShiftDr,
            (ShiftDr, true) => Exit1Dr,
            (ShiftDr, false) => ShiftDr,
            (Exit1Dr, true) => UpdateDr,
            (Exit1Dr, false) => PauseDr,
            (PauseDr, true) => Exit2Dr,
            (PauseDr, false) => PauseDr,
            (Exit2Dr, true) => UpdateDr,
            (Exit2Dr, false) => ShiftDr,
            (UpdateDr, true) => SelectDr,
            (UpdateDr, false) => RunTestIdle,
            (SelectIr, true) => Reset,
            (SelectIr, false) => CaptureIr,
            (CaptureIr, true) => Exit1Ir,
            (CaptureIr, false) => ShiftIr,
            (ShiftIr, true) => Exit1Ir,
            (ShiftIr, false) => ShiftIr,
            (Exit1Ir, true) => UpdateIr,
            (Exit1Ir, false) => PauseIr,
            (PauseIr, true) => Exit2Ir,
            (PauseIr, false) => PauseIr,
            (Exit2Ir, true) => UpdateIr,
            (Exit2Ir, false) => ShiftIr,
            (UpdateIr, true) => SelectDr,
            (UpdateIr, false) => RunTestIdle,
        }
    }

    fn is_ir(self) -> bool {
        self as u8 >= TapState::SelectIr as u8
    }

    /// TMS level that moves one step along the standard path towards `target`.
    fn tms_towards(self, target: TapState) -> bool {
        use TapState::*;
        match self {
            Reset => false,
            RunTestIdle => true,
            SelectDr => target.is_ir(),
            CaptureDr => target != ShiftDr,
            ShiftDr => true,
            Exit1Dr => target != PauseDr,
            PauseDr => true,
            Exit2Dr => target != ShiftDr,
            UpdateDr => target != RunTestIdle,
            SelectIr => false,
            CaptureIr => target != ShiftIr,
            ShiftIr => true,
            Exit1Ir => target != PauseIr,
            PauseIr => true,
            Exit2Ir => target != ShiftIr,
            UpdateIr => target != RunTestIdle,
        }
    }
}

bitflags! {
    /// Options for XSVF playback.
    pub struct XsvfFlags: u32 {
        /// XRUNTEST/XWAIT times are TCK cycles instead of microseconds.
        const WAIT_IS_TICKS = 0x0000_0001;
        /// Hold TCK low while waiting.
        const LOW_CLOCK_ON_WAIT = 0x0000_0002;
        /// The target is virtual: TDO data is never compared.
        const VIRTUAL = 0x8000_0000;
    }
}

/// Padding needed to address one device in a longer JTAG chain.
///
/// XSVF files are written for a chain consisting of the target device only. When other devices
/// surround the target, instruction shifts must fill their instruction registers with BYPASS
/// (all ones) and data shifts must account for their one-bit bypass registers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct ShiftOffsets {
    /// Instruction register bits shifted before the target's.
    pub header_ir: u32,
    /// Instruction register bits shifted after the target's.
    pub trailer_ir: u32,
    /// Bypass bits shifted before the target's data register.
    pub header_dr: u32,
    /// Bypass bits shifted after the target's data register.
    pub trailer_dr: u32,
    /// Header padding for segmented FPGA data shifts (XSDRB/XSDRTDOB and friends).
    pub header_dr_fpga: u32,
}

/// Errors reported by the XSVF player.
#[derive(Debug)]
pub enum XsvfError {
    /// The JTAG interface could not be claimed, or an unspecified failure occurred.
    Unknown,
    /// Captured TDO data did not match the expected data.
    TdoMismatch,
    /// Captured TDO data did not match even after all XREPEAT retries.
    MaxRetries,
    /// Unknown or unsupported opcode.
    IllegalCommand(u8),
    /// Unknown TAP state, or a transition the player cannot make.
    IllegalState(u8),
    /// XSDRSIZE exceeds [`MAX_SDR_BYTES`](constant.MAX_SDR_BYTES.html).
    DataOverflow(u32),
    /// The file could not be read or ended prematurely.
    FileIo(io::Error),
    /// The JTAG transport failed.
    Transport(Error),
}

impl XsvfError {
    /// Returns the numeric error code used by XSVF tools.
    pub fn code(&self) -> i32 {
        match self {
            XsvfError::Unknown | XsvfError::Transport(_) => 1,
            XsvfError::TdoMismatch => 2,
            XsvfError::MaxRetries => 3,
            XsvfError::IllegalCommand(_) => 4,
            XsvfError::IllegalState(_) => 5,
            XsvfError::DataOverflow(_) => 6,
            XsvfError::FileIo(_) => 7,
        }
    }
}

impl fmt::Display for XsvfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XsvfError::Unknown => f.write_str("XSVF playback failed (JTAG interface unavailable)"),
            XsvfError::TdoMismatch => f.write_str("TDO mismatch"),
            XsvfError::MaxRetries => f.write_str("TDO mismatch after maximum number of retries"),
            XsvfError::IllegalCommand(op) => write!(f, "illegal XSVF command {:#04x}", op),
            XsvfError::IllegalState(s) => write!(f, "illegal TAP state {}", s),
            XsvfError::DataOverflow(bits) => {
                write!(f, "XSDRSIZE of {} bits exceeds {} bytes", bits, MAX_SDR_BYTES)
            }
            XsvfError::FileIo(e) => write!(f, "XSVF file error: {}", e),
            XsvfError::Transport(e) => write!(f, "JTAG transport error: {}", e),
        }
    }
}

impl std::error::Error for XsvfError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            XsvfError::FileIo(e) => Some(e),
            XsvfError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<Error> for XsvfError {
    fn from(e: Error) -> Self {
        XsvfError::Transport(e)
    }
}

impl From<io::Error> for XsvfError {
    fn from(e: io::Error) -> Self {
        XsvfError::FileIo(e)
    }
}

/// Which part of a segmented data shift a command is.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SdrSegment {
    /// XSDRB/XSDRTDOB: enter Shift-DR, stay there.
    Begin,
    /// XSDRC/XSDRTDOC: continue in Shift-DR.
    Continue,
    /// XSDRE/XSDRTDOE: continue, then move to the XENDDR state.
    End,
}

/// One decoded XSVF command. Operands are byte ranges into the decoded file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XsvfCommand {
    Complete,
    TdoMask {
        mask: Range<usize>,
    },
    /// XSIR and XSIR2.
    Sir {
        bits: u32,
        tdi: Range<usize>,
    },
    Sdr {
        tdi: Range<usize>,
    },
    RunTest {
        usecs: u32,
        field: Range<usize>,
    },
    Repeat(u8),
    SdrSize(u32),
    SdrTdo {
        tdi: Range<usize>,
        expected: Range<usize>,
    },
    SetSdrMasks {
        address: Range<usize>,
        data: Range<usize>,
    },
    SdrInc {
        start: Range<usize>,
        data: Vec<Range<usize>>,
    },
    SdrSegment {
        segment: SdrSegment,
        tdi: Range<usize>,
        expected: Option<Range<usize>>,
    },
    State(u8),
    EndIr(u8),
    EndDr(u8),
    Comment,
    Wait {
        wait_state: u8,
        end_state: u8,
        usecs: u32,
    },
}

fn bytes_for_bits(bits: u32) -> usize {
    ((bits + 7) / 8) as usize
}

/// Decodes an XSVF file one command at a time.
#[derive(Debug)]
pub struct XsvfDecoder<'a> {
    cursor: Cursor<&'a [u8]>,
    sdr_bits: u32,
    data_mask_bits: u32,
}

impl<'a> XsvfDecoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
            sdr_bits: 0,
            data_mask_bits: 0,
        }
    }

    /// Returns the offset of the next command.
    pub fn position(&self) -> usize {
        self.cursor.position() as usize
    }

    fn len(&self) -> usize {
        self.cursor.get_ref().len()
    }

    fn take(&mut self, n: usize) -> Result<Range<usize>, XsvfError> {
        let start = self.position();
        let end = start + n;
        if end > self.len() {
            return Err(XsvfError::FileIo(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "XSVF operand runs past end of file",
            )));
        }
        self.cursor.set_position(end as u64);
        Ok(start..end)
    }

    fn sdr_field(&mut self) -> Result<Range<usize>, XsvfError> {
        self.take(bytes_for_bits(self.sdr_bits))
    }

    /// Decodes the next command.
    ///
    /// Returns `Ok(None)` at the end of the data.
    pub fn next_command(&mut self) -> Result<Option<XsvfCommand>, XsvfError> {
        use self::opcode::*;

        if self.position() >= self.len() {
            return Ok(None);
        }
        let op = self.cursor.read_u8()?;
        let cmd = match op {
            XCOMPLETE => XsvfCommand::Complete,
            XTDOMASK => XsvfCommand::TdoMask {
                mask: self.sdr_field()?,
            },
            XSIR | XSIR2 => {
                let bits = if op == XSIR {
                    u32::from(self.cursor.read_u8()?)
                } else {
                    u32::from(self.cursor.read_u16::<BigEndian>()?)
                };
                XsvfCommand::Sir {
                    bits,
                    tdi: self.take(bytes_for_bits(bits))?,
                }
            }
            XSDR => XsvfCommand::Sdr {
                tdi: self.sdr_field()?,
            },
            XRUNTEST => {
                let start = self.position();
                let usecs = self.cursor.read_u32::<BigEndian>()?;
                XsvfCommand::RunTest {
                    usecs,
                    field: start..start + 4,
                }
            }
            XREPEAT => XsvfCommand::Repeat(self.cursor.read_u8()?),
            XSDRSIZE => {
                let bits = self.cursor.read_u32::<BigEndian>()?;
                if bytes_for_bits(bits) > MAX_SDR_BYTES {
                    return Err(XsvfError::DataOverflow(bits));
                }
                self.sdr_bits = bits;
                XsvfCommand::SdrSize(bits)
            }
            XSDRTDO => XsvfCommand::SdrTdo {
                tdi: self.sdr_field()?,
                expected: self.sdr_field()?,
            },
            XSETSDRMASKS => {
                let address = self.sdr_field()?;
                let data = self.sdr_field()?;
                let raw = *self.cursor.get_ref();
                self.data_mask_bits = raw[data.clone()].iter().map(|b| b.count_ones()).sum();
                XsvfCommand::SetSdrMasks { address, data }
            }
            XSDRINC => {
                let start = self.sdr_field()?;
                let count = self.cursor.read_u8()?;
                let len = bytes_for_bits(self.data_mask_bits);
                let data = (0..count)
                    .map(|_| self.take(len))
                    .collect::<Result<Vec<_>, _>>()?;
                XsvfCommand::SdrInc { start, data }
            }
            XSDRB | XSDRC | XSDRE | XSDRTDOB | XSDRTDOC | XSDRTDOE => {
                let segment = match op {
                    XSDRB | XSDRTDOB => SdrSegment::Begin,
                    XSDRC | XSDRTDOC => SdrSegment::Continue,
                    _ => SdrSegment::End,
                };
                let tdi = self.sdr_field()?;
                let expected = if op >= XSDRTDOB {
                    Some(self.sdr_field()?)
                } else {
                    None
                };
                XsvfCommand::SdrSegment {
                    segment,
                    tdi,
                    expected,
                }
            }
            XSTATE => XsvfCommand::State(self.cursor.read_u8()?),
            XENDIR => XsvfCommand::EndIr(self.cursor.read_u8()?),
            XENDDR => XsvfCommand::EndDr(self.cursor.read_u8()?),
            XCOMMENT => {
                while self.cursor.read_u8()? != 0 {}
                XsvfCommand::Comment
            }
            XWAIT => XsvfCommand::Wait {
                wait_state: self.cursor.read_u8()?,
                end_state: self.cursor.read_u8()?,
                usecs: self.cursor.read_u32::<BigEndian>()?,
            },
            other => return Err(XsvfError::IllegalCommand(other)),
        };
        Ok(Some(cmd))
    }
}

/// Output lines and timing the player needs from a JTAG adapter.
///
/// Bit vectors passed to [`shift`](#tymethod.shift) are little-endian: bit 0 of byte 0 is
/// shifted first.
pub trait XsvfPort {
    /// Prepares the adapter before the first command.
    fn begin(&mut self) -> Result<(), XsvfError> {
        Ok(())
    }

    /// Releases the adapter. Called after playback, whether it succeeded or not.
    fn end(&mut self) {}

    fn set_tms(&mut self, high: bool) -> Result<(), XsvfError>;

    fn set_tdi(&mut self, high: bool) -> Result<(), XsvfError>;

    /// Pulses TCK once, leaving TMS and TDI unchanged.
    fn pulse(&mut self) -> Result<(), XsvfError>;

    /// Sets TMS and pulses TCK.
    fn tms_transition(&mut self, tms: bool) -> Result<(), XsvfError>;

    /// Shifts `bits` bits from `tdi`, optionally capturing TDO. With `exit`, TMS is raised on the
    /// last bit.
    fn shift(
        &mut self,
        bits: u32,
        tdi: &[u8],
        tdo: Option<&mut [u8]>,
        exit: bool,
    ) -> Result<(), XsvfError>;

    /// Waits in the current state for `usecs` microseconds (or TCK cycles, depending on the
    /// port's configuration).
    fn wait(&mut self, usecs: u32) -> Result<(), XsvfError>;

    /// Reports that `pos` of `len` bytes have been processed.
    fn progress(&mut self, pos: u64, len: u64) {
        let _ = (pos, len);
    }
}

struct ShiftRequest<'d> {
    start: TapState,
    end: TapState,
    bits: u32,
    tdi: &'d [u8],
    expected: Option<&'d [u8]>,
    mask: Option<&'d [u8]>,
    header: u32,
    trailer: u32,
    run_test: u32,
    max_repeat: u8,
}

/// Reverses a big-endian bit vector into the port's little-endian order.
fn to_le(be: &[u8]) -> Vec<u8> {
    be.iter().rev().copied().collect()
}

fn tdo_matches(captured: &[u8], expected: &[u8], mask: Option<&[u8]>, bits: u32) -> bool {
    (0..bytes_for_bits(bits)).all(|i| {
        let valid_bits = if (i + 1) * 8 > bits as usize {
            (1u16 << (bits as usize - i * 8)) as u8 - 1
        } else {
            0xFF
        };
        let m = mask.map_or(0xFF, |m| m.get(i).copied().unwrap_or(0)) & valid_bits;
        let c = captured.get(i).copied().unwrap_or(0);
        let e = expected.get(i).copied().unwrap_or(0);
        (c ^ e) & m == 0
    })
}

/// Big-endian `a += b`, truncated to the length of `a`.
fn add_be(a: &mut [u8], b: &[u8]) {
    let mut carry = 0u16;
    let mut bi = b.iter().rev();
    for byte in a.iter_mut().rev() {
        let sum = u16::from(*byte) + u16::from(bi.next().copied().unwrap_or(0)) + carry;
        *byte = sum as u8;
        carry = sum >> 8;
    }
}

/// Applies an XSDRINC step: adds the address mask to `tdi` and spreads the next data bits over
/// the positions selected by the data mask.
fn sdr_masking(tdi: &mut [u8], next: &[u8], address_mask: &[u8], data_mask: &[u8]) {
    add_be(tdi, address_mask);

    let mut next_bit = 0usize;
    let len = tdi.len().min(data_mask.len());
    for i in (0..len).rev() {
        let mask = data_mask[data_mask.len() - len + i];
        let byte = tdi.len() - len + i;
        for b in 0..8 {
            if mask & (1 << b) == 0 {
                continue;
            }
            let src = next
                .len()
                .checked_sub(1 + next_bit / 8)
                .map(|j| next[j] >> (next_bit % 8) & 1)
                .unwrap_or(0);
            if src != 0 {
                tdi[byte] |= 1 << b;
            } else {
                tdi[byte] &= !(1 << b);
            }
            next_bit += 1;
        }
    }
}

/// Plays XSVF files through an [`XsvfPort`](trait.XsvfPort.html).
#[derive(Debug)]
pub struct XsvfPlayer<P: XsvfPort> {
    port: P,
    flags: XsvfFlags,
    offsets: ShiftOffsets,
    tap: TapState,
    end_ir: TapState,
    end_dr: TapState,
    run_test: u32,
    max_repeat: u8,
    sdr_bits: u32,
    tdo_mask: Vec<u8>,
    tdo_expected: Vec<u8>,
    address_mask: Vec<u8>,
    data_mask: Vec<u8>,
}

impl<P: XsvfPort> XsvfPlayer<P> {
    pub fn new(port: P, flags: XsvfFlags, offsets: ShiftOffsets) -> Self {
        Self {
            port,
            flags,
            offsets,
            tap: TapState::Reset,
            end_ir: TapState::RunTestIdle,
            end_dr: TapState::RunTestIdle,
            run_test: 0,
            max_repeat: 0,
            sdr_bits: 0,
            tdo_mask: Vec::new(),
            tdo_expected: Vec::new(),
            address_mask: Vec::new(),
            data_mask: Vec::new(),
        }
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn into_port(self) -> P {
        self.port
    }

    /// Returns the TAP state the player believes the chain is in.
    pub fn tap_state(&self) -> TapState {
        self.tap
    }

    /// Plays a complete XSVF file.
    pub fn play(&mut self, data: &[u8]) -> Result<(), XsvfError> {
        self.port.begin()?;
        let res = self.run(data);
        self.port.end();
        res
    }

    fn run(&mut self, data: &[u8]) -> Result<(), XsvfError> {
        self.goto(TapState::Reset)?;

        let mut decoder = XsvfDecoder::new(data);
        loop {
            self.port
                .progress(decoder.position() as u64, data.len() as u64);
            match decoder.next_command()? {
                None => {
                    return Err(XsvfError::FileIo(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "XSVF file ended without XCOMPLETE",
                    )))
                }
                Some(XsvfCommand::Complete) => {
                    debug!("XSVF playback complete");
                    return Ok(());
                }
                Some(cmd) => self.execute(data, cmd)?,
            }
        }
    }

    fn execute(&mut self, data: &[u8], cmd: XsvfCommand) -> Result<(), XsvfError> {
        trace!("XSVF: {:?}", cmd);
        let off = self.offsets;
        match cmd {
            XsvfCommand::Complete | XsvfCommand::Comment => {}
            XsvfCommand::TdoMask { mask } => self.tdo_mask = data[mask].to_vec(),
            XsvfCommand::Sir { bits, tdi } => {
                self.shift(&ShiftRequest {
                    start: TapState::ShiftIr,
                    end: self.end_ir,
                    bits,
                    tdi: &data[tdi],
                    expected: None,
                    mask: None,
                    header: off.header_ir,
                    trailer: off.trailer_ir,
                    run_test: self.run_test,
                    max_repeat: 0,
                })?;
            }
            XsvfCommand::Sdr { tdi } => {
                let expected = self.tdo_expected.clone();
                let mask = self.tdo_mask.clone();
                self.shift_dr(&data[tdi], Some(&expected), Some(&mask))?;
            }
            XsvfCommand::RunTest { usecs, .. } => self.run_test = usecs,
            XsvfCommand::Repeat(n) => self.max_repeat = n,
            XsvfCommand::SdrSize(bits) => self.sdr_bits = bits,
            XsvfCommand::SdrTdo { tdi, expected } => {
                self.tdo_expected = data[expected].to_vec();
                let expected = self.tdo_expected.clone();
                let mask = self.tdo_mask.clone();
                self.shift_dr(&data[tdi], Some(&expected), Some(&mask))?;
            }
            XsvfCommand::SetSdrMasks { address, data: dm } => {
                self.address_mask = data[address].to_vec();
                self.data_mask = data[dm].to_vec();
            }
            XsvfCommand::SdrInc { start, data: steps } => {
                let mut tdi = data[start].to_vec();
                let expected = self.tdo_expected.clone();
                let mask = self.tdo_mask.clone();
                self.shift_dr(&tdi, Some(&expected), Some(&mask))?;
                for step in steps {
                    let (am, dm) = (self.address_mask.clone(), self.data_mask.clone());
                    sdr_masking(&mut tdi, &data[step], &am, &dm);
                    self.shift_dr(&tdi, Some(&expected), Some(&mask))?;
                }
            }
            XsvfCommand::SdrSegment {
                segment,
                tdi,
                expected,
            } => {
                let end = match segment {
                    SdrSegment::End => self.end_dr,
                    _ => TapState::ShiftDr,
                };
                let header = if self.tap == TapState::ShiftDr {
                    0
                } else {
                    off.header_dr_fpga
                };
                let trailer = if end == TapState::ShiftDr {
                    0
                } else {
                    off.trailer_dr
                };
                self.shift(&ShiftRequest {
                    start: TapState::ShiftDr,
                    end,
                    bits: self.sdr_bits,
                    tdi: &data[tdi],
                    expected: expected.map(|r| &data[r]),
                    mask: None,
                    header,
                    trailer,
                    run_test: 0,
                    max_repeat: 0,
                })?;
            }
            XsvfCommand::State(raw) => {
                let state = TapState::from_raw(raw).ok_or(XsvfError::IllegalState(raw))?;
                self.goto(state)?;
            }
            XsvfCommand::EndIr(raw) => {
                self.end_ir = match raw {
                    0 => TapState::RunTestIdle,
                    1 => TapState::PauseIr,
                    _ => return Err(XsvfError::IllegalState(raw)),
                }
            }
            XsvfCommand::EndDr(raw) => {
                self.end_dr = match raw {
                    0 => TapState::RunTestIdle,
                    1 => TapState::PauseDr,
                    _ => return Err(XsvfError::IllegalState(raw)),
                }
            }
            XsvfCommand::Wait {
                wait_state,
                end_state,
                usecs,
            } => {
                let wait_state =
                    TapState::from_raw(wait_state).ok_or(XsvfError::IllegalState(wait_state))?;
                let end_state =
                    TapState::from_raw(end_state).ok_or(XsvfError::IllegalState(end_state))?;
                if self.tap != wait_state {
                    self.goto(wait_state)?;
                }
                self.port.wait(usecs)?;
                if self.tap != end_state {
                    self.goto(end_state)?;
                }
            }
        }
        Ok(())
    }

    fn shift_dr(
        &mut self,
        tdi: &[u8],
        expected: Option<&[u8]>,
        mask: Option<&[u8]>,
    ) -> Result<(), XsvfError> {
        // Without a preceding XSDRTDO there is nothing to compare against.
        let expected = expected.filter(|e| !e.is_empty());
        let mask = mask.filter(|m| !m.is_empty());
        self.shift(&ShiftRequest {
            start: TapState::ShiftDr,
            end: self.end_dr,
            bits: self.sdr_bits,
            tdi,
            expected,
            mask,
            header: self.offsets.header_dr,
            trailer: self.offsets.trailer_dr,
            run_test: self.run_test,
            max_repeat: self.max_repeat,
        })
    }

    /// Moves the TAP controller to `target` along the standard paths.
    fn goto(&mut self, target: TapState) -> Result<(), XsvfError> {
        if target == TapState::Reset {
            self.port.set_tms(true)?;
            for _ in 0..5 {
                self.port.pulse()?;
            }
            self.tap = TapState::Reset;
            return Ok(());
        }
        if (target == TapState::Exit2Dr && self.tap != TapState::PauseDr)
            || (target == TapState::Exit2Ir && self.tap != TapState::PauseIr)
        {
            return Err(XsvfError::IllegalState(target as u8));
        }

        // No path between two states is longer than this.
        for _ in 0..16 {
            if self.tap == target {
                return Ok(());
            }
            let tms = self.tap.tms_towards(target);
            self.port.tms_transition(tms)?;
            self.tap = self.tap.next(tms);
        }
        if self.tap == target {
            Ok(())
        } else {
            Err(XsvfError::IllegalState(target as u8))
        }
    }

    fn shift(&mut self, req: &ShiftRequest<'_>) -> Result<(), XsvfError> {
        let exit = req.start != req.end;
        let padding_tdi = req.start == TapState::ShiftIr;
        let compare = !self.flags.contains(XsvfFlags::VIRTUAL);

        let tdi = to_le(req.tdi);
        let expected = req.expected.map(to_le);
        let mask = req.mask.map(to_le);
        let mut tdo = vec![0u8; bytes_for_bits(req.bits)];

        let mut run_test = req.run_test;
        let mut repeat = 0u8;
        loop {
            if req.bits == 0 {
                if run_test > 0 {
                    self.goto(TapState::RunTestIdle)?;
                    self.port.wait(run_test)?;
                }
                return Ok(());
            }

            self.goto(req.start)?;
            if req.header > 0 {
                self.port.set_tdi(padding_tdi)?;
                for _ in 0..req.header {
                    self.port.pulse()?;
                }
            }

            let capture = expected.as_ref().map(|_| &mut tdo[..]);
            self.port
                .shift(req.bits, &tdi, capture, exit && req.trailer == 0)?;

            let mismatch = match &expected {
                Some(exp) if compare => !tdo_matches(&tdo, exp, mask.as_deref(), req.bits),
                _ => false,
            };

            if exit {
                if req.trailer > 0 {
                    self.port.set_tdi(padding_tdi)?;
                    for _ in 1..req.trailer {
                        self.port.pulse()?;
                    }
                    self.port.tms_transition(true)?;
                }
                self.tap = self.tap.next(true);

                if mismatch && run_test > 0 && repeat < req.max_repeat {
                    // exception handling: retry through Pause-DR with a longer run-test time
                    self.goto(TapState::PauseDr)?;
                    self.goto(TapState::ShiftDr)?;
                    run_test += run_test >> 2;
                } else {
                    self.goto(req.end)?;
                }

                if run_test > 0 {
                    self.goto(TapState::RunTestIdle)?;
                    self.port.wait(run_test)?;
                }
            }

            if !mismatch {
                return Ok(());
            }
            let retry = repeat < req.max_repeat;
            repeat = repeat.saturating_add(1);
            if !retry {
                break;
            }
            debug!("TDO mismatch, retry {} of {}", repeat, req.max_repeat);
        }

        if req.max_repeat > 0 && repeat > req.max_repeat {
            Err(XsvfError::MaxRetries)
        } else {
            Err(XsvfError::TdoMismatch)
        }
    }
}

/// Playback progress reported during firmware upload.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Progress {
    /// `pos` of `len` bytes of file `file` (1-based) of `files` have been played.
    Playing {
        pos: u64,
        len: u64,
        file: u32,
        files: u32,
    },
    /// A wait of `ms` milliseconds has started.
    Waiting { ms: u32 },
    /// The wait announced by `Waiting` has ended.
    WaitDone,
}

/// XSVF port driving a PX14400's JTAG interface.
pub(crate) struct Px14Port<'s, 'p, G: Gateway> {
    session: &'s DeviceSession<G>,
    flags: XsvfFlags,
    file: u32,
    files: u32,
    progress: &'p mut dyn FnMut(Progress),
    claim: Option<JtagClaim<'s, G>>,
}

impl<'s, 'p, G: Gateway> Px14Port<'s, 'p, G> {
    pub(crate) fn new(
        session: &'s DeviceSession<G>,
        flags: XsvfFlags,
        file: u32,
        files: u32,
        progress: &'p mut dyn FnMut(Progress),
    ) -> Self {
        Self {
            session,
            flags,
            file,
            files,
            progress,
            claim: None,
        }
    }

    fn set_line(&self, line: JtagLines, high: bool) -> Result<(), XsvfError> {
        let value = if high { line } else { JtagLines::empty() };
        self.session
            .write_jtag(value, line, JtagIoFlags::empty())?;
        Ok(())
    }
}

impl<G: Gateway> XsvfPort for Px14Port<'_, '_, G> {
    fn begin(&mut self) -> Result<(), XsvfError> {
        match self.session.claim_jtag() {
            Ok(claim) => {
                self.claim = Some(claim);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::JtagIo => Err(XsvfError::Unknown),
            Err(e) => Err(e.into()),
        }
    }

    fn end(&mut self) {
        self.claim = None;
    }

    fn set_tms(&mut self, high: bool) -> Result<(), XsvfError> {
        self.set_line(JtagLines::TMS, high)
    }

    fn set_tdi(&mut self, high: bool) -> Result<(), XsvfError> {
        self.set_line(JtagLines::TDI, high)
    }

    fn pulse(&mut self) -> Result<(), XsvfError> {
        self.session
            .write_jtag(JtagLines::empty(), JtagLines::empty(), JtagIoFlags::PULSE_TCK)?;
        Ok(())
    }

    fn tms_transition(&mut self, tms: bool) -> Result<(), XsvfError> {
        let value = if tms { JtagLines::TMS } else { JtagLines::empty() };
        self.session
            .write_jtag(value, JtagLines::TMS, JtagIoFlags::PULSE_TCK)?;
        Ok(())
    }

    fn shift(
        &mut self,
        bits: u32,
        tdi: &[u8],
        tdo: Option<&mut [u8]>,
        exit: bool,
    ) -> Result<(), XsvfError> {
        self.session.shift_stream(bits, Some(tdi), tdo, exit)?;
        Ok(())
    }

    fn wait(&mut self, usecs: u32) -> Result<(), XsvfError> {
        if self.flags.contains(XsvfFlags::WAIT_IS_TICKS) {
            self.session.pulse_tck(usecs)?;
            return Ok(());
        }

        if self.flags.contains(XsvfFlags::LOW_CLOCK_ON_WAIT) {
            self.set_line(JtagLines::TCK, false)?;
        }
        let announce = usecs > LONG_WAIT_US;
        if announce {
            (self.progress)(Progress::Waiting { ms: usecs / 1000 });
        }
        if !self.flags.contains(XsvfFlags::VIRTUAL) {
            self.session.gateway().delay_us(usecs)?;
        }
        if announce {
            (self.progress)(Progress::WaitDone);
        }
        Ok(())
    }

    fn progress(&mut self, pos: u64, len: u64) {
        (self.progress)(Progress::Playing {
            pos,
            len,
            file: self.file,
            files: self.files,
        });
    }
}

impl<G: Gateway> DeviceSession<G> {
    /// Plays an XSVF file through the board's JTAG chain.
    ///
    /// `offsets` describe the target's position in the chain; use the default for a chain that
    /// consists of the target only.
    pub fn play_xsvf(
        &self,
        path: &Path,
        offsets: ShiftOffsets,
        progress: &mut dyn FnMut(Progress),
    ) -> crate::Result<()> {
        self.play_xsvf_file(path, offsets, 1, 1, progress)
    }

    pub(crate) fn play_xsvf_file(
        &self,
        path: &Path,
        offsets: ShiftOffsets,
        file: u32,
        files: u32,
        progress: &mut dyn FnMut(Progress),
    ) -> crate::Result<()> {
        let data = fs::read(path).map_err(|e| {
            Error::with_while(ErrorKind::FirmwareUploadFailed, XsvfError::FileIo(e), "reading XSVF file")
        })?;

        let mut flags = self.config.xsvf_flags();
        if self.is_virtual() {
            flags |= XsvfFlags::VIRTUAL;
        }
        debug!(
            "playing {} ({} bytes) with {:?}",
            path.display(),
            data.len(),
            offsets
        );

        let port = Px14Port::new(self, flags, file, files, progress);
        let mut player = XsvfPlayer::new(port, flags, offsets);
        player.play(&data).map_err(|e| {
            Error::with_while(ErrorKind::FirmwareUploadFailed, e, "playing XSVF file")
        })
    }
}

impl<G: Gateway> fmt::Debug for Px14Port<'_, '_, G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Px14Port")
            .field("flags", &self.flags)
            .field("file", &self.file)
            .field("files", &self.files)
            .finish()
    }
}
