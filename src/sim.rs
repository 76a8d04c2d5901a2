//! An in-process model of the PX14400 driver and board.
//!
//! A [`SimBoard`] owns the state of one board: EEPROM contents, the DMA allocator, boot buffers
//! and a JTAG scan chain with a TAP controller model. Any number of [`SimulatedGateway`] handles
//! can be opened on a board; like handles of the real driver they share the board but own their
//! buffers, boot buffer checkouts and JTAG session, which are released when the handle is
//! dropped.
//!
//! The board also records what was asked of it (allocation sizes, EEPROM writes, checksum
//! updates, shifted bits) so callers can observe the traffic a library operation produced.
//!
//! [`SimBoard`]: struct.SimBoard.html
//! [`SimulatedGateway`]: struct.SimulatedGateway.html

use crate::addr::PlatformAddress;
use crate::bootbuf::BOOT_BUFFER_COUNT;
use crate::eeprom::EEPROM_CHECKSUM_WORDS;
use crate::error::{Error, ErrorKind};
use crate::gateway::{
    stream_bytes, BootBufOp, BootBufRequest, DeviceKind, Gateway, JtagIo, JtagIoFlags, JtagLines,
    StreamFlags,
};
use crate::xsvf::TapState;
use crate::Result;
use log::{debug, trace};
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::rc::Rc;

const EEPROM_WORDS: usize = 0x80;
const DMA_BASE: u64 = 0x1000_0000;
const PAGE: u64 = 0x1000;

#[derive(Debug, Default, Copy, Clone)]
struct SimBootBuf {
    samples: u32,
    addr: u64,
    owner: Option<u32>,
    busy: bool,
}

#[derive(Debug)]
struct BoardState {
    kind: DeviceKind,
    next_handle: u32,

    eeprom: [u16; EEPROM_WORDS],
    eeprom_writes: Vec<(u16, u16)>,
    checksum_resets: usize,

    next_dma_addr: u64,
    buffers: BTreeMap<u64, (u32, u32)>,
    alloc_requests: Vec<u32>,
    fail_next_allocs: usize,
    max_alloc_bytes: Option<u32>,
    memory_limit: Option<u64>,
    fail_map: bool,

    bootbufs: [SimBootBuf; BOOT_BUFFER_COUNT],
    realloc_fails: bool,

    jtag_owner: Option<u32>,
    jtag_grant_refused: bool,
    lines: JtagLines,
    tap: TapState,
    idcodes: Vec<u32>,
    dr: VecDeque<bool>,
    streamed_bits: u64,
    delayed_us: u64,
}

impl BoardState {
    fn new(kind: DeviceKind) -> Self {
        Self {
            kind,
            next_handle: 1,
            eeprom: [0; EEPROM_WORDS],
            eeprom_writes: Vec::new(),
            checksum_resets: 0,
            next_dma_addr: DMA_BASE,
            buffers: BTreeMap::new(),
            alloc_requests: Vec::new(),
            fail_next_allocs: 0,
            max_alloc_bytes: None,
            memory_limit: None,
            fail_map: false,
            bootbufs: [SimBootBuf::default(); BOOT_BUFFER_COUNT],
            realloc_fails: false,
            jtag_owner: None,
            jtag_grant_refused: false,
            lines: JtagLines::empty(),
            tap: TapState::Reset,
            idcodes: Vec::new(),
            dr: VecDeque::new(),
            streamed_bits: 0,
            delayed_us: 0,
        }
    }

    fn map_addr(&mut self, bytes: u32) -> u64 {
        let addr = self.next_dma_addr;
        let span = (u64::from(bytes) + PAGE - 1) / PAGE * PAGE;
        self.next_dma_addr += span.max(PAGE);
        addr
    }

    fn tdo(&self) -> bool {
        match self.tap {
            TapState::ShiftDr => self.dr.front().copied().unwrap_or(false),
            _ => false,
        }
    }

    /// One rising TCK edge. Returns the TDO level presented before the edge.
    fn clock(&mut self, tms: bool, tdi: bool) -> bool {
        let tdo = self.tdo();
        if self.tap == TapState::ShiftDr {
            self.dr.pop_front();
            self.dr.push_back(tdi);
        }
        let next = self.tap.next(tms);
        if next == TapState::CaptureDr {
            self.capture_dr();
        }
        if next != self.tap {
            trace!("sim TAP: {:?} -> {:?}", self.tap, next);
        }
        self.tap = next;
        tdo
    }

    /// Loads the identification registers of all devices, the device closest to TDO first.
    fn capture_dr(&mut self) {
        self.dr.clear();
        for &code in self.idcodes.iter().rev() {
            if code == 0 {
                // no IDCODE register, BYPASS captures a 0
                self.dr.push_back(false);
            } else {
                for bit in 0..32 {
                    self.dr.push_back(code & (1 << bit) != 0);
                }
            }
        }
    }
}

/// State of one simulated board, shared by all handles opened on it.
#[derive(Clone)]
pub struct SimBoard {
    state: Rc<RefCell<BoardState>>,
}

impl SimBoard {
    /// Creates a locally attached board with blank EEPROM and an empty JTAG chain.
    pub fn new() -> Self {
        Self::with_kind(DeviceKind::Local)
    }

    /// Creates a virtual board.
    pub fn new_virtual() -> Self {
        Self::with_kind(DeviceKind::Virtual)
    }

    /// Creates a board of the given kind.
    pub fn with_kind(kind: DeviceKind) -> Self {
        Self {
            state: Rc::new(RefCell::new(BoardState::new(kind))),
        }
    }

    /// Opens a new handle on this board.
    pub fn open(&self) -> SimulatedGateway {
        let mut state = self.state.borrow_mut();
        let handle = state.next_handle;
        state.next_handle += 1;
        debug!("sim: opened handle {}", handle);
        SimulatedGateway {
            state: self.state.clone(),
            handle,
        }
    }

    /// Reads an EEPROM word without recording an access.
    pub fn eeprom(&self, addr: u16) -> u16 {
        self.state.borrow().eeprom[usize::from(addr) % EEPROM_WORDS]
    }

    /// Sets an EEPROM word without recording a write.
    pub fn set_eeprom(&self, addr: u16, value: u16) {
        self.state.borrow_mut().eeprom[usize::from(addr) % EEPROM_WORDS] = value;
    }

    /// Returns every EEPROM write issued through any handle, in order.
    pub fn eeprom_writes(&self) -> Vec<(u16, u16)> {
        self.state.borrow().eeprom_writes.clone()
    }

    /// Returns the number of checksum updates requested.
    pub fn checksum_resets(&self) -> usize {
        self.state.borrow().checksum_resets
    }

    /// Returns the byte size of every DMA allocation request, including failed ones.
    pub fn alloc_requests(&self) -> Vec<u32> {
        self.state.borrow().alloc_requests.clone()
    }

    /// Returns the number of DMA buffers currently allocated.
    pub fn live_buffers(&self) -> usize {
        self.state.borrow().buffers.len()
    }

    /// Makes the next `n` DMA allocations fail.
    pub fn fail_next_allocs(&self, n: usize) {
        self.state.borrow_mut().fail_next_allocs = n;
    }

    /// Makes every DMA allocation larger than `bytes` fail.
    pub fn set_max_alloc_bytes(&self, bytes: Option<u32>) {
        self.state.borrow_mut().max_alloc_bytes = bytes;
    }

    /// Limits the total size of the DMA buffers allocated at the same time.
    pub fn set_memory_limit(&self, bytes: Option<u64>) {
        self.state.borrow_mut().memory_limit = bytes;
    }

    /// Makes mapping freshly allocated buffers into the process fail.
    pub fn set_map_fails(&self, fails: bool) {
        self.state.borrow_mut().fail_map = fails;
    }

    /// Sets the size of the boot buffer the driver allocated at load time (0 for none).
    pub fn set_boot_buffer(&self, index: usize, samples: u32) {
        let mut state = self.state.borrow_mut();
        let addr = if samples == 0 {
            0
        } else {
            state.map_addr(samples * 2)
        };
        let buf = &mut state.bootbufs[index];
        buf.samples = samples;
        buf.addr = addr;
    }

    /// Marks a boot buffer as taking part in a DMA transfer.
    pub fn set_boot_buffer_busy(&self, index: usize, busy: bool) {
        self.state.borrow_mut().bootbufs[index].busy = busy;
    }

    /// Makes boot buffer reallocation fail.
    pub fn set_realloc_fails(&self, fails: bool) {
        self.state.borrow_mut().realloc_fails = fails;
    }

    /// Returns the size of a boot buffer as currently allocated by the driver.
    pub fn boot_buffer_samples(&self, index: usize) -> u32 {
        self.state.borrow().bootbufs[index].samples
    }

    /// Sets the IDCODEs of the devices on the JTAG chain, the device closest to TDI first.
    ///
    /// A code of 0 stands for a device without an IDCODE register.
    pub fn set_idcodes(&self, codes: Vec<u32>) {
        self.state.borrow_mut().idcodes = codes;
    }

    /// Makes the board refuse every JTAG session request, as if another process held it.
    pub fn set_jtag_refused(&self, refused: bool) {
        self.state.borrow_mut().jtag_grant_refused = refused;
    }

    /// Returns the handle currently owning the JTAG session.
    pub fn jtag_owner(&self) -> Option<u32> {
        self.state.borrow().jtag_owner
    }

    /// Returns the current JTAG line levels.
    pub fn jtag_lines(&self) -> JtagLines {
        self.state.borrow().lines
    }

    /// Returns the current state of the TAP controllers.
    pub fn tap_state(&self) -> TapState {
        self.state.borrow().tap
    }

    /// Returns the number of bits moved through bulk shift requests.
    pub fn streamed_bits(&self) -> u64 {
        self.state.borrow().streamed_bits
    }

    /// Returns the total time spent in driver delays.
    pub fn delayed_us(&self) -> u64 {
        self.state.borrow().delayed_us
    }
}

impl Default for SimBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SimBoard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("SimBoard")
            .field("kind", &state.kind)
            .field("live_buffers", &state.buffers.len())
            .field("jtag_owner", &state.jtag_owner)
            .finish()
    }
}

/// A handle on a [`SimBoard`](struct.SimBoard.html).
pub struct SimulatedGateway {
    state: Rc<RefCell<BoardState>>,
    handle: u32,
}

impl SimulatedGateway {
    /// Returns this handle's identifier on its board.
    pub fn handle_id(&self) -> u32 {
        self.handle
    }
}

impl Gateway for SimulatedGateway {
    fn kind(&self) -> DeviceKind {
        self.state.borrow().kind
    }

    fn dma_alloc(&self, bytes: u32) -> Result<u64> {
        let mut state = self.state.borrow_mut();
        state.alloc_requests.push(bytes);

        if state.fail_next_allocs > 0 {
            state.fail_next_allocs -= 1;
            return Err(Error::new(ErrorKind::DmaBufAllocFail, "simulated allocation failure"));
        }
        if let Some(max) = state.max_alloc_bytes {
            if bytes > max {
                return Err(Error::new(
                    ErrorKind::DmaBufAllocFail,
                    format!("no contiguous region of {} bytes", bytes),
                ));
            }
        }

        if let Some(limit) = state.memory_limit {
            let used: u64 = state.buffers.values().map(|&(_, b)| u64::from(b)).sum();
            if used + u64::from(bytes) > limit {
                return Err(Error::new(
                    ErrorKind::DmaBufAllocFail,
                    format!("{} bytes exceed the remaining DMA memory", bytes),
                ));
            }
        }

        let addr = state.map_addr(bytes);
        state.buffers.insert(addr, (self.handle, bytes));
        trace!("sim: allocated {} bytes at {:#x}", bytes, addr);
        Ok(addr)
    }

    fn dma_map(&self, driver_addr: u64, _bytes: u32) -> Result<PlatformAddress> {
        if self.state.borrow().fail_map {
            return Err(Error::new(ErrorKind::Generic, "simulated mapping failure"));
        }
        PlatformAddress::from_driver(driver_addr)?
            .ok_or_else(|| Error::new(ErrorKind::Generic, "null buffer address"))
    }

    fn dma_free(&self, addr: u64) -> Result<()> {
        let mut state = self.state.borrow_mut();
        match state.buffers.get(&addr) {
            Some(&(owner, _)) if owner == self.handle => {
                state.buffers.remove(&addr);
                trace!("sim: freed {:#x}", addr);
                Ok(())
            }
            _ => Err(Error::new(
                ErrorKind::InvalidArg,
                format!("{:#x} is not a DMA buffer of this handle", addr),
            )),
        }
    }

    fn dma_free_all(&self) -> Result<()> {
        let handle = self.handle;
        self.state
            .borrow_mut()
            .buffers
            .retain(|_, &mut (owner, _)| owner != handle);
        Ok(())
    }

    fn bootbuf_ctrl(&self, req: &mut BootBufRequest) -> Result<()> {
        let mut state = self.state.borrow_mut();
        match req.op {
            BootBufOp::CheckOut | BootBufOp::Query => {
                let index = usize::from(req.index);
                let buf = state
                    .bootbufs
                    .get_mut(index)
                    .ok_or_else(|| Error::new(ErrorKind::OutOfBounds, "boot buffer index"))?;
                if req.op == BootBufOp::Query {
                    req.samples = buf.samples;
                    req.addr = if buf.owner.is_some() { buf.addr } else { 0 };
                    return Ok(());
                }
                if buf.samples == 0 {
                    return Err(Error::new(
                        ErrorKind::BufferNotAllocated,
                        "boot buffer was not allocated",
                    ));
                }
                match buf.owner {
                    Some(owner) if owner != self.handle => {
                        return Err(Error::new(
                            ErrorKind::BufferCheckedOut,
                            "boot buffer is checked out by another handle",
                        ));
                    }
                    _ => buf.owner = Some(self.handle),
                }
                req.samples = buf.samples;
                req.addr = buf.addr;
                Ok(())
            }
            BootBufOp::CheckIn => {
                let handle = self.handle;
                let buf = state
                    .bootbufs
                    .iter_mut()
                    .find(|b| b.addr != 0 && b.addr == req.addr && b.owner == Some(handle))
                    .ok_or_else(|| {
                        Error::new(ErrorKind::InvalidArg, "address is not a checked out boot buffer")
                    })?;
                if buf.busy {
                    return Err(Error::new(ErrorKind::Busy, "boot buffer is in use for DMA"));
                }
                buf.owner = None;
                Ok(())
            }
            BootBufOp::Realloc => {
                if state.bootbufs.iter().any(|b| b.owner.is_some()) {
                    return Err(Error::new(ErrorKind::Busy, "a boot buffer is checked out"));
                }
                if state.realloc_fails {
                    return Err(Error::new(
                        ErrorKind::DmaBufAllocFail,
                        "boot buffer could not be sized as requested",
                    ));
                }
                for index in 0..BOOT_BUFFER_COUNT {
                    let base = crate::eeprom::EA_BOOTBUF_BASE as usize + index * 2;
                    let bytes =
                        u32::from(state.eeprom[base]) | (u32::from(state.eeprom[base + 1]) << 16);
                    let samples = bytes / 2;
                    if samples != state.bootbufs[index].samples {
                        let addr = if samples == 0 { 0 } else { state.map_addr(bytes) };
                        state.bootbufs[index].samples = samples;
                        state.bootbufs[index].addr = addr;
                    }
                }
                Ok(())
            }
        }
    }

    fn jtag_io(&self, io: JtagIo) -> Result<u32> {
        let mut state = self.state.borrow_mut();

        if io.flags.contains(JtagIoFlags::START_SESSION) {
            let granted = !state.jtag_grant_refused
                && (state.jtag_owner.is_none() || state.jtag_owner == Some(self.handle));
            if granted {
                state.jtag_owner = Some(self.handle);
            }
            return Ok(granted as u32);
        }
        if io.flags.contains(JtagIoFlags::END_SESSION) {
            if state.jtag_owner == Some(self.handle) {
                state.jtag_owner = None;
            }
            return Ok(1);
        }
        if state.jtag_owner != Some(self.handle) && !state.kind.is_virtual() {
            return Err(Error::new(ErrorKind::JtagIo, "JTAG session not owned"));
        }

        if io.flags.contains(JtagIoFlags::PULSE_TCK_LOOP) {
            let tms = state.lines.contains(JtagLines::TMS);
            let tdi = state.lines.contains(JtagLines::TDI);
            for _ in 0..io.value {
                state.clock(tms, tdi);
            }
            return Ok(0);
        }

        let mask = JtagLines::from_bits_truncate(io.mask) - JtagLines::TDO;
        let value = JtagLines::from_bits_truncate(io.value);
        state.lines = (state.lines - mask) | (value & mask);

        let mut tdo = state.tdo();
        if io.flags.contains(JtagIoFlags::PULSE_TCK) {
            let tms = state.lines.contains(JtagLines::TMS);
            let tdi = state.lines.contains(JtagLines::TDI);
            tdo = state.clock(tms, tdi);
        }

        if io.flags.contains(JtagIoFlags::POST_READ) {
            let mut lines = state.lines;
            lines.set(JtagLines::TDO, tdo);
            Ok(lines.bits())
        } else {
            Ok(0)
        }
    }

    fn jtag_stream(&self, flags: StreamFlags, bits: u32, data: &mut [u8]) -> Result<()> {
        if data.len() < stream_bytes(bits) {
            return Err(Error::new(ErrorKind::InvalidArg, "stream buffer too small"));
        }
        let mut state = self.state.borrow_mut();
        if state.jtag_owner != Some(self.handle) && !state.kind.is_virtual() {
            return Err(Error::new(ErrorKind::JtagIo, "JTAG session not owned"));
        }

        for i in 0..bits as usize {
            let (byte, bit) = (i / 8, i % 8);
            let tdi = flags.contains(StreamFlags::WRITE_TDI) && data[byte] & (1 << bit) != 0;
            let last = i + 1 == bits as usize;
            let tms = last && flags.contains(StreamFlags::EXIT_SHIFT);
            let tdo = state.clock(tms, tdi);
            if flags.contains(StreamFlags::READ_TDO) {
                if tdo {
                    data[byte] |= 1 << bit;
                } else {
                    data[byte] &= !(1 << bit);
                }
            }
        }
        state.lines.set(JtagLines::TMS, flags.contains(StreamFlags::EXIT_SHIFT));
        state.streamed_bits += u64::from(bits);
        Ok(())
    }

    fn eeprom_read(&self, addr: u16) -> Result<u16> {
        self.state
            .borrow()
            .eeprom
            .get(usize::from(addr))
            .copied()
            .ok_or_else(|| Error::new(ErrorKind::OutOfBounds, "EEPROM address"))
    }

    fn eeprom_write(&self, addr: u16, value: u16) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let word = state
            .eeprom
            .get_mut(usize::from(addr))
            .ok_or_else(|| Error::new(ErrorKind::OutOfBounds, "EEPROM address"))?;
        *word = value;
        state.eeprom_writes.push((addr, value));
        Ok(())
    }

    fn reset_eeprom_checksum(&self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.checksum_resets += 1;
        if state.kind.is_virtual() {
            return Ok(());
        }
        let sum = state.eeprom[..usize::from(EEPROM_CHECKSUM_WORDS)]
            .iter()
            .fold(0u16, |acc, w| acc.wrapping_add(*w));
        state.eeprom[usize::from(EEPROM_CHECKSUM_WORDS)] = sum;
        Ok(())
    }

    fn delay_us(&self, us: u32) -> Result<()> {
        self.state.borrow_mut().delayed_us += u64::from(us);
        Ok(())
    }
}

impl Drop for SimulatedGateway {
    fn drop(&mut self) {
        let handle = self.handle;
        let mut state = self.state.borrow_mut();
        for buf in state.bootbufs.iter_mut() {
            if buf.owner == Some(handle) {
                buf.owner = None;
            }
        }
        if state.jtag_owner == Some(handle) {
            state.jtag_owner = None;
        }
        state.buffers.retain(|_, &mut (owner, _)| owner != handle);
        debug!("sim: closed handle {}", handle);
    }
}

impl fmt::Debug for SimulatedGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedGateway")
            .field("handle", &self.handle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn io(value: JtagLines, mask: JtagLines, flags: JtagIoFlags) -> JtagIo {
        JtagIo {
            value: value.bits(),
            mask: mask.bits(),
            flags,
        }
    }

    #[test]
    fn tap_shifts_out_idcodes() {
        let board = SimBoard::new();
        board.set_idcodes(vec![0x0000_0001, 0xA5A5_5A5B]);
        let gw = board.open();

        assert_eq!(gw.jtag_io(io(JtagLines::empty(), JtagLines::empty(), JtagIoFlags::START_SESSION)).unwrap(), 1);

        gw.jtag_io(io(JtagLines::TMS, JtagLines::TMS, JtagIoFlags::empty()))
            .unwrap();
        gw.jtag_io(JtagIo {
            value: 5,
            mask: 0,
            flags: JtagIoFlags::PULSE_TCK_LOOP,
        })
        .unwrap();
        assert_eq!(board.tap_state(), TapState::Reset);

        for &tms in &[false, true, false, false] {
            let v = if tms { JtagLines::TMS } else { JtagLines::empty() };
            gw.jtag_io(io(v, JtagLines::TMS, JtagIoFlags::PULSE_TCK)).unwrap();
        }
        assert_eq!(board.tap_state(), TapState::ShiftDr);

        let mut data = [0u8; 8];
        gw.jtag_stream(StreamFlags::READ_TDO, 64, &mut data).unwrap();
        // device closest to TDO comes out first
        assert_eq!(u32::from_le_bytes([data[0], data[1], data[2], data[3]]), 0xA5A5_5A5B);
        assert_eq!(u32::from_le_bytes([data[4], data[5], data[6], data[7]]), 1);
    }

    #[test]
    fn drop_releases_handle_resources() {
        let board = SimBoard::new();
        board.set_boot_buffer(1, 1024);
        {
            let gw = board.open();
            gw.dma_alloc(4096).unwrap();
            let mut req = BootBufRequest::new(BootBufOp::CheckOut);
            req.index = 1;
            gw.bootbuf_ctrl(&mut req).unwrap();
            assert_eq!(req.samples, 1024);
            assert_eq!(board.live_buffers(), 1);
        }
        assert_eq!(board.live_buffers(), 0);

        let gw = board.open();
        let mut req = BootBufRequest::new(BootBufOp::Query);
        req.index = 1;
        gw.bootbuf_ctrl(&mut req).unwrap();
        assert_eq!(req.addr, 0);
    }

    #[test]
    fn checksum_covers_words_below_checksum_address() {
        let board = SimBoard::new();
        board.set_eeprom(0x10, 0xFFFF);
        board.set_eeprom(0x11, 0x0003);
        let gw = board.open();
        gw.reset_eeprom_checksum().unwrap();
        assert_eq!(board.eeprom(0x7F), 0x0002);
        assert_eq!(board.checksum_resets(), 1);
        assert!(board.eeprom_writes().is_empty());
    }
}
