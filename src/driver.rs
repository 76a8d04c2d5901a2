//! Gateway to the Linux kernel driver (`/dev/sig_px14400N`).

use crate::addr::PlatformAddress;
use crate::error::{Error, ErrorKind, ResultExt as _};
use crate::gateway::{
    stream_bytes, BootBufRequest, Gateway, JtagIo, StreamFlags, FREE_ALL_SENTINEL,
};
use crate::Result;
use byteorder::{ByteOrder, NativeEndian};
use log::{debug, trace};
use nix::sys::mman::{mmap, MapFlags, ProtFlags};
use nix::{ioctl_read, ioctl_readwrite};
use std::convert::TryFrom;
use std::fs::{File, OpenOptions};
use std::mem::{self, MaybeUninit};
use std::num::NonZeroUsize;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fmt, thread};

const PX14IOC_MAGIC: u8 = 0x14;

/// Settle time the driver needs between two JTAG I/O requests.
const JTAG_IO_SETTLE: Duration = Duration::from_micros(20);

#[repr(C)]
#[derive(Debug, Default)]
struct DmaAllocReq {
    struct_size: u32,
    req_bytes: u32,
    virt_addr: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct DmaFreeReq {
    struct_size: u32,
    free_all: u32,
    virt_addr: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct EepromIoReq {
    struct_size: u32,
    read: i32,
    eeprom_addr: u32,
    eeprom_val: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct JtagIoReq {
    struct_size: u32,
    val_w: u32,
    mask_w: u32,
    val_r: u32,
    flags: u32,
}

/// Fixed part of a bulk shift request. The data bytes follow immediately.
#[repr(C)]
#[derive(Debug, Default)]
struct JtagStreamHeader {
    struct_size: u32,
    flags: u32,
    n_bits: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct BootBufCtrlReq {
    struct_size: u32,
    operation: u16,
    buf_idx: u16,
    buf_samples: u32,
    reserved: u32,
    virt_addr: u64,
}

ioctl_read!(px14_driver_version, PX14IOC_MAGIC, 1, u64);
ioctl_readwrite!(px14_dma_buffer_alloc, PX14IOC_MAGIC, 2, DmaAllocReq);
ioctl_readwrite!(px14_dma_buffer_free, PX14IOC_MAGIC, 3, DmaFreeReq);
ioctl_readwrite!(px14_eeprom_io, PX14IOC_MAGIC, 4, EepromIoReq);
ioctl_readwrite!(px14_jtag_io, PX14IOC_MAGIC, 13, JtagIoReq);
ioctl_readwrite!(px14_us_delay, PX14IOC_MAGIC, 14, u32);
ioctl_readwrite!(px14_jtag_stream, PX14IOC_MAGIC, 15, JtagStreamHeader);
ioctl_read!(px14_bootbuf_ctrl, PX14IOC_MAGIC, 24, BootBufCtrlReq);

fn struct_size<T>() -> u32 {
    mem::size_of::<T>() as u32
}

/// Turns the value returned by the driver into a `Result`.
///
/// The driver reports failures either through `errno` or by returning the positive magnitude of
/// a status code.
fn check(res: nix::Result<i32>, what: &'static str) -> Result<()> {
    match res.px14_err_while(what)? {
        0 => Ok(()),
        n => Err(Error::from_status(-n, what)),
    }
}

/// A handle on a locally attached board, opened through its device node.
pub struct DriverGateway {
    file: File,
    path: PathBuf,
}

impl DriverGateway {
    /// Opens board number `index` (as enumerated by the driver).
    pub fn open_index(index: u32) -> Result<Self> {
        Self::open(format!("/dev/sig_px14400{}", index))
    }

    /// Opens the board behind a device node.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("opening PX14400 device {}", path.display());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .px14_err_while("opening PX14400 device node")?;

        Ok(Self {
            file,
            path: path.to_owned(),
        })
    }

    /// Returns the 64-bit packed version of the kernel driver.
    pub fn driver_version(&self) -> Result<u64> {
        // SAFETY: the descriptor is valid for the lifetime of `self.file` and the driver writes a
        // single `u64`.
        let ver = unsafe {
            let mut ver = MaybeUninit::<u64>::zeroed();
            check(
                px14_driver_version(self.file.as_raw_fd(), ver.as_mut_ptr()),
                "reading driver version",
            )?;
            ver.assume_init()
        };
        Ok(ver)
    }

    fn free_request(&self, free_all: u32, addr: u64) -> Result<()> {
        let mut req = DmaFreeReq {
            struct_size: struct_size::<DmaFreeReq>(),
            free_all,
            virt_addr: addr,
        };
        // SAFETY: `req` is a properly sized request structure that outlives the call.
        check(
            unsafe { px14_dma_buffer_free(self.file.as_raw_fd(), &mut req) },
            "freeing DMA buffer",
        )
    }
}

impl Gateway for DriverGateway {
    fn dma_alloc(&self, bytes: u32) -> Result<u64> {
        let mut req = DmaAllocReq {
            struct_size: struct_size::<DmaAllocReq>(),
            req_bytes: bytes,
            virt_addr: 0,
        };
        // SAFETY: `req` is a properly sized request structure that outlives the call.
        check(
            unsafe { px14_dma_buffer_alloc(self.file.as_raw_fd(), &mut req) },
            "allocating DMA buffer",
        )?;
        if req.virt_addr == 0 {
            return Err(Error::new(
                ErrorKind::DmaBufAllocFail,
                "driver returned a null DMA buffer",
            ));
        }
        trace!("driver allocated {} bytes at {:#x}", bytes, req.virt_addr);
        Ok(req.virt_addr)
    }

    fn dma_map(&self, driver_addr: u64, bytes: u32) -> Result<PlatformAddress> {
        let length = usize::try_from(bytes)
            .ok()
            .and_then(NonZeroUsize::new)
            .ok_or_else(|| Error::new(ErrorKind::InvalidArg, "cannot map an empty buffer"))?;
        let offset = nix::libc::off_t::try_from(driver_addr)
            .map_err(|_| Error::new(ErrorKind::Generic, "driver address out of range"))?;

        // SAFETY: the kernel driver identifies the buffer by the offset and backs the whole
        // mapping; nothing else aliases the new mapping yet.
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &self.file,
                offset,
            )
        }
        .px14_err_while("mapping DMA buffer")?;

        PlatformAddress::from_driver(ptr.as_ptr() as usize as u64)?
            .ok_or_else(|| Error::new(ErrorKind::Generic, "mmap returned null"))
    }

    fn dma_free(&self, addr: u64) -> Result<()> {
        self.free_request(!FREE_ALL_SENTINEL, addr)
    }

    fn dma_free_all(&self) -> Result<()> {
        self.free_request(FREE_ALL_SENTINEL, 0)
    }

    fn bootbuf_ctrl(&self, req: &mut BootBufRequest) -> Result<()> {
        let mut raw = BootBufCtrlReq {
            struct_size: struct_size::<BootBufCtrlReq>(),
            operation: req.op as u16,
            buf_idx: req.index,
            buf_samples: req.samples,
            reserved: 0,
            virt_addr: req.addr,
        };
        // SAFETY: `raw` is a properly sized request structure that outlives the call.
        check(
            unsafe { px14_bootbuf_ctrl(self.file.as_raw_fd(), &mut raw) },
            "controlling boot buffer",
        )?;
        req.samples = raw.buf_samples;
        req.addr = raw.virt_addr;
        Ok(())
    }

    fn jtag_io(&self, io: JtagIo) -> Result<u32> {
        thread::sleep(JTAG_IO_SETTLE);

        let mut req = JtagIoReq {
            struct_size: struct_size::<JtagIoReq>(),
            val_w: io.value,
            mask_w: io.mask,
            val_r: 0,
            flags: io.flags.bits(),
        };
        // SAFETY: `req` is a properly sized request structure that outlives the call.
        check(
            unsafe { px14_jtag_io(self.file.as_raw_fd(), &mut req) },
            "performing JTAG I/O",
        )?;
        Ok(req.val_r)
    }

    fn jtag_stream(&self, flags: StreamFlags, bits: u32, data: &mut [u8]) -> Result<()> {
        let n_bytes = stream_bytes(bits);
        if data.len() < n_bytes {
            return Err(Error::new(ErrorKind::InvalidArg, "stream buffer too small"));
        }

        // Header words followed by the payload, padded to whole words so the request can be
        // built in a `u32` buffer with the header's alignment.
        const HEADER_WORDS: usize = 3;
        let payload_words = (n_bytes + 3) / 4;
        let mut words = vec![0u32; HEADER_WORDS + payload_words];
        words[0] = struct_size::<JtagStreamHeader>() + n_bytes as u32;
        words[1] = flags.bits();
        words[2] = bits;
        let mut padded = vec![0u8; payload_words * 4];
        padded[..n_bytes].copy_from_slice(&data[..n_bytes]);
        NativeEndian::read_u32_into(&padded, &mut words[HEADER_WORDS..]);

        // SAFETY: `words` starts with a `JtagStreamHeader` and holds the `n_bytes` data bytes the
        // header announces; it outlives the call.
        check(
            unsafe {
                px14_jtag_stream(
                    self.file.as_raw_fd(),
                    words.as_mut_ptr() as *mut JtagStreamHeader,
                )
            },
            "streaming JTAG data",
        )?;

        if flags.contains(StreamFlags::READ_TDO) {
            NativeEndian::write_u32_into(&words[HEADER_WORDS..], &mut padded);
            data[..n_bytes].copy_from_slice(&padded[..n_bytes]);
        }
        Ok(())
    }

    fn eeprom_read(&self, addr: u16) -> Result<u16> {
        let mut req = EepromIoReq {
            struct_size: struct_size::<EepromIoReq>(),
            read: 1,
            eeprom_addr: u32::from(addr),
            eeprom_val: 0,
        };
        // SAFETY: `req` is a properly sized request structure that outlives the call.
        check(
            unsafe { px14_eeprom_io(self.file.as_raw_fd(), &mut req) },
            "reading EEPROM",
        )?;
        Ok(req.eeprom_val as u16)
    }

    fn eeprom_write(&self, addr: u16, value: u16) -> Result<()> {
        let mut req = EepromIoReq {
            struct_size: struct_size::<EepromIoReq>(),
            read: 0,
            eeprom_addr: u32::from(addr),
            eeprom_val: u32::from(value),
        };
        // SAFETY: `req` is a properly sized request structure that outlives the call.
        check(
            unsafe { px14_eeprom_io(self.file.as_raw_fd(), &mut req) },
            "writing EEPROM",
        )
    }

    fn delay_us(&self, us: u32) -> Result<()> {
        let mut us = us;
        // SAFETY: the driver reads and writes back a single `u32`.
        check(
            unsafe { px14_us_delay(self.file.as_raw_fd(), &mut us) },
            "waiting in driver",
        )
    }
}

impl fmt::Debug for DriverGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverGateway")
            .field("path", &self.path)
            .finish()
    }
}
