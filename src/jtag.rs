//! Bit-level access to the board's JTAG chain.

use crate::error::{Error, ErrorKind};
use crate::gateway::{stream_bytes, Gateway, JtagIo, JtagIoFlags, JtagLines, StreamFlags};
use crate::{DeviceSession, Result};
use log::{trace, warn};
use std::fmt;

impl<G: Gateway> DeviceSession<G> {
    /// Drives the JTAG lines selected by `mask` to `value`.
    pub fn write_jtag(&self, value: JtagLines, mask: JtagLines, flags: JtagIoFlags) -> Result<()> {
        trace!("JTAG write {:?} mask {:?} {:?}", value, mask, flags);
        self.gateway.jtag_io(JtagIo {
            value: value.bits(),
            mask: mask.bits(),
            flags,
        })?;
        Ok(())
    }

    /// Reads the JTAG lines (after performing `flags`, eg. a clock pulse).
    pub fn read_jtag(&self, flags: JtagIoFlags) -> Result<JtagLines> {
        let raw = self.gateway.jtag_io(JtagIo {
            value: 0,
            mask: 0,
            flags: flags | JtagIoFlags::POST_READ,
        })?;
        let lines = JtagLines::from_bits_warn(raw);
        trace!("JTAG read {:?}", lines);
        Ok(lines)
    }

    /// Pulses TCK `count` times in the driver without changing TMS or TDI.
    pub fn pulse_tck(&self, count: u32) -> Result<()> {
        self.gateway.jtag_io(JtagIo {
            value: count,
            mask: 0,
            flags: JtagIoFlags::PULSE_TCK_LOOP,
        })?;
        Ok(())
    }

    /// Claims (`enable = true`) or releases exclusive use of the JTAG interface.
    ///
    /// Returns whether the request was granted. Virtual devices grant every request.
    pub fn jtag_session_ctrl(&self, enable: bool) -> Result<bool> {
        let flags = if enable {
            JtagIoFlags::START_SESSION
        } else {
            JtagIoFlags::END_SESSION
        };
        let granted = self.gateway.jtag_io(JtagIo {
            value: 0,
            mask: 0,
            flags,
        })? != 0;
        let granted = granted || self.is_virtual();
        trace!("JTAG session {}: granted={}", if enable { "start" } else { "end" }, granted);
        Ok(granted)
    }

    /// Shifts `bits` bits through the chain in a single driver request.
    ///
    /// Bits are taken from `tdi` (LSB of byte 0 first) if given, otherwise TDI is held low.
    /// Captured TDO bits are stored in `tdo` if given. Both buffers must hold at least
    /// `ceil(bits / 8)` bytes. With `exit_shift`, TMS is raised with the last bit.
    ///
    /// Virtual devices do not produce TDO data; `tdo` is zeroed.
    pub fn shift_stream(
        &self,
        bits: u32,
        tdi: Option<&[u8]>,
        tdo: Option<&mut [u8]>,
        exit_shift: bool,
    ) -> Result<()> {
        let n_bytes = stream_bytes(bits);
        let mut flags = StreamFlags::empty();
        flags.set(StreamFlags::WRITE_TDI, tdi.is_some());
        flags.set(StreamFlags::READ_TDO, tdo.is_some());
        flags.set(StreamFlags::EXIT_SHIFT, exit_shift);

        let mut buf = vec![0u8; n_bytes];
        if let Some(tdi) = tdi {
            let src = tdi.get(..n_bytes).ok_or_else(|| {
                Error::new(ErrorKind::InvalidArg, "TDI buffer shorter than bit count")
            })?;
            buf.copy_from_slice(src);
        }

        trace!("JTAG stream {} bits {:?}", bits, flags);
        self.gateway.jtag_stream(flags, bits, &mut buf)?;

        if let Some(tdo) = tdo {
            let dst = tdo.get_mut(..n_bytes).ok_or_else(|| {
                Error::new(ErrorKind::InvalidArg, "TDO buffer shorter than bit count")
            })?;
            if self.is_virtual() {
                dst.iter_mut().for_each(|b| *b = 0);
            } else {
                dst.copy_from_slice(&buf);
            }
        }
        Ok(())
    }

    /// Claims the JTAG interface and hands JTAG control to the host.
    ///
    /// The returned guard releases control and the session when dropped, also on error paths.
    /// Fails with `JtagIo` if another owner holds the interface.
    pub fn claim_jtag(&self) -> Result<JtagClaim<'_, G>> {
        if !self.jtag_session_ctrl(true)? {
            return Err(Error::new(
                ErrorKind::JtagIo,
                "JTAG interface is in use by another owner",
            ));
        }
        let claim = JtagClaim { session: self };
        self.write_jtag(JtagLines::CTRL, JtagLines::CTRL, JtagIoFlags::empty())?;
        Ok(claim)
    }
}

/// Exclusive use of a session's JTAG interface.
///
/// Created by [`DeviceSession::claim_jtag`]. Dropping the claim leaves TCK high, returns JTAG
/// control to the board and ends the session.
///
/// [`DeviceSession::claim_jtag`]: struct.DeviceSession.html#method.claim_jtag
pub struct JtagClaim<'a, G: Gateway> {
    session: &'a DeviceSession<G>,
}

impl<'a, G: Gateway> JtagClaim<'a, G> {
    pub fn session(&self) -> &'a DeviceSession<G> {
        self.session
    }
}

impl<G: Gateway> Drop for JtagClaim<'_, G> {
    fn drop(&mut self) {
        let s = self.session;
        let res = s
            .write_jtag(JtagLines::TCK, JtagLines::TCK, JtagIoFlags::empty())
            .and_then(|_| s.write_jtag(JtagLines::empty(), JtagLines::CTRL, JtagIoFlags::empty()))
            .and_then(|_| s.jtag_session_ctrl(false).map(drop));
        if let Err(e) = res {
            warn!("failed to release JTAG interface: {}", e);
        }
    }
}

impl<G: Gateway> fmt::Debug for JtagClaim<'_, G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JtagClaim").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimBoard;

    #[test]
    fn claim_is_exclusive_and_released() {
        let board = SimBoard::new();
        let a = DeviceSession::new(board.open());
        let b = DeviceSession::new(board.open());

        {
            let _claim = a.claim_jtag().unwrap();
            assert!(board.jtag_lines().contains(JtagLines::CTRL));
            assert_eq!(b.claim_jtag().unwrap_err().kind(), ErrorKind::JtagIo);
        }
        assert_eq!(board.jtag_owner(), None);
        assert!(!board.jtag_lines().contains(JtagLines::CTRL));
        assert!(board.jtag_lines().contains(JtagLines::TCK));

        let _claim = b.claim_jtag().unwrap();
    }

    #[test]
    fn virtual_devices_always_grant() {
        let board = SimBoard::new_virtual();
        board.set_jtag_refused(true);
        let session = DeviceSession::new(board.open());
        assert!(session.jtag_session_ctrl(true).unwrap());
    }

    #[test]
    fn stream_checks_buffer_sizes() {
        let board = SimBoard::new();
        let session = DeviceSession::new(board.open());
        let _claim = session.claim_jtag().unwrap();

        let err = session
            .shift_stream(17, Some(&[0u8; 2]), None, false)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArg);

        let mut tdo = [0xFFu8; 3];
        session
            .shift_stream(17, Some(&[0xAA, 0x55, 0x01]), Some(&mut tdo), true)
            .unwrap();
        assert_eq!(board.streamed_bits(), 17);
    }
}
