//! Process-space addresses handed out by the driver.

use crate::error::{Error, ErrorKind};
use crate::Result;
use std::fmt;

/// Pointer width of an address.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AddressWidth {
    /// 32-bit address.
    Bits32,
    /// 64-bit address.
    Bits64,
}

impl AddressWidth {
    /// Returns the width of `usize` on the host.
    pub fn native() -> Self {
        if cfg!(target_pointer_width = "64") {
            AddressWidth::Bits64
        } else {
            AddressWidth::Bits32
        }
    }

    fn max(self) -> u64 {
        match self {
            AddressWidth::Bits32 => u64::from(u32::MAX),
            AddressWidth::Bits64 => u64::MAX,
        }
    }
}

/// An address in the calling process, as returned by the driver.
///
/// The driver transports addresses as 64-bit integers regardless of the process's pointer width.
/// A `PlatformAddress` is only created after checking that the value fits the width of the
/// process it is meant for, so converting it to a `usize` or a raw pointer cannot truncate.
///
/// A null address is represented by `Option<PlatformAddress>::None`, never by a
/// `PlatformAddress` of 0.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct PlatformAddress {
    raw: u64,
    width: AddressWidth,
}

impl PlatformAddress {
    /// Validates a raw address returned by the driver against the host pointer width.
    ///
    /// Returns `Ok(None)` for a null address.
    pub fn from_driver(raw: u64) -> Result<Option<Self>> {
        Self::with_width(raw, AddressWidth::native())
    }

    /// Validates a raw address against an explicit pointer width.
    pub fn with_width(raw: u64, width: AddressWidth) -> Result<Option<Self>> {
        if raw == 0 {
            return Ok(None);
        }
        if raw > width.max() {
            return Err(Error::new(
                ErrorKind::InvalidArg,
                format!("address {:#x} does not fit a {:?} address space", raw, width),
            ));
        }
        Ok(Some(Self { raw, width }))
    }

    /// Returns the address as transported to and from the driver.
    pub fn raw(&self) -> u64 {
        self.raw
    }

    /// Returns the pointer width this address was validated against.
    pub fn width(&self) -> AddressWidth {
        self.width
    }

    /// Returns the address as a `usize`, if it fits the host.
    pub fn as_usize(&self) -> Option<usize> {
        use std::convert::TryFrom;
        usize::try_from(self.raw).ok()
    }

    /// Returns the address as a raw pointer to samples.
    ///
    /// Dereferencing the pointer is only sound while the buffer it belongs to is allocated (or
    /// checked out) by this process.
    pub fn as_mut_ptr(&self) -> Option<*mut u16> {
        self.as_usize().map(|a| a as *mut u16)
    }
}

impl fmt::Debug for PlatformAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_is_none() {
        assert_eq!(PlatformAddress::from_driver(0).unwrap(), None);
    }

    #[test]
    fn width_is_checked() {
        let a = PlatformAddress::with_width(0xFFFF_F000, AddressWidth::Bits32)
            .unwrap()
            .unwrap();
        assert_eq!(a.raw(), 0xFFFF_F000);
        assert_eq!(a.width(), AddressWidth::Bits32);

        let err = PlatformAddress::with_width(0x1_0000_0000, AddressWidth::Bits32).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArg);

        assert!(PlatformAddress::with_width(0x1_0000_0000, AddressWidth::Bits64)
            .unwrap()
            .is_some());
    }

    #[test]
    fn addresses_key_by_value_and_width() {
        use std::collections::HashSet;

        let narrow = PlatformAddress::with_width(0x1000, AddressWidth::Bits32)
            .unwrap()
            .unwrap();
        let wide = PlatformAddress::with_width(0x1000, AddressWidth::Bits64)
            .unwrap()
            .unwrap();
        assert_ne!(narrow, wide);

        let set: HashSet<_> = [narrow, wide, narrow].iter().copied().collect();
        assert_eq!(set.len(), 2);
        assert_eq!(format!("{:?}", narrow), "0x1000");
    }
}
