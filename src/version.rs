//! Packed `a.b.c.d` version numbers.
//!
//! Two encodings are in use:
//!
//! * 32-bit versions (firmware chunk and package versions, hardware revision bounds) store one
//!   component per byte, `a` in the most significant byte. Each component is in `0..=255`.
//! * 64-bit versions (software release versions, hardware revisions) store one component per
//!   16-bit word, `a` in the most significant word. Each component is in `0..=65535`.

/// Packs four components into a 32-bit version.
pub fn ver32(a: u8, b: u8, c: u8, d: u8) -> u32 {
    u32::from_be_bytes([a, b, c, d])
}

/// Packs four components into a 64-bit version.
pub fn ver64(a: u16, b: u16, c: u16, d: u16) -> u64 {
    (u64::from(a) << 48) | (u64::from(b) << 32) | (u64::from(c) << 16) | u64::from(d)
}

/// Formats a 32-bit version as `a.b.c.d`.
pub fn format_ver32(ver: u32) -> String {
    let [a, b, c, d] = ver.to_be_bytes();
    format!("{}.{}.{}.{}", a, b, c, d)
}

/// Formats a 64-bit version as `a.b.c.d`.
pub fn format_ver64(ver: u64) -> String {
    format!(
        "{}.{}.{}.{}",
        (ver >> 48) & 0xFFFF,
        (ver >> 32) & 0xFFFF,
        (ver >> 16) & 0xFFFF,
        ver & 0xFFFF
    )
}

/// Parses an `a.b.c.d` string into a 32-bit version.
///
/// Returns `None` unless the string has exactly four dot-separated decimal components, each in
/// `0..=255`. Whitespace is not allowed anywhere in the string.
pub fn parse_ver32(s: &str) -> Option<u32> {
    let c = parse_components(s, 0xFF)?;
    Some(ver32(c[0] as u8, c[1] as u8, c[2] as u8, c[3] as u8))
}

/// Parses an `a.b.c.d` string into a 64-bit version.
///
/// Same rules as [`parse_ver32`], with components in `0..=65535`.
///
/// [`parse_ver32`]: fn.parse_ver32.html
pub fn parse_ver64(s: &str) -> Option<u64> {
    let c = parse_components(s, 0xFFFF)?;
    Some(ver64(c[0] as u16, c[1] as u16, c[2] as u16, c[3] as u16))
}

fn parse_components(s: &str, max: u32) -> Option<[u32; 4]> {
    let mut out = [0; 4];
    let mut parts = s.split('.');
    for slot in out.iter_mut() {
        let part = parts.next()?;
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        // Long digit strings overflow `u32`, which is out of range anyway.
        let value = part.parse::<u32>().ok()?;
        if value > max {
            return None;
        }
        *slot = value;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ver32_roundtrip() {
        for &(a, b, c, d) in &[(0, 0, 0, 0), (1, 2, 3, 4), (255, 255, 255, 255), (2, 0, 0, 0)] {
            let packed = ver32(a, b, c, d);
            let s = format_ver32(packed);
            assert_eq!(s, format!("{}.{}.{}.{}", a, b, c, d));
            assert_eq!(parse_ver32(&s), Some(packed));
        }
        for a in 0..=255u8 {
            let packed = ver32(a, 255 - a, a / 2, a % 7);
            assert_eq!(parse_ver32(&format_ver32(packed)), Some(packed));
        }
    }

    #[test]
    fn ver32_rejects_out_of_range() {
        assert_eq!(parse_ver32("256.0.0.0"), None);
        assert_eq!(parse_ver32("1.2.3.999"), None);
        assert_eq!(parse_ver32("1.2.3"), None);
        assert_eq!(parse_ver32("1.2.3.4.5"), None);
        assert_eq!(parse_ver32("1.-2.3.4"), None);
        assert_eq!(parse_ver32("1..3.4"), None);
        assert_eq!(parse_ver32("a.b.c.d"), None);
        assert_eq!(parse_ver32(" 1.2.3.4"), None);
        assert_eq!(parse_ver32("1. 2 .3.4"), None);
        assert_eq!(parse_ver64("2.20.46.0\n"), None);
    }

    #[test]
    fn ver64_bounds() {
        assert_eq!(parse_ver64("2.20.46.0"), Some(ver64(2, 20, 46, 0)));
        assert_eq!(parse_ver64("65535.0.0.1"), Some(0xFFFF_0000_0000_0001));
        assert_eq!(parse_ver64("65536.0.0.0"), None);
        assert_eq!(format_ver64(ver64(1, 9, 0, 0)), "1.9.0.0");
    }
}
