//! Adapting xcf32p bitstreams to the xcf16p configuration EEPROM.
//!
//! Newer board revisions store the system FPGA's configuration on an xcf16p EEPROM instead of
//! an xcf32p. Bitstreams for both parts only differ in a handful of operands: the expected
//! IDCODE, two status register values and one programming delay. [`patch_32p_to_16p`] rewrites
//! those operands in place so the same firmware packages serve both hardware revisions.
//!
//! [`patch_32p_to_16p`]: fn.patch_32p_to_16p.html

use crate::error::{Error, ErrorKind, ResultExt};
use crate::xsvf::{XsvfCommand, XsvfDecoder};
use log::debug;
use std::fs;
use std::ops::Range;
use std::path::Path;

/// IDCODE instruction.
const INST_IDCODE: u32 = 0xFE;
/// XSC_DATA_BTC instruction.
const INST_DATA_BTC: u32 = 0xF2;
/// XSC_DATA_DONE instruction.
const INST_DATA_DONE: u32 = 0x09;

const IDCODE_32P: u32 = 0xF505_9093;
const IDCODE_16P: u32 = 0xF505_8093;
const DATA_BTC_32P: u32 = 0xFFFF_FFEC;
const DATA_BTC_16P: u32 = 0xFFFF_FFE4;
const DATA_DONE_32P: u32 = 0xC0;
const DATA_DONE_16P: u8 = 0xCC;
const PROGRAM_DELAY_32P: u32 = 140_000_000;
const PROGRAM_DELAY_16P: u32 = 80_000_000;

/// Operands longer than this are never patched.
const MAX_FIELD_BYTES: usize = 32;

/// Value of a big-endian field, truncated to its last 32 bits.
fn field_value(field: &[u8]) -> u32 {
    field
        .iter()
        .fold(0u32, |acc, &b| (acc << 8) | u32::from(b))
}

fn last_bytes(range: &Range<usize>, n: usize) -> Range<usize> {
    range.end.saturating_sub(n).max(range.start)..range.end
}

#[derive(Debug)]
struct Patch {
    at: Range<usize>,
    value: Vec<u8>,
}

fn find_patches(data: &[u8]) -> Result<Vec<Patch>, crate::xsvf::XsvfError> {
    let mut patches = Vec::new();
    let mut last_inst = 0u32;
    let mut decoder = XsvfDecoder::new(data);

    while let Some(cmd) = decoder.next_command()? {
        let (tdi, expected) = match cmd {
            XsvfCommand::Complete => break,
            XsvfCommand::Sir { tdi, .. } => {
                last_inst = field_value(&data[tdi]);
                continue;
            }
            XsvfCommand::RunTest { usecs, field } => {
                if usecs == PROGRAM_DELAY_32P {
                    patches.push(Patch {
                        at: field,
                        value: PROGRAM_DELAY_16P.to_be_bytes().to_vec(),
                    });
                }
                continue;
            }
            XsvfCommand::SdrTdo { tdi, expected } => (tdi, expected),
            XsvfCommand::SdrSegment {
                tdi,
                expected: Some(expected),
                ..
            } => (tdi, expected),
            _ => continue,
        };
        if expected.len() > MAX_FIELD_BYTES {
            continue;
        }

        match last_inst {
            INST_IDCODE if field_value(&data[expected.clone()]) == IDCODE_32P => {
                patches.push(Patch {
                    at: last_bytes(&expected, 4),
                    value: IDCODE_16P.to_be_bytes().to_vec(),
                });
            }
            INST_DATA_BTC if field_value(&data[tdi.clone()]) == DATA_BTC_32P => {
                patches.push(Patch {
                    at: last_bytes(&tdi, 4),
                    value: DATA_BTC_16P.to_be_bytes().to_vec(),
                });
            }
            INST_DATA_DONE if field_value(&data[tdi.clone()]) == DATA_DONE_32P => {
                patches.push(Patch {
                    at: last_bytes(&tdi, 1),
                    value: vec![DATA_DONE_16P],
                });
            }
            _ => {}
        }
    }
    Ok(patches)
}

/// Rewrites an XSVF file made for an xcf32p EEPROM in place so it programs an xcf16p.
///
/// Returns the number of operands changed. Files without any of the affected operands are left
/// untouched.
pub fn patch_32p_to_16p(path: &Path) -> crate::Result<usize> {
    let mut data = fs::read(path).px14_err_while("reading bitstream to patch")?;
    let patches = find_patches(&data).map_err(|e| {
        Error::with_while(ErrorKind::FirmwareUploadFailed, e, "scanning bitstream to patch")
    })?;

    if patches.is_empty() {
        return Ok(0);
    }
    for patch in &patches {
        // ranges come from the decoder and lie within `data`
        let dst = &mut data[patch.at.clone()];
        let src = &patch.value[patch.value.len() - dst.len()..];
        dst.copy_from_slice(src);
    }
    fs::write(path, &data).px14_err_while("writing patched bitstream")?;
    debug!("patched {} operands in {}", patches.len(), path.display());
    Ok(patches.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    const XSIR: u8 = 2;
    const XRUNTEST: u8 = 4;
    const XSDRSIZE: u8 = 8;
    const XSDRTDO: u8 = 9;
    const XCOMPLETE: u8 = 0;

    fn bitstream_32p() -> Vec<u8> {
        vec![
            XSIR, 8, 0xFE,
            XSDRSIZE, 0, 0, 0, 32,
            XSDRTDO, 0, 0, 0, 0, 0xF5, 0x05, 0x90, 0x93,
            XSIR, 8, 0xF2,
            XSDRTDO, 0xFF, 0xFF, 0xFF, 0xEC, 0, 0, 0, 0,
            XRUNTEST, 0x08, 0x58, 0x3B, 0x00,
            XSIR, 8, 0x09,
            XSDRSIZE, 0, 0, 0, 8,
            XSDRTDO, 0xC0, 0x00,
            XCOMPLETE,
        ]
    }

    #[test]
    fn rewrites_known_operands() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sys.xsvf");
        fs::write(&path, bitstream_32p()).unwrap();

        assert_eq!(patch_32p_to_16p(&path).unwrap(), 4);

        let patched = fs::read(&path).unwrap();
        let mut expected = bitstream_32p();
        expected[15] = 0x80;
        expected[24] = 0xE4;
        expected[30..34].copy_from_slice(&[0x04, 0xC4, 0xB4, 0x00]);
        expected[43] = 0xCC;
        assert_eq!(patched, expected);

        // a patched file has nothing left to patch
        assert_eq!(patch_32p_to_16p(&path).unwrap(), 0);
    }

    #[test]
    fn operands_after_other_instructions_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.xsvf");
        let mut data = bitstream_32p();
        // IDCODE check after a different instruction
        data[2] = 0xE8;
        fs::write(&path, &data).unwrap();

        assert_eq!(patch_32p_to_16p(&path).unwrap(), 3);
        assert_eq!(fs::read(&path).unwrap()[13..17], [0xF5, 0x05, 0x90, 0x93]);
    }

    #[test]
    fn invalid_bitstream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.xsvf");
        fs::write(&path, [XSIR, 8, 0xFE, 0x30]).unwrap();
        let err = patch_32p_to_16p(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FirmwareUploadFailed);

        let err = patch_32p_to_16p(&dir.path().join("missing.xsvf")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileIo);
    }
}
