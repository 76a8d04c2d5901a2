//! Firmware upload.
//!
//! [`DeviceSession::upload_firmware`] accepts either a single XSVF file, which is played as-is
//! on the whole chain, or a firmware package. For packages, the JTAG chain is resolved, every
//! chain item whose firmware chunk is part of the package is brought up to date, and the EEPROM
//! is updated to record what is now installed.
//!
//! [`DeviceSession::upload_firmware`]: ../struct.DeviceSession.html#method.upload_firmware

use crate::eeprom::{
    FwInfoFlags, VersionAddrs, EA_CUST_FWPKG_ENUM, EA_FWINFO, EA_FWPKG_VER_HIGH,
    EA_FWPKG_VER_LOW, EA_HW_REV, EA_PRE_RELEASE,
};
use crate::error::{Error, ErrorKind, ResultExt};
use crate::fwctx::{
    ContextFlags, FirmwareChunk, FirmwareChunkFlags, FirmwareContext, NotesSeverity,
    BLANK_FILE_PREFIX, NOTES_NAME,
};
use crate::gateway::Gateway;
use crate::package::FirmwarePackage;
use crate::patch::patch_32p_to_16p;
use crate::topology::JtagChainItem;
use crate::version::{format_ver32, format_ver64};
use crate::xsvf::{Progress, ShiftOffsets};
use crate::{DeviceSession, Result};
use bitflags::bitflags;
use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

bitflags! {
    /// Options for [`DeviceSession::upload_firmware`].
    ///
    /// [`DeviceSession::upload_firmware`]: struct.DeviceSession.html#method.upload_firmware
    pub struct UploadFlags: u32 {
        /// Skip chunks whose version and custom enumeration are already installed.
        const REFRESH_ONLY = 0x0001;
        /// Only check that the package is compatible with the board.
        const COMPAT_CHECK_ONLY = 0x0002;
        /// Erase EEPROMs even if they are recorded as blank.
        const FORCE_EEPROM_ERASE = 0x0004;
        /// Do not play any bitstreams, only update the EEPROM records.
        const SKIP_FW_UPLOAD = 0x0008;
    }
}

bitflags! {
    /// Conditions reported by a successful firmware upload.
    #[derive(Default)]
    pub struct UploadStatus: u32 {
        /// The system must be shut down for the new firmware to load.
        const SHUTDOWN_REQUIRED = 0x0001;
        /// The system must be rebooted for the new firmware to load.
        const REBOOT_REQUIRED = 0x0002;
        /// Nothing was uploaded because the installed firmware is current.
        const FW_UP_TO_DATE = 0x0004;
        /// The package was a verification package and the firmware matched.
        const VERIFIED = 0x0008;
    }
}

/// Result of a successful firmware upload.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct UploadOutcome {
    pub status: UploadStatus,
    /// Number of chunks that were uploaded (or only recorded, with `SKIP_FW_UPLOAD`).
    pub uploaded: u32,
    /// Number of chunks skipped because they were already installed.
    pub up_to_date: u32,
}

/// Release notes of a firmware package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareNotes {
    /// Where the notes were extracted to, if the package has any.
    pub path: Option<PathBuf>,
    pub severity: NotesSeverity,
}

/// Version information of a firmware package.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FirmwareVersionInfo {
    /// Package version (32-bit packed).
    pub pkg_version: u32,
    pub pkg_cust_enum: u32,
    pub readme_severity: NotesSeverity,
    pub extra_flags: ContextFlags,
}

/// Extracts the release notes of the package at `path` into `dest_dir`.
pub fn extract_firmware_notes(path: &Path, dest_dir: &Path) -> Result<FirmwareNotes> {
    let mut pkg = FirmwarePackage::open(path)?;
    let ctx = pkg.context()?;

    let path = if pkg.contains(NOTES_NAME) {
        Some(pkg.extract_to_dir(NOTES_NAME, dest_dir)?)
    } else {
        None
    };
    Ok(FirmwareNotes {
        path,
        severity: ctx.notes_severity,
    })
}

/// Reads the version information of the package at `path`.
pub fn query_firmware_version_info(path: &Path) -> Result<FirmwareVersionInfo> {
    let ctx = FirmwarePackage::open(path)?.context()?;
    Ok(FirmwareVersionInfo {
        pkg_version: ctx.package_version,
        pkg_cust_enum: ctx.package_cust_enum,
        readme_severity: ctx.notes_severity,
        extra_flags: ctx.flags,
    })
}

/// Where bitstreams are extracted to during an upload.
enum Scratch {
    Configured(PathBuf),
    Owned(TempDir),
}

impl Scratch {
    fn new(configured: Option<&PathBuf>) -> Result<Self> {
        match configured {
            Some(dir) => Ok(Scratch::Configured(dir.clone())),
            None => Ok(Scratch::Owned(
                tempfile::tempdir().px14_err_while("creating temporary directory")?,
            )),
        }
    }

    fn path(&self) -> &Path {
        match self {
            Scratch::Configured(dir) => dir,
            Scratch::Owned(dir) => dir.path(),
        }
    }
}

/// Extracted bitstreams, deleted when dropped.
struct ExtractedFiles(Vec<PathBuf>);

impl Drop for ExtractedFiles {
    fn drop(&mut self) {
        for path in &self.0 {
            if let Err(e) = fs::remove_file(path) {
                warn!("failed to delete {}: {}", path.display(), e);
            }
        }
    }
}

enum ChunkStatus {
    Uploaded,
    UpToDate,
}

/// A chain item and the chunk the package has for it.
struct Job<'a> {
    item: &'a JtagChainItem,
    chunk: &'a FirmwareChunk,
    /// Whether the bitstream leaves the EEPROM blank, if the item tracks that.
    leaves_blank: Option<bool>,
}

fn is_blank_file(name: &str) -> bool {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .map_or(false, |n| n.starts_with(BLANK_FILE_PREFIX))
}

impl<G: Gateway> DeviceSession<G> {
    /// Uploads the firmware at `path`.
    ///
    /// Files ending in `.xsvf` are played on the JTAG chain as they are. Any other file is
    /// treated as a firmware package. `progress` is called during playback.
    ///
    /// A package is first checked for compatibility with the board; failures report
    /// `IncompatibleFirmware` with a description available through [`error_extra`]. If no chunk
    /// of the package applies to this board, `RequiredFwNotFound` is returned. A failing chunk
    /// aborts the upload. Chunks completed before it stay recorded in EEPROM.
    ///
    /// [`error_extra`]: struct.DeviceSession.html#method.error_extra
    pub fn upload_firmware(
        &self,
        path: &Path,
        flags: UploadFlags,
        progress: &mut dyn FnMut(Progress),
    ) -> Result<UploadOutcome> {
        if self.kind().is_remote() {
            return Err(Error::new(
                ErrorKind::RemoteCallNotAvailable,
                "firmware can only be uploaded to local devices",
            ));
        }

        let ext = path.extension().ok_or_else(|| {
            Error::new(
                ErrorKind::UnknownFwFile,
                format!("cannot tell the type of {}", path.display()),
            )
        })?;

        if ext.eq_ignore_ascii_case("xsvf") {
            self.play_xsvf(path, ShiftOffsets::default(), progress)?;
            return Ok(UploadOutcome::default());
        }

        self.upload_package(path, flags, progress)
    }

    /// Checks that the firmware described by `ctx` may be installed on this board.
    ///
    /// Fails with `IncompatibleFirmware` and a description of the unmet requirement.
    pub fn check_firmware_compatibility(&self, ctx: &FirmwareContext) -> Result<()> {
        let sw = self.config().software_release();
        if sw < ctx.min_sw_version {
            return Err(self.fail_with_extra(
                ErrorKind::IncompatibleFirmware,
                format!(
                    "Firmware requires a minimum PX14400 software release version of {}. \
                     Current software release version is {}",
                    format_ver64(ctx.min_sw_version),
                    format_ver64(sw)
                ),
            ));
        }

        let hw = self.hardware_config()?;
        if hw.board_rev != ctx.required_board_rev {
            return Err(self.fail_with_extra(
                ErrorKind::IncompatibleFirmware,
                format!(
                    "Board revision mismatch (Requires: {}, Have: {})",
                    ctx.required_board_rev, hw.board_rev
                ),
            ));
        }

        let custom = ctx.required_custom_hw;
        if custom != 0 && custom != 0xFFFF && hw.custom_hw != custom {
            return Err(self.fail_with_extra(
                ErrorKind::IncompatibleFirmware,
                format!(
                    "Custom hardware required (Requires: {}, Have: {})",
                    custom, hw.custom_hw
                ),
            ));
        }

        if self.is_virtual() {
            return Ok(());
        }

        let have = u32::from(self.read_eeprom(EA_HW_REV)?) << 16;
        if ctx.min_hw_rev != 0 && have < ctx.min_hw_rev {
            return Err(self.fail_with_extra(
                ErrorKind::IncompatibleFirmware,
                format!(
                    "Firmware requires a minimum hardware revision of {}. \
                     Current hardware revision is {}",
                    format_ver32(ctx.min_hw_rev),
                    format_ver32(have)
                ),
            ));
        }
        if ctx.max_hw_rev != 0 && have > ctx.max_hw_rev {
            return Err(self.fail_with_extra(
                ErrorKind::IncompatibleFirmware,
                format!(
                    "Firmware requires a maximum hardware revision of {}. \
                     Current hardware revision is {}",
                    format_ver32(ctx.max_hw_rev),
                    format_ver32(have)
                ),
            ));
        }
        Ok(())
    }

    fn upload_package(
        &self,
        path: &Path,
        flags: UploadFlags,
        progress: &mut dyn FnMut(Progress),
    ) -> Result<UploadOutcome> {
        let mut pkg = FirmwarePackage::open(path)?;
        let ctx = pkg.context()?;

        self.check_firmware_compatibility(&ctx)?;
        if flags.contains(UploadFlags::COMPAT_CHECK_ONLY) {
            return Ok(UploadOutcome::default());
        }

        let chain = self.resolve_jtag_chain()?;
        let mut jobs: Vec<Job<'_>> = chain
            .iter()
            .filter_map(|item| {
                let chunk = ctx.chunk(item.chunk?)?;
                Some(Job {
                    item,
                    chunk,
                    leaves_blank: None,
                })
            })
            .collect();

        let scratch = Scratch::new(self.config().temp_dir())?;
        let count = jobs.len() as u32;
        let mut outcome = UploadOutcome::default();

        for (i, job) in jobs.iter_mut().enumerate() {
            let status = self.upload_chunk(
                &mut pkg,
                &ctx,
                job,
                flags,
                scratch.path(),
                (i as u32 + 1, count),
                progress,
            )?;
            match status {
                ChunkStatus::Uploaded => {
                    if !flags.contains(UploadFlags::SKIP_FW_UPLOAD) {
                        let chunk_flags = job.chunk.flags;
                        if chunk_flags.contains(FirmwareChunkFlags::REQUIRES_SHUTDOWN) {
                            outcome.status |= UploadStatus::SHUTDOWN_REQUIRED;
                        }
                        if chunk_flags.contains(FirmwareChunkFlags::REQUIRES_REBOOT) {
                            outcome.status |= UploadStatus::REBOOT_REQUIRED;
                        }
                    }
                    outcome.uploaded += 1;
                }
                ChunkStatus::UpToDate => outcome.up_to_date += 1,
            }
        }
        debug!(
            "{}: {} chunks uploaded, {} up to date",
            path.display(),
            outcome.uploaded,
            outcome.up_to_date
        );

        if outcome.uploaded == 0 && outcome.up_to_date == 0 {
            return Err(Error::new(
                ErrorKind::RequiredFwNotFound,
                format!("{} contains no firmware for this board", path.display()),
            ));
        }

        if ctx.is_verify_package() {
            outcome.status |= UploadStatus::VERIFIED;
            return Ok(outcome);
        }

        if outcome.uploaded == 0 {
            outcome.status |= UploadStatus::FW_UP_TO_DATE;
        } else {
            self.record_package(&ctx)?;
        }
        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    fn upload_chunk(
        &self,
        pkg: &mut FirmwarePackage,
        ctx: &FirmwareContext,
        job: &mut Job<'_>,
        flags: UploadFlags,
        scratch: &Path,
        (file, files): (u32, u32),
        progress: &mut dyn FnMut(Progress),
    ) -> Result<ChunkStatus> {
        if self.chunk_is_current(ctx, job, flags)? {
            debug!("chunk {:?} is up to date", job.item.chunk);
            return Ok(ChunkStatus::UpToDate);
        }

        if !flags.contains(UploadFlags::SKIP_FW_UPLOAD) {
            let mut extracted = ExtractedFiles(Vec::new());
            for name in &job.chunk.files {
                let dest = pkg.extract_to_dir(name, scratch)?;
                extracted.0.push(dest.clone());
                if job.item.patch_32p_to_16p {
                    patch_32p_to_16p(&dest)?;
                }
            }

            for path in &extracted.0 {
                self.play_xsvf_file(path, job.item.shift, file, files, progress)?;
            }
            drop(extracted);

            if ctx.is_verify_package() {
                return Ok(ChunkStatus::Uploaded);
            }
        }

        self.record_chunk(job)?;
        Ok(ChunkStatus::Uploaded)
    }

    /// Decides whether a chunk can be skipped.
    fn chunk_is_current(
        &self,
        ctx: &FirmwareContext,
        job: &mut Job<'_>,
        flags: UploadFlags,
    ) -> Result<bool> {
        if ctx.is_verify_package() {
            return Ok(false);
        }

        // Erasing an EEPROM takes long, skip it if it is known to be blank already
        if !job.item.skip_flag.is_empty() {
            if let Some(first) = job.chunk.files.first() {
                let blank = is_blank_file(first);
                job.leaves_blank = Some(blank);

                let info = FwInfoFlags::from_bits_warn(self.read_eeprom(EA_FWINFO)?);
                if blank
                    && info.contains(job.item.skip_flag)
                    && !flags.contains(UploadFlags::FORCE_EEPROM_ERASE)
                {
                    return Ok(true);
                }
            }
        }

        if flags.contains(UploadFlags::REFRESH_ONLY) && !self.is_virtual() {
            if let Some(addrs) = job.item.version_addrs {
                let version = self.installed_version(&addrs)?;
                let cust_enum = u32::from(self.read_eeprom(addrs.cust_enum)?);
                if version == job.chunk.version && cust_enum == job.chunk.cust_enum {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn installed_version(&self, addrs: &VersionAddrs) -> Result<u32> {
        let high = u32::from(self.read_eeprom(addrs.ver_high)?);
        let low = u32::from(self.read_eeprom(addrs.ver_low)?);
        Ok(high << 16 | low)
    }

    /// Sets or clears `bits` in an EEPROM word. Returns whether the word was written.
    fn update_bits(&self, addr: u16, bits: u16, set: bool) -> Result<bool> {
        let old = self.read_eeprom(addr)?;
        let new = if set { old | bits } else { old & !bits };
        if new != old {
            self.write_eeprom(addr, new)?;
        }
        Ok(new != old)
    }

    /// Records a chunk's installation in EEPROM.
    fn record_chunk(&self, job: &Job<'_>) -> Result<()> {
        let (item, chunk) = (job.item, job.chunk);
        let mut wrote = false;

        if let Some(addrs) = item.version_addrs {
            let have = self.installed_version(&addrs)?;
            if have != chunk.version {
                self.write_eeprom(addrs.prev_ver_low, have as u16)?;
                self.write_eeprom(addrs.prev_ver_high, (have >> 16) as u16)?;
                self.write_eeprom(addrs.ver_low, chunk.version as u16)?;
                self.write_eeprom(addrs.ver_high, (chunk.version >> 16) as u16)?;
                wrote = true;
            }

            let cust_enum = self.read_eeprom(addrs.cust_enum)?;
            if u32::from(cust_enum) != chunk.cust_enum {
                self.write_eeprom(addrs.cust_enum, chunk.cust_enum as u16)?;
                wrote = true;
            }
        }

        if !item.prerelease.is_empty() {
            let prerelease = chunk.flags.contains(FirmwareChunkFlags::PRERELEASE);
            wrote |= self.update_bits(EA_PRE_RELEASE, item.prerelease.bits(), prerelease)?;
        }

        if let Some(blank) = job.leaves_blank {
            wrote |= self.update_bits(EA_FWINFO, item.skip_flag.bits(), blank)?;
        }

        if wrote {
            self.reset_eeprom_checksum()?;
        }
        debug!(
            "recorded chunk {:?} version {}",
            item.chunk,
            format_ver32(chunk.version)
        );
        Ok(())
    }

    /// Records the package version after its chunks were installed.
    fn record_package(&self, ctx: &FirmwareContext) -> Result<()> {
        self.write_eeprom(EA_FWPKG_VER_LOW, ctx.package_version as u16)?;
        self.write_eeprom(EA_FWPKG_VER_HIGH, (ctx.package_version >> 16) as u16)?;
        self.write_eeprom(EA_CUST_FWPKG_ENUM, ctx.package_cust_enum as u16)?;
        self.reset_eeprom_checksum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eeprom::{
        PreReleaseFlags, EA_BOARD_REV_SUB, EA_CUSTOM_HW_ENUM,
        EA_CUSTOM_LOGIC_ENUM, EA_LOGIC_SUB_VER, EA_LOGIC_VER, EA_PREV_LOGIC_SUB_VER,
        EA_PREV_LOGIC_VER, EA_SAB_LOGIC_SUB_VER, EA_SAB_LOGIC_VER,
    };
    use crate::fwctx::{CHUNK_SAB_V5SX50T_1, CHUNK_SAB_V5SX95T_1, CHUNK_SYS_V5LX50T_1, CHUNK_SYS_V5LX50T_2, MANIFEST_NAME};
    use crate::gateway::DeviceKind;
    use crate::package::tests::write_package;
    use crate::sim::{SimBoard, SimulatedGateway};
    use crate::tests::init_logger;
    use crate::version::{ver32, ver64};
    use crate::{BoardRevision, SessionConfig};
    use tempfile::TempDir;

    /// XSIR with the IDCODE instruction, then XCOMPLETE.
    const BITSTREAM: &[u8] = &[0x02, 0x08, 0xFE, 0x00];

    fn chunk(version: u32, files: &[&str]) -> FirmwareChunk {
        FirmwareChunk {
            version,
            files: files.iter().map(|f| f.to_string()).collect(),
            ..FirmwareChunk::default()
        }
    }

    /// Writes a package with the given manifest and one copy of `BITSTREAM` per chunk file.
    fn package(dir: &TempDir, ctx: &FirmwareContext) -> PathBuf {
        let xml = ctx.to_xml();
        let mut entries: Vec<(&str, &[u8])> = vec![(MANIFEST_NAME, xml.as_bytes())];
        for chunk in ctx.chunks.values() {
            for file in &chunk.files {
                entries.push((file.as_str(), BITSTREAM));
            }
        }
        let path = dir.path().join("firmware.px14fw");
        write_package(&path, &entries);
        path
    }

    /// A PX14400 DR board with the modern JTAG chain (system EEPROM and FPGA).
    fn dr_board() -> SimBoard {
        let board = SimBoard::new();
        board.set_eeprom(EA_HW_REV, 0x0300);
        board.set_eeprom(EA_BOARD_REV_SUB, 1);
        board.set_idcodes(vec![0xF505_8093, 0xC2A9_6093]);
        board
    }

    fn session(board: &SimBoard, scratch: &TempDir) -> DeviceSession<SimulatedGateway> {
        DeviceSession::with_config(
            board.open(),
            SessionConfig::default().with_temp_dir(scratch.path()),
        )
    }

    fn sys_package(version: u32) -> FirmwareContext {
        let mut ctx = FirmwareContext {
            package_version: ver32(1, 4, 0, 0),
            package_cust_enum: 2,
            ..FirmwareContext::default()
        };
        ctx.chunks
            .insert(CHUNK_SYS_V5LX50T_1, chunk(version, &["sys_1.xsvf"]));
        ctx
    }

    #[test]
    fn rejects_old_software() {
        init_logger();
        let dir = tempfile::tempdir().unwrap();
        let board = SimBoard::new_virtual();
        let session = DeviceSession::with_config(
            board.open(),
            SessionConfig::default().with_software_release(ver64(1, 9, 0, 0)),
        );
        let mut ctx = sys_package(ver32(1, 0, 0, 0));
        ctx.min_sw_version = ver64(2, 0, 0, 0);
        let path = package(&dir, &ctx);

        let err = session
            .upload_firmware(&path, UploadFlags::empty(), &mut |_| {})
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IncompatibleFirmware);
        let text = err.to_string();
        assert!(text.contains("2.0.0.0"), "{}", text);
        assert!(text.contains("1.9.0.0"), "{}", text);
        assert_eq!(session.error_extra().unwrap(), text);
        assert_eq!(board.streamed_bits(), 0);
    }

    #[test]
    fn compatibility_requirements() {
        let board = dr_board();
        board.set_eeprom(EA_CUSTOM_HW_ENUM, 4);
        let session = DeviceSession::new(board.open());
        let mut ctx = sys_package(0);

        session.check_firmware_compatibility(&ctx).unwrap();

        ctx.required_board_rev = BoardRevision::Px14400D;
        session.check_firmware_compatibility(&ctx).unwrap_err();
        assert_eq!(
            session.error_extra().unwrap(),
            "Board revision mismatch (Requires: PX14400D, Have: PX14400A)"
        );
        ctx.required_board_rev = BoardRevision::Px14400;

        ctx.required_custom_hw = 3;
        session.check_firmware_compatibility(&ctx).unwrap_err();
        assert_eq!(
            session.error_extra().unwrap(),
            "Custom hardware required (Requires: 3, Have: 4)"
        );
        ctx.required_custom_hw = 0xFFFF;
        session.check_firmware_compatibility(&ctx).unwrap();

        ctx.min_hw_rev = ver32(3, 1, 0, 0);
        let err = session.check_firmware_compatibility(&ctx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IncompatibleFirmware);
        assert_eq!(
            session.error_extra().unwrap(),
            "Firmware requires a minimum hardware revision of 3.1.0.0. \
             Current hardware revision is 3.0.0.0"
        );

        ctx.min_hw_rev = 0;
        ctx.max_hw_rev = ver32(2, 255, 0, 0);
        session.check_firmware_compatibility(&ctx).unwrap_err();
        assert!(session.error_extra().unwrap().contains("maximum hardware revision"));

        // Hardware bounds are not checked on virtual devices
        let virt = DeviceSession::new(SimBoard::new_virtual().open());
        virt.check_firmware_compatibility(&ctx).unwrap();
    }

    #[test]
    fn refresh_only_skips_installed_firmware() {
        init_logger();
        let dir = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let board = dr_board();
        board.set_eeprom(EA_LOGIC_VER, 0x0102);
        board.set_eeprom(EA_LOGIC_SUB_VER, 0x0003);
        board.set_eeprom(EA_CUSTOM_LOGIC_ENUM, 6);
        let session = session(&board, &scratch);

        let mut ctx = sys_package(ver32(1, 2, 0, 3));
        ctx.chunks.get_mut(&CHUNK_SYS_V5LX50T_1).unwrap().cust_enum = 6;
        let path = package(&dir, &ctx);

        let outcome = session
            .upload_firmware(&path, UploadFlags::REFRESH_ONLY, &mut |_| {})
            .unwrap();
        assert_eq!(
            outcome,
            UploadOutcome {
                status: UploadStatus::FW_UP_TO_DATE,
                uploaded: 0,
                up_to_date: 1,
            }
        );
        assert_eq!(board.streamed_bits(), 0);
        assert!(board.eeprom_writes().is_empty());
        assert_eq!(board.checksum_resets(), 0);
        assert_eq!(fs::read_dir(scratch.path()).unwrap().count(), 0);

        // A different custom enumeration is not up to date
        board.set_eeprom(EA_CUSTOM_LOGIC_ENUM, 0);
        let outcome = session
            .upload_firmware(&path, UploadFlags::REFRESH_ONLY, &mut |_| {})
            .unwrap();
        assert!(!outcome.status.contains(UploadStatus::FW_UP_TO_DATE));
        assert_eq!((outcome.uploaded, outcome.up_to_date), (1, 0));
        assert!(board.streamed_bits() > 0);
    }

    #[test]
    fn uploads_and_records_versions() {
        init_logger();
        let dir = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let board = dr_board();
        board.set_eeprom(EA_LOGIC_VER, 0x0100);
        board.set_eeprom(EA_LOGIC_SUB_VER, 0x0002);
        let session = session(&board, &scratch);

        let mut ctx = sys_package(ver32(1, 2, 0, 3));
        {
            let sys = ctx.chunks.get_mut(&CHUNK_SYS_V5LX50T_1).unwrap();
            sys.cust_enum = 5;
            sys.flags = FirmwareChunkFlags::PRERELEASE | FirmwareChunkFlags::REQUIRES_REBOOT;
        }
        // Not on this board
        ctx.chunks
            .insert(CHUNK_SAB_V5SX95T_1, chunk(ver32(9, 0, 0, 0), &["sab_1.xsvf"]));
        let path = package(&dir, &ctx);

        let mut events = Vec::new();
        let outcome = session
            .upload_firmware(&path, UploadFlags::empty(), &mut |p| events.push(p))
            .unwrap();
        assert_eq!(outcome.status, UploadStatus::REBOOT_REQUIRED);
        assert_eq!((outcome.uploaded, outcome.up_to_date), (1, 0));

        // Chain padding is clocked, only the instruction itself is streamed
        assert_eq!(board.streamed_bits(), 8);
        assert!(events.contains(&Progress::Playing {
            pos: 0,
            len: BITSTREAM.len() as u64,
            file: 1,
            files: 1,
        }));

        assert_eq!(board.eeprom(EA_PREV_LOGIC_VER), 0x0100);
        assert_eq!(board.eeprom(EA_PREV_LOGIC_SUB_VER), 0x0002);
        assert_eq!(board.eeprom(EA_LOGIC_VER), 0x0102);
        assert_eq!(board.eeprom(EA_LOGIC_SUB_VER), 0x0003);
        assert_eq!(board.eeprom(EA_CUSTOM_LOGIC_ENUM), 5);
        assert_eq!(board.eeprom(EA_PRE_RELEASE), PreReleaseFlags::SYS_FW.bits());
        assert_eq!(board.eeprom(EA_FWPKG_VER_LOW), 0x0000);
        assert_eq!(board.eeprom(EA_FWPKG_VER_HIGH), 0x0104);
        assert_eq!(board.eeprom(EA_CUST_FWPKG_ENUM), 2);
        assert_eq!(board.checksum_resets(), 2);
        assert_eq!(board.jtag_owner(), None);
        assert_eq!(fs::read_dir(scratch.path()).unwrap().count(), 0);

        // Uploading the same firmware again leaves the chunk records alone
        let writes = board.eeprom_writes().len();
        session
            .upload_firmware(&path, UploadFlags::empty(), &mut |_| {})
            .unwrap();
        assert_eq!(board.eeprom_writes().len(), writes + 3);
        assert_eq!(board.checksum_resets(), 3);
    }

    #[test]
    fn blank_eeproms_are_not_erased_again() {
        init_logger();
        let dir = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        // Legacy chain: xcf16p, xcf32p, FPGA
        let board = SimBoard::new();
        board.set_eeprom(EA_HW_REV, 0x0200);
        board.set_idcodes(vec![0xE505_8093, 0xF505_9093, 0xC2A9_6093]);
        let session = session(&board, &scratch);

        let mut ctx = sys_package(ver32(1, 0, 0, 0));
        ctx.chunks
            .insert(CHUNK_SYS_V5LX50T_2, chunk(0, &["erase_sys_2.xsvf"]));
        let path = package(&dir, &ctx);

        // Erased and recorded as blank
        session
            .upload_firmware(&path, UploadFlags::empty(), &mut |_| {})
            .unwrap();
        assert_eq!(board.eeprom(EA_FWINFO), FwInfoFlags::PCIE_EEPROM_2_BLANK.bits());
        assert_eq!(board.streamed_bits(), 16);

        // Now only the primary EEPROM is programmed
        session
            .upload_firmware(&path, UploadFlags::empty(), &mut |_| {})
            .unwrap();
        assert_eq!(board.streamed_bits(), 24);

        session
            .upload_firmware(&path, UploadFlags::FORCE_EEPROM_ERASE, &mut |_| {})
            .unwrap();
        assert_eq!(board.streamed_bits(), 40);

        // Programming the secondary EEPROM clears the blank record
        ctx.chunks.get_mut(&CHUNK_SYS_V5LX50T_2).unwrap().files = vec!["sys_2.xsvf".into()];
        let path = package(&dir, &ctx);
        session
            .upload_firmware(&path, UploadFlags::empty(), &mut |_| {})
            .unwrap();
        assert_eq!(board.eeprom(EA_FWINFO), 0);
    }

    #[test]
    fn verify_packages_leave_eeprom_alone() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let board = dr_board();
        let session = session(&board, &scratch);

        let mut ctx = sys_package(ver32(1, 2, 0, 3));
        ctx.flags = ContextFlags::VERIFY_FILE;
        let path = package(&dir, &ctx);

        let outcome = session
            .upload_firmware(&path, UploadFlags::REFRESH_ONLY, &mut |_| {})
            .unwrap();
        assert_eq!(outcome.status, UploadStatus::VERIFIED);
        assert_eq!(outcome.uploaded, 1);
        assert!(board.streamed_bits() > 0);
        assert!(board.eeprom_writes().is_empty());
    }

    #[test]
    fn skip_upload_only_updates_records() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let board = dr_board();
        let session = session(&board, &scratch);

        let mut ctx = sys_package(ver32(1, 2, 0, 3));
        ctx.chunks.get_mut(&CHUNK_SYS_V5LX50T_1).unwrap().flags =
            FirmwareChunkFlags::REQUIRES_SHUTDOWN;
        let path = package(&dir, &ctx);

        let outcome = session
            .upload_firmware(&path, UploadFlags::SKIP_FW_UPLOAD, &mut |_| {})
            .unwrap();
        assert_eq!(outcome.status, UploadStatus::empty());
        assert_eq!(outcome.uploaded, 1);
        assert_eq!(board.streamed_bits(), 0);
        assert_eq!(board.eeprom(EA_LOGIC_VER), 0x0102);
        assert_eq!(board.eeprom(EA_FWPKG_VER_HIGH), 0x0104);
    }

    #[test]
    fn package_without_matching_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let board = dr_board();
        let session = session(&board, &scratch);

        let mut ctx = FirmwareContext::default();
        ctx.chunks
            .insert(CHUNK_SAB_V5SX95T_1, chunk(ver32(1, 0, 0, 0), &["sab_1.xsvf"]));
        let path = package(&dir, &ctx);

        let err = session
            .upload_firmware(&path, UploadFlags::empty(), &mut |_| {})
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RequiredFwNotFound);

        let outcome = session
            .upload_firmware(&path, UploadFlags::COMPAT_CHECK_ONLY, &mut |_| {})
            .unwrap();
        assert_eq!(outcome, UploadOutcome::default());
        assert_eq!(board.streamed_bits(), 0);
    }

    #[test]
    fn failing_bitstream_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let board = dr_board();
        let session = session(&board, &scratch);

        let ctx = sys_package(ver32(1, 2, 0, 3));
        let xml = ctx.to_xml();
        let path = dir.path().join("broken.px14fw");
        // Opcode 5 is not a valid XSVF command
        write_package(
            &path,
            &[(MANIFEST_NAME, xml.as_bytes()), ("sys_1.xsvf", &[0x05u8][..])],
        );

        let err = session
            .upload_firmware(&path, UploadFlags::empty(), &mut |_| {})
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FirmwareUploadFailed);
        assert!(board.eeprom_writes().is_empty());
        assert_eq!(board.jtag_owner(), None);
        assert_eq!(fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[test]
    fn failed_chunk_keeps_earlier_records() {
        init_logger();
        let dir = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        // SP board with an SX50T: system EEPROM, system FPGA, SAB EEPROM, SAB FPGA
        let board = SimBoard::new();
        board.set_eeprom(EA_HW_REV, 0x0300);
        board.set_idcodes(vec![0xF505_8093, 0xC2A9_6093, 0xF505_9093, 0xC2E9_6093]);
        let session = session(&board, &scratch);

        let mut ctx = sys_package(ver32(1, 2, 0, 3));
        ctx.chunks
            .insert(CHUNK_SAB_V5SX50T_1, chunk(ver32(2, 0, 0, 1), &["sab_1.xsvf"]));
        let xml = ctx.to_xml();
        let path = dir.path().join("partial.px14fw");
        write_package(
            &path,
            &[
                (MANIFEST_NAME, xml.as_bytes()),
                ("sys_1.xsvf", BITSTREAM),
                ("sab_1.xsvf", &[0x05u8][..]),
            ],
        );

        let err = session
            .upload_firmware(&path, UploadFlags::empty(), &mut |_| {})
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FirmwareUploadFailed);
        assert_eq!(board.streamed_bits(), 8);

        // The system chunk stays recorded
        assert_eq!(board.eeprom(EA_LOGIC_VER), 0x0102);
        assert_eq!(board.eeprom(EA_LOGIC_SUB_VER), 0x0003);
        assert_eq!(board.checksum_resets(), 1);

        // Neither the SAB chunk nor the package is
        assert_eq!(board.eeprom(EA_SAB_LOGIC_VER), 0);
        assert_eq!(board.eeprom(EA_SAB_LOGIC_SUB_VER), 0);
        let package_words = [EA_FWPKG_VER_LOW, EA_FWPKG_VER_HIGH, EA_CUST_FWPKG_ENUM];
        assert!(board
            .eeprom_writes()
            .iter()
            .all(|(addr, _)| !package_words.contains(addr)));
        assert_eq!(board.jtag_owner(), None);
        assert_eq!(fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[test]
    fn plain_bitstreams_and_unknown_files() {
        let dir = tempfile::tempdir().unwrap();
        let board = dr_board();
        let session = DeviceSession::new(board.open());

        let xsvf = dir.path().join("custom.XSVF");
        fs::write(&xsvf, BITSTREAM).unwrap();
        let outcome = session
            .upload_firmware(&xsvf, UploadFlags::empty(), &mut |_| {})
            .unwrap();
        assert_eq!(outcome, UploadOutcome::default());
        assert_eq!(board.streamed_bits(), 8);

        let err = session
            .upload_firmware(&dir.path().join("firmware"), UploadFlags::empty(), &mut |_| {})
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownFwFile);

        let remote = DeviceSession::new(SimBoard::with_kind(DeviceKind::Remote).open());
        let err = remote
            .upload_firmware(&xsvf, UploadFlags::empty(), &mut |_| {})
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RemoteCallNotAvailable);
    }

    #[test]
    fn virtual_devices_upload_without_hardware_checks() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let board = SimBoard::new_virtual();
        let session = session(&board, &scratch);

        let mut ctx = sys_package(ver32(1, 2, 0, 3));
        ctx.min_hw_rev = ver32(9, 0, 0, 0);
        let path = package(&dir, &ctx);

        let outcome = session
            .upload_firmware(&path, UploadFlags::REFRESH_ONLY, &mut |_| {})
            .unwrap();
        assert_eq!(outcome.status, UploadStatus::empty());
        assert_eq!(outcome.uploaded, 1);
        assert_eq!(board.eeprom(EA_LOGIC_VER), 0x0102);
    }

    #[test]
    fn package_queries() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = sys_package(ver32(1, 2, 0, 3));
        ctx.notes_severity = NotesSeverity::Important;
        ctx.flags = ContextFlags::VERIFY_FILE;
        let xml = ctx.to_xml();

        let with_notes = dir.path().join("notes.px14fw");
        write_package(
            &with_notes,
            &[(MANIFEST_NAME, xml.as_bytes()), (NOTES_NAME, &b"Read me."[..])],
        );
        let out = tempfile::tempdir().unwrap();
        let notes = extract_firmware_notes(&with_notes, out.path()).unwrap();
        assert_eq!(notes.severity, NotesSeverity::Important);
        let notes_path = notes.path.unwrap();
        assert_eq!(fs::read_to_string(notes_path).unwrap(), "Read me.");

        let without = package(&dir, &ctx);
        let notes = extract_firmware_notes(&without, out.path()).unwrap();
        assert_eq!(notes.path, None);

        let info = query_firmware_version_info(&without).unwrap();
        assert_eq!(
            info,
            FirmwareVersionInfo {
                pkg_version: ver32(1, 4, 0, 0),
                pkg_cust_enum: 2,
                readme_severity: NotesSeverity::Important,
                extra_flags: ContextFlags::VERIFY_FILE,
            }
        );
    }
}
