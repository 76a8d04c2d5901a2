//! Firmware package archives.

use crate::error::{Error, ErrorKind, ResultExt};
use crate::fwctx::{FirmwareContext, MANIFEST_NAME};
use log::debug;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use zip::read::ZipArchive;

/// An open firmware package (`.px14fw`).
///
/// Packages are zip archives holding the manifest ([`MANIFEST_NAME`]), the XSVF bitstreams it
/// references, and optionally release notes. Entry names are matched case-insensitively.
///
/// [`MANIFEST_NAME`]: fwctx/constant.MANIFEST_NAME.html
pub struct FirmwarePackage {
    path: PathBuf,
    archive: ZipArchive<File>,
}

impl FirmwarePackage {
    /// Opens a package.
    ///
    /// Fails with `InvalidFwFile` if the file cannot be opened or is not a zip archive.
    pub fn open(path: &Path) -> crate::Result<Self> {
        let file = File::open(path)
            .map_err(|e| Error::with_while(ErrorKind::InvalidFwFile, e, "opening firmware package"))?;
        let archive = ZipArchive::new(file)
            .map_err(|e| Error::with_while(ErrorKind::InvalidFwFile, e, "reading firmware package"))?;
        debug!("opened {} ({} entries)", path.display(), archive.len());
        Ok(Self {
            path: path.to_path_buf(),
            archive,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the names of all entries.
    pub fn entry_names(&self) -> Vec<String> {
        self.archive.file_names().map(str::to_string).collect()
    }

    fn locate(&self, name: &str) -> Option<String> {
        let exact = self.archive.file_names().find(|n| *n == name);
        exact
            .or_else(|| {
                self.archive
                    .file_names()
                    .find(|n| n.eq_ignore_ascii_case(name))
            })
            .map(str::to_string)
    }

    /// Returns whether the package has an entry called `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.locate(name).is_some()
    }

    fn entry_reader(&mut self, name: &str) -> crate::Result<zip::read::ZipFile<'_>> {
        let found = self.locate(name).ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidFwFile,
                format!("{} has no entry '{}'", self.path.display(), name),
            )
        })?;
        self.archive
            .by_name(&found)
            .map_err(|e| Error::with_while(ErrorKind::InvalidFwFile, e, "opening package entry"))
    }

    /// Extracts the entry `name` to the file `dest`, replacing it if it exists.
    pub fn extract(&mut self, name: &str, dest: &Path) -> crate::Result<()> {
        let mut entry = self.entry_reader(name)?;
        let mut out = File::create(dest).map_err(|e| {
            Error::with_while(ErrorKind::DestFileOpenFailed, e, "creating extracted file")
        })?;
        let bytes = io::copy(&mut entry, &mut out).px14_err_while("extracting package entry")?;
        debug!("extracted {} ({} bytes) to {}", name, bytes, dest.display());
        Ok(())
    }

    /// Extracts the entry `name` into `dir`, keeping only the last component of its name.
    ///
    /// Returns the path of the extracted file.
    pub fn extract_to_dir(&mut self, name: &str, dir: &Path) -> crate::Result<PathBuf> {
        let file_name = Path::new(name).file_name().ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidFwFile,
                format!("'{}' does not name a file", name),
            )
        })?;
        let dest = dir.join(file_name);
        self.extract(name, &dest)?;
        Ok(dest)
    }

    /// Reads the entry `name` as UTF-8 text.
    pub fn read_to_string(&mut self, name: &str) -> crate::Result<String> {
        let mut entry = self.entry_reader(name)?;
        let mut text = String::new();
        entry
            .read_to_string(&mut text)
            .px14_err_while("reading package entry")?;
        Ok(text)
    }

    /// Reads and parses the package manifest.
    pub fn context(&mut self) -> crate::Result<FirmwareContext> {
        let xml = self.read_to_string(MANIFEST_NAME)?;
        FirmwareContext::parse(&xml)
    }
}

impl fmt::Debug for FirmwarePackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirmwarePackage")
            .field("path", &self.path)
            .field("entries", &self.archive.len())
            .finish()
    }
}
