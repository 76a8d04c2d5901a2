//! Firmware package manifests.
//!
//! Every firmware package carries a manifest named [`MANIFEST_NAME`] describing the package
//! (version, release information, requirements the target board must meet) and its firmware
//! *chunks*. A chunk is the firmware for one configuration EEPROM of the board, stored as one
//! or more XSVF files inside the package.
//!
//! [`FirmwareContext`] is the parsed form of a manifest and can also write one, which is how
//! packages are authored. [`CustomLogicProvider`] describes the vendor of custom firmware.
//!
//! [`MANIFEST_NAME`]: constant.MANIFEST_NAME.html
//! [`FirmwareContext`]: struct.FirmwareContext.html
//! [`CustomLogicProvider`]: struct.CustomLogicProvider.html

use crate::error::{Error, ErrorKind, ResultExt};
use crate::version::{format_ver32, format_ver64, parse_ver32, parse_ver64};
use crate::BoardRevision;
use bitflags::bitflags;
use log::{debug, warn};
use roxmltree::{Document, Node};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// Name of the manifest inside a firmware package.
pub const MANIFEST_NAME: &str = "context_v2.xml";
/// Name of the optional release notes inside a firmware package.
pub const NOTES_NAME: &str = "fw_readme.txt";
/// Bitstreams whose name starts with this prefix erase their EEPROM instead of programming it.
pub const BLANK_FILE_PREFIX: &str = "erase_";

/// System logic, primary EEPROM (xcf32p).
pub const CHUNK_SYS_V5LX50T_1: u32 = 0;
/// System logic, secondary EEPROM (xcf16p).
pub const CHUNK_SYS_V5LX50T_2: u32 = 1;
/// SAB logic for the XC5VSX50T, primary EEPROM (xcf32p).
pub const CHUNK_SAB_V5SX50T_1: u32 = 2;
/// SAB logic for the XC5VSX50T, secondary EEPROM (xcf16p).
pub const CHUNK_SAB_V5SX50T_2: u32 = 3;
/// SAB logic for the XC5VSX95T, primary EEPROM (xcf32p).
pub const CHUNK_SAB_V5SX95T_1: u32 = 4;
/// SAB logic for the XC5VSX95T, secondary EEPROM (xcf16p).
pub const CHUNK_SAB_V5SX95T_2: u32 = 5;
/// Number of known chunk identifiers.
pub const CHUNK_COUNT: u32 = 6;

/// Returns a human-readable description of a chunk identifier.
pub fn chunk_name(id: u32) -> &'static str {
    match id {
        CHUNK_SYS_V5LX50T_1 => "SysV5LX50_1 (xcf32p)",
        CHUNK_SYS_V5LX50T_2 => "SysV5LX50_2 (xcf16p)",
        CHUNK_SAB_V5SX50T_1 => "SabV5SX50_1 (xcf32p)",
        CHUNK_SAB_V5SX50T_2 => "SabV5SX50_2 (xcf16p)",
        CHUNK_SAB_V5SX95T_1 => "SabV5SX95T_1 (xcf32p)",
        CHUNK_SAB_V5SX95T_2 => "SabV5SX95T_2 (xcf16p)",
        _ => "(Unknown firmware chunk type)",
    }
}

bitflags! {
    /// Requirements of a firmware chunk.
    pub struct FirmwareChunkFlags: u32 {
        /// The firmware is a pre-release version.
        const PRERELEASE = 0x0001;
        /// The system must be shut down after the upload for the firmware to load.
        const REQUIRES_SHUTDOWN = 0x0002;
        /// The system must be rebooted after the upload for the firmware to load.
        const REQUIRES_REBOOT = 0x0004;
    }
}

bitflags! {
    /// Package-level flags.
    pub struct ContextFlags: u32 {
        /// The package only verifies the installed firmware and does not record anything in
        /// EEPROM.
        const VERIFY_FILE = 0x0001;
    }
}

/// How important it is that users read a package's release notes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NotesSeverity {
    /// No notes.
    None,
    /// Informational notes.
    Normal,
    /// Notes that should be read before using the firmware.
    Important,
    Unknown(u32),
}

impl NotesSeverity {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => NotesSeverity::None,
            1 => NotesSeverity::Normal,
            2 => NotesSeverity::Important,
            other => NotesSeverity::Unknown(other),
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            NotesSeverity::None => 0,
            NotesSeverity::Normal => 1,
            NotesSeverity::Important => 2,
            NotesSeverity::Unknown(raw) => raw,
        }
    }
}

impl Default for NotesSeverity {
    fn default() -> Self {
        NotesSeverity::None
    }
}

/// The firmware for one configuration EEPROM.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FirmwareChunk {
    /// Firmware version (32-bit packed).
    pub version: u32,
    /// Custom firmware enumeration, 0 for standard firmware.
    pub cust_enum: u32,
    pub flags: FirmwareChunkFlags,
    /// Names of the package entries to play, in order.
    pub files: Vec<String>,
}

impl Default for FirmwareChunkFlags {
    fn default() -> Self {
        Self::empty()
    }
}

impl Default for ContextFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// A parsed firmware package manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareContext {
    /// Package version (32-bit packed).
    pub package_version: u32,
    /// Custom firmware package enumeration, 0 for standard packages.
    pub package_cust_enum: u32,
    /// Release number assigned by the firmware vendor.
    pub ucd: u32,
    pub release_date: String,
    pub flags: ContextFlags,
    /// Firmware chunks by chunk identifier.
    pub chunks: BTreeMap<u32, FirmwareChunk>,

    /// Board revision the firmware is made for.
    pub required_board_rev: BoardRevision,
    /// Custom hardware the firmware requires. 0 and 0xFFFF accept any hardware.
    pub required_custom_hw: u16,
    /// Highest supported hardware revision (32-bit packed), 0 if unbounded.
    pub max_hw_rev: u32,
    /// Lowest supported hardware revision (32-bit packed), 0 if unbounded.
    pub min_hw_rev: u32,
    /// Lowest supported software release (64-bit packed), 0 if unbounded.
    pub min_sw_version: u64,

    pub notes_severity: NotesSeverity,
    /// Additional package entries that are not firmware.
    pub aux_files: Vec<String>,
    /// Free-form (name, value) pairs.
    pub user_data: Vec<(String, String)>,
}

impl Default for FirmwareContext {
    fn default() -> Self {
        Self {
            package_version: 0,
            package_cust_enum: 0,
            ucd: 0,
            release_date: String::new(),
            flags: ContextFlags::empty(),
            chunks: BTreeMap::new(),
            required_board_rev: BoardRevision::Px14400,
            required_custom_hw: 0,
            max_hw_rev: 0,
            min_hw_rev: 0,
            min_sw_version: 0,
            notes_severity: NotesSeverity::None,
            aux_files: Vec::new(),
            user_data: Vec::new(),
        }
    }
}

fn invalid(what: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidFwFile, what.into())
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

fn text<'a>(node: Node<'a, '_>) -> &'a str {
    node.text().unwrap_or("")
}

/// Returns the trimmed text of an optional element.
fn field<'a>(parent: Node<'a, '_>, name: &str) -> Option<&'a str> {
    raw_field(parent, name).map(str::trim)
}

/// Returns the text of an optional element as written. Used for file names.
fn raw_field<'a>(parent: Node<'a, '_>, name: &str) -> Option<&'a str> {
    child(parent, name).map(text)
}

fn number<T: FromStr>(parent: Node<'_, '_>, name: &str) -> crate::Result<Option<T>> {
    match field(parent, name) {
        None => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|_| invalid(format!("<{}> is not a number: '{}'", name, s))),
    }
}

fn version32(parent: Node<'_, '_>, name: &str) -> crate::Result<Option<u32>> {
    match field(parent, name) {
        None => Ok(None),
        Some(s) => parse_ver32(s)
            .map(Some)
            .ok_or_else(|| invalid(format!("<{}> is not a valid version: '{}'", name, s))),
    }
}

fn version64(parent: Node<'_, '_>, name: &str) -> crate::Result<Option<u64>> {
    match field(parent, name) {
        None => Ok(None),
        Some(s) => parse_ver64(s)
            .map(Some)
            .ok_or_else(|| invalid(format!("<{}> is not a valid version: '{}'", name, s))),
    }
}

/// Escapes the characters with special meaning in XML text.
fn escape(s: &str) -> Cow<'_, str> {
    if !s.contains(|c| matches!(c, '&' | '<' | '>' | '\'' | '"')) {
        return Cow::Borrowed(s);
    }
    let mut out = String::with_capacity(s.len() + 8);
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

impl FirmwareContext {
    /// Parses a manifest from its XML text.
    ///
    /// Fails with `XmlMalformed` if the text is not well-formed XML and with `InvalidFwFile` if
    /// it is not a firmware manifest, misses a mandatory field or has a field with an invalid
    /// value. Absent optional fields keep their default values.
    pub fn parse(xml: &str) -> crate::Result<Self> {
        let doc = Document::parse(xml).px14_err_while("parsing firmware manifest")?;
        let root = doc.root_element();
        if !root.tag_name().name().eq_ignore_ascii_case("PX14_Firmware") {
            return Err(invalid(format!(
                "unexpected root element <{}>",
                root.tag_name().name()
            )));
        }

        let mut ctx = Self::default();
        ctx.package_version = version32(root, "version_pkg")?
            .ok_or_else(|| invalid("manifest has no package version"))?;

        if let Some(v) = number(root, "cust_enum_pkg")? {
            ctx.package_cust_enum = v;
        }
        if let Some(v) = number(root, "ucd")? {
            ctx.ucd = v;
        }
        if let Some(s) = child(root, "rel_date") {
            ctx.release_date = text(s).to_string();
        }
        if let Some(v) = number(root, "fw_flags")? {
            ctx.flags = ContextFlags::from_bits_truncate(v);
            if ctx.flags.bits() != v {
                warn!("unknown package flags: {:#x}", v);
            }
        }

        if let Some(v) = number(root, "req_boardrevision")? {
            ctx.required_board_rev = BoardRevision::from_raw(v);
        }
        if let Some(v) = number(root, "req_customhwenum")? {
            ctx.required_custom_hw = v;
        }
        if let Some(v) = version32(root, "req_maxhwrevision")? {
            ctx.max_hw_rev = v;
        }
        if let Some(v) = version32(root, "req_minhwrevision")? {
            ctx.min_hw_rev = v;
        }
        if let Some(v) = version64(root, "req_minswversion")? {
            ctx.min_sw_version = v;
        }
        if let Some(v) = number(root, "readmesev")? {
            ctx.notes_severity = NotesSeverity::from_raw(v);
        }

        let aux_count: u32 = number(root, "auxfilecount")?.unwrap_or(0);
        for i in 1..=aux_count {
            // Missing auxiliary entries are skipped
            if let Some(name) = raw_field(root, &format!("auxfile{}", i)) {
                ctx.aux_files.push(name.to_string());
            }
        }

        if let Some(user) = child(root, "UserDefined") {
            ctx.user_data = user
                .children()
                .filter(|n| n.is_element())
                .map(|n| (n.tag_name().name().to_string(), text(n).to_string()))
                .collect();
        }

        for node in root
            .children()
            .filter(|n| n.is_element() && n.tag_name().name() == "firmware_chunk")
        {
            let (id, chunk) = Self::parse_chunk(node)?;
            ctx.chunks.insert(id, chunk);
        }

        debug!(
            "parsed firmware manifest: package {}, chunks {:?}",
            format_ver32(ctx.package_version),
            ctx.chunks.keys().collect::<Vec<_>>()
        );
        Ok(ctx)
    }

    fn parse_chunk(node: Node<'_, '_>) -> crate::Result<(u32, FirmwareChunk)> {
        let id = node
            .attribute("id")
            .ok_or_else(|| invalid("firmware chunk without id"))?;
        let id: u32 = id
            .trim()
            .parse()
            .map_err(|_| invalid(format!("invalid firmware chunk id '{}'", id)))?;

        let version = version32(node, "fwc_version")?
            .ok_or_else(|| invalid(format!("firmware chunk {} has no version", id)))?;
        let count: u32 = number(node, "fwc_file_count")?
            .ok_or_else(|| invalid(format!("firmware chunk {} has no file count", id)))?;

        let mut files = Vec::new();
        for i in 1..=count {
            let name = raw_field(node, &format!("fwc_file{}", i)).ok_or_else(|| {
                invalid(format!("firmware chunk {} is missing file {}", id, i))
            })?;
            files.push(name.to_string());
        }

        let mut chunk = FirmwareChunk {
            version,
            files,
            ..FirmwareChunk::default()
        };
        if let Some(v) = number(node, "fwc_flags")? {
            chunk.flags = FirmwareChunkFlags::from_bits_truncate(v);
            if chunk.flags.bits() != v {
                warn!("unknown flags {:#x} on firmware chunk {}", v, id);
            }
        }
        if let Some(v) = number(node, "fwc_cust_enum")? {
            chunk.cust_enum = v;
        }
        Ok((id, chunk))
    }

    /// Reads and parses a manifest file.
    pub fn parse_file(path: &Path) -> crate::Result<Self> {
        let xml = fs::read_to_string(path).px14_err_while("reading firmware manifest")?;
        Self::parse(&xml)
    }

    /// Serializes the manifest to XML.
    ///
    /// The output contains every field, so parsing it yields an equal `FirmwareContext`.
    /// Names of user-defined items must be valid XML element names.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        // Writing to a `String` cannot fail
        let _ = self.write_xml(&mut out);
        out
    }

    fn write_xml(&self, out: &mut String) -> std::fmt::Result {
        writeln!(out, r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#)?;
        writeln!(out, "<PX14_Firmware>")?;

        writeln!(out, "<!-- Firmware package information -->")?;
        writeln!(out, " <version_pkg>{}</version_pkg>", format_ver32(self.package_version))?;
        writeln!(out, " <cust_enum_pkg>{}</cust_enum_pkg>", self.package_cust_enum)?;
        writeln!(out, " <ucd>{}</ucd>", self.ucd)?;
        if !self.release_date.is_empty() {
            writeln!(out, " <rel_date>{}</rel_date>", escape(&self.release_date))?;
        }
        writeln!(out, " <fw_flags>{}</fw_flags>", self.flags.bits())?;

        writeln!(out, "\n<!-- Firmware requirements -->")?;
        writeln!(out, " <req_boardrevision>{}</req_boardrevision>", self.required_board_rev.raw())?;
        writeln!(out, " <req_customhwenum>{}</req_customhwenum>", self.required_custom_hw)?;
        writeln!(out, " <req_maxhwrevision>{}</req_maxhwrevision>", format_ver32(self.max_hw_rev))?;
        writeln!(out, " <req_minhwrevision>{}</req_minhwrevision>", format_ver32(self.min_hw_rev))?;
        writeln!(out, " <req_minswversion>{}</req_minswversion>", format_ver64(self.min_sw_version))?;

        writeln!(out, "\n<!-- Firmware notes -->")?;
        writeln!(out, " <readmesev>{}</readmesev>", self.notes_severity.raw())?;

        writeln!(out, "\n<!-- Auxiliary file info -->")?;
        writeln!(out, " <auxfilecount>{}</auxfilecount>", self.aux_files.len())?;
        for (i, name) in self.aux_files.iter().enumerate() {
            writeln!(out, "  <auxfile{0}>{1}</auxfile{0}>", i + 1, escape(name))?;
        }

        if !self.user_data.is_empty() {
            writeln!(out, "\n<!-- User defined items -->")?;
            writeln!(out, " <UserDefined>")?;
            for (name, value) in &self.user_data {
                writeln!(out, "  <{0}>{1}</{0}>", name, escape(value))?;
            }
            writeln!(out, " </UserDefined>")?;
        }

        if !self.chunks.is_empty() {
            writeln!(out, "\n<!-- Per-firmware chunk information -->")?;
        }
        for (id, chunk) in &self.chunks {
            writeln!(out, "\n<!-- Firmware chunk: {} = {} -->", id, chunk_name(*id))?;
            writeln!(out, r#" <firmware_chunk id="{}">"#, id)?;
            writeln!(out, "  <fwc_version>{}</fwc_version>", format_ver32(chunk.version))?;
            writeln!(out, "  <fwc_cust_enum>{}</fwc_cust_enum>", chunk.cust_enum)?;
            writeln!(out, "  <fwc_flags>{}</fwc_flags>", chunk.flags.bits())?;
            writeln!(out, "  <fwc_file_count>{}</fwc_file_count>", chunk.files.len())?;
            for (i, name) in chunk.files.iter().enumerate() {
                writeln!(out, "   <fwc_file{0}>{1}</fwc_file{0}>", i + 1, escape(name))?;
            }
            writeln!(out, " </firmware_chunk>")?;
        }

        writeln!(out, "\n</PX14_Firmware>")
    }

    /// Writes the manifest to a file, replacing it if it exists.
    pub fn write_to(&self, path: &Path) -> crate::Result<()> {
        fs::write(path, self.to_xml()).map_err(|e| {
            Error::with_while(ErrorKind::DestFileOpenFailed, e, "writing firmware manifest")
        })
    }

    /// Resets every field to its default value.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Returns whether this is a verification-only package.
    pub fn is_verify_package(&self) -> bool {
        self.flags.contains(ContextFlags::VERIFY_FILE)
    }

    pub fn chunk(&self, id: u32) -> Option<&FirmwareChunk> {
        self.chunks.get(&id)
    }
}

/// Identifies the vendor of custom firmware.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CustomLogicProvider {
    pub guid: String,
    pub client_name: String,
    pub short_name: String,
    /// Custom firmware enumeration assigned to this vendor.
    pub custom_fw_enum: u32,
}

impl CustomLogicProvider {
    /// Parses a provider description.
    ///
    /// Fails with `XmlMalformed` if the text is not well-formed XML, with `XmlInvalid` if the
    /// root element is not `SigFpgaDev_PX14400`, and with `XmlGeneric` if `GUID` or
    /// `CustomFwEnum` is missing.
    pub fn parse(xml: &str) -> crate::Result<Self> {
        let doc = Document::parse(xml).px14_err_while("parsing custom logic provider")?;
        let root = doc.root_element();
        if !root
            .tag_name()
            .name()
            .eq_ignore_ascii_case("SigFpgaDev_PX14400")
        {
            return Err(Error::new(
                ErrorKind::XmlInvalid,
                format!("unexpected root element <{}>", root.tag_name().name()),
            ));
        }

        let missing = |name: &str| {
            Error::new(
                ErrorKind::XmlGeneric,
                format!("custom logic provider has no <{}>", name),
            )
        };
        let guid = field(root, "GUID").ok_or_else(|| missing("GUID"))?;
        let custom_fw_enum = field(root, "CustomFwEnum").ok_or_else(|| missing("CustomFwEnum"))?;
        let custom_fw_enum = custom_fw_enum.parse().map_err(|_| {
            Error::new(
                ErrorKind::XmlGeneric,
                format!("<CustomFwEnum> is not a number: '{}'", custom_fw_enum),
            )
        })?;

        Ok(Self {
            guid: guid.to_string(),
            client_name: field(root, "ClientName").unwrap_or("").to_string(),
            short_name: field(root, "ShortName").unwrap_or("").to_string(),
            custom_fw_enum,
        })
    }

    pub fn parse_file(path: &Path) -> crate::Result<Self> {
        let xml = fs::read_to_string(path).px14_err_while("reading custom logic provider")?;
        Self::parse(&xml)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::{ver32, ver64};

    const MANIFEST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<PX14_Firmware>
  <version_pkg>1.12.3.0</version_pkg>
  <ucd>117</ucd>
  <rel_date>2011-11-04</rel_date>
  <req_minswversion>2.0.0.0</req_minswversion>
  <req_minhwrevision>3.0.0.0</req_minhwrevision>
  <readmesev>2</readmesev>
  <auxfilecount>2</auxfilecount>
  <auxfile1>tools.zip</auxfile1>
  <UserDefined>
    <builder>nightly</builder>
  </UserDefined>
  <firmware_chunk id="0">
    <fwc_version>1.12.0.4</fwc_version>
    <fwc_flags>6</fwc_flags>
    <fwc_file_count>2</fwc_file_count>
    <fwc_file1>sys_a.xsvf</fwc_file1>
    <fwc_file2>sys_b.xsvf</fwc_file2>
  </firmware_chunk>
  <firmware_chunk id="5">
    <fwc_version>1.3.0.0</fwc_version>
    <fwc_cust_enum>7</fwc_cust_enum>
    <fwc_file_count>1</fwc_file_count>
    <fwc_file1>erase_sab.xsvf</fwc_file1>
  </firmware_chunk>
</PX14_Firmware>
"#;

    #[test]
    fn parses_manifest() {
        let ctx = FirmwareContext::parse(MANIFEST).unwrap();
        assert_eq!(ctx.package_version, ver32(1, 12, 3, 0));
        assert_eq!(ctx.ucd, 117);
        assert_eq!(ctx.release_date, "2011-11-04");
        assert_eq!(ctx.min_sw_version, ver64(2, 0, 0, 0));
        assert_eq!(ctx.min_hw_rev, ver32(3, 0, 0, 0));
        assert_eq!(ctx.max_hw_rev, 0);
        assert_eq!(ctx.required_board_rev, BoardRevision::Px14400);
        assert_eq!(ctx.notes_severity, NotesSeverity::Important);
        // auxfile2 is announced but absent
        assert_eq!(ctx.aux_files, vec!["tools.zip".to_string()]);
        assert_eq!(
            ctx.user_data,
            vec![("builder".to_string(), "nightly".to_string())]
        );
        assert!(!ctx.is_verify_package());

        let sys = ctx.chunk(CHUNK_SYS_V5LX50T_1).unwrap();
        assert_eq!(sys.version, ver32(1, 12, 0, 4));
        assert_eq!(
            sys.flags,
            FirmwareChunkFlags::REQUIRES_SHUTDOWN | FirmwareChunkFlags::REQUIRES_REBOOT
        );
        assert_eq!(sys.files, vec!["sys_a.xsvf", "sys_b.xsvf"]);

        let sab = ctx.chunk(CHUNK_SAB_V5SX95T_2).unwrap();
        assert_eq!(sab.cust_enum, 7);
        assert!(ctx.chunk(CHUNK_SAB_V5SX95T_1).is_none());
    }

    #[test]
    fn written_manifest_parses_to_same_context() {
        let mut ctx = FirmwareContext::parse(MANIFEST).unwrap();
        ctx.release_date = "Nov 4 <final> & \"signed\"".to_string();
        ctx.flags = ContextFlags::VERIFY_FILE;
        ctx.required_board_rev = BoardRevision::Px14400D2;
        ctx.required_custom_hw = 3;
        ctx.max_hw_rev = ver32(4, 1, 0, 0);
        ctx.package_cust_enum = 9;
        ctx.chunks.get_mut(&5).unwrap().files.push("it's.xsvf".to_string());
        ctx.chunks.get_mut(&0).unwrap().files.push(" sys c.xsvf ".to_string());
        ctx.aux_files.push("\tnotes.txt".to_string());

        let xml = ctx.to_xml();
        assert!(xml.starts_with(r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#));
        assert!(xml.contains("<!-- Firmware chunk: 5 = SabV5SX95T_2 (xcf16p) -->"));
        assert_eq!(FirmwareContext::parse(&xml).unwrap(), ctx);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MANIFEST_NAME);
        ctx.write_to(&path).unwrap();
        assert_eq!(FirmwareContext::parse_file(&path).unwrap(), ctx);

        ctx.reset();
        assert_eq!(ctx, FirmwareContext::default());
    }

    #[test]
    fn root_is_case_insensitive() {
        let ctx = FirmwareContext::parse(
            "<px14_firmware><version_pkg> 2.0.0.1 </version_pkg></px14_firmware>",
        )
        .unwrap();
        assert_eq!(ctx.package_version, ver32(2, 0, 0, 1));
        assert!(ctx.chunks.is_empty());
    }

    #[test]
    fn rejects_invalid_manifests() {
        let kind = |xml: &str| FirmwareContext::parse(xml).unwrap_err().kind();

        assert_eq!(kind("<PX14_Firmware><version_pkg>"), ErrorKind::XmlMalformed);
        assert_eq!(
            kind("<Firmware><version_pkg>1.0.0.0</version_pkg></Firmware>"),
            ErrorKind::InvalidFwFile
        );
        assert_eq!(kind("<PX14_Firmware/>"), ErrorKind::InvalidFwFile);
        assert_eq!(
            kind("<PX14_Firmware><version_pkg>1.256.0.0</version_pkg></PX14_Firmware>"),
            ErrorKind::InvalidFwFile
        );
        assert_eq!(
            kind(
                "<PX14_Firmware><version_pkg>1.0.0.0</version_pkg>\
                 <req_minswversion>1.2.3</req_minswversion></PX14_Firmware>"
            ),
            ErrorKind::InvalidFwFile
        );
        assert_eq!(
            kind(
                "<PX14_Firmware><version_pkg>1.0.0.0</version_pkg>\
                 <firmware_chunk id=\"1\"><fwc_version>1.0.0.0</fwc_version>\
                 <fwc_file_count>2</fwc_file_count><fwc_file1>a</fwc_file1>\
                 </firmware_chunk></PX14_Firmware>"
            ),
            ErrorKind::InvalidFwFile
        );
        assert_eq!(
            kind(
                "<PX14_Firmware><version_pkg>1.0.0.0</version_pkg>\
                 <firmware_chunk><fwc_version>1.0.0.0</fwc_version>\
                 <fwc_file_count>0</fwc_file_count></firmware_chunk></PX14_Firmware>"
            ),
            ErrorKind::InvalidFwFile
        );
        assert_eq!(
            kind(
                "<PX14_Firmware><version_pkg>1.0.0.0</version_pkg>\
                 <firmware_chunk id=\"0\"><fwc_version>1.0.0.0</fwc_version>\
                 </firmware_chunk></PX14_Firmware>"
            ),
            ErrorKind::InvalidFwFile
        );
    }

    #[test]
    fn chunk_names() {
        assert_eq!(chunk_name(CHUNK_SYS_V5LX50T_2), "SysV5LX50_2 (xcf16p)");
        assert_eq!(chunk_name(CHUNK_COUNT), "(Unknown firmware chunk type)");
    }

    #[test]
    fn custom_logic_provider() {
        let provider = CustomLogicProvider::parse(
            "<SigFpgaDev_PX14400>\
               <GUID>{8c5b7e1a-3f0e-4b55-9d2b-6c1f0e9a7d21}</GUID>\
               <CustomFwEnum>12</CustomFwEnum>\
               <ShortName>ACME</ShortName>\
             </SigFpgaDev_PX14400>",
        )
        .unwrap();
        assert_eq!(provider.guid, "{8c5b7e1a-3f0e-4b55-9d2b-6c1f0e9a7d21}");
        assert_eq!(provider.custom_fw_enum, 12);
        assert_eq!(provider.short_name, "ACME");
        assert_eq!(provider.client_name, "");

        let err = CustomLogicProvider::parse("<Other><GUID>x</GUID></Other>").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::XmlInvalid);
        let err = CustomLogicProvider::parse(
            "<SigFpgaDev_PX14400><GUID>x</GUID></SigFpgaDev_PX14400>",
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::XmlGeneric);
        let err = CustomLogicProvider::parse("<SigFpgaDev_PX14400>").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::XmlMalformed);
    }
}
