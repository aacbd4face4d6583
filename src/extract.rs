// src/extract.rs

//! The archive-event seam between external package codecs and the
//! installer.
//!
//! Both archive generations (tar-with-control-stream and the ADB
//! format) decode outside this crate. What crosses the boundary is a
//! visitor protocol: the codec drives `ArchiveVisitor` with metadata,
//! script, and file events in archive order, and the installer is the
//! visitor. File content arrives as a reader so payloads stream straight
//! into staging without buffering.

use std::io::Read;

use crate::error::Result;
use crate::hash::Checksum;
use crate::script::ScriptKind;

/// File-type of an archive entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    Regular,
    Symlink,
    BlockDev,
    CharDev,
    Fifo,
    Socket,
}

impl EntryKind {
    /// Entry types whose content carries a checksum.
    pub fn needs_checksum(&self) -> bool {
        matches!(self, Self::Dir | Self::Regular | Self::Symlink)
    }
}

/// Metadata of one archive entry, as provided by the codec.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    /// Path relative to the root, as stored in the archive.
    pub name: String,
    pub kind: EntryKind,
    /// Permission bits.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Symbolic owner names; resolved against the target root's
    /// passwd/group when present (newer archives carry these).
    pub uname: Option<String>,
    pub gname: Option<String>,
    pub size: u64,
    /// Symlink target, or hardlink target for a `Regular` entry.
    pub link_target: Option<String>,
    /// Content digest from the archive, when the format embeds one.
    pub digest: Checksum,
    /// Digest over the entry's extended attributes.
    pub xattr_digest: Checksum,
    pub device: u64,
    pub mtime: u64,
}

impl EntryInfo {
    pub fn new(name: &str, kind: EntryKind, mode: u32) -> Self {
        Self {
            name: name.to_string(),
            kind,
            mode,
            uid: 0,
            gid: 0,
            uname: None,
            gname: None,
            size: 0,
            link_target: None,
            digest: Checksum::None,
            xattr_digest: Checksum::None,
            device: 0,
            mtime: 0,
        }
    }

    /// Is this regular entry a hardlink?
    pub fn is_hardlink(&self) -> bool {
        self.kind == EntryKind::Regular && self.link_target.is_some()
    }
}

/// Installed-state metadata delivered ahead of the payload. The two
/// archive generations deliver this differently (control stream vs.
/// metadata block); the codec normalizes to this form.
#[derive(Debug, Clone, Default)]
pub struct InstallMeta {
    /// Space-separated replaces list, dependency syntax.
    pub replaces: String,
    pub replaces_priority: u64,
    /// Trigger glob patterns.
    pub triggers: Vec<String>,
    /// Set for the current-generation format; switches symlink checksum
    /// handling.
    pub v3: bool,
    /// Scripts embedded in the metadata block (current generation only;
    /// the legacy format delivers scripts as separate events).
    pub scripts: Vec<(ScriptKind, Vec<u8>)>,
}

/// Receiver of archive events, in archive order.
pub trait ArchiveVisitor {
    fn metadata(&mut self, meta: InstallMeta) -> Result<()>;

    fn script(&mut self, kind: ScriptKind, data: Vec<u8>) -> Result<()>;

    fn file(&mut self, info: &EntryInfo, content: &mut dyn Read) -> Result<()>;
}

/// One package archive being decoded.
pub trait PackageArchive {
    /// Drive the visitor over the whole archive.
    fn extract(&mut self, visitor: &mut dyn ArchiveVisitor) -> Result<()>;
}

/// Factory turning a raw package byte stream into a decodable archive;
/// the host wires the actual codec in here.
pub trait ArchiveOpener {
    fn open(&mut self, stream: Box<dyn Read>) -> Result<Box<dyn PackageArchive>>;
}
