// src/atom.rs

//! Interning tables for blobs and ACL tuples.
//!
//! Versions, architectures, license strings, and repository tags are
//! interned once and referred to by copyable handles; equality is handle
//! equality. ACL tuples go through the same treatment so that "did the
//! ACL change" is a single comparison and every file record stays one
//! handle wide.

use std::collections::HashMap;

use crate::hash::Checksum;

/// Handle to an interned blob. `Atom::NULL` is the empty blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Atom(u32);

impl Atom {
    pub const NULL: Atom = Atom(0);

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

/// Blob interning table.
pub struct AtomTable {
    lookup: HashMap<Box<[u8]>, Atom>,
    blobs: Vec<Box<[u8]>>,
}

impl Default for AtomTable {
    fn default() -> Self {
        Self::new()
    }
}

impl AtomTable {
    pub fn new() -> Self {
        let mut t = Self {
            lookup: HashMap::new(),
            blobs: Vec::new(),
        };
        // Slot 0 is the null atom.
        t.atomize(b"");
        t
    }

    /// Intern a blob, returning the existing handle when an equal blob
    /// is already present.
    pub fn atomize(&mut self, blob: &[u8]) -> Atom {
        if let Some(&atom) = self.lookup.get(blob) {
            return atom;
        }
        let atom = Atom(self.blobs.len() as u32);
        let owned: Box<[u8]> = blob.into();
        self.blobs.push(owned.clone());
        self.lookup.insert(owned, atom);
        atom
    }

    pub fn atomize_str(&mut self, s: &str) -> Atom {
        self.atomize(s.as_bytes())
    }

    pub fn get(&self, atom: Atom) -> &[u8] {
        &self.blobs[atom.0 as usize]
    }

    /// The interned bytes as UTF-8. All atoms this crate creates come
    /// from text fields.
    pub fn get_str(&self, atom: Atom) -> &str {
        std::str::from_utf8(self.get(atom)).unwrap_or("")
    }
}

/// Access-control tuple: permission bits, ownership, optional xattr
/// digest. Stored interned; records hold an `AclId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Acl {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub xattr_csum: Checksum,
}

impl Acl {
    pub fn new(mode: u32, uid: u32, gid: u32) -> Self {
        Self {
            mode: mode & 0o7777,
            uid,
            gid,
            xattr_csum: Checksum::None,
        }
    }

    pub fn with_xattr(mode: u32, uid: u32, gid: u32, xattr_csum: Checksum) -> Self {
        Self {
            mode: mode & 0o7777,
            uid,
            gid,
            xattr_csum,
        }
    }
}

/// Handle to an interned ACL tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AclId(u32);

/// ACL interning table.
#[derive(Default)]
pub struct AclTable {
    lookup: HashMap<Acl, AclId>,
    acls: Vec<Acl>,
}

impl AclTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn atomize(&mut self, acl: Acl) -> AclId {
        if let Some(&id) = self.lookup.get(&acl) {
            return id;
        }
        let id = AclId(self.acls.len() as u32);
        self.acls.push(acl);
        self.lookup.insert(acl, id);
        id
    }

    pub fn get(&self, id: AclId) -> &Acl {
        &self.acls[id.0 as usize]
    }
}
