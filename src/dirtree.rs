// src/dirtree.rs

//! Reference-counted directory tree and the global file index.
//!
//! Directories are shared between packages: each owning package holds a
//! `DirInstance`, and the `Dir` itself stays alive while any instance
//! references it. A directory that drops to zero references is cleared
//! but kept in the arena so its `modified` flag stays visible to trigger
//! matching, and so a later install can revive it.
//!
//! Files are keyed by `(directory, basename)` in one global index; each
//! file belongs to exactly one `DirInstance`. Per-instance file lists
//! preserve insertion order, which the database writer relies on.

use std::collections::HashMap;

use glob::{MatchOptions, Pattern};

use crate::atom::AclId;
use crate::hash::Checksum;
use crate::package::PkgId;

/// Handle to a directory node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirId(pub(crate) u32);

/// Handle to a package's claim on a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiriId(pub(crate) u32);

/// Handle to a file record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(pub(crate) u32);

/// Protection policy of a directory subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtectMode {
    #[default]
    None,
    /// Explicitly unprotected, overriding an inherited mode.
    Ignore,
    /// Keep user-modified files; ship replacements as `.apk-new`.
    Changed,
    SymlinksOnly,
    All,
}

impl ProtectMode {
    /// Does this mode actually protect contents? `None` and `Ignore`
    /// both behave unprotected.
    pub fn protects(&self) -> bool {
        matches!(self, Self::Changed | Self::SymlinksOnly | Self::All)
    }
}

/// A protected-path pattern relative to some directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedPath {
    pub pattern: Box<str>,
    pub mode: ProtectMode,
}

/// Parse protected-path configuration lines. The first character selects
/// the mode: `-` ignore, `+` changed, `@` symlinks-only, `!` all; a bare
/// path defaults to changed. `#` starts a comment.
pub fn parse_protected_paths(content: &str, out: &mut Vec<ProtectedPath>) {
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (mode, rest) = match line.as_bytes()[0] {
            b'-' => (ProtectMode::Ignore, &line[1..]),
            b'+' => (ProtectMode::Changed, &line[1..]),
            b'@' => (ProtectMode::SymlinksOnly, &line[1..]),
            b'!' => (ProtectMode::All, &line[1..]),
            _ => (ProtectMode::Changed, line),
        };
        let pattern = rest.trim_matches('/');
        if pattern.is_empty() {
            continue;
        }
        out.push(ProtectedPath {
            pattern: pattern.into(),
            mode,
        });
    }
}

fn segment_matches(pattern: &str, segment: &str) -> bool {
    match Pattern::new(pattern) {
        Ok(p) => p.matches_with(
            segment,
            MatchOptions {
                require_literal_separator: true,
                ..MatchOptions::default()
            },
        ),
        Err(_) => pattern == segment,
    }
}

/// A directory node, keyed by canonical path without trailing slash.
pub struct Dir {
    /// Canonical relative path; empty for the root.
    pub name: Box<str>,
    pub parent: Option<DirId>,
    /// Owning dir-instance count, plus one per outstanding lookup.
    pub refs: u32,
    /// The instance whose ACL governs the on-disk directory.
    pub owner: Option<DiriId>,
    pub protect_mode: ProtectMode,
    /// Multi-segment protected patterns inherited into this directory,
    /// with the leading segment stripped.
    pub protected_paths: Vec<ProtectedPath>,
    pub created: bool,
    pub modified: bool,
    pub permissions_ok: bool,
    pub permissions_stale: bool,
    pub has_protected_children: bool,
}

impl Dir {
    /// Path as matched by triggers: rooted with a leading slash.
    pub fn rooted_name(&self) -> String {
        format!("/{}", self.name)
    }

    fn basename(&self) -> &str {
        match self.name.rfind('/') {
            Some(i) => &self.name[i + 1..],
            None => &self.name,
        }
    }
}

/// One package's claim on a directory.
pub struct DirInstance {
    pub pkg: PkgId,
    pub dir: DirId,
    pub acl: AclId,
    /// Owned files in insertion order.
    pub files: Vec<FileId>,
}

/// A file owned by a dir-instance.
pub struct FileEntry {
    pub diri: DiriId,
    pub name: Box<str>,
    pub acl: AclId,
    pub csum: Checksum,
}

/// What to do with the on-disk directory when its last reference drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirUnref {
    /// Release bookkeeping only (database close).
    Free,
    /// Also try to remove the directory from the filesystem.
    Remove,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TreeStats {
    pub dirs: usize,
    pub files: usize,
}

/// The directory tree, dir-instance arena, and global file index.
pub struct DirTree {
    dirs: Vec<Dir>,
    dir_index: HashMap<Box<str>, DirId>,
    diris: Vec<Option<DirInstance>>,
    free_diris: Vec<u32>,
    files: Vec<Option<FileEntry>>,
    free_files: Vec<u32>,
    file_index: HashMap<(DirId, Box<str>), FileId>,
    /// Database-level protected path configuration, applied to top-level
    /// directories.
    pub protected_paths: Vec<ProtectedPath>,
    pub stats: TreeStats,
}

impl DirTree {
    pub fn new(protected_paths: Vec<ProtectedPath>) -> Self {
        Self {
            dirs: Vec::new(),
            dir_index: HashMap::new(),
            diris: Vec::new(),
            free_diris: Vec::new(),
            files: Vec::new(),
            free_files: Vec::new(),
            file_index: HashMap::new(),
            protected_paths,
            stats: TreeStats::default(),
        }
    }

    pub fn dir(&self, id: DirId) -> &Dir {
        &self.dirs[id.0 as usize]
    }

    pub fn dir_mut(&mut self, id: DirId) -> &mut Dir {
        &mut self.dirs[id.0 as usize]
    }

    pub fn dirs(&self) -> impl Iterator<Item = DirId> + '_ {
        (0..self.dirs.len() as u32).map(DirId)
    }

    /// Look up a directory without creating or referencing it.
    pub fn dir_query(&self, path: &str) -> Option<DirId> {
        self.dir_index.get(path.trim_end_matches('/')).copied()
    }

    pub fn dir_ref(&mut self, id: DirId) -> DirId {
        self.dirs[id.0 as usize].refs += 1;
        id
    }

    /// Look up or create a directory, taking a reference. New and
    /// revived nodes inherit protection from the parent chain and the
    /// database-level pattern list.
    pub fn dir_get(&mut self, path: &str) -> DirId {
        let path = path.trim_end_matches('/');
        if let Some(&id) = self.dir_index.get(path) {
            if self.dirs[id.0 as usize].refs > 0 {
                return self.dir_ref(id);
            }
        }

        let id = match self.dir_index.get(path) {
            Some(&id) => id,
            None => {
                let id = DirId(self.dirs.len() as u32);
                self.dirs.push(Dir {
                    name: path.into(),
                    parent: None,
                    refs: 0,
                    owner: None,
                    protect_mode: ProtectMode::None,
                    protected_paths: Vec::new(),
                    created: false,
                    modified: false,
                    permissions_ok: false,
                    permissions_stale: false,
                    has_protected_children: false,
                });
                self.dir_index.insert(path.into(), id);
                id
            }
        };

        self.stats.dirs += 1;
        self.dirs[id.0 as usize].refs = 1;

        let inherited: Option<Vec<ProtectedPath>> = if path.is_empty() {
            self.dirs[id.0 as usize].parent = None;
            self.dirs[id.0 as usize].has_protected_children = true;
            None
        } else if let Some((parent_path, _)) = path.rsplit_once('/') {
            let parent = self.dir_get(parent_path);
            let (mode, ppaths) = {
                let p = &self.dirs[parent.0 as usize];
                (p.protect_mode, p.protected_paths.clone())
            };
            let dir = &mut self.dirs[id.0 as usize];
            dir.parent = Some(parent);
            dir.protect_mode = mode;
            dir.has_protected_children = mode.protects();
            Some(ppaths)
        } else {
            let parent = self.dir_get("");
            self.dirs[id.0 as usize].parent = Some(parent);
            Some(self.protected_paths.clone())
        };

        if let Some(ppaths) = inherited {
            let basename = self.dirs[id.0 as usize].basename().to_string();
            let mut own_mode = self.dirs[id.0 as usize].protect_mode;
            let mut own_paths = Vec::new();
            let mut protected_children = self.dirs[id.0 as usize].has_protected_children;
            for ppath in &ppaths {
                match ppath.pattern.split_once('/') {
                    Some((head, rest)) => {
                        if !segment_matches(head, &basename) {
                            continue;
                        }
                        own_paths.push(ProtectedPath {
                            pattern: rest.into(),
                            mode: ppath.mode,
                        });
                    }
                    None => {
                        if !segment_matches(&ppath.pattern, &basename) {
                            continue;
                        }
                        own_mode = ppath.mode;
                    }
                }
                protected_children |= ppath.mode.protects();
            }
            let dir = &mut self.dirs[id.0 as usize];
            dir.protect_mode = own_mode;
            dir.protected_paths = own_paths;
            dir.has_protected_children = protected_children;
        }

        id
    }

    /// Drop a reference. At zero the node is cleared and, in `Remove`
    /// mode, its path is appended to `removed` for the caller to rmdir.
    /// Parent references cascade.
    pub fn dir_unref(&mut self, id: DirId, mode: DirUnref, removed: &mut Vec<Box<str>>) {
        let mut cur = Some(id);
        while let Some(d) = cur {
            let dir = &mut self.dirs[d.0 as usize];
            dir.refs -= 1;
            if dir.refs > 0 {
                break;
            }
            self.stats.dirs -= 1;
            let dir = &mut self.dirs[d.0 as usize];
            dir.protected_paths.clear();
            let next = if !dir.name.is_empty() {
                if mode == DirUnref::Remove {
                    dir.modified = true;
                    removed.push(dir.name.clone());
                }
                dir.parent.take()
            } else {
                None
            };
            let dir = &mut self.dirs[d.0 as usize];
            dir.created = false;
            dir.permissions_ok = false;
            dir.permissions_stale = false;
            cur = next;
        }
    }

    // ------------------------------------------------------------------
    // Directory instances
    // ------------------------------------------------------------------

    /// Create a package's claim on `path`, taking a directory reference.
    /// The caller links the returned id into the package's list.
    pub fn diri_new(&mut self, pkg: PkgId, path: &str, default_acl: AclId) -> DiriId {
        let dir = self.dir_get(path);
        let diri = DirInstance {
            pkg,
            dir,
            acl: default_acl,
            files: Vec::new(),
        };
        if let Some(slot) = self.free_diris.pop() {
            self.diris[slot as usize] = Some(diri);
            DiriId(slot)
        } else {
            let id = DiriId(self.diris.len() as u32);
            self.diris.push(Some(diri));
            id
        }
    }

    pub fn diri(&self, id: DiriId) -> &DirInstance {
        self.diris[id.0 as usize].as_ref().expect("live dir instance")
    }

    pub fn diri_mut(&mut self, id: DiriId) -> &mut DirInstance {
        self.diris[id.0 as usize].as_mut().expect("live dir instance")
    }

    /// Release a claim. Returns true when the directory lost its owner,
    /// so the caller can schedule an ownership sweep.
    pub fn diri_free(&mut self, id: DiriId, mode: DirUnref, removed: &mut Vec<Box<str>>) -> bool {
        let diri = self.diris[id.0 as usize].take().expect("live dir instance");
        self.free_diris.push(id.0);
        let dir = &mut self.dirs[diri.dir.0 as usize];
        let owner_lost = dir.owner == Some(id);
        if owner_lost {
            dir.owner = None;
        }
        self.dir_unref(diri.dir, mode, removed);
        owner_lost
    }

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    pub fn file(&self, id: FileId) -> &FileEntry {
        self.files[id.0 as usize].as_ref().expect("live file")
    }

    pub fn file_mut(&mut self, id: FileId) -> &mut FileEntry {
        self.files[id.0 as usize].as_mut().expect("live file")
    }

    /// Global index lookup by directory path and basename.
    pub fn file_query(&self, dir: &str, name: &str) -> Option<FileId> {
        let dir = self.dir_query(dir)?;
        self.file_query_in(dir, name)
    }

    pub fn file_query_in(&self, dir: DirId, name: &str) -> Option<FileId> {
        self.file_index.get(&(dir, name.into())).copied()
    }

    fn file_alloc(&mut self, entry: FileEntry) -> FileId {
        if let Some(slot) = self.free_files.pop() {
            self.files[slot as usize] = Some(entry);
            FileId(slot)
        } else {
            let id = FileId(self.files.len() as u32);
            self.files.push(Some(entry));
            id
        }
    }

    /// Create a file owned by `diri` without touching the global index.
    /// Used during install staging; migration indexes it later.
    pub fn file_new(&mut self, diri: DiriId, name: &str, default_acl: AclId) -> FileId {
        let id = self.file_alloc(FileEntry {
            diri,
            name: name.into(),
            acl: default_acl,
            csum: Checksum::None,
        });
        self.diri_mut(diri).files.push(id);
        id
    }

    /// Find or create an indexed file record; the database reader path.
    pub fn file_get(&mut self, diri: DiriId, name: &str, default_acl: AclId) -> FileId {
        let dir = self.diri(diri).dir;
        if let Some(id) = self.file_query_in(dir, name) {
            return id;
        }
        let id = self.file_alloc(FileEntry {
            diri,
            name: name.into(),
            acl: default_acl,
            csum: Checksum::None,
        });
        self.diri_mut(diri).files.push(id);
        self.file_index.insert((dir, name.into()), id);
        self.stats.files += 1;
        id
    }

    /// Insert a staged file into the global index, displacing `old` if
    /// given. Returns with index and stats consistent.
    pub fn file_index_replace(&mut self, id: FileId, old: Option<FileId>) {
        let (dir, name) = {
            let f = self.file(id);
            (self.diri(f.diri).dir, f.name.clone())
        };
        if let Some(old) = old {
            if old == id {
                return;
            }
            let odiri = self.file(old).diri;
            self.diri_mut(odiri).files.retain(|&f| f != old);
            self.files[old.0 as usize] = None;
            self.free_files.push(old.0);
        } else {
            self.stats.files += 1;
        }
        self.file_index.insert((dir, name), id);
    }

    /// Remove a file from the arena, and from the global index when
    /// `indexed` (a staged-but-never-committed file is not indexed).
    pub fn file_remove(&mut self, id: FileId, indexed: bool) {
        let entry = self.files[id.0 as usize].take().expect("live file");
        self.free_files.push(id.0);
        if indexed {
            let dir = self.diri(entry.diri).dir;
            if self.file_index.get(&(dir, entry.name.clone())) == Some(&id) {
                self.file_index.remove(&(dir, entry.name));
                self.stats.files -= 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::{Acl, AclTable};

    fn default_acl() -> (AclTable, AclId) {
        let mut acls = AclTable::new();
        let id = acls.atomize(Acl::new(0o755, 0, 0));
        (acls, id)
    }

    fn etc_protected() -> Vec<ProtectedPath> {
        let mut out = Vec::new();
        parse_protected_paths("+etc\n@etc/init.d\n!etc/apk\n", &mut out);
        out
    }

    #[test]
    fn test_parse_protected_paths() {
        let mut out = Vec::new();
        parse_protected_paths("# comment\n\n+etc\n-var/cache\n@lib/modules\n!secret\nplain\n", &mut out);
        assert_eq!(out.len(), 5);
        assert_eq!(out[0].mode, ProtectMode::Changed);
        assert_eq!(out[1].mode, ProtectMode::Ignore);
        assert_eq!(out[1].pattern.as_ref(), "var/cache");
        assert_eq!(out[2].mode, ProtectMode::SymlinksOnly);
        assert_eq!(out[3].mode, ProtectMode::All);
        assert_eq!(out[4].mode, ProtectMode::Changed);
    }

    #[test]
    fn test_dir_get_idempotent_refcount() {
        let mut tree = DirTree::new(Vec::new());
        let a = tree.dir_get("usr/bin");
        let b = tree.dir_get("usr/bin");
        assert_eq!(a, b);
        assert_eq!(tree.dir(a).refs, 2);
        // Parent chain was created and referenced.
        let usr = tree.dir_query("usr").unwrap();
        assert_eq!(tree.dir(usr).refs, 1);
        assert!(tree.dir_query("").is_some());
    }

    #[test]
    fn test_dir_unref_cascades_and_clears() {
        let mut tree = DirTree::new(Vec::new());
        let id = tree.dir_get("usr/share/doc");
        tree.dir_mut(id).created = true;
        let before = tree.stats.dirs;

        let mut removed = Vec::new();
        tree.dir_unref(id, DirUnref::Remove, &mut removed);
        assert_eq!(
            removed,
            vec![Box::from("usr/share/doc"), Box::from("usr/share"), Box::from("usr")]
        );
        assert_eq!(tree.dir(id).refs, 0);
        assert!(!tree.dir(id).created);
        assert!(tree.dir(id).modified);
        assert_eq!(tree.stats.dirs, before - 4);
    }

    #[test]
    fn test_dir_revival_after_unref() {
        let mut tree = DirTree::new(Vec::new());
        let id = tree.dir_get("opt");
        let mut removed = Vec::new();
        tree.dir_unref(id, DirUnref::Free, &mut removed);
        assert!(removed.is_empty());

        let revived = tree.dir_get("opt");
        assert_eq!(revived, id);
        assert_eq!(tree.dir(id).refs, 1);
    }

    #[test]
    fn test_protection_inheritance() {
        let mut tree = DirTree::new(etc_protected());
        let etc = tree.dir_get("etc");
        assert_eq!(tree.dir(etc).protect_mode, ProtectMode::Changed);
        // Multi-segment patterns descend with the head stripped.
        assert_eq!(tree.dir(etc).protected_paths.len(), 2);

        let initd = tree.dir_get("etc/init.d");
        assert_eq!(tree.dir(initd).protect_mode, ProtectMode::SymlinksOnly);
        let apk = tree.dir_get("etc/apk");
        assert_eq!(tree.dir(apk).protect_mode, ProtectMode::All);
        // Unmatched children inherit the parent's mode.
        let other = tree.dir_get("etc/conf.d");
        assert_eq!(tree.dir(other).protect_mode, ProtectMode::Changed);
        // Unrelated trees stay unprotected.
        let usr = tree.dir_get("usr/bin");
        assert_eq!(tree.dir(usr).protect_mode, ProtectMode::None);
        assert!(!tree.dir(usr).protect_mode.protects());
    }

    #[test]
    fn test_file_index_query() {
        let (_acls, acl) = default_acl();
        let mut tree = DirTree::new(Vec::new());
        let diri = tree.diri_new(PkgId(0), "usr/bin", acl);
        let file = tree.file_get(diri, "busybox", acl);

        assert_eq!(tree.file_query("usr/bin", "busybox"), Some(file));
        assert_eq!(tree.file_query("usr/bin/", "busybox"), Some(file));
        assert_eq!(tree.file_query("usr/bin", "nope"), None);
        assert_eq!(tree.file_query("usr/lib", "busybox"), None);
        assert_eq!(tree.stats.files, 1);

        // file_get is idempotent for the same key.
        assert_eq!(tree.file_get(diri, "busybox", acl), file);
        assert_eq!(tree.stats.files, 1);
    }

    #[test]
    fn test_staged_file_not_indexed_until_replace() {
        let (_acls, acl) = default_acl();
        let mut tree = DirTree::new(Vec::new());
        let diri = tree.diri_new(PkgId(0), "usr/bin", acl);
        let staged = tree.file_new(diri, "tool", acl);
        assert_eq!(tree.file_query("usr/bin", "tool"), None);
        assert_eq!(tree.stats.files, 0);

        tree.file_index_replace(staged, None);
        assert_eq!(tree.file_query("usr/bin", "tool"), Some(staged));
        assert_eq!(tree.stats.files, 1);
    }

    #[test]
    fn test_file_index_replace_displaces_old_owner() {
        let (_acls, acl) = default_acl();
        let mut tree = DirTree::new(Vec::new());
        let old_diri = tree.diri_new(PkgId(0), "usr/bin", acl);
        let old = tree.file_get(old_diri, "tool", acl);

        let new_diri = tree.diri_new(PkgId(1), "usr/bin", acl);
        let staged = tree.file_new(new_diri, "tool", acl);
        tree.file_index_replace(staged, Some(old));

        assert_eq!(tree.file_query("usr/bin", "tool"), Some(staged));
        assert!(tree.diri(old_diri).files.is_empty());
        assert_eq!(tree.stats.files, 1);
    }

    #[test]
    fn test_diri_free_drops_owner_and_refs() {
        let (_acls, acl) = default_acl();
        let mut tree = DirTree::new(Vec::new());
        let diri = tree.diri_new(PkgId(0), "usr/lib", acl);
        let dir = tree.diri(diri).dir;
        tree.dir_mut(dir).owner = Some(diri);

        let mut removed = Vec::new();
        let owner_lost = tree.diri_free(diri, DirUnref::Remove, &mut removed);
        assert!(owner_lost);
        assert_eq!(tree.dir(dir).refs, 0);
        assert!(removed.iter().any(|p| p.as_ref() == "usr/lib"));
    }

    #[test]
    fn test_refs_equal_instance_count() {
        let (_acls, acl) = default_acl();
        let mut tree = DirTree::new(Vec::new());
        let d1 = tree.diri_new(PkgId(0), "usr/bin", acl);
        let d2 = tree.diri_new(PkgId(1), "usr/bin", acl);
        let dir = tree.diri(d1).dir;
        assert_eq!(tree.diri(d2).dir, dir);
        assert_eq!(tree.dir(dir).refs, 2);

        let mut removed = Vec::new();
        tree.diri_free(d1, DirUnref::Free, &mut removed);
        assert_eq!(tree.dir(dir).refs, 1);
    }
}
