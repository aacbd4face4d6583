// src/fsdir.rs

//! Filesystem operations under the database root.
//!
//! Extraction is two-phase: payloads land next to their final location
//! under a deterministic temporary name derived from the owning package
//! and the full path, and a later control action either commits the
//! rename, diverts to `<name>.apk-new`, cancels the staged copy, or
//! deletes the real file. The temporary name being deterministic is what
//! lets an aborted transaction cancel its own leftovers.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::{lchown, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::sys::stat::{mknod, Mode, SFlag, utimensat, UtimensatFlags};
use nix::sys::time::TimeSpec;
use tracing::{debug, warn};

use crate::error::Result;
use crate::extract::{EntryInfo, EntryKind};
use crate::hash::{Checksum, ChecksumKind, Hasher};
use crate::idcache::IdCache;

/// Migration priority of a filesystem location. Plain disk is the only
/// backend here; the migrator still runs its priority passes so further
/// backends slot in behind this constant.
pub const PRIO_DISK: u8 = 0;

pub fn priority(_dir: &str) -> u8 {
    PRIO_DISK
}

/// Control action applied to a staged or installed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileControl {
    /// Rename staged file over the final path.
    Commit,
    /// Keep the on-disk file; rename staged to `<name>.apk-new`.
    ApkNew,
    /// Discard the staged file.
    Cancel,
    /// Remove the installed file.
    Delete,
}

/// Result of comparing an on-disk directory against expected ACLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirStatus {
    Ok,
    Modified,
}

/// Result of auditing an on-disk file against the recorded checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audit {
    Clean,
    Modified,
}

/// Extraction behavior switches derived from database state.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractFlags {
    /// Skip ownership application (usermode roots).
    pub no_chown: bool,
    /// Never unlink an existing staged target first.
    pub no_overwrite: bool,
}

/// One directory under the root, scoped to an owning package context.
pub struct Fsdir<'a> {
    root: &'a Path,
    dir: &'a str,
    pkgctx: Option<&'a str>,
}

impl<'a> Fsdir<'a> {
    pub fn new(root: &'a Path, dir: &'a str, pkgctx: Option<&'a str>) -> Self {
        Self { root, dir, pkgctx }
    }

    fn dir_path(&self) -> PathBuf {
        if self.dir.is_empty() {
            self.root.to_path_buf()
        } else {
            self.root.join(self.dir)
        }
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.dir_path().join(name)
    }

    fn full_name(&self, name: &str) -> String {
        if self.dir.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.dir, name)
        }
    }

    fn tmp_path(&self, name: &str) -> PathBuf {
        let full = self.full_name(name);
        self.dir_path()
            .join(tmpname(self.pkgctx.unwrap_or(""), &full))
    }

    /// Create the directory itself with the given permission bits.
    pub fn create(&self, mode: u32) -> io::Result<()> {
        match fs::create_dir(self.dir_path()) {
            Ok(()) => {
                fs::set_permissions(self.dir_path(), fs::Permissions::from_mode(mode))?;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Remove the directory; fails if non-empty.
    pub fn delete(&self) -> io::Result<()> {
        fs::remove_dir(self.dir_path())
    }

    /// Compare the on-disk directory against the expected ACL.
    pub fn check(&self, mode: u32, uid: u32, gid: u32) -> io::Result<DirStatus> {
        let meta = fs::symlink_metadata(self.dir_path())?;
        if meta.mode() & 0o7777 != mode & 0o7777 || meta.uid() != uid || meta.gid() != gid {
            return Ok(DirStatus::Modified);
        }
        Ok(DirStatus::Ok)
    }

    /// Bring the on-disk directory's permission bits and ownership in
    /// line with the expected ACL.
    pub fn update_perms(&self, mode: u32, uid: u32, gid: u32) -> io::Result<()> {
        let path = self.dir_path();
        let meta = fs::symlink_metadata(&path)?;
        let mut rc = Ok(());
        if meta.mode() & 0o7777 != mode & 0o7777 {
            if let Err(e) = fs::set_permissions(&path, fs::Permissions::from_mode(mode)) {
                rc = Err(e);
            }
        }
        if meta.uid() != uid || meta.gid() != gid {
            if let Err(e) = lchown(&path, Some(uid), Some(gid)) {
                rc = Err(e);
            }
        }
        rc
    }

    /// Apply a control action to `name`.
    pub fn control(&self, name: &str, ctrl: FileControl) -> io::Result<()> {
        let real = self.file_path(name);
        match ctrl {
            FileControl::Commit => fs::rename(self.tmp_path(name), real),
            FileControl::ApkNew => {
                let mut apknew = real.into_os_string();
                apknew.push(".apk-new");
                fs::rename(self.tmp_path(name), apknew)
            }
            FileControl::Cancel => fs::remove_file(self.tmp_path(name)),
            FileControl::Delete => fs::remove_file(real),
        }
    }

    /// Digest the on-disk content of `name`. Symlinks hash their target
    /// path, matching how link checksums are recorded.
    pub fn digest(&self, name: &str, kind: ChecksumKind) -> io::Result<Checksum> {
        let path = self.file_path(name);
        let meta = fs::symlink_metadata(&path)?;
        if meta.file_type().is_symlink() {
            let target = fs::read_link(&path)?;
            Ok(Checksum::compute(kind, target.as_os_str().as_encoded_bytes()))
        } else {
            let mut file = File::open(&path)?;
            Ok(Checksum::compute_reader(kind, &mut file)?)
        }
    }

    /// Audit `name` against a recorded checksum. A missing file is
    /// clean (nothing to preserve); a file present with no recorded
    /// checksum, or with differing content, is modified.
    pub fn audit(&self, name: &str, expected: Option<&Checksum>) -> Audit {
        let kind = expected.and_then(Checksum::kind);
        let Some(kind) = kind else {
            // No usable checksum; only absence counts as clean.
            return match fs::symlink_metadata(self.file_path(name)) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => Audit::Clean,
                _ => Audit::Modified,
            };
        };
        match self.digest(name, kind) {
            Ok(actual) if Some(&actual) == expected => Audit::Clean,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Audit::Clean,
            _ => Audit::Modified,
        }
    }
}

/// Deterministic staging basename for `fullname` owned by `pkgctx`.
fn tmpname(pkgctx: &str, fullname: &str) -> String {
    let mut h = Hasher::new(ChecksumKind::Sha256);
    h.update(pkgctx.as_bytes());
    h.update(b"\0");
    h.update(fullname.as_bytes());
    format!(".apk.{}", h.finalize().hex_prefix(48))
}

/// Extract one archive entry under `root`, staging non-directories at
/// their temporary name. Returns the number of payload bytes written.
pub fn extract(
    root: &Path,
    info: &EntryInfo,
    content: &mut dyn Read,
    pkgctx: Option<&str>,
    flags: ExtractFlags,
    ids: &mut IdCache,
) -> Result<u64> {
    let (dirname, _basename) = split_dir(&info.name);
    let fsd = Fsdir::new(root, dirname, pkgctx);

    if info.kind == EntryKind::Dir {
        let d = Fsdir::new(root, &info.name, pkgctx);
        d.create(info.mode)?;
        return Ok(0);
    }

    let target = match pkgctx {
        Some(_) => fsd.tmp_path(name_of(&info.name)),
        None => root.join(&info.name),
    };
    if !flags.no_overwrite {
        match fs::remove_file(&target) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    let mut written = 0u64;
    match info.kind {
        EntryKind::Dir => unreachable!(),
        EntryKind::Regular => {
            if let Some(link) = &info.link_target {
                // Hardlinks link against the target's own staging name.
                let (ldir, lbase) = split_dir(link);
                let ltarget = match pkgctx {
                    Some(_) => Fsdir::new(root, ldir, pkgctx).tmp_path(lbase),
                    None => root.join(link),
                };
                fs::hard_link(&ltarget, &target)?;
            } else {
                let mut file = OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(info.mode & 0o7777)
                    .open(&target)?;
                written = io::copy(content, &mut file)?;
                file.sync_data().ok();
                fs::set_permissions(&target, fs::Permissions::from_mode(info.mode & 0o7777))?;
            }
        }
        EntryKind::Symlink => {
            let link = info.link_target.as_deref().unwrap_or("");
            std::os::unix::fs::symlink(link, &target)?;
        }
        EntryKind::BlockDev | EntryKind::CharDev | EntryKind::Fifo | EntryKind::Socket => {
            let sflag = match info.kind {
                EntryKind::BlockDev => SFlag::S_IFBLK,
                EntryKind::CharDev => SFlag::S_IFCHR,
                EntryKind::Fifo => SFlag::S_IFIFO,
                _ => SFlag::S_IFSOCK,
            };
            mknod(
                &target,
                sflag,
                Mode::from_bits_truncate(info.mode),
                info.device,
            )
            .map_err(io::Error::from)?;
        }
    }

    if !flags.no_chown {
        let uid = info
            .uname
            .as_deref()
            .and_then(|n| ids.uid_for(n))
            .unwrap_or(info.uid);
        let gid = info
            .gname
            .as_deref()
            .and_then(|n| ids.gid_for(n))
            .unwrap_or(info.gid);
        if let Err(e) = lchown(&target, Some(uid), Some(gid)) {
            warn!(path = %info.name, error = %e, "failed to set ownership");
        } else if info.mode & 0o7000 != 0 && info.kind != EntryKind::Symlink {
            // chown drops setuid/setgid bits.
            fs::set_permissions(&target, fs::Permissions::from_mode(info.mode & 0o7777))?;
        }
    }

    if info.kind != EntryKind::Symlink && info.mtime != 0 {
        let ts = TimeSpec::new(info.mtime as i64, 0);
        if let Err(e) = utimensat(None, &target, &ts, &ts, UtimensatFlags::NoFollowSymlink) {
            debug!(path = %info.name, error = %e, "failed to preserve modification time");
        }
    }

    Ok(written)
}

/// Split a relative path into `(dirname, basename)`; dirname is empty
/// for top-level entries.
pub fn split_dir(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((dir, base)) => (dir, base),
        None => ("", path),
    }
}

fn name_of(path: &str) -> &str {
    split_dir(path).1
}

/// Reject archive paths that could escape the root: absolute paths,
/// dot and dot-dot segments, control characters.
pub fn sane_entry_name(name: &str) -> bool {
    if name.is_empty() || name.starts_with('/') {
        return false;
    }
    if name.bytes().any(|b| b < 0x20 || b == 0x7f) {
        return false;
    }
    !name
        .split('/')
        .any(|seg| seg.is_empty() || seg == "." || seg == "..")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ids(root: &Path) -> IdCache {
        IdCache::new(root.to_path_buf())
    }

    fn regular(name: &str, mode: u32) -> EntryInfo {
        EntryInfo::new(name, EntryKind::Regular, mode)
    }

    #[test]
    fn test_sane_entry_name() {
        assert!(sane_entry_name("usr/bin/foo"));
        assert!(sane_entry_name("etc/foo.conf"));
        assert!(!sane_entry_name("/etc/shadow"));
        assert!(!sane_entry_name("../etc/shadow"));
        assert!(!sane_entry_name("usr/../../etc/shadow"));
        assert!(!sane_entry_name("usr/./bin"));
        assert!(!sane_entry_name("usr//bin"));
        assert!(!sane_entry_name("usr/\x07bell"));
        assert!(!sane_entry_name(""));
    }

    #[test]
    fn test_extract_stages_then_commit() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("usr/bin")).unwrap();

        let info = regular("usr/bin/tool", 0o755);
        let mut content: &[u8] = b"#!/bin/sh\n";
        extract(
            root.path(),
            &info,
            &mut content,
            Some("toolpkg"),
            ExtractFlags { no_chown: true, ..Default::default() },
            &mut ids(root.path()),
        )
        .unwrap();

        // Staged, not at the final path yet.
        let real = root.path().join("usr/bin/tool");
        assert!(!real.exists());

        let fsd = Fsdir::new(root.path(), "usr/bin", Some("toolpkg"));
        fsd.control("tool", FileControl::Commit).unwrap();
        assert!(real.exists());
        assert_eq!(fs::read(&real).unwrap(), b"#!/bin/sh\n");
        let mode = fs::metadata(&real).unwrap().mode() & 0o7777;
        assert_eq!(mode, 0o755);
    }

    #[test]
    fn test_control_cancel_removes_staged() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("etc")).unwrap();

        let info = regular("etc/app.conf", 0o644);
        let mut content: &[u8] = b"key=value\n";
        extract(
            root.path(),
            &info,
            &mut content,
            Some("app"),
            ExtractFlags { no_chown: true, ..Default::default() },
            &mut ids(root.path()),
        )
        .unwrap();

        let fsd = Fsdir::new(root.path(), "etc", Some("app"));
        fsd.control("app.conf", FileControl::Cancel).unwrap();
        assert!(!root.path().join("etc/app.conf").exists());
        // The staging entry is gone too.
        assert_eq!(fs::read_dir(root.path().join("etc")).unwrap().count(), 0);
    }

    #[test]
    fn test_control_apknew() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("etc")).unwrap();
        fs::write(root.path().join("etc/app.conf"), b"user edited\n").unwrap();

        let info = regular("etc/app.conf", 0o644);
        let mut content: &[u8] = b"shipped\n";
        extract(
            root.path(),
            &info,
            &mut content,
            Some("app"),
            ExtractFlags { no_chown: true, ..Default::default() },
            &mut ids(root.path()),
        )
        .unwrap();

        let fsd = Fsdir::new(root.path(), "etc", Some("app"));
        fsd.control("app.conf", FileControl::ApkNew).unwrap();
        assert_eq!(fs::read(root.path().join("etc/app.conf")).unwrap(), b"user edited\n");
        assert_eq!(
            fs::read(root.path().join("etc/app.conf.apk-new")).unwrap(),
            b"shipped\n"
        );
    }

    #[test]
    fn test_hardlink_against_staged_target() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("usr/bin")).unwrap();
        fs::create_dir_all(root.path().join("usr/sbin")).unwrap();

        let mut content: &[u8] = b"binary";
        extract(
            root.path(),
            &regular("usr/bin/tool", 0o755),
            &mut content,
            Some("pkg"),
            ExtractFlags { no_chown: true, ..Default::default() },
            &mut ids(root.path()),
        )
        .unwrap();

        let mut link = regular("usr/sbin/tool", 0o755);
        link.link_target = Some("usr/bin/tool".to_string());
        let mut empty: &[u8] = b"";
        extract(
            root.path(),
            &link,
            &mut empty,
            Some("pkg"),
            ExtractFlags { no_chown: true, ..Default::default() },
            &mut ids(root.path()),
        )
        .unwrap();

        Fsdir::new(root.path(), "usr/bin", Some("pkg"))
            .control("tool", FileControl::Commit)
            .unwrap();
        Fsdir::new(root.path(), "usr/sbin", Some("pkg"))
            .control("tool", FileControl::Commit)
            .unwrap();

        let a = fs::metadata(root.path().join("usr/bin/tool")).unwrap();
        let b = fs::metadata(root.path().join("usr/sbin/tool")).unwrap();
        assert_eq!(a.ino(), b.ino());
    }

    #[test]
    fn test_dir_check_and_update_perms() {
        let root = TempDir::new().unwrap();
        let fsd = Fsdir::new(root.path(), "var/lib", None);
        fs::create_dir_all(root.path().join("var")).unwrap();
        fsd.create(0o755).unwrap();

        assert_eq!(fsd.check(0o755, meta_uid(root.path()), meta_gid(root.path())).unwrap(), DirStatus::Ok);
        assert_eq!(
            fsd.check(0o700, meta_uid(root.path()), meta_gid(root.path())).unwrap(),
            DirStatus::Modified
        );

        fsd.update_perms(0o700, meta_uid(root.path()), meta_gid(root.path())).unwrap();
        assert_eq!(fsd.check(0o700, meta_uid(root.path()), meta_gid(root.path())).unwrap(), DirStatus::Ok);

        let missing = Fsdir::new(root.path(), "does/not/exist", None);
        assert_eq!(
            missing.check(0o755, 0, 0).unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
    }

    fn meta_uid(p: &Path) -> u32 {
        fs::metadata(p).unwrap().uid()
    }

    fn meta_gid(p: &Path) -> u32 {
        fs::metadata(p).unwrap().gid()
    }

    #[test]
    fn test_audit_states() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("etc")).unwrap();
        let fsd = Fsdir::new(root.path(), "etc", None);

        let recorded = Checksum::compute(ChecksumKind::Sha256, b"original\n");
        // Absent file is clean.
        assert_eq!(fsd.audit("app.conf", Some(&recorded)), Audit::Clean);

        fs::write(root.path().join("etc/app.conf"), b"original\n").unwrap();
        assert_eq!(fsd.audit("app.conf", Some(&recorded)), Audit::Clean);

        fs::write(root.path().join("etc/app.conf"), b"edited\n").unwrap();
        assert_eq!(fsd.audit("app.conf", Some(&recorded)), Audit::Modified);

        // Present but no recorded checksum: modified.
        assert_eq!(fsd.audit("app.conf", None), Audit::Modified);
    }

    #[test]
    fn test_audit_symlink_hashes_target() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("etc")).unwrap();
        std::os::unix::fs::symlink("../run/app", root.path().join("etc/app.link")).unwrap();
        let fsd = Fsdir::new(root.path(), "etc", None);

        let good = Checksum::compute(ChecksumKind::Sha1, b"../run/app");
        assert_eq!(fsd.audit("app.link", Some(&good)), Audit::Clean);
        let bad = Checksum::compute(ChecksumKind::Sha1, b"/somewhere/else");
        assert_eq!(fsd.audit("app.link", Some(&bad)), Audit::Modified);
    }
}
