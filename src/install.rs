// src/install.rs

//! Package unpack, migration, and purge.
//!
//! Unpack drives the archive visitor: metadata populates the installed
//! record, scripts attach (running the pre-install/pre-upgrade hook as
//! soon as the first payload entry appears), and every file entry is
//! sanitized, collision-checked, and staged next to its final location.
//!
//! Migration is the second phase: staged files move to their final
//! names in priority-ordered passes, with protected directories keeping
//! user-modified content and diverting replacements to `.apk-new`.
//!
//! Purge is the inverse walk, honoring the same protected-path rules.

use std::fs;
use std::io::Read;

use tracing::{debug, error, info, warn};

use crate::database::Database;
use crate::depend::parse_deps;
use crate::dirtree::{DirUnref, DiriId, FileId};
use crate::error::{Error, Result};
use crate::extract::{ArchiveOpener, ArchiveVisitor, EntryInfo, EntryKind, InstallMeta};
use crate::fsdir::{self, Audit, FileControl, Fsdir};
use crate::hash::Checksum;
use crate::package::{PkgId, Replaces, REPO_CACHED};
use crate::repository;
use crate::script::ScriptKind;

/// Installed-size accounting rounds each payload up to whole blocks.
fn calc_installed_size(size: u64) -> u64 {
    (size + 4095) & !4095
}

/// Progress callback: cumulative installed bytes.
pub type ProgressFn<'a> = &'a mut dyn FnMut(u64);

/// Visitor state for one package unpack.
pub struct InstallCtx<'a, 'p> {
    db: &'a mut Database,
    pkg: PkgId,
    /// Script to run once unpacking starts (pre-install or pre-upgrade).
    script: ScriptKind,
    script_args: Vec<String>,
    script_pending: bool,
    missing_checksum: bool,
    diri: Option<DiriId>,
    installed_size: u64,
    progress: Option<ProgressFn<'p>>,
}

impl<'a, 'p> InstallCtx<'a, 'p> {
    pub fn new(
        db: &'a mut Database,
        pkg: PkgId,
        upgrade: bool,
        script_args: Vec<String>,
        progress: Option<ProgressFn<'p>>,
    ) -> Self {
        Self {
            db,
            pkg,
            script: if upgrade {
                ScriptKind::PreUpgrade
            } else {
                ScriptKind::PreInstall
            },
            script_args,
            script_pending: false,
            missing_checksum: false,
            diri: None,
            installed_size: 0,
            progress,
        }
    }

    fn run_pending_script(&mut self) {
        if !self.script_pending {
            return;
        }
        self.script_pending = false;
        self.db
            .run_ipkg_script(self.pkg, self.script, &self.script_args);
    }

    fn mark_broken_files(&mut self) {
        self.db.ipkg_mut(self.pkg).broken_files = true;
    }

    /// Current directory instance for `dir`, reusing the cursor when the
    /// archive lists files of one directory together.
    fn diri_for(&mut self, dir: &str) -> Option<DiriId> {
        if let Some(cur) = self.diri {
            if self.db.tree.dir(self.db.tree.diri(cur).dir).name.as_ref() == dir {
                return Some(cur);
            }
        }
        let found = self.db.find_diri(self.pkg, dir);
        if found.is_some() {
            self.diri = found;
        }
        found
    }

    fn install_directory_entry(&mut self, dir: &str) -> DiriId {
        let diri = self.db.diri_new_for(self.pkg, dir);
        self.diri = Some(diri);
        diri
    }

    fn install_dir(&mut self, info: &EntryInfo) {
        let name = info.name.trim_end_matches('/');
        let diri = match self.diri_for(name) {
            Some(d) => d,
            None => self.install_directory_entry(name),
        };
        let acl = self.db.acl_of(info);
        self.db.tree.diri_mut(diri).acl = acl;
        let dir = self.db.tree.diri(diri).dir;
        let expected = self
            .db
            .tree
            .dir(dir)
            .owner
            .map(|owner| self.db.tree.diri(owner).acl);
        self.db.apply_diri_permissions(diri);
        self.db.dir_prepare(dir, expected);
    }

    /// Find the hardlink target file within this package.
    fn hardlink_target(&self, link: &str) -> Option<FileId> {
        let (hldir, hlfile) = fsdir::split_dir(link);
        let diri = self.db.find_diri(self.pkg, hldir)?;
        self.db
            .tree
            .diri(diri)
            .files
            .iter()
            .copied()
            .find(|&f| self.db.tree.file(f).name.as_ref() == hlfile)
    }

    fn install_file(&mut self, info: &EntryInfo, content: &mut dyn Read) -> Result<()> {
        let (bdir, bfile) = fsdir::split_dir(&info.name);

        let diri = match self.diri_for(bdir) {
            Some(d) => d,
            None if bdir.is_empty() => self.install_directory_entry(""),
            None => {
                error!(
                    pkg = %self.db.registry.pkg_display(self.pkg),
                    path = %info.name,
                    "no directory entry in archive"
                );
                self.mark_broken_files();
                return Ok(());
            }
        };

        let link_target_file = if info.is_hardlink() {
            let target = self.hardlink_target(info.link_target.as_deref().unwrap());
            if target.is_none() {
                error!(
                    pkg = %self.db.registry.pkg_display(self.pkg),
                    path = %info.name,
                    target = info.link_target.as_deref().unwrap(),
                    "no hard link target in archive"
                );
                self.mark_broken_files();
                return Ok(());
            }
            target
        } else {
            None
        };

        // Collision with an already-owned path?
        let dir = self.db.tree.diri(diri).dir;
        let ofile = self.db.tree.file_query_in(dir, bfile);
        let mut opkg = None;
        if let Some(ofile) = ofile {
            let owner = self.db.tree.diri(self.db.tree.file(ofile).diri).pkg;
            opkg = Some(owner);
            match self.db.registry.pkg_replaces_file(owner, self.pkg) {
                Replaces::Conflict => {
                    if self.db.flags.force_overwrite {
                        warn!(
                            pkg = %self.db.registry.pkg_display(self.pkg),
                            path = %info.name,
                            owner = %self.db.registry.pkg_display(owner),
                            "overwriting file owned by another package"
                        );
                    } else {
                        error!(
                            pkg = %self.db.registry.pkg_display(self.pkg),
                            path = %info.name,
                            owner = %self.db.registry.pkg_display(owner),
                            "trying to overwrite file owned by another package"
                        );
                        self.mark_broken_files();
                        return Ok(());
                    }
                }
                Replaces::No => return Ok(()),
                Replaces::Yes => {}
            }
        }

        // Reinstalling over our own entry updates it in place; otherwise
        // stage a new record that migration will index.
        let file = if opkg == Some(self.pkg) {
            ofile.unwrap()
        } else {
            let default_acl = self.db.default_file_acl;
            self.db.tree.file_new(diri, bfile, default_acl)
        };

        debug!(path = %info.name, "extracting");
        let acl = self.db.acl_of(info);
        self.db.tree.file_mut(file).acl = acl;

        let pkgctx = self.db.registry.pkg_name_str(self.pkg).to_string();
        let flags = self.db.extract_flags();
        let root = self.db.root().to_path_buf();
        match fsdir::extract(
            &root,
            info,
            content,
            Some(&pkgctx),
            flags,
            &mut self.db.id_cache,
        ) {
            Ok(_) => self.assign_checksum(file, info, link_target_file),
            Err(Error::Io(e)) if e.raw_os_error() == Some(nix::libc::ENOSPC) => {
                self.mark_broken_files();
                return Err(Error::Io(e));
            }
            Err(e) => {
                warn!(path = %info.name, error = %e, "extraction failed");
                self.mark_broken_files();
            }
        }
        Ok(())
    }

    fn assign_checksum(&mut self, file: FileId, info: &EntryInfo, link_target: Option<FileId>) {
        let v3 = self.db.ipkg_mut(self.pkg).v3;

        let csum = if let Some(target) = link_target {
            self.db.tree.file(target).csum
        } else {
            match info.digest {
                Checksum::Md5(d) => Checksum::Md5(d),
                Checksum::Sha1(d) => Checksum::Sha1(d),
                _ => Checksum::None,
            }
        };

        let csum = if v3 && info.kind == EntryKind::Symlink {
            // Link checksums are over the target path.
            let target = info.link_target.as_deref().unwrap_or("");
            let full = Checksum::compute(crate::hash::ChecksumKind::Sha256, target.as_bytes());
            let bytes: [u8; 32] = full.data().try_into().expect("sha256 width");
            self.db.ipkg_mut(self.pkg).sha256_160 = true;
            Checksum::sha256_160(&bytes)
        } else if csum.is_none() {
            if let Checksum::Sha256(d) = info.digest {
                self.db.ipkg_mut(self.pkg).sha256_160 = true;
                Checksum::sha256_160(&d)
            } else {
                csum
            }
        } else {
            csum
        };

        if csum.is_none()
            && link_target.is_none()
            && info.kind.needs_checksum()
            && !self.missing_checksum
        {
            warn!(
                pkg = %self.db.registry.pkg_display(self.pkg),
                path = %info.name,
                "package carries no embedded checksums"
            );
            self.mark_broken_files();
            self.missing_checksum = true;
        }

        self.db.tree.file_mut(file).csum = csum;
    }
}

impl ArchiveVisitor for InstallCtx<'_, '_> {
    fn metadata(&mut self, meta: InstallMeta) -> Result<()> {
        let replaces = parse_deps(&mut self.db.registry, &meta.replaces)?;
        {
            let ipkg = self.db.ipkg_mut(self.pkg);
            ipkg.replaces = replaces;
            ipkg.replaces_priority = meta.replaces_priority;
            ipkg.v3 = meta.v3;
            ipkg.triggers = meta.triggers;
        }
        for (kind, blob) in meta.scripts {
            self.script_pending |= kind == self.script;
            self.db.ipkg_mut(self.pkg).set_script(kind, blob);
        }
        let has_triggers = !self.db.ipkg_mut(self.pkg).triggers.is_empty();
        if has_triggers {
            self.db.trigger_list_add(self.pkg);
        }
        Ok(())
    }

    fn script(&mut self, kind: ScriptKind, data: Vec<u8>) -> Result<()> {
        self.script_pending |= kind == self.script;
        self.db.ipkg_mut(self.pkg).set_script(kind, data);
        Ok(())
    }

    fn file(&mut self, info: &EntryInfo, content: &mut dyn Read) -> Result<()> {
        self.run_pending_script();

        // Top-level control entries of the archive itself.
        if info.name.starts_with('.') && !info.name.contains('/') {
            return Ok(());
        }
        if !fsdir::sane_entry_name(&info.name) {
            warn!(
                pkg = %self.db.registry.pkg_display(self.pkg),
                path = %info.name,
                "ignoring malicious file"
            );
            self.mark_broken_files();
            return Ok(());
        }

        let entry_size = calc_installed_size(info.size);
        if info.kind == EntryKind::Dir {
            self.install_dir(info);
        } else {
            self.install_file(info, content)?;
        }

        self.installed_size += entry_size;
        let total = self.db.registry.pkg(self.pkg).installed_size;
        let done = if total > 0 {
            self.installed_size.min(total)
        } else {
            self.installed_size
        };
        if let Some(progress) = self.progress.as_mut() {
            progress(done);
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Unpack
// ----------------------------------------------------------------------

/// Resolve the package source, open it, and drive the extraction
/// visitor. On success the pending pre-script has run and all files are
/// staged.
fn unpack_pkg(
    db: &mut Database,
    pkg: PkgId,
    upgrade: bool,
    opener: &mut dyn ArchiveOpener,
    progress: Option<ProgressFn<'_>>,
    script_args: &[String],
) -> Result<()> {
    let pkg_name = db.registry.pkg_display(pkg);
    let mut need_copy;

    let stream: Box<dyn Read> = if let Some(filename) = db.registry.pkg(pkg).filename.clone() {
        need_copy = true;
        Box::new(fs::File::open(filename.as_ref())?)
    } else {
        let repo = db
            .select_repo(pkg)
            .ok_or_else(|| Error::PackageNotFound(pkg_name.clone()))?;
        need_copy = !db.pkg_in_local_repo(pkg);
        db.open_repo_item(repo, pkg).map_err(|e| match e {
            Error::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                Error::IndexStale(pkg_name.clone())
            }
            other => other,
        })?
    };
    if !db.cache_active() {
        need_copy = false;
    }

    let (stream, tee) = if need_copy {
        let name = db.cache_pkg_name(pkg)?;
        let cache_dir = db.cache_dir().expect("cache active").to_path_buf();
        let (stream, tee) = repository::cache_tee(stream, &cache_dir, &name);
        if tee.is_none() {
            warn!(pkg = %pkg_name, "unable to cache package");
        }
        (stream, tee)
    } else {
        (stream, None)
    };

    let mut archive = opener.open(stream)?;
    let result = {
        let mut ctx = InstallCtx::new(&mut *db, pkg, upgrade, script_args.to_vec(), progress);
        let r = archive.extract(&mut ctx);
        if r.is_ok() {
            ctx.run_pending_script();
        }
        r
    };

    match result {
        Ok(()) => {
            if let Some(tee) = tee {
                if tee.commit().is_ok() {
                    db.registry.pkg_mut(pkg).repos |= REPO_CACHED;
                }
            }
            Ok(())
        }
        Err(e) => {
            if let Some(tee) = tee {
                tee.discard();
            }
            error!(pkg = %pkg_name, error = %e, "unpack failed");
            Err(e)
        }
    }
}

// ----------------------------------------------------------------------
// Migration
// ----------------------------------------------------------------------

/// Move every staged file of `pkg` to its final location, lowest
/// priority first, and take ownership in the file index.
pub fn migrate_files(db: &mut Database, pkg: PkgId) {
    let mut priority = fsdir::PRIO_DISK;
    loop {
        match migrate_files_for_priority(db, pkg, priority) {
            Some(next) => priority = next,
            None => break,
        }
    }
}

fn migrate_files_for_priority(db: &mut Database, pkg: PkgId, priority: u8) -> Option<u8> {
    let mut next_priority: Option<u8> = None;
    let pkgctx = db.registry.pkg_name_str(pkg).to_string();
    let root = db.root().to_path_buf();
    let dirs: Vec<DiriId> = db.ipkg_mut(pkg).dirs.clone();

    for diri_id in dirs {
        let dir = db.tree.diri(diri_id).dir;
        let dirname = db.tree.dir(dir).name.to_string();
        let dir_priority = fsdir::priority(&dirname);
        if dir_priority != priority {
            if dir_priority > priority {
                next_priority = Some(next_priority.map_or(dir_priority, |n| n.min(dir_priority)));
            }
            continue;
        }

        let protected = db.tree.dir(dir).protect_mode.protects();
        let inetc = dirname == "etc";
        db.tree.dir_mut(dir).modified = true;
        let fsd = Fsdir::new(&root, &dirname, Some(&pkgctx));

        let files: Vec<FileId> = db.tree.diri(diri_id).files.clone();
        for file in files {
            let name = db.tree.file(file).name.to_string();
            let ofile = db.tree.file_query_in(dir, &name);

            let mut ctrl = FileControl::Commit;
            let overlay_owner = ofile.is_some_and(|of| {
                let owner = db.tree.diri(db.tree.file(of).diri).pkg;
                db.registry.pkg(owner).name.is_none()
            });
            if overlay_owner {
                // The overlay's copy stays; drop ours.
                ctrl = FileControl::Cancel;
            } else if protected {
                let ocsum = ofile.map(|of| db.tree.file(of).csum);
                if fsd.audit(&name, ocsum.as_ref()) == Audit::Modified {
                    // On-disk file without a database entry or with local
                    // changes. Keep it; decide what happens to ours.
                    let ncsum = db.tree.file(file).csum;
                    if db.flags.clean_protected || fsd.audit(&name, Some(&ncsum)) == Audit::Clean {
                        ctrl = FileControl::Cancel;
                    } else {
                        ctrl = FileControl::ApkNew;
                    }
                }
            }

            if let Err(e) = fsd.control(&name, ctrl) {
                error!(
                    pkg = %db.registry.pkg_display(pkg),
                    path = %format!("{dirname}/{name}"),
                    error = %e,
                    "failed to commit file"
                );
                db.ipkg_mut(pkg).broken_files = true;
            } else if inetc && ctrl == FileControl::Commit && (name == "passwd" || name == "group") {
                // New user database takes effect immediately.
                db.id_cache.reset();
            }

            if ofile != Some(file) {
                db.tree.file_index_replace(file, ofile);
            }
        }
    }
    next_priority
}

// ----------------------------------------------------------------------
// Purge
// ----------------------------------------------------------------------

/// Remove `pkg`'s footprint. With `is_installed`, committed files are
/// deleted (respecting protected paths) and the index is updated; an
/// aborted install instead cancels its staged files.
pub fn purge_pkg(db: &mut Database, pkg: PkgId, is_installed: bool) {
    let pkgctx = db.registry.pkg_name_str(pkg).to_string();
    let root = db.root().to_path_buf();
    let dirs: Vec<DiriId> = match db.registry.pkg(pkg).ipkg.as_ref() {
        Some(ipkg) => ipkg.dirs.clone(),
        None => return,
    };
    let ctrl = if is_installed {
        FileControl::Delete
    } else {
        FileControl::Cancel
    };

    let mut removed_dirs = Vec::new();
    for diri_id in dirs {
        let dir = db.tree.diri(diri_id).dir;
        let dirname = db.tree.dir(dir).name.to_string();
        if is_installed {
            db.tree.dir_mut(dir).modified = true;
        }
        let protected = db.tree.dir(dir).protect_mode.protects();
        let fsd = Fsdir::new(&root, &dirname, Some(&pkgctx));

        let files: Vec<FileId> = db.tree.diri(diri_id).files.clone();
        for file in files {
            let name = db.tree.file(file).name.to_string();
            let csum = db.tree.file(file).csum;
            let keep_on_disk = is_installed
                && protected
                && !db.flags.purge
                && fsd.audit(&name, Some(&csum)) == Audit::Modified;
            if !keep_on_disk && !db.flags.simulate {
                if let Err(e) = fsd.control(&name, ctrl) {
                    debug!(path = %format!("{dirname}/{name}"), error = %e, "purge control failed");
                }
            }
            debug!(path = %format!("{dirname}/{name}"), "purged");
            db.tree.file_remove(file, is_installed);
        }

        if db.tree.diri_free(diri_id, DirUnref::Remove, &mut removed_dirs) {
            db.dirowner_stale = true;
        }
    }
    db.ipkg_mut(pkg).dirs.clear();

    if !db.flags.simulate {
        for dir in removed_dirs {
            let _ = fs::remove_dir(root.join(dir.as_ref()));
        }
    }
}

// ----------------------------------------------------------------------
// Install driver
// ----------------------------------------------------------------------

/// Install, upgrade, or remove one package. `oldpkg` without `newpkg`
/// purges; both run the upgrade path. Returns whether the operation
/// finished without per-package breakage.
pub fn install_pkg(
    db: &mut Database,
    oldpkg: Option<PkgId>,
    newpkg: Option<PkgId>,
    opener: &mut dyn ArchiveOpener,
    progress: Option<ProgressFn<'_>>,
) -> Result<bool> {
    let script_args: Vec<String> = match (oldpkg, newpkg) {
        (Some(old), Some(new)) => vec![
            db.registry.pkg_version_str(new).to_string(),
            db.registry.pkg_version_str(old).to_string(),
        ],
        (Some(pkg), None) | (None, Some(pkg)) => {
            vec![db.registry.pkg_version_str(pkg).to_string()]
        }
        (None, None) => return Ok(true),
    };

    // Pure removal.
    let Some(new) = newpkg else {
        let old = oldpkg.unwrap();
        if db.registry.pkg(old).ipkg.is_some() {
            db.run_ipkg_script(old, ScriptKind::PreDeinstall, &script_args);
            purge_pkg(db, old, true);
            db.run_ipkg_script(old, ScriptKind::PostDeinstall, &script_args);
            db.pkg_uninstall(old);
        }
        return Ok(true);
    };

    info!(
        pkg = %db.registry.pkg_display(new),
        upgrade = oldpkg.is_some(),
        "installing"
    );

    let had_triggers = {
        let ipkg = db.registry.pkg_install(new);
        ipkg.run_all_triggers = true;
        ipkg.broken_files = false;
        ipkg.broken_script = false;
        ipkg.broken_xattr = false;
        let had = !ipkg.triggers.is_empty();
        ipkg.triggers.clear();
        had
    };
    if had_triggers {
        db.trigger_list_remove(new);
    }

    if db.registry.pkg(new).installed_size != 0 {
        if let Err(e) = unpack_pkg(db, new, oldpkg.is_some(), opener, progress, &script_args) {
            if oldpkg != Some(new) {
                purge_pkg(db, new, false);
            }
            db.pkg_uninstall(new);
            return Err(e);
        }
        migrate_files(db, new);
    }

    if let Some(old) = oldpkg {
        if old != new && db.registry.pkg(old).ipkg.is_some() {
            purge_pkg(db, old, true);
            db.pkg_uninstall(old);
        }
    }

    db.run_ipkg_script(
        new,
        if oldpkg.is_some() {
            ScriptKind::PostUpgrade
        } else {
            ScriptKind::PostInstall
        },
        &script_args,
    );

    let ipkg = db.ipkg_mut(new);
    Ok(!(ipkg.broken_files || ipkg.broken_script))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calc_installed_size_rounds_to_blocks() {
        assert_eq!(calc_installed_size(0), 0);
        assert_eq!(calc_installed_size(1), 4096);
        assert_eq!(calc_installed_size(4096), 4096);
        assert_eq!(calc_installed_size(4097), 8192);
    }
}
