// src/fdb.rs

//! Text codec for the installed-package database and its sibling files.
//!
//! The installed database is a sequence of records separated by blank
//! lines; each line is `X:value`. Index fields (package metadata) share
//! the format with repository indexes; the lowercase installed-state
//! fields carry the filesystem footprint:
//!
//! * `F:` opens a directory, `M:` its ACL
//! * `R:` a file in the current directory, `a:` its ACL, `Z:` its checksum
//! * `r:`/`q:` replaces list and priority, `s:` repository tag,
//!   `f:` condition flags
//!
//! Write order is canonical and read/write round-trips: the metadata
//! header, then `r q s f`, then directories with their files in list
//! order. ACLs matching the defaults (`0755 0:0` dirs, `0644 0:0`
//! files) are omitted.
//!
//! The same module writes the scripts archive (a tar of
//! `name-version.<digest>.<action>` entries) and the triggers file
//! (`<digest> glob...` per package).

use std::io::{BufRead, Read, Write};

use tar::{Archive, Builder, EntryType, Header};
use tracing::{debug, warn};

use crate::atom::Acl;
use crate::database::Database;
use crate::depend::{parse_deps, write_deps};
use crate::dirtree::DirUnref;
use crate::error::{Error, Result};
use crate::hash::Checksum;
use crate::package::{Package, PkgId};
use crate::script::ScriptKind;

/// Where a database stream comes from; decides which fields apply and
/// how packages are marked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdbSource {
    /// The installed database of a layer.
    Installed { layer: u8 },
    /// A repository index; the id is the repository slot.
    Repository(usize),
    /// The cached index of non-repository packages.
    NrCache,
}

impl FdbSource {
    fn is_installed(&self) -> bool {
        matches!(self, Self::Installed { .. })
    }

    fn format_error(&self, line: usize) -> Error {
        if self.is_installed() {
            Error::FdbFormat { line }
        } else {
            Error::IndexFormat { line }
        }
    }
}

struct ReadState {
    pkg: Option<PkgId>,
    ipkg_started: bool,
    diri: Option<crate::dirtree::DiriId>,
    file: Option<crate::dirtree::FileId>,
}

impl ReadState {
    fn reset(&mut self) {
        self.pkg = None;
        self.ipkg_started = false;
        self.diri = None;
        self.file = None;
    }
}

/// Read one database stream into the registry and directory tree.
pub fn read_fdb<R: BufRead>(db: &mut Database, reader: R, src: FdbSource) -> Result<()> {
    let mut st = ReadState {
        pkg: None,
        ipkg_started: false,
        diri: None,
        file: None,
    };
    let mut lineno = 0usize;

    for line in reader.lines() {
        let line = line?;
        lineno += 1;

        if line.trim().is_empty() {
            if st.pkg.is_some() {
                finish_record(db, &mut st, src).map_err(|_| src.format_error(lineno))?;
            }
            continue;
        }

        let mut chars = line.bytes();
        let field = chars.next().unwrap() as char;
        if chars.next() != Some(b':') {
            return Err(src.format_error(lineno));
        }
        let value = &line[2..];

        let pkg = match st.pkg {
            Some(p) => p,
            None => {
                let mut fresh = Package::new();
                if let FdbSource::Installed { layer } = src {
                    fresh.layer = layer;
                }
                let id = db.registry.alloc_pkg(fresh);
                st.pkg = Some(id);
                id
            }
        };

        if add_info(db, pkg, field, value).map_err(|_| src.format_error(lineno))? {
            continue;
        }

        if !src.is_installed() {
            // Repository indexes carry only metadata; skip unknown
            // fields for forward compatibility.
            continue;
        }

        // First installed-state field: attach the installed record. This
        // must happen after the name, before any footprint entry.
        if !st.ipkg_started {
            db.registry.pkg_install(pkg);
            st.ipkg_started = true;
        }

        let bad = || src.format_error(lineno);
        match field {
            'F' => {
                if let Some(diri) = st.diri {
                    db.apply_diri_permissions(diri);
                }
                if db.registry.pkg(pkg).name.is_none() {
                    return Err(bad());
                }
                st.diri = Some(find_or_new_diri(db, pkg, value));
                st.file = None;
            }
            'M' | 'a' => {
                let acl = parse_acl(value).ok_or_else(bad)?;
                let acl = db.acls.atomize(acl);
                match field {
                    'M' => db.tree.diri_mut(st.diri.ok_or_else(bad)?).acl = acl,
                    _ => db.tree.file_mut(st.file.ok_or_else(bad)?).acl = acl,
                }
            }
            'R' => {
                let diri = st.diri.ok_or_else(bad)?;
                st.file = Some(db.tree.file_get(diri, value, db.default_file_acl));
            }
            'Z' => {
                let file = st.file.ok_or_else(bad)?;
                db.tree.file_mut(file).csum = Checksum::decode(value).map_err(|_| bad())?;
            }
            'r' => {
                let deps = parse_deps(&mut db.registry, value).map_err(|_| bad())?;
                ipkg_mut(db, pkg).replaces = deps;
            }
            'q' => {
                ipkg_mut(db, pkg).replaces_priority = value.parse().map_err(|_| bad())?;
            }
            's' => {
                let tag = db.get_tag_id(value).map_err(|_| bad())?;
                ipkg_mut(db, pkg).repository_tag = tag;
            }
            'f' => {
                for flag in value.chars() {
                    let ipkg = ipkg_mut(db, pkg);
                    match flag {
                        'f' => ipkg.broken_files = true,
                        's' => ipkg.broken_script = true,
                        'x' => ipkg.broken_xattr = true,
                        'S' => ipkg.sha256_160 = true,
                        _ => {
                            if !db.flags.force_old_apk {
                                warn!("unrecognized installed-db flag '{flag}'");
                                return Err(bad());
                            }
                        }
                    }
                }
            }
            _ => {
                if !db.flags.force_old_apk {
                    warn!("unrecognized installed-db field '{field}' on line {lineno}");
                    return Err(bad());
                }
            }
        }
    }

    if st.pkg.is_some() {
        finish_record(db, &mut st, src).map_err(|_| src.format_error(lineno))?;
    }
    Ok(())
}

fn finish_record(db: &mut Database, st: &mut ReadState, src: FdbSource) -> Result<()> {
    let pkg = st.pkg.expect("record open");
    if let Some(diri) = st.diri {
        db.apply_diri_permissions(diri);
    }
    match src {
        FdbSource::Repository(repo) => {
            db.registry.pkg_mut(pkg).repos |= 1 << repo;
        }
        FdbSource::NrCache => {
            db.registry.pkg_mut(pkg).cached_non_repository = true;
        }
        FdbSource::Installed { .. } => {
            // Installed package without any footprint lines still gets
            // its installed record.
            if !st.ipkg_started {
                db.registry.pkg_install(pkg);
            }
        }
    }
    db.registry.pkg_add(&mut db.tree, pkg, db.open_complete)?;
    st.reset();
    Ok(())
}

fn find_or_new_diri(db: &mut Database, pkg: PkgId, dir: &str) -> crate::dirtree::DiriId {
    let dir = dir.trim_end_matches('/');
    match db.find_diri(pkg, dir) {
        Some(d) => d,
        None => db.diri_new_for(pkg, dir),
    }
}

fn ipkg_mut(db: &mut Database, pkg: PkgId) -> &mut crate::package::InstalledPackage {
    db.registry
        .pkg_mut(pkg)
        .ipkg
        .as_mut()
        .expect("installed record")
}

/// `uid:gid:octal-mode[:xattr-checksum]`
fn parse_acl(value: &str) -> Option<Acl> {
    let mut parts = value.splitn(4, ':');
    let uid = parts.next()?.parse().ok()?;
    let gid = parts.next()?.parse().ok()?;
    let mode = u32::from_str_radix(parts.next()?, 8).ok()?;
    let xattr = match parts.next() {
        Some(csum) => Checksum::decode(csum).ok()?,
        None => Checksum::None,
    };
    Some(Acl::with_xattr(mode, uid, gid, xattr))
}

fn write_acl(out: &mut String, field: char, acl: &Acl) {
    out.push(field);
    out.push(':');
    out.push_str(&format!("{}:{}:{:o}", acl.uid, acl.gid, acl.mode));
    if !acl.xattr_csum.is_none() {
        out.push(':');
        out.push_str(&acl.xattr_csum.encode());
    }
    out.push('\n');
}

// ----------------------------------------------------------------------
// Metadata fields shared with repository indexes
// ----------------------------------------------------------------------

/// Apply one metadata field. Returns false when the field is not a
/// metadata field (an installed-state field, or unknown).
fn add_info(db: &mut Database, pkg: PkgId, field: char, value: &str) -> Result<bool> {
    let reg = &mut db.registry;
    match field {
        'C' => reg.pkg_mut(pkg).digest = Checksum::decode(value)?,
        'P' => {
            let name = reg.get_name(value);
            reg.pkg_mut(pkg).name = Some(name);
        }
        'V' => {
            let v = reg.atoms.atomize_str(value);
            reg.pkg_mut(pkg).version = v;
        }
        'A' => {
            let a = reg.atoms.atomize_str(value);
            reg.pkg_mut(pkg).arch = Some(a);
        }
        'S' => reg.pkg_mut(pkg).size = value.parse().map_err(|_| Error::FdbFormat { line: 0 })?,
        'I' => {
            reg.pkg_mut(pkg).installed_size =
                value.parse().map_err(|_| Error::FdbFormat { line: 0 })?
        }
        'T' => reg.pkg_mut(pkg).description = Some(value.into()),
        'U' => reg.pkg_mut(pkg).url = Some(value.into()),
        'L' => {
            let l = reg.atoms.atomize_str(value);
            reg.pkg_mut(pkg).license = l;
        }
        'o' => {
            let o = reg.atoms.atomize_str(value);
            reg.pkg_mut(pkg).origin = Some(o);
        }
        't' => {
            reg.pkg_mut(pkg).build_time =
                value.parse().map_err(|_| Error::FdbFormat { line: 0 })?
        }
        'D' => {
            let deps = parse_deps(reg, value)?;
            reg.pkg_mut(pkg).depends = deps;
        }
        'p' => {
            let deps = parse_deps(reg, value)?;
            reg.pkg_mut(pkg).provides = deps;
        }
        'i' => {
            let deps = parse_deps(reg, value)?;
            reg.pkg_mut(pkg).install_if = deps;
        }
        _ => return Ok(false),
    }
    Ok(true)
}

/// Write the metadata header in canonical field order.
pub fn write_index_entry(db: &Database, pkg: PkgId, out: &mut String) {
    let reg = &db.registry;
    let p = reg.pkg(pkg);

    if !p.digest.is_none() {
        out.push_str(&format!("C:{}\n", p.digest.encode()));
    }
    out.push_str(&format!("P:{}\n", reg.pkg_name_str(pkg)));
    out.push_str(&format!("V:{}\n", reg.pkg_version_str(pkg)));
    if let Some(arch) = p.arch {
        out.push_str(&format!("A:{}\n", reg.atoms.get_str(arch)));
    }
    if p.size != 0 {
        out.push_str(&format!("S:{}\n", p.size));
    }
    if p.installed_size != 0 {
        out.push_str(&format!("I:{}\n", p.installed_size));
    }
    if let Some(desc) = &p.description {
        out.push_str(&format!("T:{desc}\n"));
    }
    if let Some(url) = &p.url {
        out.push_str(&format!("U:{url}\n"));
    }
    if !p.license.is_null() {
        out.push_str(&format!("L:{}\n", reg.atoms.get_str(p.license)));
    }
    if let Some(origin) = p.origin {
        out.push_str(&format!("o:{}\n", reg.atoms.get_str(origin)));
    }
    if p.build_time != 0 {
        out.push_str(&format!("t:{}\n", p.build_time));
    }
    if !p.depends.is_empty() {
        out.push_str(&format!("D:{}\n", write_deps(reg, &p.depends)));
    }
    if !p.provides.is_empty() {
        out.push_str(&format!("p:{}\n", write_deps(reg, &p.provides)));
    }
    if !p.install_if.is_empty() {
        out.push_str(&format!("i:{}\n", write_deps(reg, &p.install_if)));
    }
}

/// Write one installed-package record, trailing blank line included.
pub fn write_fdb<W: Write>(db: &Database, pkg: PkgId, w: &mut W) -> Result<()> {
    let mut out = String::new();
    write_index_entry(db, pkg, &mut out);

    let reg = &db.registry;
    let ipkg = reg.pkg(pkg).ipkg.as_ref().expect("installed record");

    if !ipkg.replaces.is_empty() {
        out.push_str(&format!("r:{}\n", write_deps(reg, &ipkg.replaces)));
    }
    if ipkg.replaces_priority != 0 {
        out.push_str(&format!("q:{}\n", ipkg.replaces_priority));
    }
    if ipkg.repository_tag != 0 {
        out.push_str(&format!("s:{}\n", db.repo_tags[ipkg.repository_tag].plain_name()));
    }
    if ipkg.broken_files || ipkg.broken_script || ipkg.broken_xattr || ipkg.sha256_160 {
        out.push_str("f:");
        if ipkg.broken_files {
            out.push('f');
        }
        if ipkg.broken_script {
            out.push('s');
        }
        if ipkg.broken_xattr {
            out.push('x');
        }
        if ipkg.sha256_160 {
            out.push('S');
        }
        out.push('\n');
    }

    for &diri_id in &ipkg.dirs {
        let diri = db.tree.diri(diri_id);
        out.push_str(&format!("F:{}\n", db.tree.dir(diri.dir).name));
        if diri.acl != db.default_dir_acl {
            write_acl(&mut out, 'M', db.acls.get(diri.acl));
        }
        for &file_id in &diri.files {
            let file = db.tree.file(file_id);
            out.push_str(&format!("R:{}\n", file.name));
            if file.acl != db.default_file_acl {
                write_acl(&mut out, 'a', db.acls.get(file.acl));
            }
            if !file.csum.is_none() {
                out.push_str(&format!("Z:{}\n", file.csum.encode()));
            }
        }
    }
    out.push('\n');
    w.write_all(out.as_bytes())?;
    Ok(())
}

// ----------------------------------------------------------------------
// Scripts archive
// ----------------------------------------------------------------------

/// Append one package's lifecycle scripts to the archive builder.
/// Entries are named `name-version.<digest>.<action>`, mode 0755, mtime
/// set to the package build time.
pub fn write_scripts<W: Write>(db: &Database, pkg: PkgId, builder: &mut Builder<W>) -> Result<()> {
    let reg = &db.registry;
    let Some(ipkg) = reg.pkg(pkg).ipkg.as_ref() else {
        return Ok(());
    };
    for kind in ScriptKind::ALL {
        let Some(blob) = ipkg.script(kind) else {
            continue;
        };
        let name = format!(
            "{}-{}.{}.{}",
            reg.pkg_name_str(pkg),
            reg.pkg_version_str(pkg),
            reg.pkg(pkg).digest.encode(),
            kind.name()
        );
        let mut header = Header::new_ustar();
        header.set_entry_type(EntryType::Regular);
        header
            .set_path(&name)
            .map_err(|_| Error::NameTooLong(name.clone()))?;
        header.set_size(blob.len() as u64);
        header.set_mode(0o755);
        header.set_mtime(reg.pkg(pkg).build_time);
        header.set_cksum();
        builder.append(&header, blob)?;
    }
    Ok(())
}

/// Load a scripts archive, attaching each entry to the matching
/// installed package. Entries for unknown packages are skipped.
pub fn read_scripts<R: Read>(db: &mut Database, reader: R) -> Result<()> {
    let mut archive = Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type() != EntryType::Regular {
            continue;
        }
        let path = entry.path()?.to_string_lossy().into_owned();
        let Some((digest, kind)) = parse_script_name(&path) else {
            continue;
        };
        let Some(pkg) = db.registry.get_pkg(&digest) else {
            continue;
        };
        if db.registry.pkg(pkg).ipkg.is_none() {
            continue;
        }
        let mut blob = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut blob)?;
        db.registry
            .pkg_mut(pkg)
            .ipkg
            .as_mut()
            .unwrap()
            .set_script(kind, blob);
        debug!(script = %path, "attached lifecycle script");
    }
    Ok(())
}

/// `name-version.<digest>.<action>` → digest and action.
fn parse_script_name(name: &str) -> Option<(Checksum, ScriptKind)> {
    let (rest, action) = name.rsplit_once('.')?;
    let kind = ScriptKind::from_name(action)?;
    let (_, digest) = rest.rsplit_once('.')?;
    let digest = Checksum::decode(digest).ok()?;
    Some((digest, kind))
}

// ----------------------------------------------------------------------
// Triggers file
// ----------------------------------------------------------------------

/// One line per package: `<digest> glob1 glob2 ...`.
pub fn write_triggers<W: Write>(db: &Database, pkg: PkgId, w: &mut W) -> Result<()> {
    let reg = &db.registry;
    let Some(ipkg) = reg.pkg(pkg).ipkg.as_ref() else {
        return Ok(());
    };
    if ipkg.triggers.is_empty() {
        return Ok(());
    }
    let mut line = reg.pkg(pkg).digest.encode();
    for trigger in &ipkg.triggers {
        line.push(' ');
        line.push_str(trigger);
    }
    line.push('\n');
    w.write_all(line.as_bytes())?;
    Ok(())
}

pub fn read_triggers<R: BufRead>(db: &mut Database, reader: R) -> Result<()> {
    for line in reader.lines() {
        let line = line?;
        let mut tokens = line.split_whitespace();
        let Some(digest) = tokens.next() else {
            continue;
        };
        let Ok(digest) = Checksum::decode(digest) else {
            continue;
        };
        let Some(pkg) = db.registry.get_pkg(&digest) else {
            continue;
        };
        if db.registry.pkg(pkg).ipkg.is_none() {
            continue;
        }
        let triggers: Vec<String> = tokens.map(str::to_string).collect();
        let ipkg = db.registry.pkg_mut(pkg).ipkg.as_mut().unwrap();
        ipkg.triggers = triggers;
        if !ipkg.triggers.is_empty() && !ipkg.in_trigger_list {
            ipkg.in_trigger_list = true;
            db.trigger_pkgs.push(pkg);
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Overlay
// ----------------------------------------------------------------------

/// Read an overlay file list: one `dir/file` path per line, a trailing
/// slash denoting a directory. The entries attach to an anonymous
/// package so migration preserves them.
pub fn read_overlay<R: BufRead>(db: &mut Database, reader: R) -> Result<()> {
    let pkg = db.registry.alloc_pkg(Package::new());
    db.registry.pkg_install(pkg);

    let mut cur: Option<crate::dirtree::DiriId> = None;
    for line in reader.lines() {
        let line = line?;
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let (dir, file) = crate::fsdir::split_dir(line.trim_end_matches('/'));
        if line.ends_with('/') {
            // The line itself names a directory.
            let diri = find_or_new_diri(db, pkg, line.trim_end_matches('/'));
            let dir_id = db.tree.diri(diri).dir;
            db.tree.dir_mut(dir_id).created = true;
            cur = Some(diri);
        } else {
            let diri = match cur {
                Some(d) if db.tree.dir(db.tree.diri(d).dir).name.as_ref() == dir => d,
                _ => find_or_new_diri(db, pkg, dir),
            };
            cur = Some(diri);
            db.tree.file_get(diri, file, db.default_file_acl);
        }
    }
    Ok(())
}

/// Free an installed (or overlay) package's footprint at close time.
pub fn free_footprint(db: &mut Database, pkg: PkgId) {
    let dirs = match db.registry.pkg(pkg).ipkg.as_ref() {
        Some(ipkg) => ipkg.dirs.clone(),
        None => return,
    };
    let mut removed = Vec::new();
    for diri in dirs {
        if db.tree.diri_free(diri, DirUnref::Free, &mut removed) {
            db.dirowner_stale = true;
        }
    }
    db.registry
        .pkg_mut(pkg)
        .ipkg
        .as_mut()
        .expect("installed record")
        .dirs
        .clear();
}
