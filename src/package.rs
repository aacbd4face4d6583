// src/package.rs

//! Package names, packages, and the registries that own them.
//!
//! The registry is the owning store: `Name` and `Package` live in arenas
//! and everything else links to them through copyable handles, which is
//! what lets provider/dependency graphs contain cycles. Packages are
//! keyed by their content digest; inserting a second package with the
//! same digest merges metadata instead of duplicating the record.

use std::collections::HashMap;

use tracing::debug;

use crate::atom::{Atom, AtomTable};
use crate::depend::Dependency;
use crate::dirtree::{DirTree, DiriId};
use crate::error::{Error, Result};
use crate::hash::Checksum;
use crate::script::ScriptKind;

/// Handle to an interned package name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NameId(pub(crate) u32);

/// Handle to a package record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PkgId(pub(crate) u32);

/// Repository bitmask type. Bit 0 is the package cache.
pub type RepoMask = u32;

/// Bit marking a package as present in the local cache.
pub const REPO_CACHED: RepoMask = 1 << 0;

/// One provider of a name: the package, and the version under which it
/// provides the name (`None` for an unversioned virtual).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provider {
    pub pkg: PkgId,
    pub version: Option<Box<str>>,
}

/// A unique package name and the indexes hanging off it.
pub struct Name {
    pub name: Box<str>,
    pub providers: Vec<Provider>,
    pub rdepends: Vec<NameId>,
    pub rinstall_if: Vec<NameId>,
    pub is_dependency: bool,
    /// 0 = a sole real package provides this, 1 = mixed, 2 = virtual only.
    pub priority: u8,
    providers_sorted: bool,
    /// 2-bit scratch used during reverse-dependency recomputation.
    state: u8,
}

impl Name {
    fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            providers: Vec::new(),
            rdepends: Vec::new(),
            rinstall_if: Vec::new(),
            is_dependency: false,
            priority: 0,
            providers_sorted: false,
            state: 0,
        }
    }
}

/// A package record, keyed by content digest.
pub struct Package {
    /// Content digest; the primary key. `Checksum::None` only for the
    /// anonymous overlay package.
    pub digest: Checksum,
    /// `None` only for the anonymous overlay package.
    pub name: Option<NameId>,
    pub version: Atom,
    pub arch: Option<Atom>,
    pub license: Atom,
    pub origin: Option<Atom>,
    pub description: Option<Box<str>>,
    pub url: Option<Box<str>>,
    pub depends: Vec<Dependency>,
    pub provides: Vec<Dependency>,
    pub install_if: Vec<Dependency>,
    pub build_time: u64,
    pub size: u64,
    pub installed_size: u64,
    pub repos: RepoMask,
    pub layer: u8,
    /// Set when installing straight from a file instead of a repository.
    pub filename: Option<Box<str>>,
    /// Present iff the package is installed.
    pub ipkg: Option<InstalledPackage>,
    pub cached_non_repository: bool,
    /// Enumeration scratch for callers walking provider lists.
    pub seen: bool,
}

impl Package {
    pub fn new() -> Self {
        Self {
            digest: Checksum::None,
            name: None,
            version: Atom::NULL,
            arch: None,
            license: Atom::NULL,
            origin: None,
            description: None,
            url: None,
            depends: Vec::new(),
            provides: Vec::new(),
            install_if: Vec::new(),
            build_time: 0,
            size: 0,
            installed_size: 0,
            repos: 0,
            layer: 0,
            filename: None,
            ipkg: None,
            cached_non_repository: false,
            seen: false,
        }
    }

    pub fn is_installed(&self) -> bool {
        self.ipkg.is_some()
    }
}

impl Default for Package {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-installed-package state: the filesystem footprint, lifecycle
/// scripts, trigger globs, and the persisted condition flags.
#[derive(Default)]
pub struct InstalledPackage {
    /// Owned directory instances, in insertion order. The database write
    /// order follows this.
    pub dirs: Vec<DiriId>,
    pub scripts: [Option<Box<[u8]>>; ScriptKind::COUNT],
    pub triggers: Vec<String>,
    /// Pending trigger invocations. The first element is a `None`
    /// placeholder for the script path in the eventual argv.
    pub pending_triggers: Vec<Option<String>>,
    pub replaces: Vec<Dependency>,
    pub replaces_priority: u64,
    pub repository_tag: usize,
    pub broken_files: bool,
    pub broken_script: bool,
    pub broken_xattr: bool,
    /// File checksums are SHA-256 truncated to 160 bits.
    pub sha256_160: bool,
    pub v3: bool,
    /// Fire every registered trigger once, not just matching ones. Set
    /// on fresh install so the package sees its own files.
    pub run_all_triggers: bool,
    /// Membership of the database's trigger-firing list.
    pub(crate) in_trigger_list: bool,
}

impl InstalledPackage {
    pub fn script(&self, kind: ScriptKind) -> Option<&[u8]> {
        self.scripts[kind as usize].as_deref()
    }

    pub fn set_script(&mut self, kind: ScriptKind, blob: Vec<u8>) {
        self.scripts[kind as usize] = Some(blob.into_boxed_slice());
    }
}

/// Outcome of the file/dir replacement policy between two packages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replaces {
    Yes,
    No,
    Conflict,
}

/// Counters mirrored into status output.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegistryStats {
    pub packages: usize,
}

/// Owning store for names and packages.
pub struct Registry {
    pub atoms: AtomTable,
    names: Vec<Name>,
    name_index: HashMap<Box<str>, NameId>,
    packages: Vec<Option<Package>>,
    free_pkgs: Vec<u32>,
    pkg_index: HashMap<Checksum, PkgId>,
    /// Installed packages in installation order.
    pub installed: Vec<PkgId>,
    pub stats: RegistryStats,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            atoms: AtomTable::new(),
            names: Vec::new(),
            name_index: HashMap::new(),
            packages: Vec::new(),
            free_pkgs: Vec::new(),
            pkg_index: HashMap::new(),
            installed: Vec::new(),
            stats: RegistryStats::default(),
        }
    }

    // ------------------------------------------------------------------
    // Names
    // ------------------------------------------------------------------

    /// Look up a name without creating it.
    pub fn query_name(&self, name: &str) -> Option<NameId> {
        self.name_index.get(name).copied()
    }

    /// Look up a name, creating it on first reference.
    pub fn get_name(&mut self, name: &str) -> NameId {
        if let Some(&id) = self.name_index.get(name) {
            return id;
        }
        let id = NameId(self.names.len() as u32);
        self.names.push(Name::new(name));
        self.name_index.insert(name.into(), id);
        id
    }

    pub fn name(&self, id: NameId) -> &Name {
        &self.names[id.0 as usize]
    }

    pub fn name_mut(&mut self, id: NameId) -> &mut Name {
        &mut self.names[id.0 as usize]
    }

    pub fn name_str(&self, id: NameId) -> &str {
        &self.names[id.0 as usize].name
    }

    pub fn names(&self) -> impl Iterator<Item = NameId> + '_ {
        (0..self.names.len() as u32).map(NameId)
    }

    /// Providers of a name sorted by display order.
    pub fn sorted_providers(&mut self, id: NameId) -> &[Provider] {
        if !self.names[id.0 as usize].providers_sorted {
            let mut providers = std::mem::take(&mut self.names[id.0 as usize].providers);
            providers.sort_by(|a, b| self.pkg_display_key(a.pkg).cmp(&self.pkg_display_key(b.pkg)));
            let name = &mut self.names[id.0 as usize];
            name.providers = providers;
            name.providers_sorted = true;
        }
        &self.names[id.0 as usize].providers
    }

    // ------------------------------------------------------------------
    // Packages
    // ------------------------------------------------------------------

    /// Allocate an arena slot for a package under construction. The slot
    /// is not indexed until `pkg_add`.
    pub fn alloc_pkg(&mut self, pkg: Package) -> PkgId {
        if let Some(slot) = self.free_pkgs.pop() {
            self.packages[slot as usize] = Some(pkg);
            return PkgId(slot);
        }
        let id = PkgId(self.packages.len() as u32);
        self.packages.push(Some(pkg));
        id
    }

    pub fn pkg(&self, id: PkgId) -> &Package {
        self.packages[id.0 as usize].as_ref().expect("live package")
    }

    pub fn pkg_mut(&mut self, id: PkgId) -> &mut Package {
        self.packages[id.0 as usize].as_mut().expect("live package")
    }

    pub fn get_pkg(&self, digest: &Checksum) -> Option<PkgId> {
        self.pkg_index.get(digest).copied()
    }

    pub fn pkg_name_str(&self, id: PkgId) -> &str {
        match self.pkg(id).name {
            Some(n) => self.name_str(n),
            None => "",
        }
    }

    pub fn pkg_version_str(&self, id: PkgId) -> &str {
        self.atoms.get_str(self.pkg(id).version)
    }

    /// `name-version` display form.
    pub fn pkg_display(&self, id: PkgId) -> String {
        format!("{}-{}", self.pkg_name_str(id), self.pkg_version_str(id))
    }

    fn pkg_display_key(&self, id: PkgId) -> (String, String) {
        (
            self.pkg_name_str(id).to_string(),
            self.pkg_version_str(id).to_string(),
        )
    }

    /// Canonicalize and index a constructed package. Returns the
    /// surviving id: on digest collision the metadata is merged into the
    /// existing record and the fresh slot is released.
    pub fn pkg_add(
        &mut self,
        tree: &mut DirTree,
        id: PkgId,
        incremental_rdepends: bool,
    ) -> Result<PkgId> {
        {
            let pkg = self.pkg(id);
            if pkg.name.is_none() || pkg.version.is_null() {
                return Err(Error::FdbFormat { line: 0 });
            }
        }
        if self.pkg(id).filename.is_some() {
            self.pkg_mut(id).repos |= REPO_CACHED;
        }

        let digest = self.pkg(id).digest;
        if let Some(&existing) = self.pkg_index.get(&digest) {
            let fresh = self.packages[id.0 as usize].take().expect("live package");
            self.free_pkgs.push(id.0);
            let target = self.pkg_mut(existing);
            target.repos |= fresh.repos;
            if target.filename.is_none() {
                target.filename = fresh.filename;
            }
            if target.ipkg.is_none() {
                if let Some(ipkg) = fresh.ipkg {
                    // Re-point the footprint at the surviving record.
                    for &diri in &ipkg.dirs {
                        tree.diri_mut(diri).pkg = existing;
                    }
                    for slot in self.installed.iter_mut() {
                        if *slot == id {
                            *slot = existing;
                        }
                    }
                    self.pkg_mut(existing).ipkg = Some(ipkg);
                }
            }
            debug!(pkg = %self.pkg_display(existing), "merged duplicate package record");
            return Ok(existing);
        }

        self.pkg_index.insert(digest, id);
        let version = self.pkg_version_str(id).to_string();
        let name = self.pkg(id).name.expect("checked above");
        self.names[name.0 as usize].providers.push(Provider {
            pkg: id,
            version: Some(version.into()),
        });
        self.names[name.0 as usize].providers_sorted = false;
        let provides: Vec<(NameId, Option<Box<str>>)> = self
            .pkg(id)
            .provides
            .iter()
            .map(|d| (d.name, d.version.clone()))
            .collect();
        for (pname, version) in provides {
            self.names[pname.0 as usize].providers.push(Provider { pkg: id, version });
            self.names[pname.0 as usize].providers_sorted = false;
        }
        if incremental_rdepends {
            self.pkg_rdepends(id);
        }
        Ok(id)
    }

    /// Attach installed-package state, creating it on first call.
    pub fn pkg_install(&mut self, id: PkgId) -> &mut InstalledPackage {
        let pkg = self.packages[id.0 as usize].as_mut().expect("live package");
        if pkg.ipkg.is_none() {
            pkg.ipkg = Some(InstalledPackage::default());
            self.installed.push(id);
            self.stats.packages += 1;
        }
        self.packages[id.0 as usize]
            .as_mut()
            .unwrap()
            .ipkg
            .as_mut()
            .unwrap()
    }

    /// Detach installed-package state. The package record itself stays
    /// in the registry until close.
    pub fn pkg_uninstall(&mut self, id: PkgId) -> Option<InstalledPackage> {
        let ipkg = self.pkg_mut(id).ipkg.take()?;
        self.installed.retain(|&p| p != id);
        self.stats.packages -= 1;
        Some(ipkg)
    }

    /// Installed packages ordered by (name, version) for deterministic
    /// database writes.
    pub fn sorted_installed(&self) -> Vec<PkgId> {
        let mut pkgs = self.installed.clone();
        pkgs.sort_by(|&a, &b| self.pkg_display_key(a).cmp(&self.pkg_display_key(b)));
        pkgs
    }

    // ------------------------------------------------------------------
    // Reverse dependencies
    // ------------------------------------------------------------------

    /// Incremental reverse-dependency update for one package; used after
    /// the initial open completes.
    pub fn pkg_rdepends(&mut self, id: PkgId) {
        let Some(pkg_name) = self.pkg(id).name else {
            return;
        };
        let depends: Vec<(NameId, bool)> = self
            .pkg(id)
            .depends
            .iter()
            .map(|d| (d.name, d.conflict))
            .collect();
        let install_if: Vec<NameId> = self.pkg(id).install_if.iter().map(|d| d.name).collect();
        for (rname, conflict) in depends {
            let name = &mut self.names[rname.0 as usize];
            name.is_dependency |= !conflict;
            if !name.rdepends.contains(&pkg_name) {
                name.rdepends.push(pkg_name);
            }
        }
        for rname in install_if {
            let name = &mut self.names[rname.0 as usize];
            if !name.rinstall_if.contains(&pkg_name) {
                name.rinstall_if.push(pkg_name);
            }
        }
    }

    /// Full reverse-dependency recomputation across the name table. One
    /// pass per name; a per-name 2-bit scratch with a touched list keeps
    /// the dedup linear.
    pub fn recompute_rdepends(&mut self) {
        for name in &mut self.names {
            name.rdepends.clear();
            name.rinstall_if.clear();
        }
        for idx in 0..self.names.len() {
            let id = NameId(idx as u32);
            let mut touched: Vec<NameId> = Vec::new();
            let mut num_virtual = 0usize;
            let providers: Vec<PkgId> =
                self.names[idx].providers.iter().map(|p| p.pkg).collect();
            for pkg in &providers {
                if self.pkg(*pkg).name != Some(id) {
                    num_virtual += 1;
                }
                let depends: Vec<(NameId, bool)> = self
                    .pkg(*pkg)
                    .depends
                    .iter()
                    .map(|d| (d.name, d.conflict))
                    .collect();
                let install_if: Vec<NameId> =
                    self.pkg(*pkg).install_if.iter().map(|d| d.name).collect();
                for (rname, conflict) in depends {
                    let name = &mut self.names[rname.0 as usize];
                    name.is_dependency |= !conflict;
                    if name.state & 1 == 0 {
                        if name.state == 0 {
                            touched.push(rname);
                        }
                        name.state |= 1;
                        name.rdepends.push(id);
                    }
                }
                for rname in install_if {
                    let name = &mut self.names[rname.0 as usize];
                    if name.state & 2 == 0 {
                        if name.state == 0 {
                            touched.push(rname);
                        }
                        name.state |= 2;
                        name.rinstall_if.push(id);
                    }
                }
            }
            self.names[idx].priority = if num_virtual == 0 {
                0
            } else if num_virtual != providers.len() {
                1
            } else {
                2
            };
            for rname in touched {
                self.names[rname.0 as usize].state = 0;
            }
        }
    }

    // ------------------------------------------------------------------
    // Replacement policy
    // ------------------------------------------------------------------

    /// May `new` take over a file currently owned by `old`?
    pub fn pkg_replaces_file(&self, old: PkgId, new: PkgId) -> Replaces {
        let opkg = self.pkg(old);
        let npkg = self.pkg(new);

        // Overlay files have no owning name; ownership transfers freely.
        let Some(oname) = opkg.name else {
            return Replaces::Yes;
        };
        // Upgrading the same package, or siblings from one origin.
        if opkg.name == npkg.name {
            return Replaces::Yes;
        }
        if opkg.origin.is_some() && opkg.origin == npkg.origin {
            return Replaces::Yes;
        }

        let oversion = self.pkg_version_str(old).to_string();
        let nversion = self.pkg_version_str(new).to_string();
        let empty: &[Dependency] = &[];
        let oreplaces = opkg.ipkg.as_ref().map_or(empty, |i| &i.replaces);
        let nreplaces = npkg.ipkg.as_ref().map_or(empty, |i| &i.replaces);

        // The old package claiming to replace the new one is a conflict.
        if let Some(nname) = npkg.name {
            if oreplaces.iter().any(|d| d.matches(nname, &nversion)) {
                return Replaces::Conflict;
            }
        }
        if nreplaces.iter().any(|d| d.matches(oname, &oversion)) {
            return Replaces::Yes;
        }

        let oprio = opkg.ipkg.as_ref().map_or(0, |i| i.replaces_priority);
        let nprio = npkg.ipkg.as_ref().map_or(0, |i| i.replaces_priority);
        if nprio > oprio {
            return Replaces::Yes;
        }
        if nprio < oprio {
            return Replaces::No;
        }
        Replaces::Conflict
    }

    /// May `new` take over directory ownership from `old`? Directory
    /// ownership never hard-errors: a conflict just leaves the old owner.
    pub fn pkg_replaces_dir(&self, old: PkgId, new: PkgId) -> Replaces {
        match self.pkg_replaces_file(old, new) {
            Replaces::Yes => Replaces::Yes,
            _ => Replaces::No,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depend::parse_deps;

    fn mk_pkg(reg: &mut Registry, name: &str, version: &str, digest_seed: &[u8]) -> PkgId {
        let mut pkg = Package::new();
        pkg.name = Some(reg.get_name(name));
        pkg.version = reg.atoms.atomize_str(version);
        pkg.digest = Checksum::compute(crate::hash::ChecksumKind::Sha1, digest_seed);
        reg.alloc_pkg(pkg)
    }

    fn add(reg: &mut Registry, id: PkgId) -> PkgId {
        let mut tree = DirTree::new(Vec::new());
        reg.pkg_add(&mut tree, id, false).unwrap()
    }

    #[test]
    fn test_get_name_idempotent() {
        let mut reg = Registry::new();
        let a = reg.get_name("busybox");
        let b = reg.get_name("busybox");
        assert_eq!(a, b);
        assert_eq!(reg.query_name("busybox"), Some(a));
        assert_eq!(reg.query_name("nope"), None);
    }

    #[test]
    fn test_pkg_add_registers_providers() {
        let mut reg = Registry::new();
        let id = mk_pkg(&mut reg, "busybox", "1.36.1-r0", b"bb");
        let provides = parse_deps(&mut reg, "cmd:sh=1").unwrap();
        reg.pkg_mut(id).provides = provides;
        let id = add(&mut reg, id);

        let bb = reg.query_name("busybox").unwrap();
        assert_eq!(reg.name(bb).providers.len(), 1);
        let sh = reg.query_name("cmd:sh").unwrap();
        assert_eq!(reg.name(sh).providers.len(), 1);
        assert_eq!(reg.name(sh).providers[0].pkg, id);
    }

    #[test]
    fn test_pkg_add_merges_duplicate_digest() {
        let mut reg = Registry::new();
        let a = mk_pkg(&mut reg, "pkg", "1.0-r0", b"same");
        reg.pkg_mut(a).repos = 1 << 2;
        let a = add(&mut reg, a);

        let b = mk_pkg(&mut reg, "pkg", "1.0-r0", b"same");
        reg.pkg_mut(b).repos = 1 << 3;
        reg.pkg_mut(b).filename = Some("pkg-1.0-r0.apk".into());
        let merged = add(&mut reg, b);

        assert_eq!(merged, a);
        assert_eq!(reg.pkg(a).repos, (1 << 2) | (1 << 3) | REPO_CACHED);
        assert!(reg.pkg(a).filename.is_some());
        // Only one real provider entry despite the merge.
        let name = reg.query_name("pkg").unwrap();
        assert_eq!(reg.name(name).providers.len(), 1);
    }

    #[test]
    fn test_pkg_add_requires_name_and_version() {
        let mut reg = Registry::new();
        let mut tree = DirTree::new(Vec::new());
        let id = reg.alloc_pkg(Package::new());
        assert!(reg.pkg_add(&mut tree, id, false).is_err());
    }

    #[test]
    fn test_install_uninstall_stats() {
        let mut reg = Registry::new();
        let id = mk_pkg(&mut reg, "pkg", "1.0-r0", b"p");
        let id = add(&mut reg, id);

        reg.pkg_install(id);
        assert_eq!(reg.stats.packages, 1);
        assert!(reg.pkg(id).is_installed());
        // Second install call is a no-op.
        reg.pkg_install(id);
        assert_eq!(reg.stats.packages, 1);

        assert!(reg.pkg_uninstall(id).is_some());
        assert_eq!(reg.stats.packages, 0);
        assert!(!reg.pkg(id).is_installed());
        assert!(reg.pkg_uninstall(id).is_none());
    }

    #[test]
    fn test_sorted_installed_by_name_version() {
        let mut reg = Registry::new();
        let b = mk_pkg(&mut reg, "zsh", "5.9-r0", b"z");
        let b = add(&mut reg, b);
        let a = mk_pkg(&mut reg, "bash", "5.2-r0", b"b");
        let a = add(&mut reg, a);
        reg.pkg_install(b);
        reg.pkg_install(a);
        assert_eq!(reg.sorted_installed(), vec![a, b]);
    }

    #[test]
    fn test_recompute_rdepends_and_priority() {
        let mut reg = Registry::new();
        let a = mk_pkg(&mut reg, "a", "1-r0", b"a");
        let deps = parse_deps(&mut reg, "b libq").unwrap();
        reg.pkg_mut(a).depends = deps;
        let provides = parse_deps(&mut reg, "libp").unwrap();
        reg.pkg_mut(a).provides = provides;
        let _a = add(&mut reg, a);

        let b = mk_pkg(&mut reg, "b", "1-r0", b"b");
        let deps = parse_deps(&mut reg, "a").unwrap();
        reg.pkg_mut(b).depends = deps;
        let provides = parse_deps(&mut reg, "libq").unwrap();
        reg.pkg_mut(b).provides = provides;
        let _b = add(&mut reg, b);

        reg.recompute_rdepends();

        let na = reg.query_name("a").unwrap();
        let nb = reg.query_name("b").unwrap();
        let libq = reg.query_name("libq").unwrap();
        assert!(reg.name(na).rdepends.contains(&nb));
        assert!(reg.name(nb).rdepends.contains(&na));
        // Dependencies on libq resolve through b's provider entry.
        assert!(reg.name(libq).rdepends.contains(&na));
        assert!(reg.name(na).is_dependency);

        // a and b each have one real provider; libq only a virtual one.
        assert_eq!(reg.name(na).priority, 0);
        assert_eq!(reg.name(libq).priority, 2);
    }

    #[test]
    fn test_replaces_same_name_wins() {
        let mut reg = Registry::new();
        let v1 = mk_pkg(&mut reg, "pkg", "1.0-r0", b"v1");
        let v1 = add(&mut reg, v1);
        let v2 = mk_pkg(&mut reg, "pkg", "2.0-r0", b"v2");
        let v2 = add(&mut reg, v2);
        assert_eq!(reg.pkg_replaces_file(v1, v2), Replaces::Yes);
    }

    #[test]
    fn test_replaces_listed_package() {
        let mut reg = Registry::new();
        let old = mk_pkg(&mut reg, "old-tool", "1.0-r0", b"o");
        let old = add(&mut reg, old);
        reg.pkg_install(old);

        let new = mk_pkg(&mut reg, "new-tool", "1.0-r0", b"n");
        let new = add(&mut reg, new);
        let replaces = parse_deps(&mut reg, "old-tool").unwrap();
        reg.pkg_install(new).replaces = replaces;

        assert_eq!(reg.pkg_replaces_file(old, new), Replaces::Yes);
        // Without a replaces declaration the reverse direction conflicts.
        assert_eq!(reg.pkg_replaces_file(new, old), Replaces::Conflict);
    }

    #[test]
    fn test_replaces_priority_tiebreak() {
        let mut reg = Registry::new();
        let a = mk_pkg(&mut reg, "a", "1-r0", b"pa");
        let a = add(&mut reg, a);
        reg.pkg_install(a).replaces_priority = 10;

        let b = mk_pkg(&mut reg, "b", "1-r0", b"pb");
        let b = add(&mut reg, b);
        reg.pkg_install(b).replaces_priority = 20;

        assert_eq!(reg.pkg_replaces_file(a, b), Replaces::Yes);
        assert_eq!(reg.pkg_replaces_file(b, a), Replaces::No);

        reg.pkg_mut(a).ipkg.as_mut().unwrap().replaces_priority = 20;
        assert_eq!(reg.pkg_replaces_file(a, b), Replaces::Conflict);
    }

    #[test]
    fn test_replaces_dir_never_conflicts() {
        let mut reg = Registry::new();
        let a = mk_pkg(&mut reg, "a", "1-r0", b"da");
        let a = add(&mut reg, a);
        reg.pkg_install(a);
        let b = mk_pkg(&mut reg, "b", "1-r0", b"db");
        let b = add(&mut reg, b);
        reg.pkg_install(b);
        assert_eq!(reg.pkg_replaces_dir(a, b), Replaces::No);
    }
}
