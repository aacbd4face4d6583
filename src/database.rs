// src/database.rs

//! The database root object: open/close lifecycle, layered state,
//! locking, repositories, and the permission sweeper.
//!
//! Opening acquires the exclusive lock (write mode), loads protected
//! paths, sets up the cache, reads every layer's world/installed/
//! triggers/scripts files, loads repository indexes, and finishes with
//! a reverse-dependency recomputation. All mutating operations happen
//! between `open` and `write_config`; `close` releases every resource
//! the open acquired.

use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::{debug, info, warn};

use crate::atom::{Acl, AclId, AclTable, Atom};
use crate::depend::{self, Dependency};
use crate::dirtree::{self, DirId, DirTree, DiriId, ProtectedPath};
use crate::error::{Error, Result};
use crate::extract::EntryInfo;
use crate::fdb::{self, FdbSource};
use crate::fsdir::{DirStatus, ExtractFlags, Fsdir};
use crate::hash::Checksum;
use crate::idcache::IdCache;
use crate::install;
use crate::package::{InstalledPackage, PkgId, Registry, REPO_CACHED as CACHED_BIT};
use crate::repository::{
    self, cache_foreach_item, CacheContext, Fetch, FetchResult, RepoTag, Repository,
    MAX_REPOS, REPO_CACHED, REPO_FIRST_CONFIGURED,
};
use crate::script::{self, ScriptEnv, ScriptKind};
use crate::trigger;

pub const LAYER_ROOT: u8 = 0;
pub const LAYER_UVOL: u8 = 1;
pub const LAYER_COUNT: u8 = 2;

const WORLD_FILE: &str = "etc/apk/world";
const ARCH_FILE: &str = "etc/apk/arch";
const LOCK_FILE: &str = "lib/apk/db/lock";
const STATIC_CACHE_DIR: &str = "var/cache/apk";
const SCRIPT_EXEC_DIR: &str = "lib/apk/exec";
const DEFAULT_CACHE_DIR: &str = "etc/apk/cache";
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub fn layer_name(layer: u8) -> &'static str {
    match layer {
        LAYER_ROOT => "lib/apk/db",
        LAYER_UVOL => "lib/apk/db-uvol",
        _ => unreachable!("invalid layer"),
    }
}

fn default_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86" => "x86",
        "arm" => "armv7",
        other => other,
    }
}

/// Behavior switches, one per configuration flag.
#[derive(Debug, Clone, Copy, Default)]
pub struct Flags {
    pub simulate: bool,
    pub no_network: bool,
    pub no_cache: bool,
    pub no_chroot: bool,
    pub preserve_env: bool,
    pub purge: bool,
    pub clean_protected: bool,
    pub overlay_from_stdin: bool,
    pub force_overwrite: bool,
    pub force_old_apk: bool,
    pub force_missing_repositories: bool,
    pub force_broken_world: bool,
    pub force_refresh: bool,
    pub usermode: bool,
    pub allow_arch: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    Write,
}

/// Everything `Database::open` needs to know.
pub struct OpenOptions {
    pub root: PathBuf,
    pub mode: OpenMode,
    /// Allow opening a root with no database yet; created on write.
    pub create: bool,
    pub flags: Flags,
    /// How long to wait for a contended lock; `None` fails immediately.
    pub lock_wait: Option<Duration>,
    pub cache_max_age: Duration,
    /// Cache directory relative to the root.
    pub cache_dir: String,
    /// Architecture override (command line).
    pub arch: Option<String>,
    /// The override came together with an explicit root; rewrite the
    /// arch file on write.
    pub root_set: bool,
    /// Explicit protected-paths configuration; `None` loads defaults
    /// plus `etc/apk/protected_paths.d`.
    pub protected_paths: Option<String>,
    /// Extra repository lines, ahead of the configured files.
    pub repositories: Vec<String>,
    /// Replaces `etc/apk/repositories` entirely when set.
    pub repositories_file: Option<PathBuf>,
    pub fetcher: Option<Box<dyn Fetch>>,
}

impl OpenOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            mode: OpenMode::Write,
            create: false,
            flags: Flags::default(),
            lock_wait: None,
            cache_max_age: Duration::from_secs(4 * 3600),
            cache_dir: DEFAULT_CACHE_DIR.to_string(),
            arch: None,
            root_set: false,
            protected_paths: None,
            repositories: Vec::new(),
            repositories_file: None,
            fetcher: None,
        }
    }
}

struct CacheState {
    dir: PathBuf,
    /// Static fallback caches hold files but do not take downloads.
    active: bool,
    /// Mountpoint remounted read-write for this transaction.
    remount: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RepoCounters {
    pub stale: usize,
    pub unavailable: usize,
    pub updated: usize,
}

pub struct Database {
    root: PathBuf,
    pub flags: Flags,
    mode: OpenMode,
    create: bool,
    pub registry: Registry,
    pub tree: DirTree,
    pub world: Vec<Dependency>,
    pub(crate) repos: Vec<Repository>,
    pub(crate) repo_tags: Vec<RepoTag>,
    pub(crate) local_repos: u32,
    pub(crate) available_repos: u32,
    pub repo_counters: RepoCounters,
    cache: Option<CacheState>,
    cache_max_age: Duration,
    pub acls: AclTable,
    pub(crate) default_dir_acl: AclId,
    pub(crate) default_file_acl: AclId,
    arch: Atom,
    write_arch: bool,
    pub(crate) id_cache: IdCache,
    lock: Option<File>,
    proc_mounted: Option<PathBuf>,
    usermode: bool,
    permanent: bool,
    autoupdate: bool,
    active_layers: u8,
    pub(crate) open_complete: bool,
    pub(crate) dirowner_stale: bool,
    pub(crate) dirperms_stale: bool,
    pub(crate) trigger_pkgs: Vec<PkgId>,
    fetcher: Option<Box<dyn Fetch>>,
    released: bool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("root", &self.root)
            .field("mode", &self.mode)
            .field("create", &self.create)
            .field("local_repos", &self.local_repos)
            .field("available_repos", &self.available_repos)
            .field("repo_counters", &self.repo_counters)
            .field("usermode", &self.usermode)
            .field("permanent", &self.permanent)
            .field("autoupdate", &self.autoupdate)
            .field("active_layers", &self.active_layers)
            .field("open_complete", &self.open_complete)
            .field("dirowner_stale", &self.dirowner_stale)
            .field("dirperms_stale", &self.dirperms_stale)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Database {
    // ------------------------------------------------------------------
    // Open
    // ------------------------------------------------------------------

    pub fn open(mut opts: OpenOptions) -> Result<Self> {
        let mut acls = AclTable::new();
        let default_dir_acl = acls.atomize(Acl::new(0o755, 0, 0));
        let default_file_acl = acls.atomize(Acl::new(0o644, 0, 0));

        let root = opts.root.clone();
        if opts.create {
            fs::create_dir_all(&root)?;
        }

        let mut registry = Registry::new();
        let arch_atom;
        let write_arch;
        if let Some(arch) = opts.arch.take().filter(|_| opts.root_set || opts.flags.allow_arch) {
            arch_atom = registry.atoms.atomize_str(&arch);
            write_arch = opts.root_set;
        } else if let Ok(content) = fs::read_to_string(root.join(ARCH_FILE)) {
            arch_atom = registry.atoms.atomize_str(content.trim());
            write_arch = false;
        } else {
            arch_atom = registry.atoms.atomize_str(default_arch());
            write_arch = true;
        }

        let mut usermode = opts.flags.usermode;
        if !opts.create {
            if let Ok(meta) = fs::metadata(root.join(layer_name(LAYER_ROOT))) {
                if meta.uid() != 0 {
                    usermode = true;
                }
            }
        }

        let autoupdate = opts.mode == OpenMode::Write && !opts.flags.no_network;

        let mut db = Database {
            root,
            flags: opts.flags,
            mode: opts.mode,
            create: opts.create,
            registry,
            tree: DirTree::new(Vec::new()),
            world: Vec::new(),
            repos: Vec::new(),
            repo_tags: vec![RepoTag::new("@")],
            local_repos: 1 << REPO_CACHED,
            available_repos: 1 << REPO_CACHED,
            repo_counters: RepoCounters::default(),
            cache: None,
            cache_max_age: opts.cache_max_age,
            acls,
            default_dir_acl,
            default_file_acl,
            arch: arch_atom,
            write_arch,
            id_cache: IdCache::new(opts.root.clone()),
            lock: None,
            proc_mounted: None,
            usermode,
            permanent: true,
            autoupdate,
            active_layers: 0,
            open_complete: false,
            dirowner_stale: false,
            dirperms_stale: false,
            trigger_pkgs: Vec::new(),
            fetcher: opts.fetcher,
            released: false,
        };
        db.repos.push(Repository::cached(&opts.cache_dir));
        db.permanent = !detect_tmpfs(&db.root);

        if db.mode == OpenMode::Write {
            db.acquire_lock(opts.lock_wait)?;
            db.mount_proc();
        }

        db.load_protected_paths(opts.protected_paths.as_deref());

        if !db.flags.no_cache {
            db.setup_cache(&opts.cache_dir)?;
        }

        if db.flags.overlay_from_stdin {
            db.flags.overlay_from_stdin = false;
            let stdin = std::io::stdin();
            fdb::read_overlay(&mut db, stdin.lock())?;
        }

        for layer in 0..LAYER_COUNT {
            match db.read_layer(layer) {
                Ok(()) => db.active_layers |= 1 << layer,
                Err(e) => {
                    if layer == LAYER_ROOT && !db.create {
                        return Err(Error::DatabaseRead(e.to_string()));
                    }
                    if layer == LAYER_ROOT {
                        db.active_layers |= 1 << layer;
                    }
                }
            }
        }

        if db.cache_active() {
            let installed = db.cache_dir().unwrap().join("installed");
            if let Ok(file) = File::open(installed) {
                fdb::read_fdb(&mut db, BufReader::new(file), FdbSource::NrCache)?;
            }
        }

        for line in std::mem::take(&mut opts.repositories) {
            db.add_repository(&line)?;
        }
        match opts.repositories_file.take() {
            Some(file) => db.add_repositories_from(&file)?,
            None => {
                let main = db.root.join("etc/apk/repositories");
                if main.exists() {
                    db.add_repositories_from(&main)?;
                }
                let dropin = db.root.join("etc/apk/repositories.d");
                if let Ok(entries) = fs::read_dir(dropin) {
                    let mut files: Vec<PathBuf> = entries
                        .filter_map(|e| e.ok().map(|e| e.path()))
                        .filter(|p| p.extension().is_some_and(|e| e == "list"))
                        .collect();
                    files.sort();
                    for file in files {
                        db.add_repositories_from(&file)?;
                    }
                }
            }
        }
        if db.repo_counters.updated > 0 {
            db.write_nr_cache()?;
        }

        db.registry.recompute_rdepends();

        if db.cache_active() {
            db.mark_cached_packages()?;
        }

        db.open_complete = true;
        Ok(db)
    }

    fn acquire_lock(&mut self, lock_wait: Option<Duration>) -> Result<()> {
        let lock_path = self.root.join(LOCK_FILE);
        let file = match File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
        {
            Ok(file) => {
                fs::set_permissions(&lock_path, fs::Permissions::from_mode(0o600)).ok();
                file
            }
            Err(_) if self.create => return Ok(()),
            Err(e) => {
                warn!(error = %e, "unable to open database lock");
                return Err(Error::LockFailed);
            }
        };

        if file.try_lock_exclusive().is_ok() {
            self.lock = Some(file);
            return Ok(());
        }
        let Some(wait) = lock_wait else {
            return Err(Error::LockFailed);
        };

        info!("Waiting for repository lock");
        let deadline = Instant::now() + wait;
        while Instant::now() < deadline {
            std::thread::sleep(LOCK_POLL_INTERVAL.min(wait));
            if file.try_lock_exclusive().is_ok() {
                self.lock = Some(file);
                return Ok(());
            }
        }
        Err(Error::LockFailed)
    }

    fn load_protected_paths(&mut self, explicit: Option<&str>) {
        let mut paths: Vec<ProtectedPath> = Vec::new();
        match explicit {
            Some(blob) => dirtree::parse_protected_paths(blob, &mut paths),
            None => {
                dirtree::parse_protected_paths("+etc\n@etc/init.d\n!etc/apk\n", &mut paths);
                if let Ok(entries) = fs::read_dir(self.root.join("etc/apk/protected_paths.d")) {
                    let mut files: Vec<PathBuf> = entries
                        .filter_map(|e| e.ok().map(|e| e.path()))
                        .filter(|p| p.extension().is_some_and(|e| e == "list"))
                        .collect();
                    files.sort();
                    for file in files {
                        if let Ok(content) = fs::read_to_string(&file) {
                            dirtree::parse_protected_paths(&content, &mut paths);
                        }
                    }
                }
            }
        }
        self.tree.protected_paths = paths;
    }

    fn setup_cache(&mut self, cache_dir: &str) -> Result<()> {
        let explicit = self.root.join(cache_dir);
        if explicit.is_dir() {
            let remount = if self.mode == OpenMode::Write && is_read_only(&explicit) {
                match remount_rw(&explicit) {
                    Some(mountpoint) => Some(mountpoint),
                    None => return Err(Error::CacheNotAvailable),
                }
            } else {
                None
            };
            self.cache = Some(CacheState {
                dir: explicit,
                active: true,
                remount,
            });
            return Ok(());
        }

        // Static fallback: usable for already-cached files, not for
        // taking new downloads.
        let fallback = self.root.join(STATIC_CACHE_DIR);
        if !fallback.is_dir() {
            if let Err(e) = fs::create_dir_all(&fallback) {
                if self.mode == OpenMode::Write {
                    warn!(error = %e, "unable to set up the cache");
                    return Err(Error::CacheNotAvailable);
                }
                return Ok(());
            }
        }
        self.cache = Some(CacheState {
            dir: fallback,
            active: false,
            remount: None,
        });
        Ok(())
    }

    fn mount_proc(&mut self) {
        #[cfg(target_os = "linux")]
        {
            use nix::sys::statfs::{statfs, PROC_SUPER_MAGIC};
            let proc_dir = self.root.join("proc");
            let mounted = statfs(&proc_dir)
                .map(|st| st.filesystem_type() == PROC_SUPER_MAGIC)
                .unwrap_or(false);
            if mounted {
                return;
            }
            if !proc_dir.exists() {
                if fs::create_dir(&proc_dir).is_err() {
                    return;
                }
                fs::set_permissions(&proc_dir, fs::Permissions::from_mode(0o555)).ok();
            }
            let r = nix::mount::mount(
                Some("proc"),
                &proc_dir,
                Some("proc"),
                nix::mount::MsFlags::empty(),
                None::<&str>,
            );
            if r.is_ok() {
                self.proc_mounted = Some(proc_dir);
            }
        }
    }

    fn read_layer(&mut self, layer: u8) -> Result<()> {
        let layer_dir = self.root.join(layer_name(layer));
        if !layer_dir.is_dir() {
            return Err(Error::DatabaseRead(format!(
                "missing layer directory {}",
                layer_dir.display()
            )));
        }

        let world_path = if layer == LAYER_ROOT {
            self.root.join(WORLD_FILE)
        } else {
            layer_dir.join("world")
        };
        match fs::read_to_string(&world_path) {
            Ok(content) => {
                let mut deps = depend::parse_world(&mut self.registry, &content)?;
                self.world.append(&mut deps);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if layer == LAYER_ROOT && !self.create {
                    return Err(Error::DatabaseRead("missing world file".to_string()));
                }
            }
            Err(e) => return Err(e.into()),
        }

        if let Ok(file) = File::open(layer_dir.join("installed")) {
            fdb::read_fdb(self, BufReader::new(file), FdbSource::Installed { layer })?;
        }
        if let Ok(file) = File::open(layer_dir.join("triggers")) {
            fdb::read_triggers(self, BufReader::new(file))?;
        }
        if let Ok(file) = File::open(layer_dir.join("scripts.tar")) {
            fdb::read_scripts(self, file)?;
        }
        Ok(())
    }

    fn add_repositories_from(&mut self, file: &Path) -> Result<()> {
        let content = fs::read_to_string(file).map_err(|e| {
            warn!(file = %file.display(), error = %e, "failed to read repositories");
            Error::DatabaseRead(format!("failed to read repositories: {}", file.display()))
        })?;
        for line in content.lines() {
            self.add_repository(line)?;
        }
        Ok(())
    }

    /// Add one repository line (`[@tag ]url`), loading its index.
    pub fn add_repository(&mut self, line: &str) -> Result<()> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(());
        }

        let (tag_id, url) = if let Some(rest) = line.strip_prefix('@') {
            let (tag, url) = rest
                .split_once(char::is_whitespace)
                .ok_or_else(|| Error::InvalidTag(line.to_string()))?;
            (self.get_tag_id(&format!("@{tag}"))?, url.trim())
        } else {
            (0, line)
        };

        if let Some(existing) = self.repos.iter().position(|r| r.url == url) {
            self.repo_tags[tag_id].allowed_repos |= (1 << existing) & self.available_repos;
            return Ok(());
        }
        if self.repos.len() >= MAX_REPOS {
            warn!(url, "too many repositories; ignoring");
            return Ok(());
        }

        let repo_num = self.repos.len();
        let arch = self.arch_str().to_string();
        let index_url = repository::format_real_url(url, &arch, None);
        self.repos.push(Repository {
            url: url.to_string(),
            digest: Checksum::compute(crate::hash::ChecksumKind::Sha1, index_url.as_bytes()),
            description: None,
        });

        let is_remote = repository::local_file_url(url).is_none();
        let mut load_error: Option<Error> = None;
        let mut update_error = false;

        if is_remote {
            if !self.flags.no_network {
                self.available_repos |= 1 << repo_num;
            }
            if self.flags.no_cache {
                // Load the index straight off the network.
                match self.fetch_stream(&index_url) {
                    Ok(stream) => {
                        let r = fdb::read_fdb(
                            self,
                            BufReader::new(stream),
                            FdbSource::Repository(repo_num),
                        );
                        if let Err(e) = r {
                            load_error = Some(e);
                        }
                    }
                    Err(e) => load_error = Some(e),
                }
            } else {
                if self.autoupdate && self.cache_active() {
                    match self.update_repository_index(repo_num) {
                        Ok(true) => self.repo_counters.updated += 1,
                        Ok(false) => {}
                        Err(e) => {
                            debug!(url, error = %e, "index update failed");
                            update_error = true;
                        }
                    }
                }
                match self.open_cached_index(repo_num) {
                    Ok(file) => {
                        let r = fdb::read_fdb(
                            self,
                            BufReader::new(file),
                            FdbSource::Repository(repo_num),
                        );
                        if let Err(e) = r {
                            load_error = Some(e);
                        }
                    }
                    Err(e) => load_error = Some(e),
                }
            }
        } else {
            self.local_repos |= 1 << repo_num;
            self.available_repos |= 1 << repo_num;
            let path = repository::local_file_url(url).unwrap();
            let index_path = repository::format_real_url(path, &arch, None);
            match File::open(&index_path) {
                Ok(file) => {
                    let r = fdb::read_fdb(
                        self,
                        BufReader::new(file),
                        FdbSource::Repository(repo_num),
                    );
                    if let Err(e) = r {
                        load_error = Some(e);
                    }
                }
                Err(e) => load_error = Some(e.into()),
            }
        }

        if load_error.is_some() || update_error {
            if is_remote {
                if load_error.is_some() {
                    self.repo_counters.unavailable += 1;
                } else {
                    self.repo_counters.stale += 1;
                }
            }
            warn!(
                url,
                error = %load_error.as_ref().map(ToString::to_string).unwrap_or_else(|| "stale index".into()),
                "repository unavailable"
            );
        }

        if load_error.is_some() {
            self.available_repos &= !(1 << repo_num);
        } else {
            self.repo_tags[tag_id].allowed_repos |= 1 << repo_num;
        }
        Ok(())
    }

    fn fetch_stream(&mut self, url: &str) -> Result<Box<dyn Read>> {
        let fetcher = self
            .fetcher
            .as_mut()
            .ok_or_else(|| Error::DatabaseRead("no fetcher configured".to_string()))?;
        match fetcher.fetch(url, None)? {
            FetchResult::Stream(s) => Ok(s),
            FetchResult::NotModified => Err(Error::DatabaseRead(
                "unexpected not-modified response".to_string(),
            )),
        }
    }

    fn update_repository_index(&mut self, repo_num: usize) -> Result<bool> {
        let Some(fetcher) = self.fetcher.as_mut() else {
            return Ok(false);
        };
        let cache = self.cache.as_ref().expect("cache active");
        let arch = self.registry.atoms.get_str(self.arch).to_string();
        let mut ctx = CacheContext {
            cache_dir: &cache.dir,
            fetcher: fetcher.as_mut(),
            arch: &arch,
            cache_max_age: self.cache_max_age,
            force_refresh: self.flags.force_refresh,
            simulate: self.flags.simulate,
        };
        let outcome = repository::cache_download(&mut ctx, &self.repos[repo_num], None, true)?;
        Ok(outcome == repository::DownloadOutcome::Fetched)
    }

    fn open_cached_index(&self, repo_num: usize) -> Result<File> {
        let cache = self.cache.as_ref().ok_or(Error::CacheNotAvailable)?;
        let name = repository::format_cache_index_name(&self.repos[repo_num]);
        Ok(File::open(cache.dir.join(name))?)
    }

    fn mark_cached_packages(&mut self) -> Result<()> {
        let cache_dir = self.cache.as_ref().expect("cache active").dir.clone();
        let mut names: Vec<String> = Vec::new();
        cache_foreach_item(&cache_dir, |name| names.push(name.to_string()))?;
        for file_name in names {
            let Some((name, _version)) = repository::parse_name_version(&file_name) else {
                continue;
            };
            let Some(name_id) = self.registry.query_name(name) else {
                continue;
            };
            let providers: Vec<PkgId> = self
                .registry
                .name(name_id)
                .providers
                .iter()
                .map(|p| p.pkg)
                .collect();
            for pkg in providers {
                if self.registry.pkg(pkg).name != Some(name_id) {
                    continue;
                }
                if let Ok(canonical) = self.cache_pkg_name(pkg) {
                    if canonical == file_name {
                        self.registry.pkg_mut(pkg).repos |= CACHED_BIT;
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn arch_str(&self) -> &str {
        self.registry.atoms.get_str(self.arch)
    }

    pub fn is_permanent(&self) -> bool {
        self.permanent
    }

    pub fn is_usermode(&self) -> bool {
        self.usermode
    }

    pub fn cache_active(&self) -> bool {
        self.cache.as_ref().is_some_and(|c| c.active)
    }

    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache.as_ref().map(|c| c.dir.as_path())
    }

    pub(crate) fn extract_flags(&self) -> ExtractFlags {
        ExtractFlags {
            no_chown: self.usermode,
            no_overwrite: false,
        }
    }

    /// Directory modes are widened in usermode so the owning user can
    /// traverse and modify what root ownership would otherwise grant.
    fn dir_mode(&self, mode: u32) -> u32 {
        if self.usermode {
            mode | 0o300
        } else {
            mode
        }
    }

    pub(crate) fn ipkg_mut(&mut self, pkg: PkgId) -> &mut InstalledPackage {
        self.registry
            .pkg_mut(pkg)
            .ipkg
            .as_mut()
            .expect("installed record")
    }

    pub(crate) fn acl_of(&mut self, info: &EntryInfo) -> AclId {
        self.acls
            .atomize(Acl::with_xattr(info.mode, info.uid, info.gid, info.xattr_digest))
    }

    /// Resolve a rooted path to the package owning it.
    pub fn get_file_owner(&self, path: &str) -> Option<PkgId> {
        let path = path.trim_start_matches('/');
        let (dir, name) = crate::fsdir::split_dir(path);
        let file = self.tree.file_query(dir, name)?;
        Some(self.tree.diri(self.tree.file(file).diri).pkg)
    }

    // ------------------------------------------------------------------
    // Directory bookkeeping shared by fdb read and install
    // ------------------------------------------------------------------

    pub(crate) fn find_diri(&self, pkg: PkgId, dir: &str) -> Option<DiriId> {
        let ipkg = self.registry.pkg(pkg).ipkg.as_ref()?;
        ipkg.dirs
            .iter()
            .copied()
            .find(|&d| self.tree.dir(self.tree.diri(d).dir).name.as_ref() == dir)
    }

    pub(crate) fn diri_new_for(&mut self, pkg: PkgId, dir: &str) -> DiriId {
        let diri = self.tree.diri_new(pkg, dir, self.default_dir_acl);
        self.registry
            .pkg_mut(pkg)
            .ipkg
            .as_mut()
            .expect("installed record")
            .dirs
            .push(diri);
        diri
    }

    /// Select the winning owner for the instance's directory and flag
    /// stale permissions when the effective ACL changes.
    pub(crate) fn apply_diri_permissions(&mut self, diri: DiriId) {
        let dir = self.tree.diri(diri).dir;
        if let Some(owner) = self.tree.dir(dir).owner {
            let owner_pkg = self.tree.diri(owner).pkg;
            let new_pkg = self.tree.diri(diri).pkg;
            if owner != diri
                && self.registry.pkg_replaces_dir(owner_pkg, new_pkg)
                    != crate::package::Replaces::Yes
            {
                return;
            }
        }
        let acl = self.tree.diri(diri).acl;
        if self.tree.dir(dir).permissions_ok {
            let owner_acl = self.tree.dir(dir).owner.map(|o| self.tree.diri(o).acl);
            if owner_acl != Some(acl) {
                self.tree.dir_mut(dir).permissions_stale = true;
                self.dirperms_stale = true;
            }
        }
        self.tree.dir_mut(dir).owner = Some(diri);
    }

    /// Ensure the on-disk directory exists with the expected ACL.
    pub(crate) fn dir_prepare(&mut self, dir: DirId, expected: Option<AclId>) {
        if self.tree.dir(dir).name.is_empty() || self.tree.dir(dir).created {
            return;
        }
        let name = self.tree.dir(dir).name.to_string();
        let owner_acl = self
            .tree
            .dir(dir)
            .owner
            .map(|o| self.tree.diri(o).acl)
            .unwrap_or(self.default_dir_acl);
        let owner_acl = *self.acls.get(owner_acl);
        let fsd = Fsdir::new(&self.root, &name, None);

        match expected {
            None => {
                // Directory should not exist yet; create it.
                if !self.flags.simulate && fsd.create(self.dir_mode(owner_acl.mode)).is_ok() {
                    let d = self.tree.dir_mut(dir);
                    d.permissions_ok = true;
                    d.permissions_stale = true;
                }
                self.tree.dir_mut(dir).created = true;
            }
            Some(acl) => {
                let acl = *self.acls.get(acl);
                match fsd.check(self.dir_mode(acl.mode), acl.uid, acl.gid) {
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        if !self.flags.simulate {
                            let _ = fsd.create(self.dir_mode(owner_acl.mode));
                        }
                        let d = self.tree.dir_mut(dir);
                        d.permissions_stale = true;
                        d.permissions_ok = true;
                        d.created = true;
                    }
                    Ok(DirStatus::Ok) => {
                        let d = self.tree.dir_mut(dir);
                        d.permissions_ok = true;
                        d.created = true;
                    }
                    Ok(DirStatus::Modified) | Err(_) => {
                        self.tree.dir_mut(dir).created = true;
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Repositories and cache
    // ------------------------------------------------------------------

    /// Intern a repository tag (`@name` or bare); id 0 is untagged.
    pub fn get_tag_id(&mut self, tag: &str) -> Result<usize> {
        if tag.is_empty() {
            return Ok(0);
        }
        let lookup: &str = tag;
        for (i, t) in self.repo_tags.iter().enumerate().skip(1) {
            if t.tag() == lookup || t.plain_name() == lookup {
                return Ok(i);
            }
        }
        if self.repo_tags.len() >= MAX_REPOS {
            return Err(Error::InvalidTag(tag.to_string()));
        }
        self.repo_tags.push(RepoTag::new(tag));
        Ok(self.repo_tags.len() - 1)
    }

    /// Pick the repository to install `pkg` from, preferring local ones.
    pub fn select_repo(&self, pkg: PkgId) -> Option<usize> {
        let mut repos = self.registry.pkg(pkg).repos & self.available_repos;
        if repos == 0 {
            return None;
        }
        if repos & self.local_repos != 0 {
            repos &= self.local_repos;
        }
        for i in REPO_FIRST_CONFIGURED..self.repos.len() {
            if repos & (1 << i) != 0 {
                return Some(i);
            }
        }
        Some(REPO_CACHED)
    }

    pub(crate) fn pkg_in_local_repo(&self, pkg: PkgId) -> bool {
        self.registry.pkg(pkg).repos & self.local_repos != 0
    }

    pub(crate) fn cache_pkg_name(&self, pkg: PkgId) -> Result<String> {
        repository::format_cache_pkg_name(
            self.registry.pkg_name_str(pkg),
            self.registry.pkg_version_str(pkg),
            &self.registry.pkg(pkg).digest,
        )
    }

    /// Open the package payload from the chosen repository.
    pub(crate) fn open_repo_item(&mut self, repo: usize, pkg: PkgId) -> Result<Box<dyn Read>> {
        if repo == REPO_CACHED {
            let cache = self.cache.as_ref().ok_or(Error::CacheNotAvailable)?;
            let name = self.cache_pkg_name(pkg)?;
            return Ok(Box::new(File::open(cache.dir.join(name))?));
        }
        let url = self.repos[repo].url.clone();
        let name = self.registry.pkg_name_str(pkg).to_string();
        let version = self.registry.pkg_version_str(pkg).to_string();
        let arch = self.arch_str().to_string();
        match repository::local_file_url(&url) {
            Some(path) => {
                let file = repository::format_real_url(path, &arch, Some((&name, &version)));
                Ok(Box::new(File::open(file)?))
            }
            None => {
                let file_url = repository::format_real_url(&url, &arch, Some((&name, &version)));
                self.fetch_stream(&file_url)
            }
        }
    }

    /// Populate the cache with `pkg`'s archive.
    pub fn cache_download_pkg(&mut self, pkg: PkgId) -> Result<repository::DownloadOutcome> {
        let repo = self
            .select_repo(pkg)
            .ok_or_else(|| Error::PackageNotFound(self.registry.pkg_display(pkg)))?;
        let cache = self.cache.as_ref().ok_or(Error::CacheNotAvailable)?;
        let cache_dir = cache.dir.clone();
        let name = self.registry.pkg_name_str(pkg).to_string();
        let version = self.registry.pkg_version_str(pkg).to_string();
        let digest = self.registry.pkg(pkg).digest;
        let arch = self.arch_str().to_string();
        let fetcher = self.fetcher.as_mut().ok_or(Error::CacheNotAvailable)?;
        let mut ctx = CacheContext {
            cache_dir: &cache_dir,
            fetcher: fetcher.as_mut(),
            arch: &arch,
            cache_max_age: self.cache_max_age,
            force_refresh: self.flags.force_refresh,
            simulate: self.flags.simulate,
        };
        let outcome = repository::cache_download(
            &mut ctx,
            &self.repos[repo],
            Some((&name, &version, &digest)),
            false,
        )?;
        self.registry.pkg_mut(pkg).repos |= CACHED_BIT;
        Ok(outcome)
    }

    /// Refuse to continue when repositories failed to load, unless
    /// forced.
    pub fn repository_check(&self) -> Result<()> {
        if self.flags.force_missing_repositories {
            return Ok(());
        }
        if self.repo_counters.stale == 0 && self.repo_counters.unavailable == 0 {
            return Ok(());
        }
        Err(Error::RepositoryCheck {
            unavailable: self.repo_counters.unavailable,
            stale: self.repo_counters.stale,
        })
    }

    /// Count world dependencies pinned to tags with no usable
    /// repositories.
    pub fn check_world(&self) -> usize {
        if self.flags.force_broken_world {
            return 0;
        }
        let mut bad = 0;
        for dep in &self.world {
            let Some(tag) = dep.tag.as_deref() else {
                continue;
            };
            let allowed = self
                .repo_tags
                .iter()
                .skip(1)
                .find(|t| t.plain_name() == tag)
                .map_or(0, |t| t.allowed_repos);
            if allowed == 0 {
                warn!(
                    name = self.registry.name_str(dep.name),
                    tag, "repository tag for world dependency does not exist"
                );
                bad += 1;
            }
        }
        bad
    }

    // ------------------------------------------------------------------
    // Triggers and scripts
    // ------------------------------------------------------------------

    pub(crate) fn trigger_list_add(&mut self, pkg: PkgId) {
        let ipkg = self.ipkg_mut(pkg);
        if !ipkg.in_trigger_list {
            ipkg.in_trigger_list = true;
            self.trigger_pkgs.push(pkg);
        }
    }

    pub(crate) fn trigger_list_remove(&mut self, pkg: PkgId) {
        if self.registry.pkg(pkg).ipkg.is_some() {
            self.ipkg_mut(pkg).in_trigger_list = false;
        }
        self.trigger_pkgs.retain(|&p| p != pkg);
    }

    /// Match modified directories against registered triggers; returns
    /// the number of packages with pending trigger work.
    pub fn fire_triggers(&mut self) -> usize {
        let trigger_pkgs = self.trigger_pkgs.clone();
        trigger::fire_triggers(&self.tree, &mut self.registry, &trigger_pkgs)
    }

    /// Run every pending trigger script, FIFO. Returns the number of
    /// packages whose trigger ran.
    pub fn run_pending_triggers(&mut self) -> usize {
        let mut ran = 0;
        for pkg in self.trigger_pkgs.clone() {
            let Some(ipkg) = self.registry.pkg(pkg).ipkg.as_ref() else {
                continue;
            };
            if ipkg.pending_triggers.is_empty() {
                continue;
            }
            let args: Vec<String> = ipkg
                .pending_triggers
                .iter()
                .flatten()
                .cloned()
                .collect();
            self.ipkg_mut(pkg).pending_triggers.clear();
            self.run_ipkg_script(pkg, ScriptKind::Trigger, &args);
            ran += 1;
        }
        ran
    }

    /// Materialize and run one lifecycle script. Failure is recorded on
    /// the package, not propagated.
    pub(crate) fn run_ipkg_script(&mut self, pkg: PkgId, kind: ScriptKind, args: &[String]) {
        if self.flags.simulate {
            return;
        }
        let Some(ipkg) = self.registry.pkg(pkg).ipkg.as_ref() else {
            return;
        };
        let Some(blob) = ipkg.script(kind) else {
            return;
        };
        let blob = blob.to_vec();
        let pkg_name = self.registry.pkg_display(pkg);
        info!(pkg = %pkg_name, script = %kind, "executing script");

        let rel = format!("{}/{}.{}", SCRIPT_EXEC_DIR, pkg_name, kind.name());
        let result = (|| -> Result<()> {
            let exec_dir = self.root.join(SCRIPT_EXEC_DIR);
            fs::create_dir_all(&exec_dir)?;
            let path = self.root.join(&rel);
            fs::write(&path, &blob)?;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
            let env = ScriptEnv {
                no_chroot: self.flags.no_chroot,
                preserve_env: self.flags.preserve_env,
            };
            let r = script::run_script(&self.root, &rel, args, env);
            fs::remove_file(&path).ok();
            r
        })();

        if let Err(e) = result {
            warn!(pkg = %pkg_name, error = %e, "script failed");
            self.ipkg_mut(pkg).broken_script = true;
        }
    }

    // ------------------------------------------------------------------
    // Permission sweeper
    // ------------------------------------------------------------------

    /// Reapply directory ownership and stale permission bits after
    /// migration or purge changed owners.
    pub fn update_directory_permissions(&mut self) -> usize {
        if self.dirowner_stale {
            let installed = self.registry.installed.clone();
            for pkg in installed {
                let dirs = self
                    .registry
                    .pkg(pkg)
                    .ipkg
                    .as_ref()
                    .map(|i| i.dirs.clone())
                    .unwrap_or_default();
                for diri in dirs {
                    self.apply_diri_permissions(diri);
                }
            }
            self.dirowner_stale = false;
        }

        let mut errors = 0;
        if self.dirperms_stale {
            if !self.flags.simulate {
                for dir in self.tree.dirs().collect::<Vec<_>>() {
                    if self.tree.dir(dir).refs == 0 || !self.tree.dir(dir).permissions_stale {
                        continue;
                    }
                    let Some(owner) = self.tree.dir(dir).owner else {
                        continue;
                    };
                    let acl = *self.acls.get(self.tree.diri(owner).acl);
                    let name = self.tree.dir(dir).name.to_string();
                    let fsd = Fsdir::new(&self.root, &name, None);
                    if fsd
                        .update_perms(self.dir_mode(acl.mode), acl.uid, acl.gid)
                        .is_ok()
                    {
                        let d = self.tree.dir_mut(dir);
                        d.modified = true;
                        d.permissions_stale = false;
                    } else {
                        errors += 1;
                    }
                }
            }
            self.dirperms_stale = false;
        }
        if errors > 0 {
            warn!("{errors} errors updating directory permissions");
        }
        errors
    }

    // ------------------------------------------------------------------
    // Install entry points
    // ------------------------------------------------------------------

    pub fn install_pkg(
        &mut self,
        oldpkg: Option<PkgId>,
        newpkg: Option<PkgId>,
        opener: &mut dyn crate::extract::ArchiveOpener,
        progress: Option<install::ProgressFn<'_>>,
    ) -> Result<bool> {
        install::install_pkg(self, oldpkg, newpkg, opener, progress)
    }

    pub(crate) fn pkg_uninstall(&mut self, pkg: PkgId) {
        self.trigger_list_remove(pkg);
        self.registry.pkg_uninstall(pkg);
    }

    // ------------------------------------------------------------------
    // Write
    // ------------------------------------------------------------------

    /// Persist all layers: world, installed database, script archive,
    /// trigger registrations, plus the non-repository cache index.
    pub fn write_config(&mut self) -> Result<()> {
        if self.flags.simulate {
            return Ok(());
        }
        if self.create {
            fs::create_dir_all(self.root.join(layer_name(LAYER_ROOT)))?;
            fs::create_dir_all(self.root.join("etc/apk"))?;
        } else if self.lock.is_none() {
            warn!("refusing to write database without write lock");
            return Err(Error::LockFailed);
        }

        if self.write_arch {
            let mut content = self.arch_str().to_string();
            content.push('\n');
            write_atomic(&self.root.join(ARCH_FILE), content.as_bytes())?;
        }

        for layer in 0..LAYER_COUNT {
            if self.active_layers & (1 << layer) == 0 {
                continue;
            }
            let layer_dir = self.root.join(layer_name(layer));
            if !layer_dir.is_dir() {
                if layer == LAYER_ROOT {
                    fs::create_dir_all(&layer_dir)?;
                } else {
                    continue;
                }
            }
            self.write_layer(layer, &layer_dir)?;
        }

        self.write_nr_cache()?;
        Ok(())
    }

    fn write_layer(&mut self, layer: u8, layer_dir: &Path) -> Result<()> {
        // World: the root layer's lives at its legacy location.
        let world_path = if layer == LAYER_ROOT {
            self.root.join(WORLD_FILE)
        } else {
            layer_dir.join("world")
        };
        let world: Vec<Dependency> = self
            .world
            .iter()
            .filter(|dep| self.dep_layer(dep) == layer)
            .cloned()
            .collect();
        write_atomic(
            &world_path,
            depend::write_world(&self.registry, &world).as_bytes(),
        )?;

        // Anonymous overlay entries never persist.
        let pkgs: Vec<PkgId> = self
            .registry
            .sorted_installed()
            .into_iter()
            .filter(|&p| self.registry.pkg(p).layer == layer && self.registry.pkg(p).name.is_some())
            .collect();

        let mut installed = Vec::new();
        for &pkg in &pkgs {
            fdb::write_fdb(self, pkg, &mut installed)?;
        }
        write_atomic(&layer_dir.join("installed"), &installed)?;

        let mut scripts = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut scripts);
            for &pkg in &pkgs {
                fdb::write_scripts(self, pkg, &mut builder)?;
            }
            builder.finish()?;
        }
        write_atomic(&layer_dir.join("scripts.tar"), &scripts)?;

        let mut triggers = Vec::new();
        for &pkg in &pkgs {
            fdb::write_triggers(self, pkg, &mut triggers)?;
        }
        write_atomic(&layer_dir.join("triggers"), &triggers)?;
        Ok(())
    }

    /// The layer a world dependency belongs to: that of its installed
    /// provider, root otherwise.
    fn dep_layer(&self, dep: &Dependency) -> u8 {
        self.registry
            .name(dep.name)
            .providers
            .iter()
            .map(|p| p.pkg)
            .find(|&p| self.registry.pkg(p).ipkg.is_some())
            .map(|p| self.registry.pkg(p).layer)
            .unwrap_or(LAYER_ROOT)
    }

    /// Compact metadata index of installed packages that no repository
    /// provides, kept in the cache directory.
    fn write_nr_cache(&mut self) -> Result<()> {
        if !self.cache_active() {
            return Ok(());
        }
        let mut out = String::new();
        for pkg in self.registry.sorted_installed() {
            let p = self.registry.pkg(pkg);
            if p.name.is_none() {
                continue;
            }
            if p.repos == CACHED_BIT || (p.repos == 0 && p.installed_size == 0) {
                fdb::write_index_entry(self, pkg, &mut out);
                out.push('\n');
            }
        }
        let path = self.cache.as_ref().unwrap().dir.join("installed");
        write_atomic(&path, out.as_bytes())?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Close
    // ------------------------------------------------------------------

    /// Release all resources. The in-memory state is dropped; call
    /// `write_config` first to persist changes.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let installed = self.registry.installed.clone();
        for pkg in installed {
            fdb::free_footprint(self, pkg);
        }

        #[cfg(target_os = "linux")]
        {
            if let Some(proc_dir) = self.proc_mounted.take() {
                let _ = nix::mount::umount2(&proc_dir, nix::mount::MntFlags::MNT_DETACH);
            }
            if let Some(state) = self.cache.take() {
                if let Some(mountpoint) = state.remount {
                    let _ = nix::mount::mount(
                        None::<&str>,
                        &mountpoint,
                        None::<&str>,
                        nix::mount::MsFlags::MS_REMOUNT | nix::mount::MsFlags::MS_RDONLY,
                        None::<&str>,
                    );
                }
            }
        }
        self.lock = None;
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.release();
    }
}

/// Write via a staging file so a crash never leaves a half-written
/// database file.
fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let mut tmp = path.to_path_buf().into_os_string();
    tmp.push(".new");
    let tmp = PathBuf::from(tmp);
    let mut file = File::create(&tmp)?;
    file.write_all(content)?;
    file.sync_data().ok();
    drop(file);
    fs::rename(&tmp, path)?;
    Ok(())
}

fn detect_tmpfs(root: &Path) -> bool {
    #[cfg(target_os = "linux")]
    {
        use nix::sys::statfs::{statfs, TMPFS_MAGIC};
        return statfs(root)
            .map(|st| st.filesystem_type() == TMPFS_MAGIC)
            .unwrap_or(false);
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = root;
        false
    }
}

fn is_read_only(path: &Path) -> bool {
    #[cfg(target_os = "linux")]
    {
        use nix::sys::statvfs::{statvfs, FsFlags};
        return statvfs(path)
            .map(|st| st.flags().contains(FsFlags::ST_RDONLY))
            .unwrap_or(false);
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = path;
        false
    }
}

/// Remount the filesystem holding `path` read-write. Returns the
/// mountpoint for restoration, or `None` when it cannot be determined
/// (no `/proc/mounts`) or the remount fails.
fn remount_rw(path: &Path) -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let mountpoint = find_mountpoint(path)?;
        let r = nix::mount::mount(
            None::<&str>,
            &mountpoint,
            None::<&str>,
            nix::mount::MsFlags::MS_REMOUNT,
            None::<&str>,
        );
        if r.is_err() {
            return None;
        }
        return Some(mountpoint);
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = path;
        None
    }
}

#[cfg(target_os = "linux")]
fn find_mountpoint(path: &Path) -> Option<PathBuf> {
    let dev = fs::metadata(path).ok()?.dev();
    let mounts = fs::read_to_string("/proc/mounts").ok()?;
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let fsname = fields.next()?;
        let mnt_dir = fields.next()?;
        if fsname == "rootfs" {
            continue;
        }
        if let Ok(meta) = fs::metadata(mnt_dir) {
            if meta.dev() == dev {
                return Some(PathBuf::from(mnt_dir));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_new(root: &Path) -> Database {
        let mut opts = OpenOptions::new(root);
        opts.create = true;
        opts.arch = Some("x86_64".to_string());
        opts.root_set = true;
        Database::open(opts).unwrap()
    }

    #[test]
    fn test_open_create_and_reopen() {
        let root = TempDir::new().unwrap();
        let mut db = open_new(root.path());
        assert!(db.world.is_empty());
        db.write_config().unwrap();
        db.close();

        assert!(root.path().join("lib/apk/db/installed").exists());
        assert!(root.path().join("etc/apk/world").exists());
        assert_eq!(
            fs::read_to_string(root.path().join(ARCH_FILE)).unwrap(),
            "x86_64\n"
        );

        let mut opts = OpenOptions::new(root.path());
        opts.arch = Some("x86_64".to_string());
        opts.root_set = true;
        let db = Database::open(opts).unwrap();
        assert_eq!(db.arch_str(), "x86_64");
    }

    #[test]
    fn test_open_missing_db_fails_without_create() {
        let root = TempDir::new().unwrap();
        let opts = OpenOptions::new(root.path());
        assert!(Database::open(opts).is_err());
    }

    #[test]
    fn test_lock_excludes_second_writer() {
        let root = TempDir::new().unwrap();
        // Seed the database directories so the lock file can be taken.
        let mut db = open_new(root.path());
        db.write_config().unwrap();
        db.close();

        let mut opts = OpenOptions::new(root.path());
        opts.create = true;
        let holder = Database::open(opts).unwrap();

        let mut opts = OpenOptions::new(root.path());
        opts.create = true;
        let err = Database::open(opts).unwrap_err();
        assert!(matches!(err, Error::LockFailed));
        holder.close();

        let mut opts = OpenOptions::new(root.path());
        opts.create = true;
        assert!(Database::open(opts).is_ok());
    }

    #[test]
    fn test_default_protected_paths_loaded() {
        let root = TempDir::new().unwrap();
        let mut db = open_new(root.path());
        let etc = db.tree.dir_get("etc");
        assert!(db.tree.dir(etc).protect_mode.protects());
        let apk = db.tree.dir_get("etc/apk");
        assert_eq!(db.tree.dir(apk).protect_mode, dirtree::ProtectMode::All);
    }

    #[test]
    fn test_protected_paths_dropin() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("etc/apk/protected_paths.d")).unwrap();
        fs::write(
            root.path().join("etc/apk/protected_paths.d/custom.list"),
            "+usr/local\n",
        )
        .unwrap();
        // Non-.list files are ignored.
        fs::write(
            root.path().join("etc/apk/protected_paths.d/readme.txt"),
            "+usr/share\n",
        )
        .unwrap();

        let mut db = open_new(root.path());
        let local = db.tree.dir_get("usr/local");
        assert!(db.tree.dir(local).protect_mode.protects());
        let share = db.tree.dir_get("usr/share");
        assert!(!db.tree.dir(share).protect_mode.protects());
    }

    #[test]
    fn test_get_tag_id_interning() {
        let root = TempDir::new().unwrap();
        let mut db = open_new(root.path());
        assert_eq!(db.get_tag_id("").unwrap(), 0);
        let edge = db.get_tag_id("@edge").unwrap();
        assert_eq!(db.get_tag_id("@edge").unwrap(), edge);
        assert_eq!(db.get_tag_id("edge").unwrap(), edge);
        let testing = db.get_tag_id("@testing").unwrap();
        assert_ne!(edge, testing);
    }

    #[test]
    fn test_local_repository_index_loads() {
        let root = TempDir::new().unwrap();
        let repo = TempDir::new().unwrap();
        let arch_dir = repo.path().join("x86_64");
        fs::create_dir_all(&arch_dir).unwrap();
        let digest = Checksum::compute(crate::hash::ChecksumKind::Sha1, b"hello-pkg");
        fs::write(
            arch_dir.join("APKINDEX.tar.gz"),
            format!(
                "C:{}\nP:hello\nV:1.0-r0\nA:x86_64\nS:512\nI:4096\nT:test package\n\n",
                digest.encode()
            ),
        )
        .unwrap();

        let mut db = open_new(root.path());
        db.add_repository(repo.path().to_str().unwrap()).unwrap();

        let name = db.registry.query_name("hello").unwrap();
        assert_eq!(db.registry.name(name).providers.len(), 1);
        let pkg = db.registry.name(name).providers[0].pkg;
        // Repository bit 1 (first configured slot) is set and local.
        assert_ne!(db.registry.pkg(pkg).repos & (1 << 1), 0);
        assert_eq!(db.select_repo(pkg), Some(1));
        assert!(db.pkg_in_local_repo(pkg));
    }

    #[test]
    fn test_repository_check_counts() {
        let root = TempDir::new().unwrap();
        let mut db = open_new(root.path());
        assert!(db.repository_check().is_ok());
        db.repo_counters.unavailable = 1;
        assert!(db.repository_check().is_err());
        db.flags.force_missing_repositories = true;
        assert!(db.repository_check().is_ok());
    }

    #[test]
    fn test_check_world_tag_without_repo() {
        let root = TempDir::new().unwrap();
        let mut db = open_new(root.path());
        let dep = Dependency::parse(&mut db.registry, "foo@missing").unwrap();
        db.world.push(dep);
        assert_eq!(db.check_world(), 1);
        db.flags.force_broken_world = true;
        assert_eq!(db.check_world(), 0);
    }

    #[test]
    fn test_write_then_reopen_round_trips_world() {
        let root = TempDir::new().unwrap();
        let mut db = open_new(root.path());
        let dep = Dependency::parse(&mut db.registry, "busybox>=1.36").unwrap();
        db.world.push(dep);
        db.write_config().unwrap();
        db.close();

        let mut opts = OpenOptions::new(root.path());
        let db = Database::open(opts_with_arch(&mut opts)).unwrap();
        assert_eq!(db.world.len(), 1);
        assert_eq!(db.world[0].write(&db.registry), "busybox>=1.36");
    }

    fn opts_with_arch(opts: &mut OpenOptions) -> OpenOptions {
        let mut new = OpenOptions::new(opts.root.clone());
        new.arch = Some("x86_64".to_string());
        new.root_set = true;
        new
    }
}
