// src/repository.rs

//! Repositories, tags, and the package cache.
//!
//! Repository slot 0 is always the local cache with a fixed digest; the
//! configured repositories follow. Cache entries are named after the
//! package (`name-version.<8 hex of digest>.apk`) or the repository
//! index (`APKINDEX.<8 hex of url digest>.tar.gz`).
//!
//! Fetching is a seam: the host injects a `Fetch` implementation and the
//! cache layer drives it with If-Modified-Since semantics, teeing the
//! stream into the cache file while the caller consumes it.

use std::cell::RefCell;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::hash::{Checksum, ChecksumKind, DigestReader};

/// Repository slot of the local cache.
pub const REPO_CACHED: usize = 0;
/// First configurable repository slot.
pub const REPO_FIRST_CONFIGURED: usize = 1;
/// Repository slots available; bounded by the repos bitmask width.
pub const MAX_REPOS: usize = 32;

/// Longest cache item name, matching the fixed buffer the format
/// routines write into.
const CACHE_NAME_MAX: usize = 127;

/// A package source.
pub struct Repository {
    pub url: String,
    /// SHA-1 of the real index URL; the first 8 hex characters name the
    /// cached index.
    pub digest: Checksum,
    pub description: Option<String>,
}

impl Repository {
    /// The fixed cache pseudo-repository.
    pub fn cached(cache_dir: &str) -> Self {
        Self {
            url: cache_dir.to_string(),
            digest: Checksum::compute(ChecksumKind::Sha1, b"cache"),
            description: None,
        }
    }
}

/// A `@tag` with the repositories it admits.
pub struct RepoTag {
    tag: Box<str>,
    pub allowed_repos: u32,
}

impl RepoTag {
    pub fn new(tag: &str) -> Self {
        let tag = if tag.starts_with('@') {
            tag.into()
        } else {
            format!("@{tag}").into_boxed_str()
        };
        Self {
            tag,
            allowed_repos: 0,
        }
    }

    /// Tag with the `@` sigil.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Tag without the sigil, as written to the installed database.
    pub fn plain_name(&self) -> &str {
        &self.tag[1..]
    }
}

/// Result of a fetch: either fresh content or confirmation that the
/// cached copy is current.
pub enum FetchResult {
    NotModified,
    Stream(Box<dyn Read>),
}

/// Network seam. Implementations honor `if_modified_since` by returning
/// `NotModified` when the remote is no newer.
pub trait Fetch {
    fn fetch(&mut self, url: &str, if_modified_since: Option<SystemTime>) -> Result<FetchResult>;
}

// ----------------------------------------------------------------------
// Name formatting
// ----------------------------------------------------------------------

/// `name-version.<8 hex>.apk`
pub fn format_cache_pkg_name(name: &str, version: &str, digest: &Checksum) -> Result<String> {
    let s = format!("{}-{}.{}.apk", name, version, digest.hex_prefix(8));
    if s.len() > CACHE_NAME_MAX {
        return Err(Error::NameTooLong(s));
    }
    Ok(s)
}

/// `APKINDEX.<8 hex>.tar.gz`
pub fn format_cache_index_name(repo: &Repository) -> String {
    format!("APKINDEX.{}.tar.gz", repo.digest.hex_prefix(8))
}

/// Real URL of a package file or the repository index.
pub fn format_real_url(repo_url: &str, arch: &str, pkg: Option<(&str, &str)>) -> String {
    let base = repo_url.trim_end_matches('/');
    match pkg {
        Some((name, version)) => format!("{base}/{arch}/{name}-{version}.apk"),
        None => format!("{base}/{arch}/APKINDEX.tar.gz"),
    }
}

/// Does the URL point at the local filesystem? Returns the path if so.
pub fn local_file_url(url: &str) -> Option<&str> {
    if let Some(path) = url.strip_prefix("file://") {
        return Some(path);
    }
    if url.contains("://") {
        return None;
    }
    Some(url)
}

/// Split `name-version` at the version boundary: the last dash followed
/// by a digit starts the version.
pub fn parse_name_version(s: &str) -> Option<(&str, &str)> {
    let bytes = s.as_bytes();
    for i in (0..bytes.len().saturating_sub(1)).rev() {
        if bytes[i] == b'-' && bytes[i + 1].is_ascii_digit() {
            return Some((&s[..i], &s[i + 1..]));
        }
    }
    None
}

// ----------------------------------------------------------------------
// Cache tee
// ----------------------------------------------------------------------

struct TeeState {
    file: Option<File>,
    tmp: PathBuf,
    final_path: PathBuf,
    failed: bool,
}

/// Reader adapter writing everything it passes into a pending cache
/// file. A write failure stops the tee but keeps the stream flowing.
pub struct TeeReader<R> {
    inner: R,
    state: Rc<RefCell<TeeState>>,
}

/// Handle used to commit or discard the pending cache file after the
/// stream has been consumed.
pub struct TeeHandle {
    state: Rc<RefCell<TeeState>>,
}

impl TeeHandle {
    /// Rename the pending file into place.
    pub fn commit(&self) -> io::Result<()> {
        let mut st = self.state.borrow_mut();
        if st.failed {
            return Err(io::Error::other("cache write failed"));
        }
        if let Some(file) = st.file.take() {
            file.sync_data().ok();
            fs::rename(&st.tmp, &st.final_path)?;
        }
        Ok(())
    }

    /// Drop the pending file.
    pub fn discard(&self) {
        let mut st = self.state.borrow_mut();
        st.file = None;
        let _ = fs::remove_file(&st.tmp);
    }
}

impl<R: Read> Read for TeeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        let mut st = self.state.borrow_mut();
        if !st.failed {
            if let Some(file) = &mut st.file {
                if let Err(e) = file.write_all(&buf[..n]) {
                    warn!(error = %e, "cache tee write failed; continuing without caching");
                    st.failed = true;
                    st.file = None;
                    let _ = fs::remove_file(&st.tmp);
                }
            }
        }
        Ok(n)
    }
}

/// Wrap `inner` so consumed bytes also land in `<cache_dir>/<name>`,
/// via a `.new` staging file committed by the returned handle. When the
/// staging file cannot be created the stream passes through uncached.
pub fn cache_tee(
    inner: Box<dyn Read>,
    cache_dir: &Path,
    name: &str,
) -> (Box<dyn Read>, Option<TeeHandle>) {
    let final_path = cache_dir.join(name);
    let tmp = cache_dir.join(format!("{name}.new"));
    let file = match File::create(&tmp) {
        Ok(file) => file,
        Err(e) => {
            warn!(item = name, error = %e, "cannot stage cache file");
            return (inner, None);
        }
    };
    let state = Rc::new(RefCell::new(TeeState {
        file: Some(file),
        tmp,
        final_path,
        failed: false,
    }));
    let handle = TeeHandle {
        state: state.clone(),
    };
    (Box::new(TeeReader { inner, state }), Some(handle))
}

// ----------------------------------------------------------------------
// Cache download
// ----------------------------------------------------------------------

/// Inputs to a cache population run.
pub struct CacheContext<'a> {
    pub cache_dir: &'a Path,
    pub fetcher: &'a mut dyn Fetch,
    pub arch: &'a str,
    pub cache_max_age: Duration,
    pub force_refresh: bool,
    pub simulate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Cached copy is recent enough; nothing fetched.
    Fresh,
    /// Remote confirmed the cached copy is current.
    NotModified,
    Fetched,
    Simulated,
}

/// Download a package or, when `pkg` is `None`, the repository index
/// into the cache. With `autoupdate`, a recent-enough cached copy short
/// circuits, and `If-Modified-Since` rides on the cached mtime.
pub fn cache_download(
    ctx: &mut CacheContext<'_>,
    repo: &Repository,
    pkg: Option<(&str, &str, &Checksum)>,
    autoupdate: bool,
) -> Result<DownloadOutcome> {
    let item = match pkg {
        Some((name, version, digest)) => format_cache_pkg_name(name, version, digest)?,
        None => format_cache_index_name(repo),
    };
    let url = format_real_url(&repo.url, ctx.arch, pkg.map(|(n, v, _)| (n, v)));
    let item_path = ctx.cache_dir.join(&item);

    let cached_mtime = fs::metadata(&item_path).and_then(|m| m.modified()).ok();
    if autoupdate && !ctx.force_refresh {
        if let Some(mtime) = cached_mtime {
            let age = SystemTime::now()
                .duration_since(mtime)
                .unwrap_or(Duration::ZERO);
            if age <= ctx.cache_max_age {
                debug!(item, "cached copy is fresh");
                return Ok(DownloadOutcome::Fresh);
            }
        }
    }

    info!("fetch {url}");
    if ctx.simulate {
        return Ok(DownloadOutcome::Simulated);
    }

    let stream = match ctx.fetcher.fetch(&url, cached_mtime)? {
        FetchResult::NotModified => {
            // Refresh the freshness clock on the cached copy.
            if let Ok(file) = File::options().write(true).open(&item_path) {
                let _ = file.set_modified(SystemTime::now());
            }
            return Ok(DownloadOutcome::NotModified);
        }
        FetchResult::Stream(s) => s,
    };

    let (mut reader, tee) = cache_tee(stream, ctx.cache_dir, &item);
    let Some(tee) = tee else {
        return Err(Error::CacheNotAvailable);
    };
    let outcome = (|| -> Result<()> {
        match pkg {
            Some((_, _, digest)) => {
                let kind = digest.kind().unwrap_or(ChecksumKind::Sha256);
                let mut verify = DigestReader::new(&mut reader, kind);
                io::copy(&mut verify, &mut io::sink())?;
                let actual = verify.finalize();
                if actual != *digest {
                    return Err(Error::ChecksumMismatch {
                        expected: digest.to_string(),
                        actual: actual.to_string(),
                    });
                }
                Ok(())
            }
            None => {
                io::copy(&mut reader, &mut io::sink())?;
                Ok(())
            }
        }
    })();

    match outcome {
        Ok(()) => {
            tee.commit()?;
            Ok(DownloadOutcome::Fetched)
        }
        Err(e) => {
            tee.discard();
            Err(e)
        }
    }
}

/// Enumerate cache entries, yielding each file name.
pub fn cache_foreach_item(cache_dir: &Path, mut cb: impl FnMut(&str)) -> Result<()> {
    for entry in fs::read_dir(cache_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            cb(name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn digest(seed: &[u8]) -> Checksum {
        Checksum::compute(ChecksumKind::Sha1, seed)
    }

    #[test]
    fn test_cache_names() {
        let d = digest(b"pkg");
        let name = format_cache_pkg_name("busybox", "1.36.1-r0", &d).unwrap();
        assert_eq!(name, format!("busybox-1.36.1-r0.{}.apk", d.hex_prefix(8)));

        let repo = Repository {
            url: "https://mirror/main".into(),
            digest: digest(b"https://mirror/main/x86_64/APKINDEX.tar.gz"),
            description: None,
        };
        let index = format_cache_index_name(&repo);
        assert!(index.starts_with("APKINDEX."));
        assert!(index.ends_with(".tar.gz"));
    }

    #[test]
    fn test_cache_name_too_long() {
        let d = digest(b"pkg");
        let long = "x".repeat(150);
        assert!(matches!(
            format_cache_pkg_name(&long, "1.0", &d),
            Err(Error::NameTooLong(_))
        ));
    }

    #[test]
    fn test_format_real_url() {
        assert_eq!(
            format_real_url("https://mirror/main/", "x86_64", None),
            "https://mirror/main/x86_64/APKINDEX.tar.gz"
        );
        assert_eq!(
            format_real_url("https://mirror/main", "aarch64", Some(("foo", "1.0-r0"))),
            "https://mirror/main/aarch64/foo-1.0-r0.apk"
        );
    }

    #[test]
    fn test_local_file_url() {
        assert_eq!(local_file_url("file:///media/cdrom"), Some("/media/cdrom"));
        assert_eq!(local_file_url("/var/repo"), Some("/var/repo"));
        assert_eq!(local_file_url("https://mirror/main"), None);
    }

    #[test]
    fn test_parse_name_version() {
        assert_eq!(parse_name_version("busybox-1.36.1-r0"), Some(("busybox", "1.36.1-r0")));
        assert_eq!(parse_name_version("gtk-4.0-4.12"), Some(("gtk-4.0", "4.12")));
        assert_eq!(parse_name_version("no-version-here"), None);
    }

    #[test]
    fn test_repo_tag_names() {
        let t = RepoTag::new("@edge");
        assert_eq!(t.tag(), "@edge");
        assert_eq!(t.plain_name(), "edge");
        let t = RepoTag::new("edge");
        assert_eq!(t.tag(), "@edge");
    }

    #[test]
    fn test_tee_commits_on_success() {
        let dir = TempDir::new().unwrap();
        let payload = b"package bytes".to_vec();
        let (mut reader, handle) =
            cache_tee(Box::new(io::Cursor::new(payload.clone())), dir.path(), "item.apk");
        io::copy(&mut reader, &mut io::sink()).unwrap();
        handle.unwrap().commit().unwrap();
        assert_eq!(fs::read(dir.path().join("item.apk")).unwrap(), payload);
        assert!(!dir.path().join("item.apk.new").exists());
    }

    #[test]
    fn test_tee_discard_removes_pending() {
        let dir = TempDir::new().unwrap();
        let (mut reader, handle) =
            cache_tee(Box::new(io::Cursor::new(b"junk".to_vec())), dir.path(), "item.apk");
        let mut buf = [0u8; 2];
        reader.read(&mut buf).unwrap();
        handle.unwrap().discard();
        assert!(!dir.path().join("item.apk").exists());
        assert!(!dir.path().join("item.apk.new").exists());
    }

    struct StaticFetch {
        body: Vec<u8>,
        not_modified: bool,
    }

    impl Fetch for StaticFetch {
        fn fetch(&mut self, _url: &str, ims: Option<SystemTime>) -> Result<FetchResult> {
            if self.not_modified && ims.is_some() {
                return Ok(FetchResult::NotModified);
            }
            Ok(FetchResult::Stream(Box::new(io::Cursor::new(
                self.body.clone(),
            ))))
        }
    }

    #[test]
    fn test_cache_download_verifies_digest() {
        let dir = TempDir::new().unwrap();
        let body = b"the package".to_vec();
        let good = Checksum::compute(ChecksumKind::Sha256, &body);
        let mut fetcher = StaticFetch {
            body: body.clone(),
            not_modified: false,
        };
        let mut ctx = CacheContext {
            cache_dir: dir.path(),
            fetcher: &mut fetcher,
            arch: "x86_64",
            cache_max_age: Duration::from_secs(3600),
            force_refresh: false,
            simulate: false,
        };
        let repo = Repository {
            url: "https://mirror/main".into(),
            digest: digest(b"url"),
            description: None,
        };

        let out = cache_download(&mut ctx, &repo, Some(("foo", "1.0", &good)), false).unwrap();
        assert_eq!(out, DownloadOutcome::Fetched);
        let item = format_cache_pkg_name("foo", "1.0", &good).unwrap();
        assert_eq!(fs::read(dir.path().join(item)).unwrap(), body);

        // Corrupt expectation: fetch fails, nothing cached.
        let bad = Checksum::compute(ChecksumKind::Sha256, b"other");
        let err = cache_download(&mut ctx, &repo, Some(("bar", "1.0", &bad)), false).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
        let item = format_cache_pkg_name("bar", "1.0", &bad).unwrap();
        assert!(!dir.path().join(item).exists());
    }

    #[test]
    fn test_cache_download_fresh_short_circuit() {
        let dir = TempDir::new().unwrap();
        let repo = Repository {
            url: "https://mirror/main".into(),
            digest: digest(b"url2"),
            description: None,
        };
        let index = format_cache_index_name(&repo);
        fs::write(dir.path().join(&index), b"cached index").unwrap();

        let mut fetcher = StaticFetch {
            body: b"new index".to_vec(),
            not_modified: false,
        };
        let mut ctx = CacheContext {
            cache_dir: dir.path(),
            fetcher: &mut fetcher,
            arch: "x86_64",
            cache_max_age: Duration::from_secs(3600),
            force_refresh: false,
            simulate: false,
        };
        let out = cache_download(&mut ctx, &repo, None, true).unwrap();
        assert_eq!(out, DownloadOutcome::Fresh);
        assert_eq!(fs::read(dir.path().join(&index)).unwrap(), b"cached index");

        // Force-refresh bypasses the age check.
        ctx.force_refresh = true;
        let out = cache_download(&mut ctx, &repo, None, true).unwrap();
        assert_eq!(out, DownloadOutcome::Fetched);
        assert_eq!(fs::read(dir.path().join(&index)).unwrap(), b"new index");
    }

    #[test]
    fn test_cache_download_not_modified_touches() {
        let dir = TempDir::new().unwrap();
        let repo = Repository {
            url: "https://mirror/main".into(),
            digest: digest(b"url3"),
            description: None,
        };
        let index = format_cache_index_name(&repo);
        fs::write(dir.path().join(&index), b"cached").unwrap();
        let old = SystemTime::now() - Duration::from_secs(86400);
        File::options()
            .write(true)
            .open(dir.path().join(&index))
            .unwrap()
            .set_modified(old)
            .unwrap();

        let mut fetcher = StaticFetch {
            body: Vec::new(),
            not_modified: true,
        };
        let mut ctx = CacheContext {
            cache_dir: dir.path(),
            fetcher: &mut fetcher,
            arch: "x86_64",
            cache_max_age: Duration::from_secs(60),
            force_refresh: false,
            simulate: false,
        };
        let out = cache_download(&mut ctx, &repo, None, true).unwrap();
        assert_eq!(out, DownloadOutcome::NotModified);
        let mtime = fs::metadata(dir.path().join(&index)).unwrap().modified().unwrap();
        assert!(mtime > old + Duration::from_secs(3600));
    }
}
