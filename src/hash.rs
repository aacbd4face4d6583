// src/hash.rs

//! Content checksums for package payloads and database records.
//!
//! Installed files carry one of three digest widths: MD5 and SHA-1 from
//! the legacy archive generation, SHA-256 from the current one. A SHA-256
//! digest truncated to 160 bits is stored in the SHA-1 slot with a
//! per-package marker flag, so the width alone does not identify the
//! algorithm.
//!
//! The text encoding is hex with a leading length byte: `10` (16 bytes,
//! MD5), `14` (20 bytes, SHA-1 width), `20` (32 bytes, SHA-256), followed
//! by the digest itself.

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::hash::{Hash as StdHash, Hasher as StdHasher};
use std::io::{self, Read};

use crate::error::Error;

/// Digest algorithm selection by stored width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    Md5,
    Sha1,
    Sha256,
}

impl ChecksumKind {
    pub const fn output_len(&self) -> usize {
        match self {
            Self::Md5 => 16,
            Self::Sha1 => 20,
            Self::Sha256 => 32,
        }
    }
}

/// A content checksum, or the absence of one.
///
/// Equality covers both width and digest bytes. The `Hash` impl feeds the
/// leading digest bytes straight to the hasher: the digests are uniform,
/// so they are their own hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Checksum {
    #[default]
    None,
    Md5([u8; 16]),
    Sha1([u8; 20]),
    Sha256([u8; 32]),
}

impl StdHash for Checksum {
    fn hash<H: StdHasher>(&self, state: &mut H) {
        let data = self.data();
        if data.len() >= 4 {
            state.write(&data[..4]);
        } else {
            state.write_u8(0);
        }
    }
}

impl Checksum {
    pub fn kind(&self) -> Option<ChecksumKind> {
        match self {
            Self::None => None,
            Self::Md5(_) => Some(ChecksumKind::Md5),
            Self::Sha1(_) => Some(ChecksumKind::Sha1),
            Self::Sha256(_) => Some(ChecksumKind::Sha256),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub fn data(&self) -> &[u8] {
        match self {
            Self::None => &[],
            Self::Md5(d) => d,
            Self::Sha1(d) => d,
            Self::Sha256(d) => d,
        }
    }

    /// Build a checksum from raw digest bytes; the length selects the kind.
    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        match data.len() {
            16 => Ok(Self::Md5(data.try_into().unwrap())),
            20 => Ok(Self::Sha1(data.try_into().unwrap())),
            32 => Ok(Self::Sha256(data.try_into().unwrap())),
            _ => Err(Error::InvalidChecksum(hex::encode(data))),
        }
    }

    /// A SHA-256 digest truncated to 160 bits, stored at SHA-1 width.
    pub fn sha256_160(digest: &[u8; 32]) -> Self {
        let mut d = [0u8; 20];
        d.copy_from_slice(&digest[..20]);
        Self::Sha1(d)
    }

    /// Encode as `<len-byte><digest>` hex. `None` encodes to the empty
    /// string and is never written to the database.
    pub fn encode(&self) -> String {
        if self.is_none() {
            return String::new();
        }
        let data = self.data();
        let mut s = String::with_capacity(2 + data.len() * 2);
        s.push_str(&hex::encode([data.len() as u8]));
        s.push_str(&hex::encode(data));
        s
    }

    /// Decode the `encode` form.
    pub fn decode(s: &str) -> Result<Self, Error> {
        let bad = || Error::InvalidChecksum(s.to_string());
        if s.len() < 2 {
            return Err(bad());
        }
        let bytes = hex::decode(s).map_err(|_| bad())?;
        let (len, digest) = bytes.split_first().ok_or_else(bad)?;
        if *len as usize != digest.len() {
            return Err(bad());
        }
        Self::from_bytes(digest).map_err(|_| bad())
    }

    /// First `n` hex characters of the raw digest; used in cache entry
    /// and script archive names.
    pub fn hex_prefix(&self, n: usize) -> String {
        let mut s = hex::encode(self.data());
        s.truncate(n);
        s
    }

    /// Hash a byte slice with the given algorithm.
    pub fn compute(kind: ChecksumKind, data: &[u8]) -> Self {
        let mut h = Hasher::new(kind);
        h.update(data);
        h.finalize()
    }

    /// Hash everything a reader yields with the given algorithm.
    pub fn compute_reader<R: Read>(kind: ChecksumKind, reader: &mut R) -> io::Result<Self> {
        let mut h = Hasher::new(kind);
        let mut buf = [0u8; 8192];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            h.update(&buf[..n]);
        }
        Ok(h.finalize())
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.data()))
    }
}

/// Incremental hasher over any supported algorithm.
pub struct Hasher {
    state: HasherState,
}

enum HasherState {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
}

impl Hasher {
    pub fn new(kind: ChecksumKind) -> Self {
        let state = match kind {
            ChecksumKind::Md5 => HasherState::Md5(Md5::new()),
            ChecksumKind::Sha1 => HasherState::Sha1(Sha1::new()),
            ChecksumKind::Sha256 => HasherState::Sha256(Sha256::new()),
        };
        Self { state }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            HasherState::Md5(h) => h.update(data),
            HasherState::Sha1(h) => h.update(data),
            HasherState::Sha256(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Checksum {
        match self.state {
            HasherState::Md5(h) => Checksum::Md5(h.finalize().into()),
            HasherState::Sha1(h) => Checksum::Sha1(h.finalize().into()),
            HasherState::Sha256(h) => Checksum::Sha256(h.finalize().into()),
        }
    }
}

/// Reader adapter that hashes everything passing through it.
///
/// Used to verify a package stream against its identity digest while the
/// external extractor consumes it.
pub struct DigestReader<R> {
    inner: R,
    hasher: Option<Hasher>,
}

impl<R: Read> DigestReader<R> {
    pub fn new(inner: R, kind: ChecksumKind) -> Self {
        Self {
            inner,
            hasher: Some(Hasher::new(kind)),
        }
    }

    /// Finalize over the bytes consumed so far.
    pub fn finalize(&mut self) -> Checksum {
        match self.hasher.take() {
            Some(h) => h.finalize(),
            None => Checksum::None,
        }
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if let Some(h) = &mut self.hasher {
            h.update(&buf[..n]);
        }
        Ok(n)
    }
}
