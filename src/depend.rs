// src/depend.rs

//! Dependency expressions and the blobs they travel in.
//!
//! A dependency is `[!]name[@tag][op version]`, e.g. `busybox>=1.36`,
//! `!conflicting-pkg`, `openrc@edge`. The world file is one expression
//! per line; database records carry space-separated lists.
//!
//! Names are resolved against the registry at parse time so the rest of
//! the engine works in handles. Version ordering here is the minimal
//! segment-wise comparison needed for replacement checks; full solver
//! ordering lives outside this crate.

use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::package::{NameId, Registry};

/// Version constraint operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DepOp {
    /// Any version satisfies.
    #[default]
    Any,
    Less,
    LessEq,
    Equal,
    GreaterEq,
    Greater,
    /// Prefix match on version segments (`~1.2` matches `1.2.9`).
    Fuzzy,
}

impl DepOp {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Any => "",
            Self::Less => "<",
            Self::LessEq => "<=",
            Self::Equal => "=",
            Self::GreaterEq => ">=",
            Self::Greater => ">",
            Self::Fuzzy => "~",
        }
    }
}

/// A single dependency expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub name: NameId,
    pub tag: Option<Box<str>>,
    pub op: DepOp,
    pub version: Option<Box<str>>,
    pub conflict: bool,
}

impl Dependency {
    /// Parse a single expression, interning the name.
    pub fn parse(reg: &mut Registry, s: &str) -> Result<Self> {
        let bad = || Error::InvalidDependency(s.to_string());
        let mut rest = s.trim();
        if rest.is_empty() {
            return Err(bad());
        }

        let conflict = rest.starts_with('!');
        if conflict {
            rest = &rest[1..];
        }

        let (op, op_at) = match rest.find(['<', '>', '=', '~']) {
            None => (DepOp::Any, rest.len()),
            Some(i) => {
                let tail = &rest[i..];
                let op = if tail.starts_with("<=") {
                    DepOp::LessEq
                } else if tail.starts_with(">=") {
                    DepOp::GreaterEq
                } else if tail.starts_with('<') {
                    DepOp::Less
                } else if tail.starts_with('>') {
                    DepOp::Greater
                } else if tail.starts_with('~') {
                    DepOp::Fuzzy
                } else {
                    DepOp::Equal
                };
                (op, i)
            }
        };

        let version = if op == DepOp::Any {
            None
        } else {
            let ver = rest[op_at + op.as_str().len()..].trim();
            if ver.is_empty() {
                return Err(bad());
            }
            Some(ver.into())
        };

        let name_part = &rest[..op_at];
        let (name, tag) = match name_part.split_once('@') {
            Some((n, t)) if !t.is_empty() => (n, Some(t.into())),
            Some(_) => return Err(bad()),
            None => (name_part, None),
        };
        if name.is_empty() {
            return Err(bad());
        }

        Ok(Self {
            name: reg.get_name(name),
            tag,
            op,
            version,
            conflict,
        })
    }

    /// Serialize back to the text form.
    pub fn write(&self, reg: &Registry) -> String {
        let mut s = String::new();
        if self.conflict {
            s.push('!');
        }
        s.push_str(reg.name_str(self.name));
        if let Some(tag) = &self.tag {
            s.push('@');
            s.push_str(tag);
        }
        if let Some(ver) = &self.version {
            s.push_str(self.op.as_str());
            s.push_str(ver);
        }
        s
    }

    /// Does an installed `(name, version)` satisfy this expression,
    /// ignoring the conflict bit?
    pub fn matches(&self, name: NameId, version: &str) -> bool {
        if name != self.name {
            return false;
        }
        let Some(want) = self.version.as_deref() else {
            return true;
        };
        match self.op {
            DepOp::Any => true,
            DepOp::Equal => version == want,
            DepOp::Less => version_cmp(version, want) == Ordering::Less,
            DepOp::LessEq => version_cmp(version, want) != Ordering::Greater,
            DepOp::GreaterEq => version_cmp(version, want) != Ordering::Less,
            DepOp::Greater => version_cmp(version, want) == Ordering::Greater,
            DepOp::Fuzzy => fuzzy_match(version, want),
        }
    }
}

/// Parse a space-separated dependency list blob.
pub fn parse_deps(reg: &mut Registry, blob: &str) -> Result<Vec<Dependency>> {
    blob.split_whitespace()
        .map(|tok| Dependency::parse(reg, tok))
        .collect()
}

/// Serialize a dependency list as a space-separated blob.
pub fn write_deps(reg: &Registry, deps: &[Dependency]) -> String {
    deps.iter()
        .map(|d| d.write(reg))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse world-file content: one expression per line, blank lines and
/// surrounding whitespace ignored.
pub fn parse_world(reg: &mut Registry, content: &str) -> Result<Vec<Dependency>> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| Dependency::parse(reg, l))
        .collect()
}

/// Serialize world content, one expression per line.
pub fn write_world(reg: &Registry, deps: &[Dependency]) -> String {
    let mut out = String::new();
    for dep in deps {
        out.push_str(&dep.write(reg));
        out.push('\n');
    }
    out
}

/// Segment-wise version comparison: numeric runs compare numerically,
/// everything else byte-wise. `1.10` sorts after `1.9`.
pub fn version_cmp(a: &str, b: &str) -> Ordering {
    let mut ia = a.as_bytes().iter().peekable();
    let mut ib = b.as_bytes().iter().peekable();
    loop {
        match (ia.peek(), ib.peek()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(&&ca), Some(&&cb)) => {
                if ca.is_ascii_digit() && cb.is_ascii_digit() {
                    let na = take_number(&mut ia);
                    let nb = take_number(&mut ib);
                    match na.cmp(&nb) {
                        Ordering::Equal => {}
                        ord => return ord,
                    }
                } else {
                    match ca.cmp(&cb) {
                        Ordering::Equal => {
                            ia.next();
                            ib.next();
                        }
                        ord => return ord,
                    }
                }
            }
        }
    }
}

fn take_number<'a, I: Iterator<Item = &'a u8>>(it: &mut std::iter::Peekable<I>) -> u64 {
    let mut n: u64 = 0;
    while let Some(&&c) = it.peek() {
        if !c.is_ascii_digit() {
            break;
        }
        n = n.saturating_mul(10).saturating_add(u64::from(c - b'0'));
        it.next();
    }
    n
}

fn fuzzy_match(version: &str, prefix: &str) -> bool {
    match version.strip_prefix(prefix) {
        None => false,
        Some("") => true,
        Some(rest) => rest.starts_with(['.', '-', '_', 'r']),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_name() {
        let mut reg = Registry::new();
        let d = Dependency::parse(&mut reg, "busybox").unwrap();
        assert_eq!(reg.name_str(d.name), "busybox");
        assert_eq!(d.op, DepOp::Any);
        assert!(d.version.is_none());
        assert!(!d.conflict);
    }

    #[test]
    fn test_parse_versioned_and_conflict() {
        let mut reg = Registry::new();
        let d = Dependency::parse(&mut reg, "musl>=1.2.4").unwrap();
        assert_eq!(d.op, DepOp::GreaterEq);
        assert_eq!(d.version.as_deref(), Some("1.2.4"));

        let d = Dependency::parse(&mut reg, "!oldpkg").unwrap();
        assert!(d.conflict);
    }

    #[test]
    fn test_parse_tagged() {
        let mut reg = Registry::new();
        let d = Dependency::parse(&mut reg, "openrc@edge=0.48").unwrap();
        assert_eq!(d.tag.as_deref(), Some("edge"));
        assert_eq!(d.op, DepOp::Equal);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let mut reg = Registry::new();
        assert!(Dependency::parse(&mut reg, "").is_err());
        assert!(Dependency::parse(&mut reg, ">=1.0").is_err());
        assert!(Dependency::parse(&mut reg, "pkg@").is_err());
        assert!(Dependency::parse(&mut reg, "pkg>=").is_err());
    }

    #[test]
    fn test_round_trip() {
        let mut reg = Registry::new();
        for s in ["busybox", "!oldpkg", "musl>=1.2.4", "openrc@edge", "zlib~1.3"] {
            let d = Dependency::parse(&mut reg, s).unwrap();
            assert_eq!(d.write(&reg), s);
        }
    }

    #[test]
    fn test_world_round_trip() {
        let mut reg = Registry::new();
        let content = "busybox\nmusl>=1.2.4\nopenrc@edge\n";
        let deps = parse_world(&mut reg, "  busybox \n\nmusl>=1.2.4\nopenrc@edge\n").unwrap();
        assert_eq!(write_world(&reg, &deps), content);
    }

    #[test]
    fn test_version_cmp_numeric_runs() {
        assert_eq!(version_cmp("1.10", "1.9"), Ordering::Greater);
        assert_eq!(version_cmp("1.2.3", "1.2.3"), Ordering::Equal);
        assert_eq!(version_cmp("1.2", "1.2.1"), Ordering::Less);
        assert_eq!(version_cmp("2.0_rc1", "2.0_rc2"), Ordering::Less);
    }

    #[test]
    fn test_matches() {
        let mut reg = Registry::new();
        let d = Dependency::parse(&mut reg, "foo>=1.2").unwrap();
        let foo = reg.get_name("foo");
        let bar = reg.get_name("bar");
        assert!(d.matches(foo, "1.2"));
        assert!(d.matches(foo, "1.10"));
        assert!(!d.matches(foo, "1.1"));
        assert!(!d.matches(bar, "1.2"));

        let f = Dependency::parse(&mut reg, "foo~1.2").unwrap();
        assert!(f.matches(foo, "1.2.9"));
        assert!(f.matches(foo, "1.2"));
        assert!(!f.matches(foo, "1.20"));
    }
}
