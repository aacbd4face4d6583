// src/trigger.rs

//! Directory-change triggers.
//!
//! Installed packages may register glob patterns; whenever a directory
//! is modified by an install or purge, every registered package whose
//! pattern matches the directory's rooted path gets the path queued on
//! its pending list. The first queued entry is preceded by a `None`
//! placeholder that later becomes the script path in the trigger argv.
//!
//! Queue order is FIFO both across packages (registration order) and
//! within a package (directory scan order).

use glob::{MatchOptions, Pattern};
use tracing::debug;

use crate::dirtree::DirTree;
use crate::package::{PkgId, Registry};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Match modified directories against every registered trigger and
/// queue pending invocations. Returns the number of packages with
/// pending trigger work.
pub fn fire_triggers(tree: &DirTree, registry: &mut Registry, trigger_pkgs: &[PkgId]) -> usize {
    let dirs: Vec<(String, bool)> = tree
        .dirs()
        .map(|d| {
            let dir = tree.dir(d);
            (dir.rooted_name(), dir.modified)
        })
        .collect();

    let mut pending_pkgs = 0;
    for &pkg in trigger_pkgs {
        let Some(ipkg) = registry.pkg(pkg).ipkg.as_ref() else {
            continue;
        };
        let run_all = ipkg.run_all_triggers;
        let patterns: Vec<Pattern> = ipkg
            .triggers
            .iter()
            .filter(|t| t.starts_with('/'))
            .filter_map(|t| Pattern::new(t).ok())
            .collect();

        let mut queued: Vec<String> = Vec::new();
        for (rooted, modified) in &dirs {
            if !run_all && !*modified {
                continue;
            }
            if patterns.iter().any(|p| p.matches_with(rooted, MATCH_OPTIONS)) {
                queued.push(rooted.clone());
            }
        }
        if queued.is_empty() {
            continue;
        }

        debug!(pkg = %registry.pkg_display(pkg), dirs = queued.len(), "queueing trigger");
        let ipkg = registry.pkg_mut(pkg).ipkg.as_mut().unwrap();
        for dir in queued {
            if ipkg.pending_triggers.is_empty() {
                ipkg.pending_triggers.push(None);
            }
            ipkg.pending_triggers.push(Some(dir));
        }
        pending_pkgs += 1;
    }
    pending_pkgs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{Checksum, ChecksumKind};
    use crate::package::Package;

    fn setup() -> (DirTree, Registry, PkgId) {
        let mut tree = DirTree::new(Vec::new());
        let mut reg = Registry::new();
        let mut pkg = Package::new();
        pkg.name = Some(reg.get_name("trigger-owner"));
        pkg.version = reg.atoms.atomize_str("1.0-r0");
        pkg.digest = Checksum::compute(ChecksumKind::Sha1, b"trigger-owner");
        let id = reg.alloc_pkg(pkg);
        let id = reg.pkg_add(&mut tree, id, false).unwrap();
        reg.pkg_install(id);
        (tree, reg, id)
    }

    #[test]
    fn test_trigger_fires_on_modified_dir() {
        let (mut tree, mut reg, pkg) = setup();
        reg.pkg_mut(pkg).ipkg.as_mut().unwrap().triggers =
            vec!["/usr/lib/modules/*".to_string()];

        let d = tree.dir_get("usr/lib/modules/6.1.0");
        tree.dir_mut(d).modified = true;

        let fired = fire_triggers(&tree, &mut reg, &[pkg]);
        assert_eq!(fired, 1);
        let pending = &reg.pkg(pkg).ipkg.as_ref().unwrap().pending_triggers;
        assert_eq!(pending[0], None);
        assert_eq!(pending[1].as_deref(), Some("/usr/lib/modules/6.1.0"));
    }

    #[test]
    fn test_trigger_ignores_unmodified_dirs() {
        let (mut tree, mut reg, pkg) = setup();
        reg.pkg_mut(pkg).ipkg.as_mut().unwrap().triggers =
            vec!["/usr/lib/modules/*".to_string()];

        tree.dir_get("usr/lib/modules/6.1.0");
        assert_eq!(fire_triggers(&tree, &mut reg, &[pkg]), 0);
        assert!(reg.pkg(pkg).ipkg.as_ref().unwrap().pending_triggers.is_empty());
    }

    #[test]
    fn test_run_all_triggers_matches_unmodified() {
        let (mut tree, mut reg, pkg) = setup();
        {
            let ipkg = reg.pkg_mut(pkg).ipkg.as_mut().unwrap();
            ipkg.triggers = vec!["/usr/share/fonts/*".to_string()];
            ipkg.run_all_triggers = true;
        }
        tree.dir_get("usr/share/fonts/ttf");
        assert_eq!(fire_triggers(&tree, &mut reg, &[pkg]), 1);
    }

    #[test]
    fn test_glob_does_not_cross_separators() {
        let (mut tree, mut reg, pkg) = setup();
        reg.pkg_mut(pkg).ipkg.as_mut().unwrap().triggers =
            vec!["/usr/lib/modules/*".to_string()];

        let deep = tree.dir_get("usr/lib/modules/6.1.0/kernel");
        tree.dir_mut(deep).modified = true;
        // The wildcard matches one path segment only; the deep dir does
        // not match, and its modified parent chain was not flagged.
        assert_eq!(fire_triggers(&tree, &mut reg, &[pkg]), 0);
    }

    #[test]
    fn test_non_rooted_patterns_skipped() {
        let (mut tree, mut reg, pkg) = setup();
        reg.pkg_mut(pkg).ipkg.as_mut().unwrap().triggers = vec!["usr/*".to_string()];
        let d = tree.dir_get("usr/bin");
        tree.dir_mut(d).modified = true;
        assert_eq!(fire_triggers(&tree, &mut reg, &[pkg]), 0);
    }

    #[test]
    fn test_placeholder_added_once() {
        let (mut tree, mut reg, pkg) = setup();
        reg.pkg_mut(pkg).ipkg.as_mut().unwrap().triggers = vec!["/etc/*".to_string()];
        for name in ["etc/app", "etc/other"] {
            let d = tree.dir_get(name);
            tree.dir_mut(d).modified = true;
        }
        assert_eq!(fire_triggers(&tree, &mut reg, &[pkg]), 1);
        let pending = &reg.pkg(pkg).ipkg.as_ref().unwrap().pending_triggers;
        assert_eq!(pending.iter().filter(|p| p.is_none()).count(), 1);
        assert_eq!(pending.len(), 3);
    }
}
