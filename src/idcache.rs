// src/idcache.rs

//! Lazy uid/gid resolution against the target root.
//!
//! Archive entries may carry symbolic owner names; these resolve against
//! the root's own `etc/passwd` and `etc/group`, not the host's. The maps
//! load on first use and are reset when migration commits a new passwd
//! or group file.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

pub struct IdCache {
    root: PathBuf,
    users: Option<HashMap<String, u32>>,
    groups: Option<HashMap<String, u32>>,
}

impl IdCache {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            users: None,
            groups: None,
        }
    }

    /// Drop the cached maps; the next lookup reloads from disk.
    pub fn reset(&mut self) {
        self.users = None;
        self.groups = None;
    }

    pub fn uid_for(&mut self, name: &str) -> Option<u32> {
        if self.users.is_none() {
            self.users = Some(load_ids(self.root.join("etc/passwd")));
        }
        self.users.as_ref().unwrap().get(name).copied()
    }

    pub fn gid_for(&mut self, name: &str) -> Option<u32> {
        if self.groups.is_none() {
            self.groups = Some(load_ids(self.root.join("etc/group")));
        }
        self.groups.as_ref().unwrap().get(name).copied()
    }
}

/// Parse `name:x:id:...` lines; malformed lines are skipped.
fn load_ids(path: PathBuf) -> HashMap<String, u32> {
    let mut map = HashMap::new();
    let Ok(content) = fs::read_to_string(path) else {
        return map;
    };
    for line in content.lines() {
        let mut fields = line.split(':');
        let (Some(name), _, Some(id)) = (fields.next(), fields.next(), fields.next()) else {
            continue;
        };
        if let Ok(id) = id.parse() {
            map.insert(name.to_string(), id);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lookup_and_reset() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("etc")).unwrap();
        fs::write(
            root.path().join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/sh\nguest:x:405:100::/dev/null:/sbin/nologin\nbad line\n",
        )
        .unwrap();
        fs::write(root.path().join("etc/group"), "root:x:0:\nusers:x:100:guest\n").unwrap();

        let mut ids = IdCache::new(root.path().to_path_buf());
        assert_eq!(ids.uid_for("root"), Some(0));
        assert_eq!(ids.uid_for("guest"), Some(405));
        assert_eq!(ids.uid_for("nobody"), None);
        assert_eq!(ids.gid_for("users"), Some(100));

        // New passwd content only shows up after a reset.
        fs::write(root.path().join("etc/passwd"), "late:x:777:777::/:/bin/sh\n").unwrap();
        assert_eq!(ids.uid_for("late"), None);
        ids.reset();
        assert_eq!(ids.uid_for("late"), Some(777));
        assert_eq!(ids.uid_for("root"), None);
    }

    #[test]
    fn test_missing_files_resolve_to_none() {
        let root = TempDir::new().unwrap();
        let mut ids = IdCache::new(root.path().to_path_buf());
        assert_eq!(ids.uid_for("root"), None);
        assert_eq!(ids.gid_for("root"), None);
    }
}
