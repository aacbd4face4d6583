// src/script.rs

//! Lifecycle script execution.
//!
//! Scripts run in a child process that enters the database root: change
//! directory to the root, chroot into it (unless disabled), and exec with
//! a sanitized environment. The parent waits synchronously; there is no
//! timeout by design, matching the engine's single-threaded model.

use std::fmt;
use std::os::fd::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;

use nix::sys::stat::{umask, Mode};
use nix::unistd::{chroot, fchdir};
use tracing::debug;

use crate::error::{Error, Result};

/// The seven lifecycle script kinds, in storage order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    PreInstall = 0,
    PostInstall = 1,
    PreDeinstall = 2,
    PostDeinstall = 3,
    PreUpgrade = 4,
    PostUpgrade = 5,
    Trigger = 6,
}

impl ScriptKind {
    pub const COUNT: usize = 7;

    pub const ALL: [ScriptKind; Self::COUNT] = [
        Self::PreInstall,
        Self::PostInstall,
        Self::PreDeinstall,
        Self::PostDeinstall,
        Self::PreUpgrade,
        Self::PostUpgrade,
        Self::Trigger,
    ];

    /// Action name as used in the script archive entry names.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PreInstall => "pre-install",
            Self::PostInstall => "post-install",
            Self::PreDeinstall => "pre-deinstall",
            Self::PostDeinstall => "post-deinstall",
            Self::PreUpgrade => "pre-upgrade",
            Self::PostUpgrade => "post-upgrade",
            Self::Trigger => "trigger",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Execution knobs taken from the database flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptEnv {
    pub no_chroot: bool,
    pub preserve_env: bool,
}

const CLEAN_PATH: &str = "/usr/sbin:/usr/bin:/sbin:/bin";

/// Run `script` (a path relative to `root`) with the given arguments.
///
/// The child changes directory to `root`, chroots into it unless
/// disabled, and execs with either the caller's environment or a
/// sanitized `PATH`. Waits for completion; a non-zero exit decodes into
/// the error message.
pub fn run_script(root: &Path, script: &str, args: &[String], env: ScriptEnv) -> Result<()> {
    let root_dir = std::fs::File::open(root)?;
    let program = if env.no_chroot {
        root.join(script).into_os_string()
    } else {
        script.into()
    };

    debug!(script, ?args, "running lifecycle script");

    let mut cmd = Command::new(program);
    cmd.args(args);
    if !env.preserve_env {
        cmd.env_clear();
        cmd.env("PATH", CLEAN_PATH);
    }
    let no_chroot = env.no_chroot;
    let root_fd = root_dir.as_raw_fd();
    unsafe {
        cmd.pre_exec(move || {
            umask(Mode::from_bits_truncate(0o022));
            fchdir(root_fd).map_err(std::io::Error::from)?;
            if !no_chroot {
                chroot(".").map_err(std::io::Error::from)?;
            }
            Ok(())
        });
    }

    let status = cmd.status().map_err(|e| Error::Script {
        name: script.to_string(),
        status: format!("failed to execute: {e}"),
    })?;
    drop(root_dir);

    if status.success() {
        return Ok(());
    }
    Err(Error::Script {
        name: script.to_string(),
        status: exit_status_str(&status),
    })
}

/// Short human form of an abnormal exit status.
fn exit_status_str(status: &std::process::ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exited with error {code}"),
        (None, Some(sig)) => format!("killed by signal {sig}"),
        (None, None) => "terminated abnormally".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn write_script(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_script_kind_names_round_trip() {
        for kind in ScriptKind::ALL {
            assert_eq!(ScriptKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(ScriptKind::from_name("post-remove"), None);
    }

    #[test]
    fn test_run_script_success() {
        let root = TempDir::new().unwrap();
        write_script(root.path(), "lib/apk/exec/ok", "#!/bin/sh\nexit 0\n");
        let env = ScriptEnv {
            no_chroot: true,
            preserve_env: false,
        };
        run_script(root.path(), "lib/apk/exec/ok", &["1.0".to_string()], env).unwrap();
    }

    #[test]
    fn test_run_script_failure_decodes_status() {
        let root = TempDir::new().unwrap();
        write_script(root.path(), "lib/apk/exec/bad", "#!/bin/sh\nexit 3\n");
        let env = ScriptEnv {
            no_chroot: true,
            preserve_env: false,
        };
        let err = run_script(root.path(), "lib/apk/exec/bad", &[], env).unwrap_err();
        match err {
            Error::Script { status, .. } => assert_eq!(status, "exited with error 3"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_run_script_cwd_is_root() {
        let root = TempDir::new().unwrap();
        write_script(
            root.path(),
            "lib/apk/exec/pwdcheck",
            "#!/bin/sh\ntest -d lib/apk/exec\n",
        );
        let env = ScriptEnv {
            no_chroot: true,
            preserve_env: false,
        };
        run_script(root.path(), "lib/apk/exec/pwdcheck", &[], env).unwrap();
    }

    #[test]
    fn test_run_script_sanitized_environment() {
        let root = TempDir::new().unwrap();
        // Fails if the parent environment leaks through.
        std::env::set_var("KEEPER_TEST_LEAK", "1");
        write_script(
            root.path(),
            "lib/apk/exec/envcheck",
            "#!/bin/sh\ntest -z \"$KEEPER_TEST_LEAK\"\n",
        );
        let env = ScriptEnv {
            no_chroot: true,
            preserve_env: false,
        };
        run_script(root.path(), "lib/apk/exec/envcheck", &[], env).unwrap();
    }
}
