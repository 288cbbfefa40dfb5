//! macOS isolation via Seatbelt SBPL profiles and `sandbox-exec`.
//!
//! The profile is default-deny, allows process exec/fork and sysctl reads,
//! grants read-only access to system locations and read+write access scoped
//! to each writable directory. It is written to a private temp file that
//! lives exactly as long as the launched process.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::backend::{ExecEnv, IsolationBackend};
use super::error::{Result, SandboxError};
use super::process::{KeepAlive, Launcher, SpawnRequest};

const SANDBOX_EXEC: &str = "/usr/bin/sandbox-exec";

/// Locations readable (never writable) by every sandboxed command.
const READ_ONLY_SUBPATHS: &[&str] = &[
    "/usr",
    "/bin",
    "/sbin",
    "/System",
    "/Library",
    "/private/etc",
    "/private/var/db",
    "/dev",
];

pub struct SeatbeltBackend {
    sandbox_exec: Option<PathBuf>,
}

impl SeatbeltBackend {
    pub fn new() -> Self {
        let path = PathBuf::from(SANDBOX_EXEC);
        Self {
            sandbox_exec: path.exists().then_some(path),
        }
    }
}

impl Default for SeatbeltBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl IsolationBackend for SeatbeltBackend {
    fn name(&self) -> &'static str {
        "macos-seatbelt"
    }

    fn capability(&self) -> Option<String> {
        self.sandbox_exec.as_ref().map(|_| "sandbox-exec".to_string())
    }

    fn create_isolated_command(
        &self,
        env: &ExecEnv,
        name: &str,
        args: &[String],
    ) -> Result<Box<dyn Launcher>> {
        let sandbox_exec = self
            .sandbox_exec
            .clone()
            .ok_or_else(|| SandboxError::setup(self.name(), "sandbox-exec not found"))?;

        let profile = generate_sbpl_profile(&env.writable_dirs);
        let profile_path = write_profile(&profile, &env.tmp_dir)
            .map_err(|e| SandboxError::setup(self.name(), format!("write profile: {e}")))?;

        debug!(profile = %profile_path.display(), "wrote seatbelt profile");

        let request = SpawnRequest::new(name, sandbox_exec, env.work_dir.clone())
            .arg("-f")
            .arg(profile_path.as_os_str())
            .arg(name)
            .args(args.iter().cloned())
            .env(env.env.clone())
            .keep_alive(KeepAlive::File(profile_path));
        Ok(Box::new(request))
    }
}

/// Write the profile to a fresh `0600` temp file, removed when the returned path drops.
fn write_profile(profile: &str, tmp_dir: &Path) -> std::io::Result<tempfile::TempPath> {
    let mut file = tempfile::Builder::new()
        .prefix("agent-sandbox-")
        .suffix(".sb")
        .tempfile_in(tmp_dir)?;
    file.write_all(profile.as_bytes())?;
    file.flush()?;
    Ok(file.into_temp_path())
}

/// Generate the Seatbelt SBPL profile for the given writable directories.
pub fn generate_sbpl_profile(writable_dirs: &[PathBuf]) -> String {
    let mut rules = vec![
        "(version 1)".to_string(),
        "(deny default)".to_string(),
        "(allow process-exec)".to_string(),
        "(allow process-fork)".to_string(),
        "(allow signal (target self))".to_string(),
        "(allow sysctl-read)".to_string(),
        // dyld and libSystem need mach lookups to start any binary.
        "(allow mach-lookup)".to_string(),
        "(allow file-read* (literal \"/\"))".to_string(),
    ];

    for path in READ_ONLY_SUBPATHS {
        rules.push(format!("(allow file-read* (subpath \"{}\"))", path));
    }

    rules.push("(allow file-write* (literal \"/dev/null\"))".to_string());

    for dir in writable_dirs {
        let escaped = escape_sbpl_path(&dir.to_string_lossy());
        rules.push(format!(
            "(allow file-read* file-write* (subpath \"{}\"))",
            escaped
        ));
    }

    rules.join("\n")
}

/// Escape a path string for use in SBPL profiles.
fn escape_sbpl_path(path: &str) -> String {
    path.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writable() -> Vec<PathBuf> {
        vec![
            PathBuf::from("/private/tmp"),
            PathBuf::from("/Users/test/project"),
        ]
    }

    #[test]
    fn test_generate_sbpl_profile_contains_deny_default() {
        let profile = generate_sbpl_profile(&writable());
        assert!(profile.starts_with("(version 1)\n(deny default)"));
    }

    #[test]
    fn test_generate_sbpl_profile_allows_exec_fork_sysctl() {
        let profile = generate_sbpl_profile(&writable());
        assert!(profile.contains("(allow process-exec)"));
        assert!(profile.contains("(allow process-fork)"));
        assert!(profile.contains("(allow sysctl-read)"));
    }

    #[test]
    fn test_generate_sbpl_profile_system_dirs_are_read_only() {
        let profile = generate_sbpl_profile(&writable());
        for dir in ["/usr", "/System", "/Library"] {
            assert!(profile.contains(&format!("(allow file-read* (subpath \"{dir}\"))")));
            assert!(!profile.contains(&format!("file-write* (subpath \"{dir}\")")));
        }
        assert!(profile.contains("(allow file-read* (literal \"/\"))"));
    }

    #[test]
    fn test_generate_sbpl_profile_allows_writable_dirs() {
        let profile = generate_sbpl_profile(&writable());
        assert!(
            profile.contains("(allow file-read* file-write* (subpath \"/Users/test/project\"))")
        );
        assert!(profile.contains("(allow file-read* file-write* (subpath \"/private/tmp\"))"));
    }

    #[test]
    fn test_escape_sbpl_path() {
        assert_eq!(escape_sbpl_path("/simple/path"), "/simple/path");
        assert_eq!(
            escape_sbpl_path("/path/with \"quotes\""),
            "/path/with \\\"quotes\\\""
        );
        assert_eq!(
            escape_sbpl_path("/path\\with\\backslashes"),
            "/path\\\\with\\\\backslashes"
        );
    }

    #[test]
    fn test_write_profile_is_removed_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_profile("(version 1)", tmp.path()).unwrap();
        let on_disk = path.to_path_buf();
        assert_eq!(std::fs::read_to_string(&on_disk).unwrap(), "(version 1)");
        drop(path);
        assert!(!on_disk.exists());
    }
}
