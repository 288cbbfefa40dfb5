//! Linux isolation: fresh user/mount/PID/IPC/UTS namespaces via `unshare`.
//!
//! A single `/bin/sh` script runs as namespace root. It recursively binds the
//! host root onto a private mount point and remounts that tree read-only,
//! binds every writable directory read-write on top, then chroots into the
//! result and execs the target from the working directory. All mount side
//! effects vanish with the mount namespace when the command exits, so there
//! is nothing to tear down afterwards.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::backend::{ExecEnv, IsolationBackend};
use super::error::{Result, SandboxError};
use super::process::{KeepAlive, Launcher, SpawnRequest};

const UNSHARE: &str = "unshare";

/// Namespaces requested from `unshare`, with the caller mapped to root so
/// `mount` and `chroot` are permitted inside.
const UNSHARE_FLAGS: &[&str] = &[
    "--user",
    "--map-root-user",
    "--mount",
    "--propagation",
    "private",
    "--pid",
    "--fork",
    "--kill-child",
    "--ipc",
    "--uts",
];

/// Exit status of the script when the read-only root cannot be built.
pub const ROOT_SETUP_FAILED: i32 = 125;

/// Remounts every mount at or below `$1` read-only. Options are copied from
/// mountinfo because a user namespace may not drop locked flags such as
/// `nosuid` or `nodev`. `/dev` and `/proc` stay as they are. Only a failure on
/// `$1` itself is reported.
const RO_REMOUNT_FN: &str = r#"ro_remount() {
    fail=0
    while read -r _ _ _ _ mnt opts _; do
        case "$mnt" in
        "$1"/dev|"$1"/dev/*|"$1"/proc|"$1"/proc/*) ;;
        "$1"|"$1"/*)
            o=${opts#rw}; o=${o#ro}; o=${o#,}
            mount -o "remount,bind,ro${o:+,$o}" "$mnt" 2>/dev/null ||
                [ "$mnt" != "$1" ] || fail=1
            ;;
        esac
    done < /proc/self/mountinfo
    return $fail
}
"#;

pub struct NamespaceBackend {
    unshare: Option<PathBuf>,
}

impl NamespaceBackend {
    pub fn new() -> Self {
        Self {
            unshare: which::which(UNSHARE).ok(),
        }
    }
}

impl Default for NamespaceBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl IsolationBackend for NamespaceBackend {
    fn name(&self) -> &'static str {
        "linux-namespaces"
    }

    fn capability(&self) -> Option<String> {
        self.unshare.as_ref().map(|_| UNSHARE.to_string())
    }

    fn create_isolated_command(
        &self,
        env: &ExecEnv,
        name: &str,
        args: &[String],
    ) -> Result<Box<dyn Launcher>> {
        let unshare = self
            .unshare
            .clone()
            .ok_or_else(|| SandboxError::setup(self.name(), "unshare not found in PATH"))?;

        // Empty directory on the host; only the child's mount namespace
        // ever mounts onto it.
        let root = tempfile::Builder::new()
            .prefix("agent-sandbox-root-")
            .tempdir()
            .map_err(|e| SandboxError::setup(self.name(), format!("cannot create chroot root: {e}")))?;

        let script = build_namespace_script(root.path(), &env.writable_dirs, &env.work_dir);
        debug!(
            root = %root.path().display(),
            writable_dirs = env.writable_dirs.len(),
            work_dir = %env.work_dir.display(),
            "prepared namespace script"
        );

        let request = SpawnRequest::new(name, unshare, env.work_dir.clone())
            .args(unshare_args(&script, name, args))
            .env(env.env.clone())
            .keep_alive(KeepAlive::Dir(root));
        Ok(Box::new(request))
    }
}

/// `unshare` argv after the program name: flags, the shell script, a literal
/// `--` (bound to `$0`) and then the target command with its arguments.
pub fn unshare_args(script: &str, name: &str, args: &[String]) -> Vec<String> {
    let mut argv: Vec<String> = UNSHARE_FLAGS.iter().map(|s| s.to_string()).collect();
    argv.extend(["/bin/sh".into(), "-c".into(), script.to_string(), "--".into()]);
    argv.push(name.to_string());
    argv.extend(args.iter().cloned());
    argv
}

/// Build the script run as root inside the new namespaces.
///
/// Failing to build the read-only root aborts with [`ROOT_SETUP_FAILED`]
/// instead of running the target unconfined. Failures binding writable
/// directories are swallowed; the directory then stays read-only.
pub fn build_namespace_script(root: &Path, writable_dirs: &[PathBuf], work_dir: &Path) -> String {
    let root_q = quote(root);
    let mut script = String::from("set -u\n");
    script.push_str(RO_REMOUNT_FN);

    for dir in writable_dirs {
        script.push_str(&format!("mkdir -p {} 2>/dev/null\n", quote(dir)));
    }

    script.push_str(&format!(
        "mount --rbind / {root_q} && ro_remount {root_q} || {{ \
         echo 'agent-sandbox: cannot build read-only root' >&2; exit {ROOT_SETUP_FAILED}; }}\n"
    ));

    for dir in writable_dirs {
        let src = quote(dir);
        let dst = quote(&root.join(dir.strip_prefix("/").unwrap_or(dir)));
        script.push_str(&format!("mount --rbind {src} {dst} 2>/dev/null\n"));
        script.push_str(&format!("mount -o remount,bind,rw {dst} 2>/dev/null\n"));
    }

    // Fresh procfs for the new PID namespace; the host one stays otherwise.
    script.push_str(&format!(
        "mount -t proc proc {} 2>/dev/null\n",
        quote(&root.join("proc"))
    ));

    // chroot(1) resets the cwd to the new root, so the inner shell moves back
    // into the working directory before replacing itself with the target.
    script.push_str(&format!(
        "exec chroot {root_q} /bin/sh -c 'cd \"$1\" && shift && exec \"$@\"' sh {} \"$@\"\n",
        quote(work_dir)
    ));
    script
}

fn quote(path: &Path) -> String {
    let raw: Cow<'_, str> = path.to_string_lossy();
    shell_escape::unix::escape(raw).into_owned()
}
