use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use path_clean::PathClean;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::backend::{ExecEnv, IsolationBackend, platform_backend};
use super::command::Command;
use super::context::CancelContext;
use super::error::{Result, SandboxError};
use super::native;
use super::process::Launcher;

/// Default name of the agent's bookkeeping directory inside the working directory.
pub const DEFAULT_STATE_DIR_NAME: &str = ".agent-sandbox";

/// Substrings that mark a command name as destructive under `Os`/`App`.
const DENIED_COMMAND_PATTERNS: &[&str] = &["rm", "del", "format", "mkfs"];

/// Shell builtins that have no executable to resolve on PATH.
#[cfg(windows)]
const BUILTIN_COMMANDS: &[&str] = &[
    "cmd", "echo", "dir", "type", "set", "cd", "chdir", "copy", "move", "mkdir", "md", "rmdir",
    "rd", "ren", "cls", "ver", "vol", "path", "pushd", "popd", "title",
];

#[cfg(not(windows))]
const BUILTIN_COMMANDS: &[&str] = &[
    "cd", "export", "source", ".", "alias", "unset", "umask", "ulimit", "exec",
];

/// Containment strength applied to executed commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// No policy enforced.
    #[default]
    None,
    /// Platform-native isolation.
    Os,
    /// Legacy alias that currently behaves like `None`.
    App,
}

impl IsolationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            IsolationMode::None => "none",
            IsolationMode::Os => "os",
            IsolationMode::App => "app",
        }
    }
}

impl fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IsolationMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(IsolationMode::None),
            "os" => Ok(IsolationMode::Os),
            "app" => Ok(IsolationMode::App),
            other => Err(format!(
                "unknown isolation mode '{other}' (expected none, os or app)"
            )),
        }
    }
}

/// Construction parameters for a [`Sandbox`].
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Directories the command may write, in order. Relative entries resolve against `work_dir`.
    pub writable_dirs: Vec<PathBuf>,
    /// Defaults to the system temp directory.
    pub tmp_dir: Option<PathBuf>,
    /// Defaults to the current directory. Must exist.
    pub work_dir: Option<PathBuf>,
    /// `KEY=VALUE` entries. Empty means inherit the current environment.
    pub env: Vec<String>,
    /// Zero means unbounded.
    pub timeout: Duration,
    pub isolation_mode: IsolationMode,
    /// Defaults to [`DEFAULT_STATE_DIR_NAME`].
    pub state_dir_name: Option<String>,
}

#[derive(Debug)]
struct SandboxState {
    writable_dirs: Vec<PathBuf>,
    tmp_dir: PathBuf,
    work_dir: PathBuf,
    env: Vec<(String, String)>,
    timeout: Duration,
    isolation_mode: IsolationMode,
    state_dir_name: String,
}

impl SandboxState {
    fn exec_env(&self) -> ExecEnv {
        ExecEnv {
            work_dir: self.work_dir.clone(),
            tmp_dir: self.tmp_dir.clone(),
            writable_dirs: self.writable_dirs.clone(),
            env: self.env.clone(),
            state_dir_name: self.state_dir_name.clone(),
        }
    }

    fn path_var(&self) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| {
                if cfg!(windows) {
                    k.eq_ignore_ascii_case("PATH")
                } else {
                    k == "PATH"
                }
            })
            .map(|(_, v)| v.as_str())
    }
}

/// Policy holder and dispatcher for sandboxed command execution.
///
/// Cheap to share behind an `Arc`: executions and queries take a read lock,
/// the two setters take a short write lock.
pub struct Sandbox {
    state: RwLock<SandboxState>,
    backend: Arc<dyn IsolationBackend>,
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("state", &*self.state.read())
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl Sandbox {
    /// Build a sandbox using the current platform's isolation backend.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_backend(config, platform_backend())
    }

    pub fn with_backend(config: Config, backend: Arc<dyn IsolationBackend>) -> Result<Self> {
        let work_dir = match config.work_dir {
            Some(dir) => dir,
            None => std::env::current_dir()?,
        };
        let work_dir = canonicalize_dir(&work_dir)?;

        let tmp_dir = config.tmp_dir.unwrap_or_else(std::env::temp_dir);
        let tmp_dir = canonicalize_lenient(&tmp_dir, &work_dir).map_err(|e| invalid(&tmp_dir, e))?;

        let mut writable_dirs = vec![tmp_dir.clone()];
        for dir in &config.writable_dirs {
            let canonical = canonicalize_lenient(dir, &work_dir).map_err(|e| invalid(dir, e))?;
            if !writable_dirs.contains(&canonical) {
                writable_dirs.push(canonical);
            }
        }

        let env = if config.env.is_empty() {
            std::env::vars_os()
                .map(|(k, v)| {
                    (
                        k.to_string_lossy().into_owned(),
                        v.to_string_lossy().into_owned(),
                    )
                })
                .collect()
        } else {
            parse_env(&config.env)
        };

        let state = SandboxState {
            writable_dirs,
            tmp_dir,
            work_dir,
            env,
            timeout: config.timeout,
            isolation_mode: config.isolation_mode,
            state_dir_name: config
                .state_dir_name
                .unwrap_or_else(|| DEFAULT_STATE_DIR_NAME.to_string()),
        };

        debug!(
            mode = %state.isolation_mode,
            backend = backend.name(),
            work_dir = %state.work_dir.display(),
            writable_dirs = ?state.writable_dirs,
            "sandbox created"
        );

        Ok(Self {
            state: RwLock::new(state),
            backend,
        })
    }

    /// Prepare `name args...` for execution under the current isolation mode.
    ///
    /// The returned command is not started. Its cancellation context is
    /// bounded by the configured timeout, measured from this call.
    pub fn execute(&self, name: &str, args: &[String]) -> Result<Command> {
        let (env, mode, timeout) = {
            let state = self.state.read();
            (state.exec_env(), state.isolation_mode, state.timeout)
        };

        let ctx = CancelContext::new(timeout);
        let launcher: Box<dyn Launcher> = match mode {
            IsolationMode::None | IsolationMode::App => {
                Box::new(native::direct_command(&env, name, args))
            }
            IsolationMode::Os => self.backend.create_isolated_command(&env, name, args)?,
        };

        info!(
            command = name,
            mode = %mode,
            backend = self.backend.name(),
            "executing command"
        );

        Ok(Command::new(name, args, env.work_dir, ctx, launcher))
    }

    /// Whether a command may write `path`. Always true in `None` mode.
    ///
    /// Relative paths resolve against the working directory; paths that do
    /// not exist yet resolve through their deepest existing ancestor.
    pub fn is_path_writable(&self, path: impl AsRef<Path>) -> bool {
        let state = self.state.read();
        if state.isolation_mode == IsolationMode::None {
            return true;
        }

        let target = match canonicalize_lenient(path.as_ref(), &state.work_dir) {
            Ok(target) => target,
            Err(e) => {
                debug!(path = %path.as_ref().display(), error = %e, "cannot resolve path");
                return false;
            }
        };

        state
            .writable_dirs
            .iter()
            .any(|dir| relative_within(&target, dir))
    }

    /// Check that `name` resolves to an executable and, outside `None` mode,
    /// is not a denylisted destructive command.
    pub fn validate_command(&self, name: &str, args: &[String]) -> Result<()> {
        let state = self.state.read();
        let mode = state.isolation_mode;

        if name.trim().is_empty() {
            return Err(SandboxError::CommandNotFound(name.to_string()));
        }

        if mode != IsolationMode::None {
            let base = command_base_name(name);
            if let Some(pattern) = DENIED_COMMAND_PATTERNS
                .iter()
                .find(|pattern| base.contains(*pattern))
            {
                warn!(command = name, pattern, mode = %mode, "command denied");
                return Err(SandboxError::CommandDenied {
                    name: name.to_string(),
                    pattern,
                    mode: mode.as_str(),
                });
            }
        }

        if is_builtin(name) {
            return Ok(());
        }

        let search_path = state
            .path_var()
            .map(str::to_string)
            .or_else(|| std::env::var("PATH").ok());
        match which::which_in(name, search_path, &state.work_dir) {
            Ok(resolved) => {
                debug!(command = name, resolved = %resolved.display(), args = args.len(), "command validated");
                Ok(())
            }
            Err(_) => Err(SandboxError::CommandNotFound(name.to_string())),
        }
    }

    pub fn get_writable_dirs(&self) -> Vec<PathBuf> {
        self.state.read().writable_dirs.clone()
    }

    pub fn get_tmp_dir(&self) -> PathBuf {
        self.state.read().tmp_dir.clone()
    }

    pub fn get_work_dir(&self) -> PathBuf {
        self.state.read().work_dir.clone()
    }

    pub fn get_env(&self) -> Vec<(String, String)> {
        self.state.read().env.clone()
    }

    pub fn get_timeout(&self) -> Duration {
        self.state.read().timeout
    }

    pub fn get_isolation_mode(&self) -> IsolationMode {
        self.state.read().isolation_mode
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Change the working directory. On failure the previous value is kept.
    pub fn set_work_dir(&self, dir: impl AsRef<Path>) -> Result<()> {
        let canonical = canonicalize_dir(dir.as_ref())?;
        let mut state = self.state.write();
        debug!(from = %state.work_dir.display(), to = %canonical.display(), "work dir changed");
        state.work_dir = canonical;
        Ok(())
    }

    pub fn set_isolation_mode(&self, mode: IsolationMode) {
        let mut state = self.state.write();
        debug!(from = %state.isolation_mode, to = %mode, "isolation mode changed");
        state.isolation_mode = mode;
    }
}

fn invalid(path: &Path, err: io::Error) -> SandboxError {
    SandboxError::InvalidPath {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

fn canonicalize_dir(dir: &Path) -> Result<PathBuf> {
    match dir.canonicalize() {
        Ok(canonical) if canonical.is_dir() => Ok(canonical),
        _ => Err(SandboxError::WorkDirNotFound(dir.to_path_buf())),
    }
}

/// Canonicalize `path`, tolerating a missing tail.
///
/// Relative paths are joined onto `base`. The deepest existing ancestor is
/// resolved through the filesystem and the missing components re-appended.
pub fn canonicalize_lenient(path: &Path, base: &Path) -> io::Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
    .clean();

    let mut existing = absolute.as_path();
    let mut missing = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(resolved) => {
                let mut out = resolved;
                for component in missing.iter().rev() {
                    out.push(component);
                }
                return Ok(out);
            }
            Err(e) => match (existing.parent(), existing.file_name()) {
                (Some(parent), Some(name)) => {
                    missing.push(name.to_os_string());
                    existing = parent;
                }
                _ => return Err(e),
            },
        }
    }
}

/// True iff the path of `target` relative to `dir` does not escape via `..`.
fn relative_within(target: &Path, dir: &Path) -> bool {
    match target.strip_prefix(dir) {
        Ok(rel) => !matches!(rel.components().next(), Some(Component::ParentDir)),
        Err(_) => false,
    }
}

fn command_base_name(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_lowercase())
        .unwrap_or_else(|| name.to_lowercase())
}

fn is_builtin(name: &str) -> bool {
    if cfg!(windows) {
        BUILTIN_COMMANDS
            .iter()
            .any(|builtin| builtin.eq_ignore_ascii_case(name))
    } else {
        BUILTIN_COMMANDS.contains(&name)
    }
}

fn parse_env(entries: &[String]) -> Vec<(String, String)> {
    entries
        .iter()
        .filter_map(|entry| match entry.split_once('=') {
            Some((key, value)) if !key.is_empty() => Some((key.to_string(), value.to_string())),
            _ => {
                warn!(entry = %entry, "ignoring malformed environment entry");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::command::SharedBuffer;
    use crate::sandbox::process::SpawnRequest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sandbox_in(dir: &Path, mode: IsolationMode) -> Sandbox {
        let config = Config {
            work_dir: Some(dir.to_path_buf()),
            tmp_dir: Some(dir.join("tmp")),
            writable_dirs: vec![dir.join("out")],
            isolation_mode: mode,
            ..Config::default()
        };
        std::fs::create_dir_all(dir.join("tmp")).unwrap();
        Sandbox::new(config).unwrap()
    }

    /// Backend that records calls and runs the command directly.
    #[derive(Default)]
    struct RecordingBackend {
        calls: AtomicUsize,
    }

    impl IsolationBackend for RecordingBackend {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn capability(&self) -> Option<String> {
            Some("recording".into())
        }

        fn create_isolated_command(
            &self,
            env: &ExecEnv,
            name: &str,
            args: &[String],
        ) -> Result<Box<dyn Launcher>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(
                SpawnRequest::new(name, name, env.work_dir.clone())
                    .args(args.iter().cloned())
                    .env(env.env.clone()),
            ))
        }
    }

    #[test]
    fn test_isolation_mode_parse() {
        assert_eq!("none".parse::<IsolationMode>().unwrap(), IsolationMode::None);
        assert_eq!("OS".parse::<IsolationMode>().unwrap(), IsolationMode::Os);
        assert_eq!(" app ".parse::<IsolationMode>().unwrap(), IsolationMode::App);
        assert!("container".parse::<IsolationMode>().is_err());
        assert_eq!(IsolationMode::Os.to_string(), "os");
    }

    #[test]
    fn test_writable_dirs_start_with_tmp_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = sandbox_in(tmp.path(), IsolationMode::Os);
        let dirs = sandbox.get_writable_dirs();
        let canonical_tmp = tmp.path().join("tmp").canonicalize().unwrap();
        assert_eq!(dirs[0], canonical_tmp);
        assert_eq!(sandbox.get_tmp_dir(), canonical_tmp);
    }

    #[test]
    fn test_default_tmp_dir_is_always_writable() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::new(Config {
            work_dir: Some(tmp.path().to_path_buf()),
            ..Config::default()
        })
        .unwrap();
        let system_tmp = std::env::temp_dir().canonicalize().unwrap();
        assert!(sandbox.get_writable_dirs().contains(&system_tmp));
    }

    #[test]
    fn test_missing_work_dir_is_error() {
        let err = Sandbox::new(Config {
            work_dir: Some(PathBuf::from("/path/does/not/exist")),
            ..Config::default()
        })
        .unwrap_err();
        assert!(matches!(err, SandboxError::WorkDirNotFound(_)));
    }

    #[test]
    fn test_new_does_not_create_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = sandbox_in(tmp.path(), IsolationMode::Os);
        assert!(!tmp.path().join("out").exists());
        // Missing writable dirs still resolve to their eventual location.
        let expected = tmp.path().canonicalize().unwrap().join("out");
        assert!(sandbox.get_writable_dirs().contains(&expected));
    }

    #[test]
    fn test_everything_writable_in_none_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = sandbox_in(tmp.path(), IsolationMode::None);
        assert!(sandbox.is_path_writable("/etc/passwd"));
        assert!(sandbox.is_path_writable("/definitely/not/here"));
        assert!(sandbox.is_path_writable(""));
    }

    #[test]
    fn test_path_writability_in_os_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = sandbox_in(tmp.path(), IsolationMode::Os);
        std::fs::create_dir_all(tmp.path().join("out/nested")).unwrap();

        assert!(sandbox.is_path_writable(tmp.path().join("out")));
        assert!(sandbox.is_path_writable(tmp.path().join("out/nested/file.txt")));
        assert!(sandbox.is_path_writable(tmp.path().join("tmp/new-file")));
        assert!(!sandbox.is_path_writable(tmp.path().join("src/main.rs")));
        assert!(!sandbox.is_path_writable("/etc/passwd"));
    }

    #[test]
    fn test_parent_escape_is_not_writable() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = sandbox_in(tmp.path(), IsolationMode::App);
        std::fs::create_dir_all(tmp.path().join("out")).unwrap();
        assert!(!sandbox.is_path_writable(tmp.path().join("out/../secret")));
        // Relative paths resolve against the working directory.
        assert!(sandbox.is_path_writable("out/report.txt"));
        assert!(!sandbox.is_path_writable("report.txt"));
    }

    #[test]
    fn test_sibling_prefix_is_not_writable() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = sandbox_in(tmp.path(), IsolationMode::Os);
        assert!(!sandbox.is_path_writable(tmp.path().join("outside/file")));
    }

    #[test]
    fn test_validate_nonexistent_command_fails_in_every_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = sandbox_in(tmp.path(), IsolationMode::None);
        for mode in [IsolationMode::None, IsolationMode::Os, IsolationMode::App] {
            sandbox.set_isolation_mode(mode);
            let err = sandbox
                .validate_command("definitely-nonexistent-xyz", &[])
                .unwrap_err();
            assert!(matches!(err, SandboxError::CommandNotFound(_)), "{mode}");
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_validate_rm_depends_on_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = sandbox_in(tmp.path(), IsolationMode::None);
        sandbox.validate_command("rm", &[]).unwrap();

        for mode in [IsolationMode::Os, IsolationMode::App] {
            sandbox.set_isolation_mode(mode);
            let err = sandbox.validate_command("rm", &[]).unwrap_err();
            assert!(matches!(err, SandboxError::CommandDenied { .. }));
        }
    }

    #[test]
    fn test_builtins_skip_resolution() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = sandbox_in(tmp.path(), IsolationMode::Os);
        sandbox.validate_command("cd", &["..".into()]).unwrap();
    }

    #[test]
    fn test_set_work_dir_rejects_missing_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = sandbox_in(tmp.path(), IsolationMode::None);
        let before = sandbox.get_work_dir();

        let err = sandbox.set_work_dir("/path/does/not/exist").unwrap_err();
        assert!(matches!(err, SandboxError::WorkDirNotFound(_)));
        assert_eq!(sandbox.get_work_dir(), before);

        let sub = tmp.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        sandbox.set_work_dir(&sub).unwrap();
        assert_eq!(sandbox.get_work_dir(), sub.canonicalize().unwrap());
    }

    #[test]
    fn test_env_entries_are_parsed() {
        let parsed = parse_env(&[
            "A=1".into(),
            "B=x=y".into(),
            "broken".into(),
            "=C:".into(),
        ]);
        assert_eq!(
            parsed,
            vec![("A".into(), "1".into()), ("B".into(), "x=y".into())]
        );
    }

    #[test]
    fn test_canonicalize_lenient_keeps_missing_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().canonicalize().unwrap();
        let resolved = canonicalize_lenient(Path::new("a/b/../c"), &base).unwrap();
        assert_eq!(resolved, base.join("a/c"));
    }

    #[test]
    fn test_os_mode_dispatches_to_backend() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = Arc::new(RecordingBackend::default());
        let sandbox = Sandbox::with_backend(
            Config {
                work_dir: Some(tmp.path().to_path_buf()),
                isolation_mode: IsolationMode::Os,
                ..Config::default()
            },
            backend.clone(),
        )
        .unwrap();

        sandbox.execute("true", &[]).unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        sandbox.set_isolation_mode(IsolationMode::App);
        sandbox.execute("true", &[]).unwrap();
        sandbox.set_isolation_mode(IsolationMode::None);
        sandbox.execute("true", &[]).unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_echo_in_none_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = sandbox_in(tmp.path(), IsolationMode::None);
        let mut cmd = sandbox.execute("echo", &["hello sandbox".into()]).unwrap();
        let out = SharedBuffer::new();
        cmd.set_stdout(out.clone());
        cmd.run().await.unwrap();
        assert_eq!(out.to_string_lossy().trim(), "hello sandbox");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_runs_in_work_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = sandbox_in(tmp.path(), IsolationMode::None);
        let mut cmd = sandbox.execute("pwd", &[]).unwrap();
        let out = SharedBuffer::new();
        cmd.set_stdout(out.clone());
        cmd.run().await.unwrap();
        assert_eq!(
            PathBuf::from(out.to_string_lossy().trim()),
            tmp.path().canonicalize().unwrap()
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_configured_env_replaces_inherited() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::new(Config {
            work_dir: Some(tmp.path().to_path_buf()),
            env: vec!["SANDBOX_MARKER=present".into(), "PATH=/usr/bin:/bin".into()],
            ..Config::default()
        })
        .unwrap();
        let mut cmd = sandbox
            .execute("sh", &["-c".into(), "echo $SANDBOX_MARKER".into()])
            .unwrap();
        let out = SharedBuffer::new();
        cmd.set_stdout(out.clone());
        cmd.run().await.unwrap();
        assert_eq!(out.to_string_lossy().trim(), "present");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_stops_sleep_and_sandbox_stays_usable() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::new(Config {
            work_dir: Some(tmp.path().to_path_buf()),
            timeout: Duration::from_secs(1),
            ..Config::default()
        })
        .unwrap();

        let started = std::time::Instant::now();
        let mut cmd = sandbox.execute("sleep", &["5".into()]).unwrap();
        let err = cmd.run().await.unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, SandboxError::Timeout(_)), "got {err:?}");
        assert!(elapsed >= Duration::from_millis(900), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(4), "{elapsed:?}");
        assert!(matches!(cmd.kill(), Err(SandboxError::NotRunning)));

        let mut again = sandbox.execute("true", &[]).unwrap();
        again.run().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_concurrent_executions_are_independent() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = Arc::new(sandbox_in(tmp.path(), IsolationMode::None));

        let run = |word: &'static str| {
            let sandbox = Arc::clone(&sandbox);
            tokio::spawn(async move {
                let mut cmd = sandbox
                    .execute("sh", &["-c".into(), format!("sleep 0.2; echo {word}")])
                    .unwrap();
                let out = SharedBuffer::new();
                cmd.set_stdout(out.clone());
                cmd.run().await.unwrap();
                out.to_string_lossy()
            })
        };

        let (a, b) = tokio::join!(run("alpha"), run("beta"));
        assert_eq!(a.unwrap().trim(), "alpha");
        assert_eq!(b.unwrap().trim(), "beta");
    }
}
