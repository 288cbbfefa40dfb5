//! Process ownership and launch plumbing shared by every backend.
//!
//! A backend turns a `(name, args)` request into a [`Launcher`]. The command
//! layer hands the launcher a [`StdioPlan`] and receives a [`Spawned`] bundle:
//! a [`ProcessHandle`] that exclusively owns the OS process plus whichever
//! stdio pipe ends were requested.

use std::ffi::OsString;
use std::fs::File;
use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tracing::debug;

use super::context::CancelContext;
use super::error::{Result, SandboxError};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How a single standard stream of the child is wired.
#[derive(Debug)]
pub enum StdioTarget {
    Null,
    Inherit,
    File(File),
    /// A pipe whose parent end is returned in [`Spawned`].
    Pipe,
}

impl StdioTarget {
    fn into_stdio(self) -> std::process::Stdio {
        match self {
            StdioTarget::Null => std::process::Stdio::null(),
            StdioTarget::Inherit => std::process::Stdio::inherit(),
            StdioTarget::File(file) => std::process::Stdio::from(file),
            StdioTarget::Pipe => std::process::Stdio::piped(),
        }
    }
}

#[derive(Debug)]
pub struct StdioPlan {
    pub stdin: StdioTarget,
    pub stdout: StdioTarget,
    pub stderr: StdioTarget,
}

/// A launched process and the parent ends of any requested pipes.
pub struct Spawned {
    pub process: Box<dyn ProcessHandle>,
    pub stdin: Option<BoxedWriter>,
    pub stdout: Option<BoxedReader>,
    pub stderr: Option<BoxedReader>,
}

/// Exclusive owner of one OS process.
///
/// Dropping the handle before the process has been reaped kills it.
#[async_trait]
pub trait ProcessHandle: Send {
    fn id(&self) -> Option<u32>;

    /// Wait for exit and return the exit code (`-1` when killed by a signal).
    ///
    /// Must be cancel-safe: dropping the future leaves the handle usable.
    async fn wait(&mut self) -> io::Result<i32>;

    /// Request termination without waiting for it.
    fn start_kill(&mut self) -> io::Result<()>;
}

/// A prepared, not yet started, process launch.
pub trait Launcher: Send {
    /// Program name used in diagnostics.
    fn name(&self) -> &str;

    fn launch(self: Box<Self>, stdio: StdioPlan, ctx: &CancelContext) -> Result<Spawned>;
}

/// A plain OS spawn: the None/App backend runs the target directly, the Unix
/// OS backends run a wrapper (`unshare`, `sandbox-exec`) around it.
#[derive(Debug)]
pub struct SpawnRequest {
    pub name: String,
    pub program: OsString,
    pub args: Vec<OsString>,
    pub work_dir: PathBuf,
    pub env: Vec<(String, String)>,
    /// Temporary files and directories that must outlive the process.
    pub keep_alive: Vec<KeepAlive>,
}

/// A temporary filesystem object removed once the process is gone.
///
/// Only held for its `Drop`.
#[derive(Debug)]
#[allow(dead_code)]
pub enum KeepAlive {
    /// A generated profile or script.
    File(tempfile::TempPath),
    /// A mount point used inside the child's namespaces.
    Dir(tempfile::TempDir),
}

impl SpawnRequest {
    pub fn new(name: &str, program: impl Into<OsString>, work_dir: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            program: program.into(),
            args: Vec::new(),
            work_dir,
            env: Vec::new(),
            keep_alive: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    pub fn keep_alive(mut self, item: KeepAlive) -> Self {
        self.keep_alive.push(item);
        self
    }
}

impl Launcher for SpawnRequest {
    fn name(&self) -> &str {
        &self.name
    }

    fn launch(self: Box<Self>, stdio: StdioPlan, ctx: &CancelContext) -> Result<Spawned> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&self.work_dir)
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(stdio.stdin.into_stdio())
            .stdout(stdio.stdout.into_stdio())
            .stderr(stdio.stderr.into_stdio())
            .kill_on_drop(true);

        // Own process group, so a kill reaches shell grandchildren too.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| SandboxError::Spawn {
            name: self.name.clone(),
            source,
        })?;

        debug!(
            pid = child.id(),
            program = %self.program.to_string_lossy(),
            "spawned process"
        );

        let stdin = child.stdin.take().map(|s| Box::new(s) as BoxedWriter);
        let stdout = child.stdout.take().map(|s| Box::new(s) as BoxedReader);
        let stderr = child.stderr.take().map(|s| Box::new(s) as BoxedReader);

        let pgid = child.id();
        let watcher = pgid.map(|pgid| spawn_watcher(pgid, ctx));

        Ok(Spawned {
            process: Box::new(ChildProcess {
                child,
                pgid,
                reaped: false,
                watcher,
                _keep_alive: self.keep_alive,
            }),
            stdin,
            stdout,
            stderr,
        })
    }
}

/// Kill the process group once the context ends, even if nobody is waiting.
fn spawn_watcher(pgid: u32, ctx: &CancelContext) -> JoinHandle<()> {
    let ctx = ctx.clone();
    tokio::spawn(async move {
        ctx.done().await;
        debug!(pgid, "context ended, killing process group");
        kill_tree(pgid);
    })
}

/// Kill the group led by `pgid`. ESRCH just means it is already gone.
#[cfg(unix)]
fn kill_tree(pgid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let _ = killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL);
}

#[cfg(windows)]
fn kill_tree(pid: u32) {
    use windows::Win32::Foundation::CloseHandle;
    use windows::Win32::System::Threading::{OpenProcess, PROCESS_TERMINATE, TerminateProcess};

    unsafe {
        if let Ok(handle) = OpenProcess(PROCESS_TERMINATE, false, pid) {
            let _ = TerminateProcess(handle, 1);
            let _ = CloseHandle(handle);
        }
    }
}

#[cfg(not(any(unix, windows)))]
fn kill_tree(_pid: u32) {}

struct ChildProcess {
    child: tokio::process::Child,
    /// Group id, kept after the leader is reaped so stragglers can still be killed.
    pgid: Option<u32>,
    reaped: bool,
    watcher: Option<JoinHandle<()>>,
    _keep_alive: Vec<KeepAlive>,
}

impl ChildProcess {
    #[cfg(unix)]
    fn kill_group(&self) {
        if let Some(pgid) = self.pgid {
            kill_tree(pgid);
        }
    }

    // Without process groups only the leader can be killed, and only while
    // it has not been reaped (its pid may be reused afterwards).
    #[cfg(not(unix))]
    fn kill_group(&self) {}

    fn stop_watcher(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

#[async_trait]
impl ProcessHandle for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> io::Result<i32> {
        let status = self.child.wait().await?;
        self.reaped = true;
        // The pid may be reused from here on; only the group kill stays valid.
        #[cfg(not(unix))]
        self.stop_watcher();
        Ok(status.code().unwrap_or(-1))
    }

    fn start_kill(&mut self) -> io::Result<()> {
        self.kill_group();
        match self.child.start_kill() {
            // The leader is already reaped or gone.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        self.stop_watcher();
        if !self.reaped {
            self.kill_group();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_request_builder() {
        let req = SpawnRequest::new("echo", "echo", PathBuf::from("/tmp"))
            .arg("-n")
            .args(["a", "b"])
            .env(vec![("K".into(), "V".into())]);
        assert_eq!(req.name, "echo");
        assert_eq!(req.args, vec!["-n", "a", "b"]);
        assert_eq!(req.env, vec![("K".to_string(), "V".to_string())]);
        assert!(req.keep_alive.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_missing_program_is_spawn_error() {
        let req = SpawnRequest::new(
            "definitely-nonexistent-xyz",
            "definitely-nonexistent-xyz",
            std::env::temp_dir(),
        );
        let plan = StdioPlan {
            stdin: StdioTarget::Null,
            stdout: StdioTarget::Null,
            stderr: StdioTarget::Null,
        };
        let ctx = CancelContext::new(std::time::Duration::ZERO);
        let err = match Box::new(req).launch(plan, &ctx) {
            Ok(_) => panic!("spawn should fail"),
            Err(e) => e,
        };
        assert!(matches!(err, SandboxError::Spawn { .. }));
    }
}
