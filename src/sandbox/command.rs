//! The platform-neutral command handle returned by `Sandbox::execute`.

use std::fmt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::context::CancelContext;
use super::error::{Result, SandboxError};
use super::process::{BoxedReader, BoxedWriter, Launcher, ProcessHandle, StdioPlan, StdioTarget};

/// How long output copies may keep draining after a forced kill.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Source for a command's standard input. Defaults to [`Input::Null`].
#[derive(Default)]
pub enum Input {
    #[default]
    Null,
    Inherit,
    File(File),
    Stream(BoxedReader),
}

impl Input {
    pub fn stream(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Input::Stream(Box::new(reader))
    }
}

impl From<File> for Input {
    fn from(file: File) -> Self {
        Input::File(file)
    }
}

impl From<&'static [u8]> for Input {
    fn from(bytes: &'static [u8]) -> Self {
        Input::Stream(Box::new(bytes))
    }
}

/// Destination for a command's stdout or stderr. Defaults to [`Output::Null`].
#[derive(Default)]
pub enum Output {
    #[default]
    Null,
    Inherit,
    File(File),
    Stream(BoxedWriter),
}

impl Output {
    pub fn stream(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Output::Stream(Box::new(writer))
    }
}

impl From<File> for Output {
    fn from(file: File) -> Self {
        Output::File(file)
    }
}

impl From<SharedBuffer> for Output {
    fn from(buffer: SharedBuffer) -> Self {
        Output::Stream(Box::new(buffer))
    }
}

/// Cloneable in-memory sink; every clone appends to the same buffer.
///
/// A buffer built with [`SharedBuffer::with_limit`] stores at most that many
/// bytes but keeps accepting (and counting) everything written to it.
#[derive(Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<Mutex<BufferState>>,
}

#[derive(Default)]
struct BufferState {
    data: Vec<u8>,
    total: usize,
    limit: Option<usize>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BufferState {
                limit: Some(limit),
                ..BufferState::default()
            })),
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inner.lock().data.clone()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.inner.lock().data).into_owned()
    }

    /// Bytes retained.
    pub fn len(&self) -> usize {
        self.inner.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes written, including any dropped past the limit.
    pub fn total_len(&self) -> usize {
        self.inner.lock().total
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("SharedBuffer")
            .field("len", &state.data.len())
            .field("total", &state.total)
            .field("limit", &state.limit)
            .finish()
    }
}

impl AsyncWrite for SharedBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut state = self.inner.lock();
        state.total = state.total.saturating_add(buf.len());
        let keep = match state.limit {
            Some(limit) => buf.len().min(limit.saturating_sub(state.data.len())),
            None => buf.len(),
        };
        state.data.extend_from_slice(&buf[..keep]);
        // Report the whole write so the producer keeps draining the pipe.
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

enum State {
    Created(Box<dyn Launcher>),
    Running(Running),
    Exited(i32),
    Failed,
}

struct Running {
    process: Box<dyn ProcessHandle>,
    stdin_copy: Option<JoinHandle<io::Result<()>>>,
    output_copies: Vec<JoinHandle<io::Result<()>>>,
}

enum Outcome {
    Exited(io::Result<i32>),
    Cancelled,
}

/// A single sandboxed process: created by `Sandbox::execute`, started at most once.
///
/// `start`, `wait` and `run` must be called from within a Tokio runtime.
pub struct Command {
    name: String,
    args: Vec<String>,
    work_dir: PathBuf,
    ctx: CancelContext,
    stdin: Option<Input>,
    stdout: Option<Output>,
    stderr: Option<Output>,
    state: State,
}

impl Command {
    pub(crate) fn new(
        name: &str,
        args: &[String],
        work_dir: PathBuf,
        ctx: CancelContext,
        launcher: Box<dyn Launcher>,
    ) -> Self {
        Self {
            name: name.to_string(),
            args: args.to_vec(),
            work_dir,
            ctx,
            stdin: Some(Input::Null),
            stdout: Some(Output::Null),
            stderr: Some(Output::Null),
            state: State::Created(launcher),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn set_stdin(&mut self, input: impl Into<Input>) {
        self.stdin = Some(input.into());
    }

    pub fn set_stdout(&mut self, output: impl Into<Output>) {
        self.stdout = Some(output.into());
    }

    pub fn set_stderr(&mut self, output: impl Into<Output>) {
        self.stderr = Some(output.into());
    }

    /// Token that cancels this command exactly like a timeout would.
    pub fn cancel_token(&self) -> CancellationToken {
        self.ctx.token()
    }

    /// OS process id while the process is running.
    pub fn id(&self) -> Option<u32> {
        match &self.state {
            State::Running(running) => running.process.id(),
            _ => None,
        }
    }

    /// Exit code once `wait` has observed the process exit.
    pub fn exit_code(&self) -> Option<i32> {
        match self.state {
            State::Exited(code) => Some(code),
            _ => None,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        let launcher = match std::mem::replace(&mut self.state, State::Failed) {
            State::Created(launcher) => launcher,
            other => {
                self.state = other;
                return Err(SandboxError::AlreadyStarted);
            }
        };

        // A context that already ended never spawns anything.
        if let Some(err) = self.ctx.err() {
            return Err(err);
        }

        let stdin = self.stdin.take().unwrap_or_default();
        let stdout = self.stdout.take().unwrap_or_default();
        let stderr = self.stderr.take().unwrap_or_default();

        let (stdin_target, stdin_source) = match stdin {
            Input::Null => (StdioTarget::Null, None),
            Input::Inherit => (StdioTarget::Inherit, None),
            Input::File(file) => (StdioTarget::File(file), None),
            Input::Stream(reader) => (StdioTarget::Pipe, Some(reader)),
        };
        let (stdout_target, stdout_sink) = output_target(stdout);
        let (stderr_target, stderr_sink) = output_target(stderr);

        let plan = StdioPlan {
            stdin: stdin_target,
            stdout: stdout_target,
            stderr: stderr_target,
        };

        let spawned = launcher.launch(plan, &self.ctx)?;

        let stdin_copy = match (stdin_source, spawned.stdin) {
            (Some(reader), Some(writer)) => Some(tokio::spawn(copy_input(reader, writer))),
            _ => None,
        };

        let mut output_copies = Vec::with_capacity(2);
        if let (Some(reader), Some(writer)) = (spawned.stdout, stdout_sink) {
            output_copies.push(tokio::spawn(copy_output(reader, writer)));
        }
        if let (Some(reader), Some(writer)) = (spawned.stderr, stderr_sink) {
            output_copies.push(tokio::spawn(copy_output(reader, writer)));
        }

        debug!(name = %self.name, pid = spawned.process.id(), "command started");

        self.state = State::Running(Running {
            process: spawned.process,
            stdin_copy,
            output_copies,
        });
        Ok(())
    }

    /// Wait for the process to exit or for the context to end.
    ///
    /// On cancellation or timeout the process is killed and reaped before
    /// the context error is returned. Stdio copies are joined first.
    pub async fn wait(&mut self) -> Result<()> {
        let mut running = match std::mem::replace(&mut self.state, State::Failed) {
            State::Running(running) => running,
            State::Created(launcher) => {
                self.state = State::Created(launcher);
                return Err(SandboxError::NotStarted);
            }
            other => {
                self.state = other;
                return Err(SandboxError::NotRunning);
            }
        };

        let outcome = tokio::select! {
            status = running.process.wait() => Outcome::Exited(status),
            _ = self.ctx.done() => Outcome::Cancelled,
        };

        let (wait_result, mut ctx_err) = match outcome {
            // The group may have been killed on expiry before `done` was polled.
            Outcome::Exited(status) => (status, self.ctx.err()),
            Outcome::Cancelled => {
                if let Err(e) = running.process.start_kill() {
                    warn!(name = %self.name, error = %e, "failed to kill cancelled process");
                }
                let status = running.process.wait().await;
                (status, self.ctx.err())
            }
        };

        if let Some(handle) = running.stdin_copy.take() {
            handle.abort();
        }

        // A background grandchild can hold the output pipes open after the
        // leader exits, so the join is bounded by the context as well.
        let mut copy_err = None;
        if ctx_err.is_none() {
            let finished = tokio::select! {
                _ = join_copies(&mut running.output_copies, &mut copy_err) => true,
                _ = self.ctx.done() => false,
            };
            if !finished {
                if let Err(e) = running.process.start_kill() {
                    warn!(name = %self.name, error = %e, "failed to kill process group");
                }
                ctx_err = self.ctx.err();
            }
        }
        if ctx_err.is_some() {
            let drain = join_copies(&mut running.output_copies, &mut copy_err);
            if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
                debug!(name = %self.name, "output still open after drain timeout");
            }
            for handle in running.output_copies.drain(..) {
                handle.abort();
            }
        }

        let code = match wait_result {
            Ok(code) => code,
            Err(e) => {
                self.state = State::Failed;
                return Err(ctx_err.unwrap_or(SandboxError::Io(e)));
            }
        };
        self.state = State::Exited(code);
        debug!(name = %self.name, code, "command exited");

        if let Some(err) = ctx_err {
            return Err(err);
        }
        if code != 0 {
            return Err(SandboxError::ExitStatus { code });
        }
        if let Some(e) = copy_err {
            return Err(SandboxError::Io(e));
        }
        Ok(())
    }

    pub async fn run(&mut self) -> Result<()> {
        self.start()?;
        self.wait().await
    }

    /// Kill the running process. A following `wait` reaps it.
    pub fn kill(&mut self) -> Result<()> {
        match &mut self.state {
            State::Running(running) => running.process.start_kill().map_err(SandboxError::Io),
            State::Created(_) => Err(SandboxError::NotStarted),
            State::Exited(_) | State::Failed => Err(SandboxError::NotRunning),
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            State::Created(_) => "created",
            State::Running(_) => "running",
            State::Exited(_) => "exited",
            State::Failed => "failed",
        };
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("args", &self.args)
            .field("work_dir", &self.work_dir)
            .field("state", &state)
            .finish()
    }
}

fn output_target(output: Output) -> (StdioTarget, Option<BoxedWriter>) {
    match output {
        Output::Null => (StdioTarget::Null, None),
        Output::Inherit => (StdioTarget::Inherit, None),
        Output::File(file) => (StdioTarget::File(file), None),
        Output::Stream(writer) => (StdioTarget::Pipe, Some(writer)),
    }
}

async fn copy_input(mut reader: BoxedReader, mut writer: BoxedWriter) -> io::Result<()> {
    match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(_) => {}
        // The child may exit without reading all of its input.
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Ok(()),
        Err(e) => return Err(e),
    }
    // Dropping the writer closes the child's stdin.
    writer.shutdown().await.or_else(|e| match e.kind() {
        io::ErrorKind::BrokenPipe => Ok(()),
        _ => Err(e),
    })
}

/// Join output copies in order, keeping the first error. A handle is only
/// removed once it has completed, so the future can be dropped and resumed.
async fn join_copies(
    copies: &mut Vec<JoinHandle<io::Result<()>>>,
    first_err: &mut Option<io::Error>,
) {
    while let Some(handle) = copies.first_mut() {
        let joined = handle.await;
        copies.remove(0);
        match joined {
            Ok(Err(e)) if first_err.is_none() => *first_err = Some(e),
            Err(join) if !join.is_cancelled() && first_err.is_none() => {
                *first_err = Some(io::Error::other(join));
            }
            _ => {}
        }
    }
}

async fn copy_output(mut reader: BoxedReader, mut writer: BoxedWriter) -> io::Result<()> {
    tokio::io::copy(&mut reader, &mut writer).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::process::SpawnRequest;

    fn command_for(program: &str, args: &[&str], timeout: Duration) -> Command {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let work_dir = std::env::temp_dir();
        let env: Vec<(String, String)> = std::env::vars().collect();
        let launcher = SpawnRequest::new(program, program, work_dir.clone())
            .args(args.iter().cloned())
            .env(env);
        Command::new(
            program,
            &args,
            work_dir,
            CancelContext::new(timeout),
            Box::new(launcher),
        )
    }

    #[tokio::test]
    async fn test_shared_buffer_collects_writes() {
        let buffer = SharedBuffer::new();
        let mut writer = buffer.clone();
        writer.write_all(b"hello ").await.unwrap();
        writer.write_all(b"world").await.unwrap();
        assert_eq!(buffer.to_string_lossy(), "hello world");
        assert_eq!(buffer.len(), 11);
    }

    #[tokio::test]
    async fn test_shared_buffer_limit_keeps_counting() {
        let buffer = SharedBuffer::with_limit(4);
        let mut writer = buffer.clone();
        writer.write_all(b"abc").await.unwrap();
        writer.write_all(b"defgh").await.unwrap();
        assert_eq!(buffer.to_string_lossy(), "abcd");
        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.total_len(), 8);
    }

    #[tokio::test]
    async fn test_wait_before_start_is_not_started() {
        let mut cmd = command_for("true", &[], Duration::ZERO);
        assert!(matches!(cmd.wait().await, Err(SandboxError::NotStarted)));
        assert!(matches!(cmd.kill(), Err(SandboxError::NotStarted)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captures_stdout() {
        let mut cmd = command_for("echo", &["hello"], Duration::ZERO);
        let out = SharedBuffer::new();
        cmd.set_stdout(out.clone());
        cmd.run().await.unwrap();
        assert_eq!(out.to_string_lossy().trim(), "hello");
        assert_eq!(cmd.exit_code(), Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_twice_fails() {
        let mut cmd = command_for("true", &[], Duration::ZERO);
        cmd.start().unwrap();
        assert!(matches!(cmd.start(), Err(SandboxError::AlreadyStarted)));
        cmd.wait().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_and_kill_after_exit_report_not_running() {
        let mut cmd = command_for("true", &[], Duration::ZERO);
        cmd.run().await.unwrap();
        assert!(matches!(cmd.wait().await, Err(SandboxError::NotRunning)));
        assert!(matches!(cmd.kill(), Err(SandboxError::NotRunning)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_typed() {
        let mut cmd = command_for("sh", &["-c", "exit 3"], Duration::ZERO);
        let err = cmd.run().await.unwrap_err();
        assert_eq!(err.exit_code(), Some(3));
        assert_eq!(cmd.exit_code(), Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdin_stream_is_piped() {
        let mut cmd = command_for("cat", &[], Duration::ZERO);
        let out = SharedBuffer::new();
        cmd.set_stdin(&b"piped input"[..]);
        cmd.set_stdout(out.clone());
        cmd.run().await.unwrap();
        assert_eq!(out.to_string_lossy(), "piped input");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_process() {
        let mut cmd = command_for("sleep", &["5"], Duration::from_millis(300));
        let started = std::time::Instant::now();
        let err = cmd.run().await.unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(_)), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(cmd.id().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_token_reports_cancelled() {
        let mut cmd = command_for("sleep", &["5"], Duration::ZERO);
        let token = cmd.cancel_token();
        cmd.start().unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });
        let err = cmd.wait().await.unwrap_err();
        assert!(matches!(err, SandboxError::Cancelled), "got {err:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_then_wait_reaps() {
        let mut cmd = command_for("sleep", &["5"], Duration::ZERO);
        cmd.start().unwrap();
        assert!(cmd.id().is_some());
        cmd.kill().unwrap();
        let err = cmd.wait().await.unwrap_err();
        assert_eq!(err.exit_code(), Some(-1));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_bounds_output_held_by_background_child() {
        let mut cmd = command_for("sh", &["-c", "sleep 6 & echo hi"], Duration::from_secs(1));
        let out = SharedBuffer::new();
        cmd.set_stdout(out.clone());
        let started = std::time::Instant::now();
        let err = cmd.run().await.unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(_)), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(out.to_string_lossy().trim(), "hi");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_process_that_is_never_waited() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let script = format!("sleep 1; touch '{}'", marker.display());
        let mut cmd = command_for("sh", &["-c", &script], Duration::from_millis(300));
        cmd.start().unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!marker.exists());
        drop(cmd);
    }
}
