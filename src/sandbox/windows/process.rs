//! Process creation under the restricted token.
//!
//! The child inherits exactly the three stdio handles of this invocation:
//! they are duplicated as inheritable and listed in
//! `PROC_THREAD_ATTRIBUTE_HANDLE_LIST`, so pipes belonging to concurrent
//! commands never leak into it.

use std::ffi::c_void;
use std::fs::OpenOptions;
use std::io;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::windows::named_pipe::NamedPipeServer;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use windows::Win32::Foundation::{HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows::Win32::System::Console::{
    GetStdHandle, STD_ERROR_HANDLE, STD_HANDLE, STD_INPUT_HANDLE, STD_OUTPUT_HANDLE,
};
use windows::Win32::System::Threading::{
    CREATE_NO_WINDOW, CREATE_UNICODE_ENVIRONMENT, CreateProcessAsUserW,
    DeleteProcThreadAttributeList, EXTENDED_STARTUPINFO_PRESENT, GetExitCodeProcess,
    InitializeProcThreadAttributeList, LPPROC_THREAD_ATTRIBUTE_LIST,
    PROC_THREAD_ATTRIBUTE_HANDLE_LIST, PROCESS_INFORMATION, STARTF_USESTDHANDLES,
    STARTUPINFOEXW, STARTUPINFOW, TerminateProcess, UpdateProcThreadAttribute,
    WaitForSingleObject,
};
use windows::core::{PCWSTR, PWSTR};

use super::acl::AccessWindow;
use super::pipe::{create_stdio_pipe, duplicate_inheritable};
use super::sid::{setup_err, wide};
use super::token::derive_token;
use crate::sandbox::acl::pipe_acl;
use crate::sandbox::backend::ExecEnv;
use crate::sandbox::context::CancelContext;
use crate::sandbox::credential::AccountCredential;
use crate::sandbox::error::{Result, SandboxError};
use crate::sandbox::process::{
    BoxedReader, BoxedWriter, Launcher, ProcessHandle, Spawned, StdioPlan, StdioTarget,
};
use crate::sandbox::restriction::CredentialRestriction;

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const TERMINATED_EXIT_CODE: u32 = 1;

/// A prepared launch of `name args...` as the sandbox account.
pub struct RestrictedLaunch {
    pub name: String,
    pub args: Vec<String>,
    pub env: ExecEnv,
    pub account: AccountCredential,
    pub user_sid: String,
}

impl Launcher for RestrictedLaunch {
    fn name(&self) -> &str {
        &self.name
    }

    fn launch(self: Box<Self>, stdio: StdioPlan, ctx: &CancelContext) -> Result<Spawned> {
        // Dropped on any error below, which locks the account out again.
        let window = AccessWindow::open(
            &self.account.sid,
            &self.user_sid,
            &self.env.work_dir,
            &self.env.writable_dirs,
            &self.env.state_dir(),
        )?;
        let token = derive_token(
            &self.account,
            &CredentialRestriction::for_user(&self.user_sid),
        )?;

        let sddl = pipe_acl(&self.account.sid, &self.user_sid).to_sddl();
        let (stdin, stdin_pipe) = child_stdio(stdio.stdin, STD_INPUT_HANDLE, &sddl)?;
        let (stdout, stdout_pipe) = child_stdio(stdio.stdout, STD_OUTPUT_HANDLE, &sddl)?;
        let (stderr, stderr_pipe) = child_stdio(stdio.stderr, STD_ERROR_HANDLE, &sddl)?;

        let mut command_line = wide(command_line(&self.name, &self.args, &self.env));
        let environment = environment_block(&self.env.env);
        let cwd = wide(self.env.work_dir.as_os_str());

        let inherited = [
            HANDLE(stdin.as_raw_handle()),
            HANDLE(stdout.as_raw_handle()),
            HANDLE(stderr.as_raw_handle()),
        ];
        let mut attributes = AttributeList::with_handle_list(&inherited)?;

        let startup = STARTUPINFOEXW {
            StartupInfo: STARTUPINFOW {
                cb: std::mem::size_of::<STARTUPINFOEXW>() as u32,
                dwFlags: STARTF_USESTDHANDLES,
                hStdInput: inherited[0],
                hStdOutput: inherited[1],
                hStdError: inherited[2],
                ..Default::default()
            },
            lpAttributeList: attributes.as_raw(),
        };

        let mut info = PROCESS_INFORMATION::default();
        unsafe {
            CreateProcessAsUserW(
                Some(HANDLE(token.as_raw_handle())),
                PCWSTR::null(),
                Some(PWSTR(command_line.as_mut_ptr())),
                None,
                None,
                true,
                EXTENDED_STARTUPINFO_PRESENT | CREATE_UNICODE_ENVIRONMENT | CREATE_NO_WINDOW,
                Some(environment.as_ptr() as *const c_void),
                PCWSTR(cwd.as_ptr()),
                &startup.StartupInfo,
                &mut info,
            )
        }
        .map_err(|source| SandboxError::Spawn {
            name: self.name.clone(),
            source: source.into(),
        })?;
        drop(attributes);

        let process = unsafe { OwnedHandle::from_raw_handle(info.hProcess.0) };
        let thread = unsafe { OwnedHandle::from_raw_handle(info.hThread.0) };
        debug!(pid = info.dwProcessId, command = %self.name, "spawned restricted process");

        // Our copies of the child's ends must close so the pipes see EOF.
        drop((stdin, stdout, stderr));

        let watcher = spawn_watcher(&process, ctx)?;

        Ok(Spawned {
            process: Box::new(RestrictedProcess {
                process,
                _thread: thread,
                pid: info.dwProcessId,
                exit: None,
                killed: false,
                watcher,
                window: Some(window),
            }),
            stdin: stdin_pipe.map(|p| Box::new(p) as BoxedWriter),
            stdout: stdout_pipe.map(|p| Box::new(p) as BoxedReader),
            stderr: stderr_pipe.map(|p| Box::new(p) as BoxedReader),
        })
    }
}

/// The handle given to the child for one stream, plus our pipe end if any.
fn child_stdio(
    target: StdioTarget,
    std_handle: STD_HANDLE,
    sddl: &str,
) -> Result<(OwnedHandle, Option<NamedPipeServer>)> {
    match target {
        StdioTarget::Pipe => {
            let pipe = create_stdio_pipe(sddl)?;
            Ok((pipe.child_end, Some(pipe.server)))
        }
        StdioTarget::File(file) => Ok((duplicate_inheritable(file.as_raw_handle())?, None)),
        StdioTarget::Inherit => match unsafe { GetStdHandle(std_handle) } {
            Ok(handle) if !handle.is_invalid() && !handle.0.is_null() => {
                Ok((duplicate_inheritable(handle.0)?, None))
            }
            _ => null_device(),
        },
        StdioTarget::Null => null_device(),
    }
}

fn null_device() -> Result<(OwnedHandle, Option<NamedPipeServer>)> {
    let nul = OpenOptions::new().read(true).write(true).open("NUL")?;
    Ok((duplicate_inheritable(nul.as_raw_handle())?, None))
}

/// Owned `PROC_THREAD_ATTRIBUTE_LIST` carrying a handle allow-list.
struct AttributeList<'a> {
    buf: Vec<u8>,
    _handles: &'a [HANDLE],
}

impl<'a> AttributeList<'a> {
    fn with_handle_list(handles: &'a [HANDLE]) -> Result<Self> {
        let mut size = 0usize;
        // Sizing call; fails with ERROR_INSUFFICIENT_BUFFER by contract.
        let _ = unsafe { InitializeProcThreadAttributeList(None, 1, Some(0), &mut size) };
        let mut list = Self {
            buf: vec![0u8; size],
            _handles: handles,
        };
        unsafe { InitializeProcThreadAttributeList(Some(list.as_raw()), 1, Some(0), &mut size) }
            .map_err(|e| setup_err("initialize attribute list", e))?;
        unsafe {
            UpdateProcThreadAttribute(
                list.as_raw(),
                0,
                PROC_THREAD_ATTRIBUTE_HANDLE_LIST as usize,
                Some(handles.as_ptr() as *const c_void),
                std::mem::size_of_val(handles),
                None,
                None,
            )
        }
        .map_err(|e| setup_err("restrict inherited handles", e))?;
        Ok(list)
    }

    fn as_raw(&mut self) -> LPPROC_THREAD_ATTRIBUTE_LIST {
        LPPROC_THREAD_ATTRIBUTE_LIST(self.buf.as_mut_ptr().cast())
    }
}

impl Drop for AttributeList<'_> {
    fn drop(&mut self) {
        unsafe { DeleteProcThreadAttributeList(self.as_raw()) };
    }
}

/// Terminate the process when the context ends, independently of `wait`.
fn spawn_watcher(process: &OwnedHandle, ctx: &CancelContext) -> Result<JoinHandle<()>> {
    let handle = process.try_clone()?;
    let ctx = ctx.clone();
    Ok(tokio::spawn(async move {
        ctx.done().await;
        let _ = unsafe { TerminateProcess(HANDLE(handle.as_raw_handle()), TERMINATED_EXIT_CODE) };
    }))
}

struct RestrictedProcess {
    process: OwnedHandle,
    _thread: OwnedHandle,
    pid: u32,
    exit: Option<i32>,
    killed: bool,
    watcher: JoinHandle<()>,
    window: Option<AccessWindow>,
}

impl RestrictedProcess {
    fn raw(&self) -> HANDLE {
        HANDLE(self.process.as_raw_handle())
    }

    fn terminate(&self) -> io::Result<()> {
        unsafe { TerminateProcess(self.raw(), TERMINATED_EXIT_CODE) }.map_err(io::Error::from)
    }
}

#[async_trait]
impl ProcessHandle for RestrictedProcess {
    fn id(&self) -> Option<u32> {
        self.exit.is_none().then_some(self.pid)
    }

    async fn wait(&mut self) -> io::Result<i32> {
        if let Some(code) = self.exit {
            return Ok(code);
        }
        loop {
            let event = unsafe { WaitForSingleObject(self.raw(), 0) };
            if event == WAIT_OBJECT_0 {
                break;
            }
            if event != WAIT_TIMEOUT {
                return Err(io::Error::last_os_error());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        let mut raw_code = 0u32;
        unsafe { GetExitCodeProcess(self.raw(), &mut raw_code) }.map_err(io::Error::from)?;
        let code = if self.killed { -1 } else { raw_code as i32 };
        self.exit = Some(code);
        self.watcher.abort();
        if let Some(mut window) = self.window.take() {
            window.close();
        }
        Ok(code)
    }

    fn start_kill(&mut self) -> io::Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        self.killed = true;
        self.terminate()
    }
}

impl Drop for RestrictedProcess {
    fn drop(&mut self) {
        self.watcher.abort();
        if self.exit.is_none() {
            if let Err(e) = self.terminate() {
                warn!(pid = self.pid, error = %e, "failed to terminate restricted process");
            }
        }
    }
}

/// Full command line. Names that do not resolve on PATH are run through
/// `cmd.exe /C` so shell builtins work.
fn command_line(name: &str, args: &[String], env: &ExecEnv) -> String {
    let path_var = env
        .env
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("PATH"))
        .map(|(_, v)| v.clone());
    let mut parts = match which::which_in(name, path_var, &env.work_dir) {
        Ok(program) => vec![quote_arg(&program.to_string_lossy())],
        Err(_) => vec![
            "cmd.exe".to_string(),
            "/D".to_string(),
            "/C".to_string(),
            quote_arg(name),
        ],
    };
    parts.extend(args.iter().map(|a| quote_arg(a)));
    parts.join(" ")
}

/// Quote one argument for `CommandLineToArgvW`.
pub fn quote_arg(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains([' ', '\t', '\n', '\u{b}', '"']) {
        return arg.to_string();
    }
    let mut out = String::from('"');
    let mut backslashes = 0usize;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                out.push_str(&"\\".repeat(backslashes * 2 + 1));
                out.push('"');
                backslashes = 0;
            }
            _ => {
                out.push_str(&"\\".repeat(backslashes));
                out.push(c);
                backslashes = 0;
            }
        }
    }
    out.push_str(&"\\".repeat(backslashes * 2));
    out.push('"');
    out
}

/// Sorted `KEY=VALUE\0...\0\0` block.
fn environment_block(env: &[(String, String)]) -> Vec<u16> {
    let mut vars: Vec<&(String, String)> = env.iter().collect();
    vars.sort_by_key(|(k, _)| k.to_uppercase());
    let mut block: Vec<u16> = Vec::new();
    for (k, v) in vars {
        block.extend(format!("{k}={v}").encode_utf16());
        block.push(0);
    }
    if block.is_empty() {
        block.push(0);
    }
    block.push(0);
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_arg() {
        assert_eq!(quote_arg("plain"), "plain");
        assert_eq!(quote_arg(""), "\"\"");
        assert_eq!(quote_arg("two words"), "\"two words\"");
        assert_eq!(quote_arg("say \"hi\""), "\"say \\\"hi\\\"\"");
        assert_eq!(quote_arg(r"C:\dir with space\"), "\"C:\\dir with space\\\\\"");
    }

    #[test]
    fn test_environment_block_is_sorted_and_terminated() {
        let block = environment_block(&[
            ("b".into(), "2".into()),
            ("A".into(), "1".into()),
        ]);
        let text = String::from_utf16_lossy(&block);
        assert_eq!(text, "A=1\0b=2\0\0");
    }

    #[test]
    fn test_empty_environment_block() {
        assert_eq!(environment_block(&[]), vec![0, 0]);
    }
}
