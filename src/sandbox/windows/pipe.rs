//! ACL-protected named pipes and inheritable handle duplicates for child stdio.

use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle};
use std::time::{Duration, Instant};

use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};
use tracing::debug;
use windows::Win32::Foundation::{
    DUPLICATE_SAME_ACCESS, DuplicateHandle, ERROR_PIPE_BUSY, HANDLE, HLOCAL, LocalFree,
};
use windows::Win32::Security::Authorization::{
    ConvertStringSecurityDescriptorToSecurityDescriptorW, SDDL_REVISION_1,
};
use windows::Win32::Security::{PSECURITY_DESCRIPTOR, SECURITY_ATTRIBUTES};
use windows::Win32::System::Threading::GetCurrentProcess;
use windows::core::{BOOL, PCWSTR};

use super::sid::{setup_err, wide};
use crate::sandbox::error::Result;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const CONNECT_RETRY: Duration = Duration::from_millis(20);
const BUFFER_SIZE: u32 = 64 * 1024;

/// One stdio channel: the async server end stays with us, the inheritable
/// client end is handed to the child.
pub struct StdioPipe {
    pub server: NamedPipeServer,
    pub child_end: OwnedHandle,
}

/// Create a duplex pipe whose DACL is `sddl` and connect its client end.
pub fn create_stdio_pipe(sddl: &str) -> Result<StdioPipe> {
    let name = format!(r"\\.\pipe\agent-sandbox-{}", uuid::Uuid::new_v4());
    let descriptor = SecurityDescriptor::from_sddl(sddl)?;
    let mut attrs = SECURITY_ATTRIBUTES {
        nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: descriptor.0.0,
        bInheritHandle: BOOL::from(false),
    };

    let server = unsafe {
        ServerOptions::new()
            .first_pipe_instance(true)
            .reject_remote_clients(true)
            .max_instances(1)
            .in_buffer_size(BUFFER_SIZE)
            .out_buffer_size(BUFFER_SIZE)
            .create_with_security_attributes_raw(
                &name,
                &mut attrs as *mut SECURITY_ATTRIBUTES as *mut c_void,
            )
    }
    .map_err(|e| setup_err("create stdio pipe", e))?;

    let client = connect_client(&name).map_err(|e| setup_err("connect stdio pipe", e))?;
    let child_end = duplicate_inheritable(client.as_raw_handle())?;
    debug!(pipe = %name, "stdio pipe connected");

    Ok(StdioPipe { server, child_end })
}

/// Open the client end, retrying while the instance is busy.
fn connect_client(name: &str) -> io::Result<File> {
    let started = Instant::now();
    loop {
        match OpenOptions::new().read(true).write(true).open(name) {
            Ok(file) => return Ok(file),
            Err(e)
                if e.raw_os_error() == Some(ERROR_PIPE_BUSY.0 as i32)
                    && started.elapsed() < CONNECT_TIMEOUT =>
            {
                std::thread::sleep(CONNECT_RETRY);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Duplicate `handle` within this process as an inheritable handle.
pub fn duplicate_inheritable(handle: RawHandle) -> Result<OwnedHandle> {
    let mut dup = HANDLE::default();
    unsafe {
        let process = GetCurrentProcess();
        DuplicateHandle(
            process,
            HANDLE(handle),
            process,
            &mut dup,
            0,
            true,
            DUPLICATE_SAME_ACCESS,
        )
    }
    .map_err(|e| setup_err("duplicate stdio handle", e))?;
    Ok(unsafe { OwnedHandle::from_raw_handle(dup.0) })
}

struct SecurityDescriptor(PSECURITY_DESCRIPTOR);

impl SecurityDescriptor {
    fn from_sddl(sddl: &str) -> Result<Self> {
        let wide_sddl = wide(sddl);
        let mut sd = PSECURITY_DESCRIPTOR::default();
        unsafe {
            ConvertStringSecurityDescriptorToSecurityDescriptorW(
                PCWSTR(wide_sddl.as_ptr()),
                SDDL_REVISION_1,
                &mut sd,
                None,
            )
        }
        .map_err(|e| setup_err("build pipe security descriptor", e))?;
        Ok(Self(sd))
    }
}

impl Drop for SecurityDescriptor {
    fn drop(&mut self) {
        unsafe {
            let _ = LocalFree(Some(HLOCAL(self.0.0)));
        }
    }
}
