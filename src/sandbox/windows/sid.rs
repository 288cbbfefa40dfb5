//! SID conversions and UTF-16 helpers.

use std::ffi::OsStr;
use std::os::windows::ffi::OsStrExt;

use windows::Win32::Foundation::{CloseHandle, HANDLE, HLOCAL, LocalFree};
use windows::Win32::Security::Authorization::{ConvertSidToStringSidW, ConvertStringSidToSidW};
use windows::Win32::Security::{
    GetLengthSid, GetTokenInformation, LookupAccountNameW, PSID, SID_NAME_USE, TOKEN_QUERY,
    TOKEN_USER, TokenUser,
};
use windows::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};
use windows::core::{PCWSTR, PWSTR};

use crate::sandbox::error::{Result, SandboxError};

pub(super) const BACKEND: &str = "windows-restricted-token";

/// NUL-terminated UTF-16.
pub fn wide(s: impl AsRef<OsStr>) -> Vec<u16> {
    s.as_ref().encode_wide().chain(std::iter::once(0)).collect()
}

pub(super) fn setup_err(what: &str, err: impl std::fmt::Display) -> SandboxError {
    SandboxError::setup(BACKEND, format!("{what}: {err}"))
}

/// A SID allocated by the system with `LocalAlloc`, freed on drop.
pub struct LocalSid(PSID);

impl LocalSid {
    pub fn from_string(sid: &str) -> Result<Self> {
        let wide_sid = wide(sid);
        let mut psid = PSID::default();
        unsafe { ConvertStringSidToSidW(PCWSTR(wide_sid.as_ptr()), &mut psid) }
            .map_err(|e| setup_err(&format!("parse SID {sid}"), e))?;
        Ok(Self(psid))
    }

    pub fn as_psid(&self) -> PSID {
        self.0
    }

    pub fn len(&self) -> u32 {
        unsafe { GetLengthSid(self.0) }
    }
}

impl Drop for LocalSid {
    fn drop(&mut self) {
        if !self.0.is_invalid() {
            unsafe {
                let _ = LocalFree(Some(HLOCAL(self.0.0)));
            }
        }
    }
}

/// Render a SID in `S-1-...` form.
pub fn sid_to_string(sid: PSID) -> Result<String> {
    let mut out = PWSTR::null();
    unsafe { ConvertSidToStringSidW(sid, &mut out) }.map_err(|e| setup_err("format SID", e))?;
    let text = unsafe { out.to_string() };
    unsafe {
        let _ = LocalFree(Some(HLOCAL(out.0 as *mut _)));
    }
    text.map_err(|e| setup_err("format SID", e))
}

/// SID of a local account.
pub fn lookup_account_sid(name: &str) -> Result<String> {
    let wide_name = wide(name);
    let mut sid_len = 0u32;
    let mut domain_len = 0u32;
    let mut use_ = SID_NAME_USE::default();

    // First call only sizes the buffers.
    let _ = unsafe {
        LookupAccountNameW(
            PCWSTR::null(),
            PCWSTR(wide_name.as_ptr()),
            None,
            &mut sid_len,
            None,
            &mut domain_len,
            &mut use_,
        )
    };
    if sid_len == 0 {
        return Err(setup_err(
            &format!("look up account {name}"),
            "account not found",
        ));
    }

    let mut sid_buf = vec![0u8; sid_len as usize];
    let mut domain_buf = vec![0u16; domain_len as usize];
    let psid = PSID(sid_buf.as_mut_ptr().cast());
    unsafe {
        LookupAccountNameW(
            PCWSTR::null(),
            PCWSTR(wide_name.as_ptr()),
            Some(psid),
            &mut sid_len,
            Some(PWSTR(domain_buf.as_mut_ptr())),
            &mut domain_len,
            &mut use_,
        )
    }
    .map_err(|e| setup_err(&format!("look up account {name}"), e))?;

    sid_to_string(psid)
}

/// SID of the user owning the current process.
pub fn current_user_sid() -> Result<String> {
    let mut token = HANDLE::default();
    unsafe { OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) }
        .map_err(|e| setup_err("open process token", e))?;

    let result = (|| {
        let mut len = 0u32;
        let _ = unsafe { GetTokenInformation(token, TokenUser, None, 0, &mut len) };
        let mut buf = vec![0u8; len as usize];
        unsafe {
            GetTokenInformation(
                token,
                TokenUser,
                Some(buf.as_mut_ptr().cast()),
                len,
                &mut len,
            )
        }
        .map_err(|e| setup_err("query token user", e))?;
        let user = unsafe { &*(buf.as_ptr() as *const TOKEN_USER) };
        sid_to_string(user.User.Sid)
    })();

    unsafe {
        let _ = CloseHandle(token);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::acl::sids;

    #[test]
    fn test_wide_is_nul_terminated() {
        assert_eq!(wide("ab"), vec![b'a' as u16, b'b' as u16, 0]);
    }

    #[test]
    fn test_string_sid_round_trip() {
        let sid = LocalSid::from_string(sids::ADMINISTRATORS).unwrap();
        assert_eq!(sid_to_string(sid.as_psid()).unwrap(), sids::ADMINISTRATORS);
        assert!(sid.len() > 0);
    }

    #[test]
    fn test_current_user_sid() {
        assert!(current_user_sid().unwrap().starts_with("S-1-5-"));
    }
}
