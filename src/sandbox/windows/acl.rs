//! Applying access lists to files, directories and registry keys.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use windows::Win32::Foundation::{HLOCAL, LocalFree, WIN32_ERROR};
use windows::Win32::Security::Authorization::{
    ConvertStringSecurityDescriptorToSecurityDescriptorW, DENY_ACCESS, EXPLICIT_ACCESS_W,
    GetNamedSecurityInfoW, NO_MULTIPLE_TRUSTEE, REVOKE_ACCESS, SDDL_REVISION_1, SE_FILE_OBJECT,
    SE_OBJECT_TYPE, SET_ACCESS, SetEntriesInAclW, SetNamedSecurityInfoW, TRUSTEE_IS_SID,
    TRUSTEE_IS_UNKNOWN, TRUSTEE_W,
};
use windows::Win32::Security::{
    ACL, DACL_SECURITY_INFORMATION, GetSecurityDescriptorDacl, NO_INHERITANCE,
    PROTECTED_DACL_SECURITY_INFORMATION, PSECURITY_DESCRIPTOR, SUB_CONTAINERS_AND_OBJECTS_INHERIT,
};
use windows::core::{BOOL, PCWSTR, PWSTR};

use super::sid::{LocalSid, setup_err, wide};
use crate::sandbox::acl::{AccessControlList, AccessMode, Inheritance};
use crate::sandbox::error::Result;

/// Merge `acl` into the DACL of a file or directory.
pub fn apply_acl(path: &Path, acl: &AccessControlList) -> Result<()> {
    let what = format!("apply ACL to {}", path.display());
    let sids = acl
        .entries
        .iter()
        .map(|e| LocalSid::from_string(&e.trustee.sid))
        .collect::<Result<Vec<_>>>()?;

    let explicit: Vec<EXPLICIT_ACCESS_W> = acl
        .entries
        .iter()
        .zip(&sids)
        .map(|(entry, sid)| EXPLICIT_ACCESS_W {
            grfAccessPermissions: entry.mask,
            grfAccessMode: match entry.mode {
                // SET_ACCESS also drops an earlier deny for the trustee.
                AccessMode::Grant => SET_ACCESS,
                AccessMode::Deny => DENY_ACCESS,
                AccessMode::Revoke => REVOKE_ACCESS,
            },
            grfInheritance: match entry.inheritance {
                Inheritance::None => NO_INHERITANCE,
                Inheritance::ContainersAndObjects => SUB_CONTAINERS_AND_OBJECTS_INHERIT,
            },
            Trustee: TRUSTEE_W {
                pMultipleTrustee: std::ptr::null_mut(),
                MultipleTrusteeOperation: NO_MULTIPLE_TRUSTEE,
                TrusteeForm: TRUSTEE_IS_SID,
                TrusteeType: TRUSTEE_IS_UNKNOWN,
                ptstrName: PWSTR(sid.as_psid().0.cast()),
            },
        })
        .collect();

    let wide_path = wide(path.as_os_str());
    let object = PCWSTR(wide_path.as_ptr());

    let mut old_acl: *mut ACL = std::ptr::null_mut();
    let mut sd = PSECURITY_DESCRIPTOR::default();
    let status = unsafe {
        GetNamedSecurityInfoW(
            object,
            SE_FILE_OBJECT,
            DACL_SECURITY_INFORMATION,
            None,
            None,
            Some(&mut old_acl),
            None,
            &mut sd,
        )
    };
    status.ok().map_err(|e| setup_err(&what, e))?;

    let mut new_acl: *mut ACL = std::ptr::null_mut();
    let status = unsafe { SetEntriesInAclW(Some(&explicit), Some(old_acl), &mut new_acl) };
    let result = status.ok().map_err(|e| setup_err(&what, e)).and_then(|()| {
        let status: WIN32_ERROR = unsafe {
            SetNamedSecurityInfoW(
                object,
                SE_FILE_OBJECT,
                DACL_SECURITY_INFORMATION,
                None,
                None,
                Some(new_acl),
                None,
            )
        };
        status.ok().map_err(|e| setup_err(&what, e))
    });

    unsafe {
        if !sd.is_invalid() {
            let _ = LocalFree(Some(HLOCAL(sd.0)));
        }
        if !new_acl.is_null() {
            let _ = LocalFree(Some(HLOCAL(new_acl.cast())));
        }
    }
    result
}

/// Replace the DACL of a named object with the one in `sddl`, blocking inheritance.
pub fn apply_sddl_dacl(object_name: &str, kind: SE_OBJECT_TYPE, sddl: &str) -> Result<()> {
    let what = format!("secure {object_name}");
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
    .map_err(|e| setup_err(&what, e))?;

    let result = (|| {
        let mut present = BOOL::default();
        let mut defaulted = BOOL::default();
        let mut dacl: *mut ACL = std::ptr::null_mut();
        unsafe { GetSecurityDescriptorDacl(sd, &mut present, &mut dacl, &mut defaulted) }
            .map_err(|e| setup_err(&what, e))?;

        let wide_name = wide(object_name);
        let status = unsafe {
            SetNamedSecurityInfoW(
                PCWSTR(wide_name.as_ptr()),
                kind,
                DACL_SECURITY_INFORMATION | PROTECTED_DACL_SECURITY_INFORMATION,
                None,
                None,
                Some(dacl),
                None,
            )
        };
        status.ok().map_err(|e| setup_err(&what, e))
    })();

    unsafe {
        let _ = LocalFree(Some(HLOCAL(sd.0)));
    }
    result
}

/// Grants the sandbox account access to a set of directories for the
/// lifetime of one execution and locks it out again when dropped.
///
/// Concurrent executions sharing a directory race on its DACL; callers
/// that care must serialize them.
pub struct AccessWindow {
    account_sid: String,
    granted: Vec<PathBuf>,
}

impl AccessWindow {
    pub fn open(
        account_sid: &str,
        user_sid: &str,
        work_dir: &Path,
        writable_dirs: &[PathBuf],
        state_dir: &Path,
    ) -> Result<Self> {
        let mut window = Self {
            account_sid: account_sid.to_string(),
            granted: Vec::new(),
        };
        let grant = AccessControlList::directory_grant(account_sid, user_sid);

        for dir in writable_dirs.iter().map(PathBuf::as_path).chain([work_dir]) {
            if window.granted.iter().any(|g| g == dir) {
                continue;
            }
            if let Err(e) = std::fs::create_dir_all(dir) {
                debug!(path = %dir.display(), error = %e, "cannot create writable dir");
                continue;
            }
            // Registered before applying so a partial grant is still revoked.
            window.granted.push(dir.to_path_buf());
            apply_acl(dir, &grant)?;
        }

        if state_dir.exists() {
            apply_acl(state_dir, &AccessControlList::directory_deny(account_sid))?;
        }

        debug!(dirs = window.granted.len(), "access window opened");
        Ok(window)
    }

    /// Replace every grant with a deny for the sandbox account.
    pub fn close(&mut self) {
        let deny = AccessControlList::directory_deny(&self.account_sid);
        for dir in self.granted.drain(..) {
            if let Err(e) = apply_acl(&dir, &deny) {
                warn!(path = %dir.display(), error = %e, "failed to lock out sandbox account");
            }
        }
    }
}

impl Drop for AccessWindow {
    fn drop(&mut self) {
        self.close();
    }
}
