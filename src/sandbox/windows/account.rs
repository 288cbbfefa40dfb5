//! Local account database and logon rights.

use windows::Win32::NetworkManagement::NetManagement::{
    NetApiBufferFree, NetUserAdd, NetUserGetInfo, NetUserSetInfo, UF_DONT_EXPIRE_PASSWD,
    UF_PASSWD_CANT_CHANGE, UF_SCRIPT, USER_INFO_1, USER_INFO_1003, USER_PRIV_USER,
};
use windows::Win32::Security::Authentication::Identity::{
    LSA_HANDLE, LSA_OBJECT_ATTRIBUTES, LSA_UNICODE_STRING, LsaAddAccountRights, LsaClose,
    LsaNtStatusToWinError, LsaOpenPolicy,
};
use windows::core::{PCWSTR, PWSTR};
use tracing::debug;

use super::sid::{LocalSid, lookup_account_sid, setup_err, wide};
use crate::sandbox::credential::{AccountCreation, AccountDirectory};
use crate::sandbox::error::Result;

const NERR_SUCCESS: u32 = 0;
const NERR_USER_NOT_FOUND: u32 = 2221;
const NERR_USER_EXISTS: u32 = 2224;

const POLICY_CREATE_ACCOUNT: u32 = 0x0000_0010;
const POLICY_LOOKUP_NAMES: u32 = 0x0000_0800;

/// Rights added to the sandbox account: batch logon only.
const LOGON_RIGHTS: &[&str] = &[
    "SeBatchLogonRight",
    "SeDenyInteractiveLogonRight",
    "SeDenyRemoteInteractiveLogonRight",
];

/// The local SAM via the NetUser API.
pub struct NetAccounts;

impl AccountDirectory for NetAccounts {
    fn exists(&self, name: &str) -> Result<bool> {
        let wide_name = wide(name);
        let mut buf: *mut u8 = std::ptr::null_mut();
        let status =
            unsafe { NetUserGetInfo(PCWSTR::null(), PCWSTR(wide_name.as_ptr()), 0, &mut buf) };
        if !buf.is_null() {
            unsafe {
                NetApiBufferFree(Some(buf.cast()));
            }
        }
        match status {
            NERR_SUCCESS => Ok(true),
            NERR_USER_NOT_FOUND => Ok(false),
            code => Err(setup_err(
                &format!("query account {name}"),
                std::io::Error::from_raw_os_error(code as i32),
            )),
        }
    }

    fn create(&self, name: &str, password: &str, comment: &str) -> Result<AccountCreation> {
        let mut wide_name = wide(name);
        let mut wide_password = wide(password);
        let mut wide_comment = wide(comment);
        let info = USER_INFO_1 {
            usri1_name: PWSTR(wide_name.as_mut_ptr()),
            usri1_password: PWSTR(wide_password.as_mut_ptr()),
            usri1_password_age: 0,
            usri1_priv: USER_PRIV_USER,
            usri1_home_dir: PWSTR::null(),
            usri1_comment: PWSTR(wide_comment.as_mut_ptr()),
            usri1_flags: UF_SCRIPT | UF_DONT_EXPIRE_PASSWD | UF_PASSWD_CANT_CHANGE,
            usri1_script_path: PWSTR::null(),
        };

        let status = unsafe {
            NetUserAdd(
                PCWSTR::null(),
                1,
                &info as *const USER_INFO_1 as *const u8,
                None,
            )
        };
        wide_password.fill(0);

        match status {
            NERR_SUCCESS => Ok(AccountCreation::Created),
            NERR_USER_EXISTS => Ok(AccountCreation::AlreadyExists),
            code => Err(setup_err(
                &format!("create account {name}"),
                std::io::Error::from_raw_os_error(code as i32),
            )),
        }
    }

    fn set_password(&self, name: &str, password: &str) -> Result<()> {
        let wide_name = wide(name);
        let mut wide_password = wide(password);
        let info = USER_INFO_1003 {
            usri1003_password: PWSTR(wide_password.as_mut_ptr()),
        };
        let status = unsafe {
            NetUserSetInfo(
                PCWSTR::null(),
                PCWSTR(wide_name.as_ptr()),
                1003,
                &info as *const USER_INFO_1003 as *const u8,
                None,
            )
        };
        wide_password.fill(0);

        if status != NERR_SUCCESS {
            return Err(setup_err(
                &format!("reset password for {name}"),
                std::io::Error::from_raw_os_error(status as i32),
            ));
        }
        Ok(())
    }

    fn grant_batch_logon_only(&self, name: &str) -> Result<()> {
        let sid = LocalSid::from_string(&lookup_account_sid(name)?)?;

        let attrs = LSA_OBJECT_ATTRIBUTES {
            Length: std::mem::size_of::<LSA_OBJECT_ATTRIBUTES>() as u32,
            ..Default::default()
        };
        let mut policy = LSA_HANDLE::default();
        let status = unsafe {
            LsaOpenPolicy(
                None,
                &attrs,
                POLICY_CREATE_ACCOUNT | POLICY_LOOKUP_NAMES,
                &mut policy,
            )
        };
        if status.is_err() {
            let code = unsafe { LsaNtStatusToWinError(status) };
            return Err(setup_err(
                "open LSA policy",
                std::io::Error::from_raw_os_error(code as i32),
            ));
        }

        let mut names: Vec<Vec<u16>> = LOGON_RIGHTS.iter().map(|r| wide(r)).collect();
        let rights: Vec<LSA_UNICODE_STRING> = names
            .iter_mut()
            .map(|w| {
                let bytes = ((w.len() - 1) * 2) as u16;
                LSA_UNICODE_STRING {
                    Length: bytes,
                    MaximumLength: bytes + 2,
                    Buffer: PWSTR(w.as_mut_ptr()),
                }
            })
            .collect();

        let status = unsafe { LsaAddAccountRights(policy, sid.as_psid(), &rights) };
        unsafe {
            let _ = LsaClose(policy);
        }
        if status.is_err() {
            let code = unsafe { LsaNtStatusToWinError(status) };
            return Err(setup_err(
                &format!("grant logon rights to {name}"),
                std::io::Error::from_raw_os_error(code as i32),
            ));
        }

        debug!(account = name, rights = ?LOGON_RIGHTS, "granted logon rights");
        Ok(())
    }

    fn lookup_sid(&self, name: &str) -> Result<String> {
        lookup_account_sid(name)
    }
}
