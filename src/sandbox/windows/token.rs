//! Logon and restricted-token derivation for the sandbox account.

use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};

use windows::Win32::Foundation::{HANDLE, LUID};
use windows::Win32::Security::{
    CREATE_RESTRICTED_TOKEN_FLAGS, CreateRestrictedToken, LOGON32_LOGON_BATCH,
    LOGON32_PROVIDER_DEFAULT, LUID_AND_ATTRIBUTES, LogonUserW, LookupPrivilegeValueW,
    SID_AND_ATTRIBUTES, SetTokenInformation, TOKEN_MANDATORY_LABEL,
    TOKEN_PRIVILEGES_ATTRIBUTES, TokenIntegrityLevel,
};
use windows::core::PCWSTR;

use super::sid::{LocalSid, setup_err, wide};
use crate::sandbox::credential::AccountCredential;
use crate::sandbox::error::Result;
use crate::sandbox::restriction::CredentialRestriction;

const SE_GROUP_INTEGRITY: u32 = 0x0000_0020;

/// Log the account on for batch work and derive the restricted token.
pub fn derive_token(
    account: &AccountCredential,
    restriction: &CredentialRestriction,
) -> Result<OwnedHandle> {
    let base = logon_batch(account)?;
    restrict(&base, restriction)
}

fn logon_batch(account: &AccountCredential) -> Result<OwnedHandle> {
    let user = wide(&account.name);
    let domain = wide(".");
    let mut password = wide(&account.password);
    let mut token = HANDLE::default();
    let result = unsafe {
        LogonUserW(
            PCWSTR(user.as_ptr()),
            PCWSTR(domain.as_ptr()),
            PCWSTR(password.as_ptr()),
            LOGON32_LOGON_BATCH,
            LOGON32_PROVIDER_DEFAULT,
            &mut token,
        )
    };
    password.fill(0);
    result.map_err(|e| setup_err(&format!("log on {}", account.name), e))?;
    Ok(unsafe { OwnedHandle::from_raw_handle(token.0) })
}

fn restrict(base: &OwnedHandle, restriction: &CredentialRestriction) -> Result<OwnedHandle> {
    let deny_only = restriction
        .deny_only_groups
        .iter()
        .map(|s| LocalSid::from_string(s))
        .collect::<Result<Vec<_>>>()?;
    let restricting = restriction
        .restricting_sids
        .iter()
        .map(|s| LocalSid::from_string(s))
        .collect::<Result<Vec<_>>>()?;

    // Attributes are ignored for both lists: disabled SIDs become deny-only.
    let disable = sid_list(&deny_only);
    let restrict_to = sid_list(&restricting);

    let mut privileges = Vec::with_capacity(restriction.removed_privileges.len());
    for name in &restriction.removed_privileges {
        let wide_name = wide(name);
        let mut luid = LUID::default();
        unsafe { LookupPrivilegeValueW(PCWSTR::null(), PCWSTR(wide_name.as_ptr()), &mut luid) }
            .map_err(|e| setup_err(&format!("look up privilege {name}"), e))?;
        privileges.push(LUID_AND_ATTRIBUTES {
            Luid: luid,
            Attributes: TOKEN_PRIVILEGES_ATTRIBUTES(0),
        });
    }

    let mut token = HANDLE::default();
    unsafe {
        CreateRestrictedToken(
            HANDLE(base.as_raw_handle()),
            CREATE_RESTRICTED_TOKEN_FLAGS(0),
            Some(&disable),
            Some(&privileges),
            Some(&restrict_to),
            &mut token,
        )
    }
    .map_err(|e| setup_err("create restricted token", e))?;
    let token = unsafe { OwnedHandle::from_raw_handle(token.0) };

    set_integrity(&token, &restriction.integrity_sid)?;
    Ok(token)
}

fn sid_list(sids: &[LocalSid]) -> Vec<SID_AND_ATTRIBUTES> {
    sids.iter()
        .map(|sid| SID_AND_ATTRIBUTES {
            Sid: sid.as_psid(),
            Attributes: 0,
        })
        .collect()
}

fn set_integrity(token: &OwnedHandle, integrity_sid: &str) -> Result<()> {
    let sid = LocalSid::from_string(integrity_sid)?;
    let label = TOKEN_MANDATORY_LABEL {
        Label: SID_AND_ATTRIBUTES {
            Sid: sid.as_psid(),
            Attributes: SE_GROUP_INTEGRITY,
        },
    };
    let size = std::mem::size_of::<TOKEN_MANDATORY_LABEL>() as u32 + sid.len();
    unsafe {
        SetTokenInformation(
            HANDLE(token.as_raw_handle()),
            TokenIntegrityLevel,
            &label as *const TOKEN_MANDATORY_LABEL as *const _,
            size,
        )
    }
    .map_err(|e| setup_err("set token integrity", e))
}
