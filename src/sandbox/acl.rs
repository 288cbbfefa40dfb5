//! Platform-neutral model of discretionary access lists.
//!
//! The Windows backend opens an access window around each execution: a
//! grant list is merged onto every writable directory before launch and its
//! deny mirror replaces it on teardown, so the persistent sandbox account
//! keeps no residual access between runs. The same model renders to SDDL for
//! securing the credential registry key and the stdio pipes.

use std::fmt::Write as _;

/// Well-known security identifiers in string form.
pub mod sids {
    pub const EVERYONE: &str = "S-1-1-0";
    pub const NETWORK_SERVICE: &str = "S-1-5-20";
    pub const WRITE_RESTRICTED: &str = "S-1-5-33";
    pub const LOCAL_SYSTEM: &str = "S-1-5-18";
    pub const ADMINISTRATORS: &str = "S-1-5-32-544";
    pub const BUILTIN_USERS: &str = "S-1-5-32-545";
    pub const POWER_USERS: &str = "S-1-5-32-547";
    pub const MEDIUM_INTEGRITY: &str = "S-1-16-8192";
}

/// `FILE_ALL_ACCESS`
pub const FILE_ALL_ACCESS: u32 = 0x001F_01FF;
/// `KEY_ALL_ACCESS`
pub const KEY_ALL_ACCESS: u32 = 0x000F_003F;
/// `GENERIC_ALL`
pub const GENERIC_ALL: u32 = 0x1000_0000;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Trustee {
    /// String SID, e.g. `S-1-5-32-544`.
    pub sid: String,
}

impl Trustee {
    pub fn new(sid: impl Into<String>) -> Self {
        Self { sid: sid.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Grant,
    Deny,
    /// Drop every existing entry for the trustee.
    Revoke,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inheritance {
    None,
    /// Applies to the object, sub-folders and files.
    ContainersAndObjects,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessEntry {
    pub trustee: Trustee,
    pub mask: u32,
    pub mode: AccessMode,
    pub inheritance: Inheritance,
}

/// Ordered list of access entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessControlList {
    pub entries: Vec<AccessEntry>,
}

impl AccessControlList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, trustee: &str, mask: u32, mode: AccessMode, inheritance: Inheritance) -> Self {
        self.entries.push(AccessEntry {
            trustee: Trustee::new(trustee),
            mask,
            mode,
            inheritance,
        });
        self
    }

    /// Full control, inherited, for the sandbox account, the Administrators
    /// group and the invoking user.
    pub fn directory_grant(account_sid: &str, user_sid: &str) -> Self {
        [account_sid, sids::ADMINISTRATORS, user_sid]
            .into_iter()
            .fold(Self::new(), |acl, sid| {
                acl.push(
                    sid,
                    FILE_ALL_ACCESS,
                    AccessMode::Grant,
                    Inheritance::ContainersAndObjects,
                )
            })
    }

    /// Revoke then deny, inherited, for the sandbox account only.
    pub fn directory_deny(account_sid: &str) -> Self {
        Self::new()
            .push(
                account_sid,
                0,
                AccessMode::Revoke,
                Inheritance::ContainersAndObjects,
            )
            .push(
                account_sid,
                FILE_ALL_ACCESS,
                AccessMode::Deny,
                Inheritance::ContainersAndObjects,
            )
    }

    /// The deny list that undoes this grant for `account_sid`.
    pub fn lockout_mirror(&self, account_sid: &str) -> Self {
        if self.grants(account_sid) {
            Self::directory_deny(account_sid)
        } else {
            Self::new()
        }
    }

    /// Whether some entry grants `sid` access.
    pub fn grants(&self, sid: &str) -> bool {
        self.effective(sid) == Some(AccessMode::Grant)
    }

    /// Whether some entry denies `sid` access.
    pub fn denies(&self, sid: &str) -> bool {
        self.effective(sid) == Some(AccessMode::Deny)
    }

    /// Deny entries win over grants, the way the OS orders them.
    fn effective(&self, sid: &str) -> Option<AccessMode> {
        let mut seen = None;
        for entry in self.entries.iter().filter(|e| e.trustee.sid == sid) {
            match entry.mode {
                AccessMode::Deny => return Some(AccessMode::Deny),
                AccessMode::Grant => seen = Some(AccessMode::Grant),
                AccessMode::Revoke => seen = None,
            }
        }
        seen
    }

    /// Render as a protected SDDL DACL. Revoke entries have no SDDL form and are skipped.
    pub fn to_sddl(&self) -> String {
        let mut sddl = String::from("D:P");
        let ordered = self
            .entries
            .iter()
            .filter(|e| e.mode == AccessMode::Deny)
            .chain(self.entries.iter().filter(|e| e.mode == AccessMode::Grant));
        for entry in ordered {
            let ace_type = if entry.mode == AccessMode::Deny { "D" } else { "A" };
            let flags = match entry.inheritance {
                Inheritance::None => "",
                Inheritance::ContainersAndObjects => "OICI",
            };
            let _ = write!(
                sddl,
                "({ace_type};{flags};0x{:x};;;{})",
                entry.mask, entry.trustee.sid
            );
        }
        sddl
    }
}

/// Access list for the credential's registry key.
pub fn secret_key_acl(allowed_sids: &[String]) -> AccessControlList {
    allowed_sids.iter().fold(AccessControlList::new(), |acl, sid| {
        acl.push(sid, KEY_ALL_ACCESS, AccessMode::Grant, Inheritance::ContainersAndObjects)
    })
}

/// Access list for the stdio pipes of one execution.
pub fn pipe_acl(account_sid: &str, user_sid: &str) -> AccessControlList {
    [sids::LOCAL_SYSTEM, sids::ADMINISTRATORS, user_sid, account_sid]
        .into_iter()
        .fold(AccessControlList::new(), |acl, sid| {
            acl.push(sid, GENERIC_ALL, AccessMode::Grant, Inheritance::None)
        })
}
