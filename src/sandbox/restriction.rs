//! Capability attenuation for the sandbox account's logon credential.
//!
//! A reduced credential is derived from the base one by marking a group set
//! deny-only, deleting a capability (privilege) set outright and intersecting
//! the remainder with a restricting set. The result is pinned to a fixed
//! integrity level instead of inheriting the caller's.

use super::acl::sids;

/// Privileges deleted from the derived credential.
pub const REMOVED_PRIVILEGES: &[&str] = &[
    "SeBackupPrivilege",
    "SeRestorePrivilege",
    "SeDebugPrivilege",
    "SeShutdownPrivilege",
    "SeSecurityPrivilege",
    "SeAssignPrimaryTokenPrivilege",
    "SeImpersonatePrivilege",
];

/// Groups kept for deny checks only.
pub const DENY_ONLY_GROUPS: &[&str] = &[sids::ADMINISTRATORS, sids::POWER_USERS];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRestriction {
    pub deny_only_groups: Vec<String>,
    pub removed_privileges: Vec<String>,
    /// Effective access is the intersection of the base grants and these.
    pub restricting_sids: Vec<String>,
    pub integrity_sid: String,
}

impl CredentialRestriction {
    /// The restriction applied to every sandboxed execution for `user_sid`,
    /// the invoking user.
    pub fn for_user(user_sid: &str) -> Self {
        Self {
            deny_only_groups: DENY_ONLY_GROUPS.iter().map(|s| s.to_string()).collect(),
            removed_privileges: REMOVED_PRIVILEGES.iter().map(|s| s.to_string()).collect(),
            restricting_sids: vec![
                sids::WRITE_RESTRICTED.to_string(),
                sids::NETWORK_SERVICE.to_string(),
                sids::BUILTIN_USERS.to_string(),
                sids::EVERYONE.to_string(),
                user_sid.to_string(),
            ],
            integrity_sid: sids::MEDIUM_INTEGRITY.to_string(),
        }
    }

    /// Whether a privilege survives derivation.
    pub fn keeps_privilege(&self, name: &str) -> bool {
        !self
            .removed_privileges
            .iter()
            .any(|p| p.eq_ignore_ascii_case(name))
    }

    /// Whether an access granted to `sid` by the base credential is still
    /// effective after restriction.
    pub fn allows_group(&self, sid: &str) -> bool {
        !self.deny_only_groups.iter().any(|g| g == sid)
            && self.restricting_sids.iter().any(|r| r == sid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USER: &str = "S-1-5-21-1-2-3-1000";

    #[test]
    fn test_admin_groups_are_deny_only() {
        let r = CredentialRestriction::for_user(USER);
        assert!(!r.allows_group(sids::ADMINISTRATORS));
        assert!(!r.allows_group(sids::POWER_USERS));
    }

    #[test]
    fn test_restricting_set_contains_user_and_well_known() {
        let r = CredentialRestriction::for_user(USER);
        for sid in [
            sids::WRITE_RESTRICTED,
            sids::NETWORK_SERVICE,
            sids::BUILTIN_USERS,
            sids::EVERYONE,
            USER,
        ] {
            assert!(r.allows_group(sid), "{sid}");
        }
        assert!(!r.allows_group("S-1-5-21-9-9-9-500"));
    }

    #[test]
    fn test_dangerous_privileges_removed() {
        let r = CredentialRestriction::for_user(USER);
        assert!(!r.keeps_privilege("SeDebugPrivilege"));
        assert!(!r.keeps_privilege("seimpersonateprivilege"));
        assert!(r.keeps_privilege("SeChangeNotifyPrivilege"));
        assert_eq!(r.removed_privileges.len(), 7);
    }

    #[test]
    fn test_integrity_is_medium() {
        let r = CredentialRestriction::for_user(USER);
        assert_eq!(r.integrity_sid, "S-1-16-8192");
    }
}
