//! Bootstrap of the dedicated sandbox account and its persisted secret.
//!
//! The OS-facing pieces (account database, secret storage, machine-scope
//! encryption) sit behind traits so the bootstrap state machine is the same
//! code everywhere and can be exercised with mocks. Only Windows wires real
//! implementations in.

use std::fmt;

use rand::RngExt;
use tracing::{debug, info, warn};

use super::acl::sids;
use super::error::{Result, SandboxError};

pub const ACCOUNT_NAME: &str = "agent_sandbox";
pub const ACCOUNT_COMMENT: &str = "Low-privilege account for sandboxed agent commands";

/// Application entropy mixed into machine-scope encryption of the password.
pub const SECRET_ENTROPY: &[u8] = b"agent-sandbox:account-credential:v1";

pub const PASSWORD_LEN: usize = 32;
const PASSWORD_CHARSET: &[u8] =
    b"ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz23456789!@#$%^&*-_=+";

const BACKEND: &str = "windows-restricted-token";

/// Outcome of an account creation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountCreation {
    Created,
    /// Someone else created it first. Treated as success.
    AlreadyExists,
}

/// The local account database.
#[cfg_attr(test, mockall::automock)]
pub trait AccountDirectory {
    fn exists(&self, name: &str) -> Result<bool>;
    fn create(&self, name: &str, password: &str, comment: &str) -> Result<AccountCreation>;
    fn set_password(&self, name: &str, password: &str) -> Result<()>;
    /// Grant batch logon and explicitly deny interactive logon.
    fn grant_batch_logon_only(&self, name: &str) -> Result<()>;
    fn lookup_sid(&self, name: &str) -> Result<String>;
}

/// A secret as found in the store.
#[derive(Clone, PartialEq, Eq)]
pub enum StoredSecret {
    Encrypted(Vec<u8>),
    /// Written by older releases. Upgraded on first read.
    Plaintext(String),
}

impl fmt::Debug for StoredSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoredSecret::Encrypted(blob) => write!(f, "Encrypted({} bytes)", blob.len()),
            StoredSecret::Plaintext(_) => f.write_str("Plaintext(<redacted>)"),
        }
    }
}

/// Persistent container for the encrypted password.
#[cfg_attr(test, mockall::automock)]
pub trait SecretStore {
    fn load(&self) -> Result<Option<StoredSecret>>;
    /// Replace whatever is stored (including a plaintext value) with `blob`.
    fn save_encrypted(&self, blob: &[u8]) -> Result<()>;
    /// Replace the container's access list so only `allowed_sids` may open it.
    fn restrict_access(&self, allowed_sids: &[String]) -> Result<()>;
}

/// Machine-scope encryption keyed with application entropy.
#[cfg_attr(test, mockall::automock)]
pub trait SecretProtector {
    fn protect(&self, plaintext: &[u8], entropy: &[u8]) -> Result<Vec<u8>>;
    fn unprotect(&self, blob: &[u8], entropy: &[u8]) -> Result<Vec<u8>>;
}

/// Logon material for the sandbox account.
#[derive(Clone)]
pub struct AccountCredential {
    pub name: String,
    pub sid: String,
    pub password: String,
}

impl fmt::Debug for AccountCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountCredential")
            .field("name", &self.name)
            .field("sid", &self.sid)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A fresh password from the thread CSPRNG.
pub fn generate_password() -> String {
    let mut rng = rand::rng();
    (0..PASSWORD_LEN)
        .map(|_| PASSWORD_CHARSET[rng.random_range(0..PASSWORD_CHARSET.len())] as char)
        .collect()
}

/// Everything the bootstrap needs from the host.
pub struct Bootstrap<'a> {
    pub accounts: &'a dyn AccountDirectory,
    pub store: &'a dyn SecretStore,
    pub protector: &'a dyn SecretProtector,
    /// SID of the real invoking user, allowed to read the stored secret.
    pub user_sid: String,
}

impl Bootstrap<'_> {
    /// Ensure the account exists and its password is stored encrypted.
    ///
    /// Idempotent: an existing account with an encrypted secret is just read
    /// back. A plaintext secret is re-encrypted in place. An account with no
    /// stored secret gets a fresh password.
    pub fn ensure_account(&self) -> Result<AccountCredential> {
        if !self.accounts.exists(ACCOUNT_NAME)? {
            let password = generate_password();
            match self
                .accounts
                .create(ACCOUNT_NAME, &password, ACCOUNT_COMMENT)?
            {
                AccountCreation::Created => {
                    info!(account = ACCOUNT_NAME, "created sandbox account");
                    self.accounts.grant_batch_logon_only(ACCOUNT_NAME)?;
                    let sid = self.accounts.lookup_sid(ACCOUNT_NAME)?;
                    self.persist(&password, &sid)?;
                    return Ok(self.credential(sid, password));
                }
                AccountCreation::AlreadyExists => {
                    debug!(account = ACCOUNT_NAME, "account created concurrently");
                }
            }
        }

        let sid = self.accounts.lookup_sid(ACCOUNT_NAME)?;
        let password = match self.store.load()? {
            Some(StoredSecret::Encrypted(blob)) => {
                let plain = self.protector.unprotect(&blob, SECRET_ENTROPY)?;
                String::from_utf8(plain)
                    .map_err(|_| SandboxError::setup(BACKEND, "stored secret is not valid UTF-8"))?
            }
            Some(StoredSecret::Plaintext(password)) => {
                warn!(account = ACCOUNT_NAME, "upgrading plaintext account secret");
                self.persist(&password, &sid)?;
                password
            }
            None => {
                warn!(account = ACCOUNT_NAME, "no stored secret, resetting account password");
                let password = generate_password();
                self.accounts.set_password(ACCOUNT_NAME, &password)?;
                self.accounts.grant_batch_logon_only(ACCOUNT_NAME)?;
                self.persist(&password, &sid)?;
                password
            }
        };

        Ok(self.credential(sid, password))
    }

    fn persist(&self, password: &str, account_sid: &str) -> Result<()> {
        let blob = self.protector.protect(password.as_bytes(), SECRET_ENTROPY)?;
        self.store.save_encrypted(&blob)?;
        self.store.restrict_access(&[
            sids::ADMINISTRATORS.to_string(),
            self.user_sid.clone(),
            account_sid.to_string(),
        ])
    }

    fn credential(&self, sid: String, password: String) -> AccountCredential {
        AccountCredential {
            name: ACCOUNT_NAME.to_string(),
            sid,
            password,
        }
    }
}
