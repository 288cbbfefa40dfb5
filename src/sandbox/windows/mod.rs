//! Windows isolation: a dedicated low-privilege account, a restricted token
//! derived from its batch logon, and a per-execution ACL window on the
//! directories it may touch.
//!
//! Unlike the Unix backends, the account outlives every command, so access
//! granted for a run is replaced with a deny entry when the run ends.

mod account;
mod acl;
mod pipe;
mod process;
mod secret;
pub(crate) mod sid;
mod token;

use once_cell::sync::OnceCell;
use tracing::debug;

use super::backend::{ExecEnv, IsolationBackend};
use super::credential::{AccountCredential, Bootstrap};
use super::error::Result;
use super::process::Launcher;

use account::NetAccounts;
use process::RestrictedLaunch;
use secret::{DpapiProtector, RegistrySecretStore};

static ACCOUNT: OnceCell<AccountCredential> = OnceCell::new();

/// Bootstrap the sandbox account once per process.
fn shared_account(user_sid: &str) -> Result<&'static AccountCredential> {
    ACCOUNT.get_or_try_init(|| {
        debug!("bootstrapping sandbox account");
        Bootstrap {
            accounts: &NetAccounts,
            store: &RegistrySecretStore,
            protector: &DpapiProtector,
            user_sid: user_sid.to_string(),
        }
        .ensure_account()
    })
}

#[derive(Debug, Default)]
pub struct RestrictedTokenBackend;

impl RestrictedTokenBackend {
    pub fn new() -> Self {
        Self
    }
}

impl IsolationBackend for RestrictedTokenBackend {
    fn name(&self) -> &'static str {
        sid::BACKEND
    }

    fn capability(&self) -> Option<String> {
        Some("restricted-token".to_string())
    }

    fn create_isolated_command(
        &self,
        env: &ExecEnv,
        name: &str,
        args: &[String],
    ) -> Result<Box<dyn Launcher>> {
        let user_sid = sid::current_user_sid()?;
        let account = shared_account(&user_sid)?.clone();
        Ok(Box::new(RestrictedLaunch {
            name: name.to_string(),
            args: args.to_vec(),
            env: env.clone(),
            account,
            user_sid,
        }))
    }
}
