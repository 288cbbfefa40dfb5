use std::path::PathBuf;
use std::sync::Arc;

use super::error::{Result, SandboxError};
use super::process::Launcher;

/// Immutable snapshot of sandbox state taken under the read lock for one execution.
#[derive(Debug, Clone)]
pub struct ExecEnv {
    pub work_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub writable_dirs: Vec<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Name of the agent's bookkeeping directory under `work_dir`.
    pub state_dir_name: String,
}

impl ExecEnv {
    pub fn state_dir(&self) -> PathBuf {
        self.work_dir.join(&self.state_dir_name)
    }
}

/// Platform-native isolation used for [`IsolationMode::Os`](super::IsolationMode::Os).
///
/// Exactly one implementation is compiled in per target; callers only ever
/// see this trait.
pub trait IsolationBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Look up the isolation tool. `None` when it is missing.
    fn capability(&self) -> Option<String>;

    fn create_isolated_command(
        &self,
        env: &ExecEnv,
        name: &str,
        args: &[String],
    ) -> Result<Box<dyn Launcher>>;
}

/// Backend for targets with no native isolation support.
#[derive(Debug, Default)]
pub struct UnsupportedBackend;

impl IsolationBackend for UnsupportedBackend {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn capability(&self) -> Option<String> {
        None
    }

    fn create_isolated_command(
        &self,
        _env: &ExecEnv,
        _name: &str,
        _args: &[String],
    ) -> Result<Box<dyn Launcher>> {
        Err(SandboxError::UnsupportedPlatform(std::env::consts::OS))
    }
}

/// The isolation backend for the current platform.
pub fn platform_backend() -> Arc<dyn IsolationBackend> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(super::linux::NamespaceBackend::new())
    }

    #[cfg(target_os = "macos")]
    {
        Arc::new(super::macos::SeatbeltBackend::new())
    }

    #[cfg(windows)]
    {
        Arc::new(super::windows::RestrictedTokenBackend::new())
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    {
        Arc::new(UnsupportedBackend)
    }
}
