//! XDG Base Directory compliant path resolution.
//!
//! The config directory is resolved through a three-level fallback:
//! 1. `AGENT_SANDBOX_CONFIG_DIR`
//! 2. `XDG_CONFIG_HOME` via `etcetera`
//! 3. Platform default (~/.config)
//!
//! Relative paths from env vars are ignored per XDG spec.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

const APP_DIR: &str = "agent-sandbox";
const CONFIG_FILE: &str = "config.toml";

/// Resolved locations used by the binary. All paths are absolute.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Config directory: config.toml lives here
    pub config_dir: PathBuf,

    /// Config file. Defaults to `config_dir/config.toml`, replaced by `--config`.
    pub config_file: PathBuf,
}

impl Paths {
    /// Resolve all paths using real environment variables.
    pub fn resolve() -> Result<Self> {
        Self::resolve_with_env(|key| std::env::var(key))
    }

    /// Resolve paths with a custom env var lookup (for testing).
    pub fn resolve_with_env<F>(env_fn: F) -> Result<Self>
    where
        F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
    {
        use etcetera::BaseStrategy;

        let strategy = etcetera::choose_base_strategy()
            .map_err(|e| anyhow::anyhow!("Failed to determine base directories: {}", e))?;

        let config_dir = env_or(&env_fn, "AGENT_SANDBOX_CONFIG_DIR", || {
            strategy.config_dir().join(APP_DIR)
        });
        let config_file = config_dir.join(CONFIG_FILE);

        Ok(Self {
            config_dir,
            config_file,
        })
    }

    /// Use an explicit config file (from `--config`). `~` is expanded.
    pub fn with_config_file(mut self, path: &str) -> Self {
        let expanded = shellexpand::tilde(path);
        self.config_file = PathBuf::from(expanded.as_ref());
        if let Some(parent) = self.config_file.parent()
            && !parent.as_os_str().is_empty()
        {
            self.config_dir = parent.to_path_buf();
        }
        self
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_file.clone()
    }

    /// Create the config directory with owner-only permissions.
    pub fn ensure_dirs(&self) -> Result<()> {
        create_dir_with_mode(&self.config_dir)
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::resolve().unwrap_or_else(|_| {
            let home = etcetera::home_dir().unwrap_or_else(|_| PathBuf::from("."));
            let config_dir = home.join(".config").join(APP_DIR);
            Self {
                config_file: config_dir.join(CONFIG_FILE),
                config_dir,
            }
        })
    }
}

/// Resolve an env var with fallback. Ignores empty and relative paths.
fn env_or<F>(env_fn: &F, var: &str, default: impl FnOnce() -> PathBuf) -> PathBuf
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    env_fn(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .unwrap_or_else(default)
}

fn create_dir_with_mode(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}
