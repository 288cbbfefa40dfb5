use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::paths::Paths;
use crate::sandbox::executor::DEFAULT_MAX_OUTPUT_BYTES;
use crate::sandbox::policy::DEFAULT_STATE_DIR_NAME;
use crate::sandbox::{self, IsolationMode};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved XDG-compliant paths (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Isolation mode: "none" | "os" | "app"
    #[serde(default = "default_isolation_mode")]
    pub isolation_mode: IsolationMode,

    /// Directories commands may write, besides the temp directory
    #[serde(default)]
    pub writable_dirs: Vec<String>,

    /// Temp directory (default: system temp dir)
    #[serde(default)]
    pub tmp_dir: Option<String>,

    /// Working directory (default: current directory)
    #[serde(default)]
    pub work_dir: Option<String>,

    /// `KEY=VALUE` entries; empty inherits the caller's environment
    #[serde(default)]
    pub env: Vec<String>,

    /// Command timeout in seconds (default: 120, 0 = unbounded)
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Maximum captured output per stream (default: 1MB)
    #[serde(default = "default_max_output")]
    pub max_output_bytes: usize,

    /// Per-workspace state directory that commands may never touch
    #[serde(default = "default_state_dir_name")]
    pub state_dir_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_isolation_mode() -> IsolationMode {
    IsolationMode::Os
}

fn default_timeout() -> u64 {
    120
}

fn default_max_output() -> usize {
    DEFAULT_MAX_OUTPUT_BYTES
}

fn default_state_dir_name() -> String {
    DEFAULT_STATE_DIR_NAME.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            isolation_mode: default_isolation_mode(),
            writable_dirs: Vec::new(),
            tmp_dir: None,
            work_dir: None,
            env: Vec::new(),
            timeout_secs: default_timeout(),
            max_output_bytes: default_max_output(),
            state_dir_name: default_state_dir_name(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl SandboxConfig {
    /// Build the library configuration, expanding `~` in every path.
    pub fn to_sandbox_config(&self) -> sandbox::Config {
        sandbox::Config {
            writable_dirs: self.writable_dirs.iter().map(|d| expand_path(d)).collect(),
            tmp_dir: self.tmp_dir.as_deref().map(expand_path),
            work_dir: self.work_dir.as_deref().map(expand_path),
            env: self.env.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            isolation_mode: self.isolation_mode,
            state_dir_name: Some(self.state_dir_name.clone()),
        }
    }
}

impl Config {
    /// Load from the default location, creating a commented template on first run.
    pub fn load() -> Result<Self> {
        Self::load_with_paths(Paths::resolve()?)
    }

    /// Load from `path` when given (the `--config` flag), else the default location.
    pub fn load_from(path: Option<&str>) -> Result<Self> {
        let paths = Paths::resolve()?;
        match path {
            Some(path) => Self::load_with_paths(paths.with_config_file(path)),
            None => Self::load_with_paths(paths),
        }
    }

    pub fn load_with_paths(paths: Paths) -> Result<Self> {
        let path = paths.config_file();

        if !path.exists() {
            paths.ensure_dirs()?;
            let config = Config {
                paths,
                ..Config::default()
            };
            config.save_with_template()?;
            return Ok(config);
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.paths = paths;

        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = self.paths.config_file();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;

        Ok(())
    }

    /// Save config with a helpful template (for first-time setup)
    pub fn save_with_template(&self) -> Result<()> {
        let path = self.paths.config_file();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;
        eprintln!("Created default config at {}", path.display());

        Ok(())
    }

    pub fn config_path(&self) -> PathBuf {
        self.paths.config_file()
    }

    pub fn get_value(&self, key: &str) -> Result<String> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["sandbox", "isolation_mode"] => Ok(self.sandbox.isolation_mode.to_string()),
            ["sandbox", "writable_dirs"] => Ok(self.sandbox.writable_dirs.join(",")),
            ["sandbox", "tmp_dir"] => Ok(self.sandbox.tmp_dir.clone().unwrap_or_default()),
            ["sandbox", "work_dir"] => Ok(self.sandbox.work_dir.clone().unwrap_or_default()),
            ["sandbox", "env"] => Ok(self.sandbox.env.join(",")),
            ["sandbox", "timeout_secs"] => Ok(self.sandbox.timeout_secs.to_string()),
            ["sandbox", "max_output_bytes"] => Ok(self.sandbox.max_output_bytes.to_string()),
            ["sandbox", "state_dir_name"] => Ok(self.sandbox.state_dir_name.clone()),
            ["logging", "level"] => Ok(self.logging.level.clone()),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["sandbox", "isolation_mode"] => {
                self.sandbox.isolation_mode = value.parse().map_err(anyhow::Error::msg)?
            }
            ["sandbox", "writable_dirs"] => self.sandbox.writable_dirs = split_list(value),
            ["sandbox", "tmp_dir"] => self.sandbox.tmp_dir = non_empty(value),
            ["sandbox", "work_dir"] => self.sandbox.work_dir = non_empty(value),
            ["sandbox", "env"] => self.sandbox.env = split_list(value),
            ["sandbox", "timeout_secs"] => self.sandbox.timeout_secs = value.parse()?,
            ["sandbox", "max_output_bytes"] => self.sandbox.max_output_bytes = value.parse()?,
            ["sandbox", "state_dir_name"] => self.sandbox.state_dir_name = value.to_string(),
            ["logging", "level"] => self.logging.level = value.to_string(),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        Ok(())
    }
}

fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Default config template with helpful comments (used for first-time setup)
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# agent-sandbox configuration
# Auto-created on first run. Edit as needed.

[sandbox]
# none: run directly, os: platform isolation, app: run directly with the denylist
isolation_mode = "os"

# Directories commands may write. The temp directory is always included.
# writable_dirs = ["~/projects/scratch"]

# tmp_dir = "/tmp"                       # default: system temp dir
# work_dir = "~/projects/app"             # default: current directory

# Environment for commands. Empty inherits the caller's environment.
# env = ["PATH=/usr/bin:/bin", "HOME=/tmp"]

timeout_secs = 120                        # 0 = no timeout
max_output_bytes = 1048576                # default: 1MB

# Per-workspace state directory that commands may never touch
# state_dir_name = ".agent-sandbox"

[logging]
level = "info"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_paths(dir: &std::path::Path) -> Paths {
        Paths {
            config_dir: dir.to_path_buf(),
            config_file: dir.join("config.toml"),
        }
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.sandbox.isolation_mode, IsolationMode::Os);
        assert_eq!(config.sandbox.timeout_secs, 120);
        assert_eq!(config.sandbox.max_output_bytes, 1_048_576);
        assert_eq!(config.sandbox.state_dir_name, ".agent-sandbox");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_template_parses_to_defaults() {
        let config: Config = toml::from_str(DEFAULT_CONFIG_TEMPLATE).unwrap();
        assert_eq!(config.sandbox.isolation_mode, IsolationMode::Os);
        assert_eq!(config.sandbox.timeout_secs, 120);
        assert!(config.sandbox.writable_dirs.is_empty());
        assert!(config.sandbox.env.is_empty());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [sandbox]
            isolation_mode = "app"
            writable_dirs = ["/data/out"]
            "#,
        )
        .unwrap();
        assert_eq!(config.sandbox.isolation_mode, IsolationMode::App);
        assert_eq!(config.sandbox.writable_dirs, vec!["/data/out"]);
        assert_eq!(config.sandbox.timeout_secs, 120);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_unknown_isolation_mode_is_rejected() {
        let result: std::result::Result<Config, _> =
            toml::from_str("[sandbox]\nisolation_mode = \"container\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_first_load_writes_template() {
        let dir = tempfile::tempdir().unwrap();
        let paths = temp_paths(dir.path());
        let config = Config::load_with_paths(paths.clone()).unwrap();

        let written = fs::read_to_string(paths.config_file()).unwrap();
        assert_eq!(written, DEFAULT_CONFIG_TEMPLATE);
        assert_eq!(config.sandbox.isolation_mode, IsolationMode::Os);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let paths = temp_paths(dir.path());
        let mut config = Config {
            paths: paths.clone(),
            ..Config::default()
        };
        config.set_value("sandbox.timeout_secs", "5").unwrap();
        config.set_value("sandbox.isolation_mode", "none").unwrap();
        config
            .set_value("sandbox.writable_dirs", "/a, /b,")
            .unwrap();
        config.save().unwrap();

        let loaded = Config::load_with_paths(paths).unwrap();
        assert_eq!(loaded.sandbox.timeout_secs, 5);
        assert_eq!(loaded.sandbox.isolation_mode, IsolationMode::None);
        assert_eq!(loaded.sandbox.writable_dirs, vec!["/a", "/b"]);
    }

    #[test]
    fn test_get_and_set_value() {
        let mut config = Config::default();
        assert_eq!(config.get_value("sandbox.isolation_mode").unwrap(), "os");

        config.set_value("logging.level", "debug").unwrap();
        assert_eq!(config.get_value("logging.level").unwrap(), "debug");

        config.set_value("sandbox.tmp_dir", " ").unwrap();
        assert!(config.sandbox.tmp_dir.is_none());

        assert!(config.set_value("sandbox.timeout_secs", "soon").is_err());
        assert!(config.set_value("sandbox.isolation_mode", "vm").is_err());
        assert!(config.get_value("agent.model").is_err());
    }

    #[test]
    fn test_to_sandbox_config_expands_tilde() {
        let home = etcetera::home_dir().unwrap();
        let sandbox = SandboxConfig {
            writable_dirs: vec!["~/out".to_string()],
            work_dir: Some("~".to_string()),
            timeout_secs: 7,
            ..SandboxConfig::default()
        };
        let config = sandbox.to_sandbox_config();
        assert_eq!(config.writable_dirs, vec![home.join("out")]);
        assert_eq!(config.work_dir, Some(home.clone()));
        assert_eq!(config.tmp_dir, None);
        assert_eq!(config.timeout, Duration::from_secs(7));
        assert_eq!(config.isolation_mode, IsolationMode::Os);
        assert_eq!(config.state_dir_name.as_deref(), Some(".agent-sandbox"));
    }
}
