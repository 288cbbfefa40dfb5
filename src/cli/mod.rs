pub mod check;
pub mod config;
pub mod run;
pub mod sandbox;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::config::Config;
use crate::sandbox::{IsolationMode, Sandbox};

#[derive(Parser)]
#[command(name = "agent-sandbox")]
#[command(author, version, about = "Run agent-generated commands under OS isolation")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file
    #[arg(short, long, global = true, env = "AGENT_SANDBOX_CONFIG")]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a command inside the sandbox
    Run(run::RunArgs),

    /// Show platform isolation support and the effective configuration
    Status(sandbox::StatusArgs),

    /// Check whether a command or path is allowed
    Check(check::CheckArgs),

    /// Run smoke tests to verify sandbox enforcement
    Test,

    /// Configuration management
    Config(config::ConfigArgs),
}

/// Per-invocation overrides of the `[sandbox]` config section.
#[derive(Args, Debug, Default, Clone)]
pub struct SandboxOverrides {
    /// Isolation mode: none, os or app
    #[arg(short, long)]
    pub mode: Option<IsolationMode>,

    /// Timeout in seconds (0 = no timeout)
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Working directory
    #[arg(short, long)]
    pub workdir: Option<PathBuf>,

    /// Additional writable directory (repeatable)
    #[arg(long = "writable", value_name = "DIR")]
    pub writable: Vec<PathBuf>,
}

impl SandboxOverrides {
    /// Build a sandbox from the config file with these overrides applied.
    pub fn build(&self, config: &Config) -> Result<Sandbox> {
        let mut sandbox_config = config.sandbox.to_sandbox_config();
        if let Some(mode) = self.mode {
            sandbox_config.isolation_mode = mode;
        }
        if let Some(secs) = self.timeout {
            sandbox_config.timeout = std::time::Duration::from_secs(secs);
        }
        if let Some(ref dir) = self.workdir {
            sandbox_config.work_dir = Some(dir.clone());
        }
        sandbox_config
            .writable_dirs
            .extend(self.writable.iter().cloned());

        Sandbox::new(sandbox_config).context("Failed to configure sandbox")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cli_parses_run_with_trailing_args() {
        let cli = Cli::try_parse_from([
            "agent-sandbox",
            "run",
            "--mode",
            "none",
            "--timeout",
            "3",
            "--",
            "ls",
            "-la",
        ])
        .unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.overrides.mode, Some(IsolationMode::None));
                assert_eq!(args.overrides.timeout, Some(3));
                assert_eq!(args.name, "ls");
                assert_eq!(args.args, vec!["-la"]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_mode() {
        let result = Cli::try_parse_from(["agent-sandbox", "run", "--mode", "vm", "--", "ls"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_overrides_apply_to_config() {
        let dir = tempfile::tempdir().unwrap();
        let extra = tempfile::tempdir().unwrap();
        let overrides = SandboxOverrides {
            mode: Some(IsolationMode::App),
            timeout: Some(9),
            workdir: Some(dir.path().to_path_buf()),
            writable: vec![extra.path().to_path_buf()],
        };
        let sandbox = overrides.build(&Config::default()).unwrap();

        assert_eq!(sandbox.get_isolation_mode(), IsolationMode::App);
        assert_eq!(sandbox.get_timeout(), Duration::from_secs(9));
        assert_eq!(
            sandbox.get_work_dir(),
            dir.path().canonicalize().unwrap()
        );
        assert!(sandbox.is_path_writable(extra.path().join("file")));
    }

    #[test]
    fn test_overrides_missing_workdir_fails() {
        let overrides = SandboxOverrides {
            workdir: Some(PathBuf::from("/definitely/not/here")),
            ..SandboxOverrides::default()
        };
        assert!(overrides.build(&Config::default()).is_err());
    }
}
