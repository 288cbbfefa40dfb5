use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Subcommand};

use super::SandboxOverrides;
use crate::config::Config;

#[derive(Args, Debug)]
pub struct CheckArgs {
    #[command(subcommand)]
    pub command: CheckCommands,
}

#[derive(Subcommand, Debug)]
pub enum CheckCommands {
    /// Check whether a command would be allowed to run
    Command {
        #[command(flatten)]
        overrides: SandboxOverrides,

        /// Command name
        name: String,

        /// Arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Check whether a path is writable by sandboxed commands
    Path {
        #[command(flatten)]
        overrides: SandboxOverrides,

        /// Path to check (relative paths resolve against the working directory)
        path: PathBuf,
    },
}

pub async fn run(args: CheckArgs, config: &Config) -> Result<()> {
    match args.command {
        CheckCommands::Command {
            overrides,
            name,
            args,
        } => {
            let sandbox = overrides.build(config)?;
            match sandbox.validate_command(&name, &args) {
                Ok(()) => {
                    println!("allowed: {} ({} mode)", name, sandbox.get_isolation_mode());
                    Ok(())
                }
                Err(e) => anyhow::bail!("denied: {}", e),
            }
        }
        CheckCommands::Path { overrides, path } => {
            let sandbox = overrides.build(config)?;
            if sandbox.is_path_writable(&path) {
                println!("writable: {}", path.display());
                Ok(())
            } else {
                anyhow::bail!("not writable: {}", path.display())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::IsolationMode;

    fn overrides_for(dir: &std::path::Path, mode: IsolationMode) -> SandboxOverrides {
        SandboxOverrides {
            mode: Some(mode),
            workdir: Some(dir.to_path_buf()),
            writable: vec![dir.to_path_buf()],
            ..SandboxOverrides::default()
        }
    }

    #[tokio::test]
    async fn test_check_denied_command_fails() {
        let dir = tempfile::tempdir().unwrap();
        let args = CheckArgs {
            command: CheckCommands::Command {
                overrides: overrides_for(dir.path(), IsolationMode::Os),
                name: "rm".to_string(),
                args: vec!["-rf".to_string(), "x".to_string()],
            },
        };
        let err = run(args, &Config::default()).await.unwrap_err();
        assert!(err.to_string().starts_with("denied"));
    }

    #[tokio::test]
    async fn test_check_path_inside_writable_dir() {
        let dir = tempfile::tempdir().unwrap();
        let args = CheckArgs {
            command: CheckCommands::Path {
                overrides: overrides_for(dir.path(), IsolationMode::App),
                path: PathBuf::from("out/file.txt"),
            },
        };
        assert!(run(args, &Config::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_check_path_outside_writable_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let args = CheckArgs {
            command: CheckCommands::Path {
                overrides: overrides_for(dir.path(), IsolationMode::App),
                path: PathBuf::from("../../../../etc/agent-sandbox-check"),
            },
        };
        assert!(run(args, &Config::default()).await.is_err());
    }
}
