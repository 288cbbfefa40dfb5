use anyhow::Result;
use clap::{Args, Subcommand};

use crate::config::{Config, DEFAULT_CONFIG_TEMPLATE};
use crate::paths::Paths;

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show {
        /// Output format: toml (default) or json
        #[arg(short, long, default_value = "toml")]
        format: String,
    },

    /// Get a configuration value
    Get {
        /// Config key (e.g., sandbox.isolation_mode)
        key: String,
    },

    /// Set a configuration value
    Set {
        /// Config key (e.g., sandbox.timeout_secs)
        key: String,

        /// Value to set (lists are comma-separated)
        value: String,
    },

    /// Show config file path
    Path,

    /// Initialize default config file
    Init {
        /// Overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

pub fn run(args: ConfigArgs, config_file: Option<&str>) -> Result<()> {
    let paths = resolve_paths(config_file)?;
    match args.command {
        ConfigCommands::Show { format } => show_config(paths, &format),
        ConfigCommands::Get { key } => get_config(paths, &key),
        ConfigCommands::Set { key, value } => set_config(paths, &key, &value),
        ConfigCommands::Path => {
            println!("{}", paths.config_file().display());
            Ok(())
        }
        ConfigCommands::Init { force } => init_config(&paths, force),
    }
}

fn resolve_paths(config_file: Option<&str>) -> Result<Paths> {
    let paths = Paths::resolve()?;
    Ok(match config_file {
        Some(file) => paths.with_config_file(file),
        None => paths,
    })
}

fn show_config(paths: Paths, format: &str) -> Result<()> {
    let config = Config::load_with_paths(paths)?;

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&config)?;
            println!("{}", json);
        }
        _ => {
            let toml = toml::to_string_pretty(&config)?;
            println!("{}", toml);
        }
    }

    Ok(())
}

fn get_config(paths: Paths, key: &str) -> Result<()> {
    let config = Config::load_with_paths(paths)?;
    let value = config.get_value(key)?;
    println!("{}", value);
    Ok(())
}

fn set_config(paths: Paths, key: &str, value: &str) -> Result<()> {
    let mut config = Config::load_with_paths(paths)?;
    config.set_value(key, value)?;
    config.save()?;
    println!("Set {} = {}", key, value);
    Ok(())
}

fn init_config(paths: &Paths, force: bool) -> Result<()> {
    let path = paths.config_file();

    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists at {}. Use --force to overwrite.",
            path.display()
        );
    }

    paths.ensure_dirs()?;
    std::fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;

    println!("Created config file at {}", path.display());
    Ok(())
}

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
    fn test_init_refuses_to_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let paths = temp_paths(dir.path());
        std::fs::write(paths.config_file(), "[logging]\nlevel = \"warn\"\n").unwrap();

        assert!(init_config(&paths, false).is_err());
        init_config(&paths, true).unwrap();
        assert_eq!(
            std::fs::read_to_string(paths.config_file()).unwrap(),
            DEFAULT_CONFIG_TEMPLATE
        );
    }

    #[test]
    fn test_set_persists_value() {
        let dir = tempfile::tempdir().unwrap();
        let paths = temp_paths(dir.path());
        set_config(paths.clone(), "sandbox.isolation_mode", "app").unwrap();

        let config = Config::load_with_paths(paths).unwrap();
        assert_eq!(config.get_value("sandbox.isolation_mode").unwrap(), "app");
    }
}
