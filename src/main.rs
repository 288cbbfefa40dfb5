use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use agent_sandbox::cli::{self, Cli, Commands};
use agent_sandbox::config::Config;

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    // `config` subcommands manage the file themselves and must not create it.
    let config = match cli.command {
        Commands::Config(_) => None,
        _ => Some(Config::load_from(cli.config.as_deref())?),
    };
    init_logging(cli.verbose, config.as_ref().map(|c| c.logging.level.as_str()));
    let config = config.unwrap_or_default();

    match cli.command {
        Commands::Run(args) => cli::run::run(args, &config).await,
        Commands::Status(args) => cli::sandbox::run_status(args, &config).await,
        Commands::Check(args) => cli::check::run(args, &config).await,
        Commands::Test => cli::sandbox::run_test(&config).await,
        Commands::Config(args) => cli::config::run(args, cli.config.as_deref()),
    }
}

/// Logs go to stderr so command output on stdout stays clean.
fn init_logging(verbose: bool, config_level: Option<&str>) {
    let level = if verbose {
        "debug"
    } else {
        config_level.unwrap_or("info")
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();
}
