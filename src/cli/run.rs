use anyhow::{Context, Result};
use clap::Args;
use tracing::{debug, info};

use super::SandboxOverrides;
use crate::config::Config;
use crate::sandbox::{Input, Output, SandboxError};

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub overrides: SandboxOverrides,

    /// Command to run
    pub name: String,

    /// Arguments passed to the command
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

pub async fn run(args: RunArgs, config: &Config) -> Result<()> {
    let sandbox = args.overrides.build(config)?;
    sandbox.validate_command(&args.name, &args.args)?;

    info!(
        name = %args.name,
        mode = %sandbox.get_isolation_mode(),
        backend = sandbox.backend_name(),
        "running command"
    );

    let mut command = sandbox.execute(&args.name, &args.args)?;
    command.set_stdin(Input::Inherit);
    command.set_stdout(Output::Inherit);
    command.set_stderr(Output::Inherit);

    match command.run().await {
        Ok(()) => Ok(()),
        Err(SandboxError::ExitStatus { code }) => {
            debug!(code, "propagating exit code");
            std::process::exit(code);
        }
        Err(e) => Err(e).with_context(|| format!("Failed to run '{}'", args.name)),
    }
}
