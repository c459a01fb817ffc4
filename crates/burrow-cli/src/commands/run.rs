//! `burrow run`: pull an image and run a command inside it.

use burrow_common::config::BurrowConfig;
use burrow_runtime::engine::{Engine, RunRequest};
use clap::Args;

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Image name, e.g. `busybox` (the `latest` tag is implied).
    pub image: String,

    /// Absolute path of the command, copied from the host into the root,
    /// followed by its arguments. Nothing from here on is parsed as a
    /// burrow option.
    #[arg(
        value_name = "COMMAND",
        required = true,
        num_args = 1..,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub command_line: Vec<String>,
}

impl RunArgs {
    /// The command path.
    #[must_use]
    pub fn command(&self) -> &str {
        self.command_line.first().map_or("", String::as_str)
    }

    /// Arguments passed to the command verbatim.
    #[must_use]
    pub fn args(&self) -> &[String] {
        self.command_line.get(1..).unwrap_or_default()
    }
}

/// Executes the `run` command and returns the command's exit status.
///
/// # Errors
///
/// Returns an error if any stage of the pipeline fails.
pub fn execute(args: RunArgs, config: BurrowConfig) -> anyhow::Result<i32> {
    let engine = Engine::new(config);
    let request = RunRequest {
        command: args.command().to_string(),
        args: args.args().to_vec(),
        image: args.image,
    };
    let termination = engine.run(&request)?;
    tracing::debug!(%termination, "command finished");
    Ok(termination.exit_code())
}
