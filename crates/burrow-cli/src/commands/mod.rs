//! CLI command definitions and dispatch.

pub mod run;

use std::path::PathBuf;

use burrow_common::config::{BurrowConfig, ExtractorKind};
use burrow_common::constants::{
    DEFAULT_AUTH_SERVICE, DEFAULT_AUTH_URL, DEFAULT_NAMESPACE, DEFAULT_REGISTRY_URL,
};
use clap::{Parser, Subcommand};

/// burrow: run a command inside a freshly pulled registry image.
///
/// Options belong before the subcommand; everything after the command path
/// is handed to the command untouched.
#[derive(Parser, Debug)]
#[command(name = "burrow", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Token endpoint of the registry's auth service.
    #[arg(long, env = "BURROW_AUTH_URL", default_value = DEFAULT_AUTH_URL)]
    pub auth_url: String,

    /// `service` parameter sent to the token endpoint.
    #[arg(long, env = "BURROW_AUTH_SERVICE", default_value = DEFAULT_AUTH_SERVICE)]
    pub auth_service: String,

    /// Base URL of the registry.
    #[arg(long, env = "BURROW_REGISTRY_URL", default_value = DEFAULT_REGISTRY_URL)]
    pub registry_url: String,

    /// Namespace for image names without a `/`.
    #[arg(long, env = "BURROW_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Directory under which the ephemeral root is created.
    #[arg(long, env = "BURROW_TEMP_ROOT")]
    pub temp_root: Option<PathBuf>,

    /// How layers are unpacked: `tar` (external program) or `builtin`.
    #[arg(long, env = "BURROW_EXTRACTOR", default_value_t = ExtractorKind::Tar)]
    pub extractor: ExtractorKind,

    /// Program used by the `tar` extractor.
    #[arg(long, env = "BURROW_TAR", default_value = "tar")]
    pub tar_program: PathBuf,

    /// Skip size and SHA-256 checks of downloaded layers.
    #[arg(long, env = "BURROW_NO_VERIFY")]
    pub no_verify: bool,

    /// Per-request timeout for registry calls, in seconds.
    #[arg(long, env = "BURROW_REQUEST_TIMEOUT")]
    pub request_timeout: Option<u64>,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, env = "BURROW_LOG_JSON")]
    pub log_json: bool,
}

impl Cli {
    /// Builds the run configuration from the global flags.
    pub fn config(&self) -> BurrowConfig {
        BurrowConfig {
            auth_url: self.auth_url.clone(),
            auth_service: self.auth_service.clone(),
            registry_url: self.registry_url.clone(),
            default_namespace: self.namespace.clone(),
            temp_root: self.temp_root.clone(),
            extractor: self.extractor,
            tar_program: self.tar_program.clone(),
            verify_digests: !self.no_verify,
            request_timeout_secs: self.request_timeout,
        }
    }
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Pull an image and run a command inside it.
    Run(run::RunArgs),
}

/// Dispatches the parsed CLI command to its handler and returns the process
/// exit status.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<i32> {
    let config = cli.config();
    match cli.command {
        Command::Run(args) => run::execute(args, config),
    }
}
