//! # burrow
//!
//! Minimal container bootstrapper: pulls an image from a registry, builds an
//! ephemeral root from its layers, and runs one command inside it under
//! chroot and a fresh PID namespace. The command's exit status becomes
//! burrow's exit status.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

mod commands;

use burrow_common::constants::{APP_NAME, EXIT_PIPELINE_FAILURE};
use burrow_common::error::BurrowError;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::commands::Cli;

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let code = match commands::execute(cli) {
        Ok(code) => code,
        Err(err) => report_failure(&err),
    };
    std::process::exit(code);
}

/// Logs go to stderr; stdout belongs to the container.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[allow(clippy::print_stderr)]
fn report_failure(err: &anyhow::Error) -> i32 {
    let burrow_err = err.downcast_ref::<BurrowError>();
    tracing::error!(kind = burrow_err.map_or("other", BurrowError::kind), "{err:#}");
    eprintln!("{APP_NAME}: {err:#}");
    burrow_err.map_or(EXIT_PIPELINE_FAILURE, BurrowError::exit_code)
}
