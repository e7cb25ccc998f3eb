//! blemux - advertise several BLE identities from one radio.
//!
//! Run with: `cargo run -p blemux-cli -- run --simulate`

use std::path::Path;

use anyhow::Result;
use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;
mod config;

use cli::{Cli, Command, RunArgs};
use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so `--events` output stays machine-readable
    let filter = if cli.quiet {
        EnvFilter::new("warn")
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command.unwrap_or_else(|| Command::Run(RunArgs::default())) {
        Command::Run(args) => {
            let config = load_config(cli.config.as_deref())?;
            config.validate()?;
            commands::run(config, args).await
        }
        Command::Check => commands::check(&load_config(cli.config.as_deref())?),
        Command::Payload(args) => {
            commands::payload(&load_config(cli.config.as_deref())?, &args)
        }
        Command::Init { force } => {
            let path = cli.config.unwrap_or_else(config::default_config_path);
            commands::init(&path, force)
        }
    }
}

/// Load the given file, or the default path (falling back to the reference configuration).
fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => {
            debug!("Loading configuration from {}", path.display());
            Config::load(path)?
        }
        None => Config::load_default()?,
    };
    Ok(config)
}
