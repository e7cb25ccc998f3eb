//! CLI argument definitions using clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "blemux")]
#[command(version, about = "Advertise several BLE identities from one radio", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "BLEMUX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Cycle through the roster until interrupted (default)
    Run(RunArgs),

    /// Validate the configuration and show each identity's payload
    Check,

    /// Print the advertising payload for a name
    Payload(PayloadArgs),

    /// Write the reference configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Arguments for `run`.
#[derive(Debug, Clone, Default, Args)]
pub struct RunArgs {
    /// Drive a simulated controller instead of the radio
    #[arg(long)]
    pub simulate: bool,

    /// HCI device index, e.g. 0 for hci0 (overrides config)
    #[arg(short, long, env = "BLEMUX_DEVICE")]
    pub device: Option<u16>,

    /// Dwell per identity in milliseconds (overrides config)
    #[arg(long)]
    pub dwell_ms: Option<u64>,

    /// Stop after this many identity steps
    #[arg(long)]
    pub rounds: Option<usize>,

    /// Print cycle events to stdout as JSON lines
    #[arg(long)]
    pub events: bool,
}

/// Arguments for `payload`.
#[derive(Debug, Clone, Args)]
pub struct PayloadArgs {
    /// Local name to encode
    pub name: String,

    /// Extra 16-bit service UUID in hex (repeatable or comma-separated)
    #[arg(short, long = "uuid", value_delimiter = ',', value_parser = parse_uuid16)]
    pub uuids: Vec<u16>,

    /// Print JSON instead of text
    #[arg(long)]
    pub json: bool,
}

fn parse_uuid16(s: &str) -> Result<u16, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u16::from_str_radix(digits, 16).map_err(|_| format!("invalid 16-bit UUID '{}'", s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_no_subcommand_defaults_to_run() {
        let cli = Cli::try_parse_from(["blemux"]).unwrap();
        assert!(cli.command.is_none());
        assert!(!cli.verbose);
    }

    #[test]
    fn test_run_flags() {
        let cli = Cli::try_parse_from([
            "blemux",
            "run",
            "--simulate",
            "--dwell-ms",
            "250",
            "--rounds",
            "6",
            "--events",
            "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Some(Command::Run(args)) => {
                assert!(args.simulate);
                assert!(args.events);
                assert_eq!(args.dwell_ms, Some(250));
                assert_eq!(args.rounds, Some(6));
            }
            other => panic!("expected run, got {:?}", other),
        }
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        assert!(Cli::try_parse_from(["blemux", "check", "-v", "-q"]).is_err());
    }

    #[test]
    fn test_payload_uuids() {
        let cli =
            Cli::try_parse_from(["blemux", "payload", "Heart Rate", "-u", "180D,0x180f"]).unwrap();
        match cli.command {
            Some(Command::Payload(args)) => {
                assert_eq!(args.name, "Heart Rate");
                assert_eq!(args.uuids, vec![0x180D, 0x180F]);
            }
            other => panic!("expected payload, got {:?}", other),
        }
    }

    #[test]
    fn test_init_with_config_path() {
        let cli = Cli::try_parse_from(["blemux", "init", "--force", "-c", "/tmp/blemux.toml"])
            .unwrap();
        assert!(matches!(cli.command, Some(Command::Init { force: true })));
        assert_eq!(cli.config.unwrap(), PathBuf::from("/tmp/blemux.toml"));
    }

    #[test]
    fn test_invalid_uuid_rejected() {
        assert!(Cli::try_parse_from(["blemux", "payload", "x", "--uuid", "12345"]).is_err());
        assert_eq!(parse_uuid16("0XFEAA"), Ok(0xFEAA));
    }
}
