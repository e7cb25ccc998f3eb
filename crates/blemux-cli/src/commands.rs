//! Subcommand implementations.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use blemux_core::{BoxedController, Cycler, EventReceiver, MockController, event_channel};
use blemux_types::payload::hex;
use blemux_types::{BuiltPayload, Identity};

use crate::cli::{PayloadArgs, RunArgs};
use crate::config::{Config, ControllerConfig, Transport};

/// Cycle through the configured roster until interrupted or `--rounds` is reached.
pub async fn run(mut config: Config, args: RunArgs) -> Result<()> {
    if args.simulate {
        config.controller.transport = Transport::Simulated;
    }
    if let Some(device) = args.device {
        config.controller.device = device;
    }
    if let Some(dwell_ms) = args.dwell_ms {
        if dwell_ms == 0 && args.rounds.is_none() {
            bail!("--dwell-ms 0 is only allowed together with --rounds");
        }
        config.advertising.dwell_ms = dwell_ms;
    }

    let roster = config.roster()?;
    for identity in &roster {
        if !identity.address().is_static_random() {
            warn!(
                "{} is not a static random address; scanners may not treat {} as a fixed device",
                identity.address(),
                identity.name()
            );
        }
    }

    let controller = open_controller(&config.controller)?;

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("Shutdown requested, stopping advertising");
        signal_token.cancel();
    });

    let (events_tx, events_rx) = event_channel(64);
    let printer = args.events.then(|| tokio::spawn(print_events(events_rx)));

    let mut cycler = Cycler::new(controller, roster, config.cycler_config())
        .with_cancellation(token)
        .with_events(events_tx);

    let result = match args.rounds {
        Some(steps) => cycler.run_rounds(steps).await,
        None => cycler.run().await,
    };

    // Dropping the cycler closes the event channel
    drop(cycler);
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    result.context("advertising cycle failed")
}

/// Validate the configuration and print each identity's payload.
pub fn check(config: &Config) -> Result<()> {
    config.validate()?;
    let roster = config.roster()?;
    let builder = config.advertising.payload_builder();
    let params = config.advertising.parameters();

    println!(
        "Controller: {} (device hci{}, command timeout {} ms)",
        match config.controller.transport {
            Transport::Hci => "hci",
            Transport::Simulated => "simulated",
        },
        config.controller.device,
        config.controller.command_timeout_ms
    );
    println!(
        "Advertising: dwell {} ms, interval 0x{:04X}-0x{:04X}, name budget {} bytes",
        config.advertising.dwell_ms,
        params.interval_min,
        params.interval_max,
        builder.name_budget()
    );
    println!("Identities: {}", roster.len());

    for (index, identity) in roster.iter().enumerate() {
        let built = builder.build(identity)?;
        println!("{}", describe_identity(index, identity, &built));
    }

    Ok(())
}

/// Print the payload for an ad-hoc name using the configured layout.
pub fn payload(config: &Config, args: &PayloadArgs) -> Result<()> {
    let builder = config
        .advertising
        .payload_builder()
        .service_uuids(args.uuids.iter().copied());
    let built = builder
        .build_name(&args.name)
        .with_context(|| format!("cannot build a payload for '{}'", args.name))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&PayloadReport::new(&args.name, &built))?);
    } else {
        print!("{}", describe_payload(&args.name, &built));
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct PayloadReport<'a> {
    name: &'a str,
    hex: String,
    len: usize,
    name_len: usize,
    truncated: bool,
}

impl<'a> PayloadReport<'a> {
    fn new(name: &'a str, built: &BuiltPayload) -> Self {
        Self {
            name,
            hex: hex(built.payload.as_bytes()),
            len: built.payload.len(),
            name_len: built.name_len,
            truncated: built.truncated,
        }
    }
}

/// One line per identity: index, name, address, payload.
fn describe_identity(index: usize, identity: &Identity, built: &BuiltPayload) -> String {
    let mut line = format!(
        "[{}] {} {} len {} {}",
        index,
        identity.name(),
        identity.address(),
        built.payload.len(),
        hex(built.payload.as_bytes())
    );
    if built.truncated {
        let _ = write!(
            line,
            " (name truncated to {} of {} bytes)",
            built.name_len,
            identity.name().len()
        );
    }
    if !identity.address().is_static_random() {
        line.push_str(" (not a static random address)");
    }
    line
}

/// Multi-line breakdown of a payload's AD structures.
fn describe_payload(name: &str, built: &BuiltPayload) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Payload: {}", hex(built.payload.as_bytes()));
    let _ = writeln!(out, "Length:  {} of 31 bytes", built.payload.len());
    if let Ok(blocks) = built.payload.blocks() {
        for block in blocks {
            let _ = writeln!(
                out,
                "  type 0x{:02X} len {:>2} {}",
                block.ad_type,
                block.data.len(),
                hex(&block.data)
            );
        }
    }
    if built.truncated {
        let _ = writeln!(
            out,
            "Name truncated to {} of {} bytes",
            built.name_len,
            name.len()
        );
    }
    out
}

/// Write the reference configuration to `path`.
pub fn init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    Config::default().save(path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn open_controller(config: &ControllerConfig) -> Result<BoxedController> {
    match config.transport {
        Transport::Simulated => {
            info!("Using simulated controller");
            Ok(Box::new(
                MockController::new().named("simulated").keep_calls(false),
            ))
        }
        Transport::Hci => open_hci(config),
    }
}

#[cfg(target_os = "linux")]
fn open_hci(config: &ControllerConfig) -> Result<BoxedController> {
    let controller = blemux_core::HciController::open(config.device)
        .with_context(|| format!("failed to open hci{}", config.device))?
        .command_timeout(config.command_timeout());
    info!("Opened hci{}", config.device);
    Ok(Box::new(controller))
}

#[cfg(not(target_os = "linux"))]
fn open_hci(_config: &ControllerConfig) -> Result<BoxedController> {
    bail!("the HCI transport is only available on Linux; use --simulate")
}

async fn print_events(mut events: EventReceiver) {
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Failed to serialize event: {}", e),
            },
            Err(RecvError::Lagged(n)) => warn!("Event output lagged, {} events dropped", n),
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use blemux_types::{Address, PayloadBuilder};

    fn simulated(rounds: usize) -> RunArgs {
        RunArgs {
            simulate: true,
            dwell_ms: Some(0),
            rounds: Some(rounds),
            ..Default::default()
        }
    }

    #[test]
    fn test_describe_identity() {
        let identity = Identity::new("DISP_01", Address::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01]))
            .unwrap();
        let built = PayloadBuilder::new().build(&identity).unwrap();
        assert_eq!(
            describe_identity(0, &identity, &built),
            "[0] DISP_01 AA:BB:CC:DD:EE:01 len 12 0201060809444953505F3031 \
             (not a static random address)"
        );
    }

    #[test]
    fn test_describe_truncated_payload() {
        let name = "x".repeat(30);
        let built = PayloadBuilder::new().build_name(&name).unwrap();
        let text = describe_payload(&name, &built);
        assert!(text.contains("Length:  31 of 31 bytes"));
        assert!(text.contains("  type 0x01 len  1 06"));
        assert!(text.contains("  type 0x09 len 26 "));
        assert!(text.ends_with("Name truncated to 26 of 30 bytes\n"));
    }

    #[test]
    fn test_payload_report_json() {
        let built = PayloadBuilder::new().build_name("A").unwrap();
        let json = serde_json::to_value(PayloadReport::new("A", &built)).unwrap();
        assert_eq!(json["hex"], "020106020941");
        assert_eq!(json["len"], 6);
        assert_eq!(json["truncated"], false);
    }

    #[test]
    fn test_check_default_config() {
        check(&Config::default()).unwrap();
    }

    #[test]
    fn test_check_rejects_invalid_config() {
        let mut config = Config::default();
        config.identities.clear();
        assert!(check(&config).is_err());
    }

    #[test]
    fn test_init_writes_loadable_config() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("blemux").join("config.toml");

        init(&path, false).unwrap();
        assert_eq!(Config::load(&path).unwrap(), Config::default());

        assert!(init(&path, false).is_err());
        init(&path, true).unwrap();
    }

    #[tokio::test]
    async fn test_run_simulated_rounds() {
        run(Config::default(), simulated(6)).await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_dwell_requires_rounds() {
        let args = RunArgs {
            rounds: None,
            ..simulated(0)
        };
        let err = run(Config::default(), args).await.unwrap_err();
        assert!(err.to_string().contains("--rounds"));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_missing_hci_device_fails() {
        let args = RunArgs {
            simulate: false,
            device: Some(0xFFFE),
            ..simulated(1)
        };
        let err = run(Config::default(), args).await.unwrap_err();
        assert!(err.to_string().contains("hci65534"));
    }
}
