use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use hci_bridge::bridge::{Bridge, Mode, ShutdownSignal};
use hci_bridge::config::BridgeConfig;
use hci_bridge::handler::CommandSetKind;
use hci_bridge::{logging, transport};

/// Line on stdin that stops the bridge.
const QUIT_COMMAND: &str = "q!";

#[derive(Debug, Parser)]
#[command(name = "hci-bridge", version, about = "Bridge between an HCI tester and a 2-wire IUT")]
struct Cli {
    /// Configuration file (TOML, or JSON with a .json extension).
    #[arg(short, long, default_value = "bridge.toml")]
    config: PathBuf,

    /// Override the configured forwarding mode.
    #[arg(long, value_enum)]
    mode: Option<Mode>,

    /// Override the configured command set.
    #[arg(long, value_enum)]
    command_set: Option<CommandSetKind>,

    /// Override the configured log level.
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;
    let result = runtime.block_on(run(cli));
    // The stdin reader sits in a blocking read that never returns on its own.
    runtime.shutdown_timeout(Duration::from_millis(100));
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = BridgeConfig::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    if let Some(mode) = cli.mode {
        config.mode = mode;
    }
    if let Some(command_set) = cli.command_set {
        config.command_set = command_set;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    let _logging = logging::init(&config.logging).context("Failed to initialise logging")?;

    let bridge = Bridge::from_config(&config).context("Invalid interception rules")?;
    let tester = transport::open(config.tester_name(), &config.tester.endpoint)
        .await
        .with_context(|| format!("Failed to open tester transport {}", config.tester.endpoint.describe()))?;
    let iut = transport::open(config.iut_name(), &config.iut.endpoint)
        .await
        .with_context(|| format!("Failed to open IUT transport {}", config.iut.endpoint.describe()))?;

    let shutdown = ShutdownSignal::new();
    tokio::spawn(wait_for_stop(shutdown.clone()));
    tracing::info!("Bridge started, enter {} or press Ctrl-C to stop", QUIT_COMMAND);

    let report = bridge.run(tester, iut, shutdown).await;
    tracing::info!(
        commands = report.stats.commands,
        replies = report.stats.replies,
        events = report.stats.events,
        intercepted = report.stats.intercepted,
        malformed = report.stats.malformed,
        rejected = report.stats.rejected,
        expired = report.stats.expired,
        "Session summary"
    );

    if !report.is_clean() {
        let failures: Vec<String> = report.failures.iter().map(ToString::to_string).collect();
        bail!("bridge stopped on error: {}", failures.join("; "));
    }
    Ok(())
}

/// Trigger `shutdown` on Ctrl-C or a quit line on stdin.
async fn wait_for_stop(shutdown: ShutdownSignal) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut signals = true;

    while stdin_open || signals {
        tokio::select! {
            result = tokio::signal::ctrl_c(), if signals => match result {
                Ok(()) => {
                    tracing::info!("Interrupted");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Cannot listen for Ctrl-C");
                    signals = false;
                }
            },
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim() == QUIT_COMMAND => {
                    tracing::info!("Quit requested");
                    break;
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => stdin_open = false,
            },
        }
    }
    if !stdin_open && !signals {
        return;
    }

    shutdown.trigger();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_parse() {
        let cli = Cli::try_parse_from(["hci-bridge", "--mode", "synchronous", "--command-set", "rf"]).unwrap();

        assert_eq!(cli.config, PathBuf::from("bridge.toml"));
        assert_eq!(cli.mode, Some(Mode::Synchronous));
        assert_eq!(cli.command_set, Some(CommandSetKind::Rf));
        assert!(cli.log_level.is_none());
    }

    #[test]
    fn test_unknown_command_set_rejected() {
        assert!(Cli::try_parse_from(["hci-bridge", "--command-set", "zigbee"]).is_err());
    }
}
