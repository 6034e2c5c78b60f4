mod latency;
mod service;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::config::Configuration;
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

use crate::service::Service;

#[derive(Parser, Debug)]
#[command(name = "eventbatch")]
#[command(about = "Batches device event inserts and prunes expired events")]
#[command(version)]
struct Cli {
    #[arg(long, global = true, env = "EVENTBATCH_CONFIG", help = "Configuration file path")]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    verbose: bool,

    #[arg(short, long, global = true, help = "Enable quiet mode (minimal output)")]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Default)]
enum Command {
    /// Read JSON-lines records from stdin and run both pipelines (default)
    #[default]
    Start,
    /// Show the effective configuration and exit
    Config {
        #[arg(long, help = "Show configuration in JSON format")]
        json: bool,
    },
    /// Report out-of-range configuration values and exit
    Validate,
}

fn init_logging(cli: &Cli) {
    let level = if cli.quiet {
        "warn"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<Configuration> {
    match path {
        Some(path) => {
            tracing::info!("Loading configuration from: {}", path.display());
            Configuration::load_from_path(path).context("Failed to load configuration")
        }
        None => Configuration::load().context("Failed to load configuration"),
    }
}

fn display_config(config: &Configuration, json: bool) -> Result<()> {
    let rendered = if json {
        serde_json::to_string_pretty(config)
            .context("Failed to serialize configuration to JSON")?
    } else {
        toml::to_string_pretty(config).context("Failed to serialize configuration to TOML")?
    };
    println!("{rendered}");
    Ok(())
}

fn validate_config(config: &Configuration) -> Result<()> {
    let mut config = config.clone();
    let adjustments = config.normalize();

    for adjustment in &adjustments {
        println!(
            "{}: {} is out of range, {} would be used",
            adjustment.field, adjustment.given, adjustment.used
        );
    }

    if !adjustments.is_empty() {
        anyhow::bail!("{} configuration value(s) out of range", adjustments.len());
    }
    println!("Configuration is valid");
    Ok(())
}

/// Wait for SIGINT or SIGTERM (Ctrl+C elsewhere).
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => tracing::info!("Received SIGINT"),
            _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        tracing::info!("Received Ctrl+C");
    }

    Ok(())
}

async fn start(config: Configuration) -> Result<()> {
    let service = Service::new(config)?;
    tracing::info!("Starting eventbatch service");

    let shutdown = async {
        if let Err(e) = wait_for_shutdown_signal().await {
            tracing::error!(error = %e, "Signal handling failed, running until input closes");
            std::future::pending::<()>().await;
        }
    };

    service
        .run(BufReader::new(tokio::io::stdin()), shutdown)
        .await?;

    tracing::info!(
        records = service.store().len().await,
        "eventbatch service stopped"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let config = load_config(cli.config.as_ref())?;

    match cli.command.clone().unwrap_or_default() {
        Command::Start => start(config).await,
        Command::Config { json } => display_config(&config, json),
        Command::Validate => validate_config(&config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_start_is_the_default_command() {
        let cli = Cli::parse_from(["eventbatch", "--verbose"]);
        assert!(cli.verbose);
        assert!(matches!(cli.command.unwrap_or_default(), Command::Start));
    }

    #[test]
    fn test_config_subcommand_flags() {
        let cli = Cli::parse_from(["eventbatch", "config", "--json", "--config", "custom.toml"]);
        assert!(matches!(cli.command, Some(Command::Config { json: true })));
        assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));
    }

    #[test]
    fn test_validate_rejects_out_of_range_values() {
        let mut config = Configuration::default();
        assert!(validate_config(&config).is_ok());

        config.insert.parse_workers = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_display_config_renders_both_formats() {
        let config = Configuration::default();
        assert!(display_config(&config, true).is_ok());
        assert!(display_config(&config, false).is_ok());
    }
}
