//! ferricd - main binary

use anyhow::Context;
use clap::{Parser, Subcommand};
use ferricd_core::{Config, Error, Server, EXIT_STATUS_SOCKETENGINE};
use std::path::PathBuf;
use tracing::{error, info};

/// A readiness-driven IRC daemon
#[derive(Parser)]
#[command(name = "ferricd")]
#[command(about = "A readiness-driven IRC daemon in Rust")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "ferricd.toml")]
    config: PathBuf,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Validate the configuration and exit
    #[arg(long)]
    test_config: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a default configuration file
    Config {
        /// Output file path
        #[arg(short, long, default_value = "ferricd.toml")]
        output: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    if let Some(Commands::Config { output }) = cli.command {
        let config = Config::default();
        std::fs::write(&output, config.to_toml()?)
            .with_context(|| format!("cannot write {:?}", output))?;
        info!("wrote default configuration to {:?}", output);
        return Ok(());
    }

    let config = if cli.config.exists() {
        info!("loading configuration from {:?}", cli.config);
        Config::from_file(&cli.config)
            .with_context(|| format!("cannot load {:?}", cli.config))?
    } else {
        info!("configuration file not found, using defaults");
        Config::default()
    };

    if cli.test_config {
        config.validate().context("configuration is invalid")?;
        info!("configuration is valid");
        return Ok(());
    }

    let server = match Server::new(config) {
        Ok(server) => server,
        Err(e @ Error::SocketEngine(_)) => {
            // Without a multiplexer there is nothing to run on.
            error!(error = %e, "could not initialize socket engine");
            std::process::exit(EXIT_STATUS_SOCKETENGINE);
        }
        Err(e) => return Err(e).context("could not start server"),
    };
    server.run();
    Ok(())
}

fn init_logging(level: &str) {
    let level = match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };
    tracing_subscriber::fmt().with_max_level(level).init();
}
