//! interp-relay: live speech interpretation relay
//!
//! ```bash
//! # Serve with the default config file
//! interp-relay serve
//!
//! # Override the bind address
//! interp-relay --config relay.toml serve --host 0.0.0.0 --port 9000
//!
//! # Show the resolved configuration with secrets masked
//! interp-relay check-config
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use interp_relay::config::{default_config_path, Config};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "interp-relay")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Config file path
    #[arg(short, long, global = true, env = "INTERP_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter, e.g. `info` or `interp_relay=debug` (RUST_LOG wins when set)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay gateway
    Serve {
        /// Bind address (defaults to gateway.host)
        #[arg(long)]
        host: Option<String>,

        /// Bind port (defaults to gateway.port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Load and validate the configuration, then print it
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .init();

    let path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = Config::load(Some(&path))?;

    match cli.command {
        Commands::Serve { host, port } => {
            let host = host.unwrap_or_else(|| config.gateway.host.clone());
            let port = port.unwrap_or(config.gateway.port);
            interp_relay::gateway::run_gateway(&host, port, config).await
        }
        Commands::CheckConfig => {
            println!("# {}", path.display());
            print!("{}", toml::to_string_pretty(&config.redacted())?);
            Ok(())
        }
    }
}
