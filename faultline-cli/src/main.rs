//! # faultline
//!
//! Command-line front end for Faultline.
//!
//! ## Commands
//!
//! - `allocate`: Print sequential addresses from a subnet
//! - `proxy`: Run the chaos proxy routes from a config file
//! - `chaos`: Pause/unpause existing containers under a monitored timeout
//!
//! ## Example
//!
//! ```bash
//! # Addresses for three replicas
//! faultline allocate --gateway 10.0.0.1 --subnet 10.0.0.0/16 --count 3
//!
//! # Delay traffic to a local database
//! faultline proxy --config faultline.toml
//!
//! # Pause replicas at random for up to two minutes
//! faultline chaos --config faultline.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::{allocate, chaos, proxy};
use config::Config;

/// Chaos-engineering harness for containerized distributed systems.
#[derive(Parser, Debug)]
#[command(name = "faultline")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print sequential addresses from a subnet, starting after the gateway
    Allocate {
        /// Gateway address (first allocation is gateway + 1)
        #[arg(long)]
        gateway: String,

        /// Subnet in CIDR notation
        #[arg(long)]
        subnet: String,

        /// Number of addresses to print
        #[arg(long, short, default_value = "1")]
        count: u32,
    },

    /// Run the chaos proxy routes from a config file until Ctrl-C
    Proxy {
        /// Configuration file
        #[arg(long, short, default_value = "faultline.toml")]
        config: PathBuf,
    },

    /// Pause/unpause existing containers under a monitored timeout
    Chaos {
        /// Configuration file
        #[arg(long, short, default_value = "faultline.toml")]
        config: PathBuf,

        /// Seed for reproducible pause schedules
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Allocate {
            gateway,
            subnet,
            count,
        } => {
            init_tracing("warn");
            allocate::run(&gateway, &subnet, count)?;
        }
        Commands::Proxy { config } => {
            let config = load_config(&config)?;
            init_tracing(&config.log_filter);
            proxy::run(&config).await?;
        }
        Commands::Chaos { config, seed } => {
            let config = load_config(&config)?;
            init_tracing(&config.log_filter);
            chaos::run(&config, seed).await?;
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<Config> {
    Config::from_file(path).context("Failed to load configuration")
}

/// Log to stderr, filtered by `RUST_LOG` or else `fallback`.
fn init_tracing(fallback: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
