//! batchgridd — the batch grid daemon.
//!
//! Single binary that assembles all subsystems:
//! - Port bus (mailboxes + RPC)
//! - Capacity grid + allocator
//! - Worker pool
//! - Batch planner + dispatcher
//!
//! # Usage
//!
//! ```text
//! batchgridd standalone --config batchgrid.toml
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use batch_core::config::BatchgridConfig;
use batchgridd::Standalone;

#[derive(Parser)]
#[command(name = "batchgridd", about = "BatchGrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run in standalone mode (simulated grid, all subsystems in one process).
    Standalone {
        /// Configuration file; defaults apply when it does not exist.
        #[arg(long, default_value = "batchgrid.toml")]
        config: PathBuf,

        /// Pause between batch cycles, in ms.
        #[arg(long, default_value = "1000")]
        cycle_interval: u64,

        /// Stop after this many cycles (0 = run until interrupted).
        #[arg(long, default_value = "0")]
        cycles: u64,
    },

    /// Print the default configuration as TOML and exit.
    PrintConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,batchgridd=debug,batchgrid=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Standalone { config, cycle_interval, cycles } => {
            run_standalone(config, cycle_interval, cycles).await
        }
        Command::PrintConfig => {
            println!("{}", BatchgridConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

async fn run_standalone(
    config_path: PathBuf,
    cycle_interval: u64,
    cycles: u64,
) -> anyhow::Result<()> {
    info!("batchgrid daemon starting in standalone mode");

    let config = if config_path.exists() {
        info!(path = ?config_path, "loading configuration");
        BatchgridConfig::from_file(&config_path)?
    } else {
        warn!(path = ?config_path, "configuration file missing, using defaults");
        BatchgridConfig::default()
    };
    if config.grid.targets.is_empty() {
        warn!("no targets configured; cycles will be empty");
    }

    let runtime = Standalone::start(config).await?;

    let mut completed = 0u64;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("shutdown signal received");
                break;
            }
            _ = async {
                runtime.run_cycle().await;
                tokio::time::sleep(Duration::from_millis(cycle_interval)).await;
            } => {
                completed += 1;
                if cycles > 0 && completed >= cycles {
                    info!(cycles = completed, "cycle limit reached");
                    break;
                }
            }
        }
    }

    runtime.shutdown().await
}
