mod commands;
mod config;
mod gnupg;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use entropy_sync::{AbortSignal, EXIT_HARD_FAILURE};
use tracing_subscriber::EnvFilter;

use crate::commands::sync::SyncOptions;
use crate::config::FORCE_TIER_ENV;

/// Filter directives for log output, e.g. `ENTROPY_LOG=entropy_sync=debug`.
const LOG_ENV: &str = "ENTROPY_LOG";

#[derive(Parser)]
#[command(name = "entropy-sync")]
#[command(about = "Keep local Entropy repository databases in sync with their mirrors")]
struct Cli {
    /// More log output (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Repository configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Update repository databases from their mirrors
    Sync {
        /// Download even when the local revision matches the remote one
        #[arg(long)]
        force: bool,
        /// Fetch the full database instead of the light one
        #[arg(long)]
        developer: bool,
        /// Only sync this repository (repeatable)
        #[arg(long = "repo", value_name = "ID")]
        repositories: Vec<String>,
    },
    /// Show local revisions and mirror health
    Status,
}

fn init_logging(verbose: u8) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| {
        EnvFilter::new(match verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Sync {
            force,
            developer,
            repositories,
        } => {
            let options = SyncOptions {
                force,
                developer,
                repositories,
                forced_tier: std::env::var(FORCE_TIER_ENV).ok(),
            };

            let abort = AbortSignal::new();
            let on_interrupt = abort.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, stopping after the current step");
                    on_interrupt.interrupt();
                }
            });

            let code = match commands::sync::run(&config, &options, &abort).await {
                Ok(code) => code,
                Err(e) => {
                    eprintln!("error: {e:#}");
                    EXIT_HARD_FAILURE
                }
            };
            Ok(ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX)))
        }
        Command::Status => {
            commands::status::run(&config)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
