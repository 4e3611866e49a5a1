//! Session worker CLI
//!
//! Offline tooling for the worker: number resolution, effective configuration
//! and credential storage housekeeping.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use session_worker::config::Config;
use session_worker::numbering::NumberingPlan;
use session_worker::store::{CredentialStore, FileCredentialStore};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Session worker - chat sessions behind a message queue
#[derive(Parser)]
#[command(name = "session-worker")]
#[command(about = "Inspect and maintain a session worker's configuration and storage")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the candidate addresses for a phone number
    Resolve {
        /// Phone number in any format
        number: String,
    },

    /// Print the effective configuration as JSON
    Config,

    /// Stored session credentials
    Sessions {
        #[command(subcommand)]
        command: SessionsCommand,
    },
}

#[derive(Subcommand)]
enum SessionsCommand {
    /// List accounts with stored credentials
    List,

    /// Show storage usage as JSON
    Stats,

    /// Delete credentials not updated for a while
    Cleanup {
        /// Maximum age in days
        #[arg(long, default_value = "7")]
        max_age_days: u64,
    },

    /// Copy one account's credentials into a backup directory
    Backup {
        account_id: i64,
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env().context("invalid configuration")?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Resolve { number } => cmd_resolve(&number),
        Commands::Config => cmd_config(&config),
        Commands::Sessions { command } => {
            let store = FileCredentialStore::new(&config.session_dir);
            match command {
                SessionsCommand::List => cmd_sessions_list(&store).await,
                SessionsCommand::Stats => cmd_sessions_stats(&store),
                SessionsCommand::Cleanup { max_age_days } => {
                    cmd_sessions_cleanup(&store, max_age_days)
                }
                SessionsCommand::Backup { account_id, dir } => {
                    cmd_sessions_backup(&store, account_id, &dir)
                }
            }
        }
    }
}

fn cmd_resolve(number: &str) -> Result<()> {
    for address in NumberingPlan::default().addresses(number) {
        println!("{}", address);
    }
    Ok(())
}

fn cmd_config(config: &Config) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

async fn cmd_sessions_list(store: &FileCredentialStore) -> Result<()> {
    let stored = store.list().await?;
    if stored.is_empty() {
        println!("No stored sessions in {}", store.dir().display());
        return Ok(());
    }

    println!("{:<12} {:<16} UPDATED", "ACCOUNT", "PHONE");
    for creds in stored {
        println!(
            "{:<12} {:<16} {}",
            creds.account_id,
            creds.phone_number,
            creds.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

fn cmd_sessions_stats(store: &FileCredentialStore) -> Result<()> {
    let stats = store.stats()?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn cmd_sessions_cleanup(store: &FileCredentialStore, max_age_days: u64) -> Result<()> {
    let max_age = Duration::from_secs(max_age_days.saturating_mul(SECS_PER_DAY));
    let removed = store.cleanup_older_than(max_age)?;
    info!(removed = removed.len(), max_age_days, "Cleanup complete");

    if removed.is_empty() {
        println!("No sessions older than {} days", max_age_days);
    } else {
        for account_id in &removed {
            println!("Removed account {}", account_id);
        }
    }
    Ok(())
}

fn cmd_sessions_backup(
    store: &FileCredentialStore,
    account_id: i64,
    dir: &std::path::Path,
) -> Result<()> {
    let path = store
        .backup(account_id, dir)
        .with_context(|| format!("backup of account {} failed", account_id))?;
    println!("Backed up account {} to {}", account_id, path.display());
    Ok(())
}
