use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;

use argus::config::AgentConfig;
use argus::crypto::{AuditLog, KeyManager};
use argus::store::{SqliteStore, Store};

#[derive(Parser)]
#[command(name = "argus")]
#[command(version, about = "Adversary-aware autonomous forge agent")]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true, default_value = "argus.toml")]
    pub config: PathBuf,

    /// Path to the persistent store.
    #[arg(long, global = true, default_value = "argus.db")]
    pub store: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the agent (requires a forge adapter; see library docs)
    Run {
        /// Suppress every write to the forge.
        #[arg(long)]
        dry_run: bool,
    },
    /// Validate the configuration file
    Check,
    /// Inspect or verify the audit log
    Audit {
        #[command(subcommand)]
        command: AuditCommands,
    },
    /// Manage the signing identity
    Key {
        #[command(subcommand)]
        command: KeyCommands,
    },
}

#[derive(Subcommand)]
pub enum AuditCommands {
    /// Walk the hash chain and verify every signature
    Verify,
    /// Print the newest entries
    List {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Subcommand)]
pub enum KeyCommands {
    /// Rotate the signing key (previous key stays valid for verification)
    Rotate,
    /// Show the public instance id and key age
    Show,
}

fn open_store(path: &PathBuf) -> Result<Arc<dyn Store>> {
    let store = SqliteStore::new(path)
        .with_context(|| format!("Failed to open store at {}", path.display()))?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { dry_run } => {
            let mut config = AgentConfig::load(&cli.config)?;
            if dry_run {
                config.dry_run = true;
            }
            argus::logging::init(config.log_level);
            // The identity must exist before anything else happens.
            let store = open_store(&cli.store)?;
            let keys = KeyManager::init(store.clone())?;
            eprintln!(
                "{} instance {} ready; no forge adapter is linked into this \
                 binary. Embed argus as a library and pass your adapter to \
                 pipeline::Orchestrator::new to run against a live forge.",
                style("argus:").bold(),
                keys.instance_id()
            );
            std::process::exit(2);
        }
        Commands::Check => {
            let config = AgentConfig::load(&cli.config)?;
            println!(
                "{} {} repo(s), poll {} min, max {} concurrent, prefix {}",
                style("ok:").green().bold(),
                config.repos.len(),
                config.default_poll_interval_minutes,
                config.max_concurrent_issues,
                config.branch_prefix
            );
        }
        Commands::Audit { command } => {
            let store = open_store(&cli.store)?;
            let keys = Arc::new(KeyManager::init(store.clone())?);
            let audit = AuditLog::open(store, keys)?;
            match command {
                AuditCommands::Verify => match audit.verify_chain() {
                    Ok(count) => {
                        println!("{} {} entries verified", style("ok:").green().bold(), count);
                    }
                    Err(err) => {
                        eprintln!("{} {}", style("chain broken:").red().bold(), err);
                        std::process::exit(1);
                    }
                },
                AuditCommands::List { limit } => {
                    let entries = audit.entries()?;
                    for entry in entries.iter().rev().take(limit).rev() {
                        println!(
                            "{} {} {} {} {} {}",
                            style(&entry.id).dim(),
                            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                            entry.action,
                            entry.repo,
                            entry.target,
                            entry.decision
                        );
                    }
                }
            }
        }
        Commands::Key { command } => {
            let store = open_store(&cli.store)?;
            let keys = KeyManager::init(store)?;
            match command {
                KeyCommands::Rotate => {
                    keys.rotate()?;
                    println!(
                        "{} key rotated for instance {}",
                        style("ok:").green().bold(),
                        keys.instance_id()
                    );
                }
                KeyCommands::Show => {
                    println!("instance: {}", keys.instance_id());
                    println!("key age: {} day(s)", keys.key_age()?.num_days());
                    if keys.rotation_recommended()? {
                        println!("{} rotation recommended", style("note:").yellow().bold());
                    }
                }
            }
        }
    }

    Ok(())
}
