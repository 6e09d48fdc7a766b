//! `recall` - store and search agent memories from the command line

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use recall_core::{MemoryRecord, MemoryService, RecallConfig, ServiceResponse};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_ENV: &str = "RECALL_LOG";

#[derive(Parser, Debug)]
#[command(name = "recall", version, about = "Append-only agent memory with semantic search")]
struct Cli {
    /// Config file (defaults to ~/.recall/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Append a memory and index it
    Store {
        content: String,
        #[arg(long = "type", default_value = "note")]
        record_type: String,
        #[arg(long, default_value = "cli")]
        source: String,
        /// Workspace label (defaults to the current directory)
        #[arg(long)]
        workspace: Option<String>,
        /// RFC 3339 timestamp (defaults to now)
        #[arg(long)]
        timestamp: Option<DateTime<Utc>>,
    },

    /// Find memories similar to a query
    Search {
        query: String,
        #[arg(short, default_value_t = 5)]
        k: usize,
        #[arg(long)]
        workspace: Option<String>,
    },

    /// Bring the index up to date with the log
    Reindex {
        /// Drop the index first and re-embed everything
        #[arg(long)]
        full: bool,
    },

    /// Keep the index in sync until interrupted
    Watch,

    /// Drop entries for workspaces that no longer exist
    Prune,

    /// List indexed workspaces
    Workspaces,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = RecallConfig::load(cli.config.as_deref()).context("Failed to load config")?;
    let service = MemoryService::from_config(&config).context("Failed to open memory store")?;

    match cli.command {
        Command::Store {
            content,
            record_type,
            source,
            workspace,
            timestamp,
        } => {
            let workspace = match workspace {
                Some(ws) => ws,
                None => std::env::current_dir()?.to_string_lossy().to_string(),
            };
            let mut record = MemoryRecord::new(record_type, source, content).with_workspace(workspace);
            if let Some(ts) = timestamp {
                record = record.with_timestamp(ts);
            }
            let response = service.store(record).await?;
            // The process exits right after; let the worker index the record first
            service.flush().await;
            print_response(&response)?;
        }
        Command::Search {
            query,
            k,
            workspace,
        } => {
            let response = service.search(&query, k, workspace.as_deref()).await?;
            print_response(&response)?;
        }
        Command::Reindex { full } => {
            let report = if full {
                service.rebuild().await?
            } else {
                service.reindex_all().await
            };
            println!(
                "indexed {}, unchanged {}, missing {}, failed {}",
                report.indexed,
                report.unchanged,
                report.missing,
                report.failed.len()
            );
            for path in &report.failed {
                println!("  failed: {}", path.display());
            }
            println!("{} entries", service.index().count_entries(None)?);
        }
        Command::Watch => {
            let watcher = service.watcher(config.debounce());
            watcher.start().await?;
            tracing::info!("Watching {} (Ctrl-C to stop)", config.log_root.display());
            tokio::signal::ctrl_c().await?;
            watcher.stop().await;
        }
        Command::Prune => {
            let pruned = service.prune_missing_workspaces()?;
            if pruned.is_empty() {
                println!("Nothing to prune");
            }
            for workspace in pruned {
                println!("pruned {}", workspace);
            }
        }
        Command::Workspaces => {
            for workspace in service.workspaces()? {
                println!("{}", workspace);
            }
        }
    }

    Ok(())
}

fn print_response(response: &ServiceResponse) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(&response.output)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    if response.is_error {
        anyhow::bail!("request failed");
    }
    Ok(())
}
