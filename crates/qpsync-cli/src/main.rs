use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use qpsync_core::IdentitySource;
use qpsync_sync::{SyncConfig, SyncPipeline};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "qpsync")]
#[command(about = "Incrementally load QuestionPro survey responses into PostgreSQL")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Load variables from this file instead of `./.env`.
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Override QP_IDENTITY_SOURCE (`timestamp` or `response_id`).
    #[arg(long, global = true)]
    identity: Option<IdentitySource>,

    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Extract, flatten, and append new responses to the destination table.
    Sync,
    /// Fetch all responses and archive the raw JSON.
    Extract,
    /// Fetch and flatten all responses into a Parquet snapshot.
    Export {
        #[arg(long, default_value = "./export")]
        out: PathBuf,
    },
    /// Connect to the database and list the destination table's columns.
    CheckDb,
}

fn init_tracing(quiet: bool, verbose: bool) -> Result<()> {
    let level = if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let filter = tracing_subscriber::EnvFilter::try_from_env("QPSYNC_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))
}

fn load_env_file(path: Option<&PathBuf>) -> Result<()> {
    match path {
        Some(path) => {
            dotenvy::from_path(path).with_context(|| format!("loading {}", path.display()))?;
        }
        None => {
            let _ = dotenvy::dotenv();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.quiet, cli.verbose)?;
    load_env_file(cli.env_file.as_ref())?;

    let mut config = SyncConfig::from_env().context("reading configuration")?;
    if let Some(identity) = cli.identity {
        config.identity = identity;
    }
    info!(survey_id = %config.survey_id, identity = %config.identity, "configuration loaded");
    let pipeline = SyncPipeline::new(config)?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            println!("{}", pipeline.run_once().await?.headline());
        }
        Commands::Extract => {
            println!("{}", pipeline.archive_raw().await?.headline());
        }
        Commands::Export { out } => {
            println!("{}", pipeline.export_parquet(&out).await?.headline());
        }
        Commands::CheckDb => {
            let columns = pipeline.inspect_table().await?;
            println!(
                "table {}: {} column(s)",
                pipeline.config().db.table_name,
                columns.len()
            );
            for column in columns {
                println!(
                    "  {} {}.{}",
                    column.name, column.data_type.schema, column.data_type.name
                );
            }
        }
    }

    Ok(())
}
