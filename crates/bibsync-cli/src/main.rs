//! bibsync CLI - Command-line interface for the bibsync sync engine
//!
//! Runs syncs, inspects conflicts and drives attachment uploads against the
//! local replica.

mod cli;
mod commands;
mod config_profiles;
mod error;

use clap::Parser;
use tracing_subscriber::filter::{Directive, LevelFilter};

use crate::cli::{Cli, Commands, ConflictCommands};
use crate::commands::common::{open_engine, open_store, resolve_db_path};
use crate::commands::completions::run_completions;
use crate::commands::config::run_config;
use crate::commands::conflicts::{run_conflicts_list, run_conflicts_resolve};
use crate::commands::status::run_status;
use crate::commands::sync::run_sync;
use crate::commands::transfers::run_transfers;
use crate::commands::upload::run_upload;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

fn default_directive() -> Directive {
    "bibsync=info"
        .parse()
        .unwrap_or_else(|_| LevelFilter::INFO.into())
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_directive()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let profile = cli.profile.as_deref();

    match cli.command {
        Commands::Completions { shell, output } => run_completions(shell, output.as_deref()),
        Commands::Config { command } => run_config(command, profile),
        Commands::Status { json } => {
            let store = open_store(&resolve_db_path(cli.db_path)?).await?;
            run_status(&store, json).await
        }
        Commands::Conflicts { command } => {
            let store = open_store(&resolve_db_path(cli.db_path)?).await?;
            match command {
                ConflictCommands::List { library, json } => {
                    run_conflicts_list(&store, library.as_deref(), json).await
                }
                ConflictCommands::Resolve { id, resolution } => {
                    run_conflicts_resolve(&store, &id, &resolution).await
                }
            }
        }
        Commands::Sync {
            full,
            libraries,
            watch,
            json,
        } => {
            let engine = open_engine(&resolve_db_path(cli.db_path)?, profile).await?;
            run_sync(engine, full, &libraries, watch, json).await
        }
        Commands::Upload {
            path,
            library,
            parent,
        } => {
            let engine = open_engine(&resolve_db_path(cli.db_path)?, profile).await?;
            run_upload(&engine, &path, &library, parent.as_deref()).await
        }
        Commands::Transfers { command } => {
            let engine = open_engine(&resolve_db_path(cli.db_path)?, profile).await?;
            run_transfers(&engine, command).await
        }
    }
}
