//! shopsync CLI - inspect and drive the offline sync store from a terminal

mod cli;
mod commands;
mod error;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::commands::cache::run_cache;
use crate::commands::common::{open_session, resolve_config_path, resolve_db_path};
use crate::commands::conflicts::{run_conflicts, run_resolve};
use crate::commands::entity::{run_create, run_delete, run_get, run_list, run_update};
use crate::commands::operations::{run_failed, run_retry};
use crate::commands::sync::{run_stats, run_sync};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("shopsync=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);
    let config_path = resolve_config_path(cli.config);
    let session = open_session(&db_path, &config_path)?;

    match cli.command {
        Commands::Create {
            entity_type,
            id,
            data,
        } => run_create(&session, &entity_type, id.as_deref(), &data)?,
        Commands::Update {
            entity_type,
            id,
            data,
        } => run_update(&session, &entity_type, &id, &data)?,
        Commands::Delete { entity_type, id } => run_delete(&session, &entity_type, &id)?,
        Commands::Get {
            entity_type,
            id,
            json,
        } => run_get(&session, &entity_type, &id, json)?,
        Commands::List { entity_type, json } => run_list(&session, &entity_type, json)?,
        Commands::Stats { json } => run_stats(&session, json)?,
        Commands::Conflicts { json } => run_conflicts(&session, json)?,
        Commands::Resolve {
            conflict_id,
            choice,
            data,
        } => run_resolve(&session, &conflict_id, choice, data.as_deref())?,
        Commands::Failed { json } => run_failed(&session, json)?,
        Commands::Retry { op_id } => run_retry(&session, &op_id)?,
        Commands::Sync { watch, json } => run_sync(&session, watch, json).await?,
        Commands::Cache { command } => run_cache(&session, command)?,
    }

    Ok(())
}
