//! Tourbook CLI - work with the local replica and sync it on demand

mod cli;
mod commands;
mod error;

use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, WorkspaceCommand};
use crate::commands::common::resolve_db_path;
use crate::commands::conflicts::{run_conflicts, run_resolve};
use crate::commands::records::{run_get, run_list, run_put, run_rm};
use crate::commands::status::run_status;
use crate::commands::sync::run_sync;
use crate::commands::workspace::{run_workspace_current, run_workspace_list, run_workspace_use};
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
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tourbook=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);

    match cli.command {
        Some(Commands::Workspace(command)) => match command {
            WorkspaceCommand::Use { id, code } => {
                run_workspace_use(&id, code.as_deref(), &db_path).await?;
            }
            WorkspaceCommand::List { json } => run_workspace_list(json, &db_path).await?,
            WorkspaceCommand::Current => run_workspace_current(&db_path).await?,
        },
        Some(Commands::Put {
            entity,
            payload,
            id,
            json,
        }) => run_put(&entity, &payload, id.as_deref(), json, &db_path).await?,
        Some(Commands::Get { entity, id, json }) => run_get(&entity, &id, json, &db_path).await?,
        Some(Commands::List {
            entity,
            limit,
            json,
        }) => run_list(&entity, limit, json, &db_path).await?,
        Some(Commands::Rm { entity, id }) => run_rm(&entity, &id, &db_path).await?,
        Some(Commands::Status { json }) => run_status(json, &db_path).await?,
        Some(Commands::Sync { json }) => run_sync(json, &db_path).await?,
        Some(Commands::Conflicts { entity, json }) => {
            run_conflicts(entity.as_deref(), json, &db_path).await?;
        }
        Some(Commands::Resolve { entity, id, keep }) => {
            run_resolve(&entity, &id, keep.into(), &db_path).await?;
        }
        None => {
            Cli::command().print_help().map_err(CliError::Io)?;
            println!();
        }
    }

    Ok(())
}
