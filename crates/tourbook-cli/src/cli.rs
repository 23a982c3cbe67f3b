use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tourbook_core::Resolution;

#[derive(Parser)]
#[command(name = "tourbook")]
#[command(about = "Work with Tourbook records offline and sync when connected")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Optional path to the local replica file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Select or inspect the current workspace
    #[command(subcommand)]
    Workspace(WorkspaceCommand),
    /// Create or update a record from a JSON object (`-` reads stdin)
    Put {
        /// Entity type, e.g. `orders`
        entity: String,
        /// JSON payload
        payload: String,
        /// Update this record instead of creating one
        #[arg(long)]
        id: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one record
    Get {
        entity: String,
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List records of one entity type
    List {
        entity: String,
        /// Number of records to show
        #[arg(short, long)]
        limit: Option<usize>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a record
    #[command(alias = "delete")]
    Rm { entity: String, id: String },
    /// Show pending work, conflicts and recent sync errors
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Push pending writes and pull remote changes now
    Sync {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List records in conflict
    Conflicts {
        /// Only this entity type
        #[arg(long)]
        entity: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve a conflict by keeping one side
    Resolve {
        entity: String,
        id: String,
        #[arg(long, value_enum)]
        keep: KeepSide,
    },
}

#[derive(Subcommand)]
pub enum WorkspaceCommand {
    /// Switch to a workspace, registering it if needed
    Use {
        id: String,
        /// Short display code (defaults to the id)
        #[arg(long)]
        code: Option<String>,
    },
    /// List known workspaces
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the current workspace
    Current,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum KeepSide {
    Local,
    Remote,
}

impl From<KeepSide> for Resolution {
    fn from(side: KeepSide) -> Self {
        match side {
            KeepSide::Local => Self::KeepLocal,
            KeepSide::Remote => Self::KeepRemote,
        }
    }
}
