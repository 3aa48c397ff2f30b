use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use shopsync_core::ManualChoice;

#[derive(Parser)]
#[command(name = "shopsync")]
#[command(about = "Inspect and drive the offline sync store of a workshop client")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Optional path to the sync settings JSON file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create an entity locally and queue it for the remote
    #[command(alias = "new")]
    Create {
        /// Entity type, e.g. customer or service_order
        entity_type: String,
        /// Entity ID (generated when omitted)
        #[arg(long)]
        id: Option<String>,
        /// JSON object with the entity fields
        #[arg(long, default_value = "{}")]
        data: String,
    },
    /// Merge fields into an existing entity
    Update {
        entity_type: String,
        id: String,
        /// JSON object with the changed fields
        #[arg(long)]
        data: String,
    },
    /// Delete an entity locally and queue the deletion
    Delete { entity_type: String, id: String },
    /// Show one entity
    Get {
        entity_type: String,
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List entities of one type
    List {
        entity_type: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show sync statistics
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List conflicts waiting for a decision
    Conflicts {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve a conflict by hand
    Resolve {
        /// Conflict ID
        conflict_id: String,
        #[arg(value_enum)]
        choice: ChoiceArg,
        /// JSON payload for `custom`
        #[arg(long)]
        data: Option<String>,
    },
    /// List operations that exhausted their retries
    Failed {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Requeue a failed operation
    Retry {
        /// Operation ID
        op_id: String,
    },
    /// Run a sync pass against the configured remote
    Sync {
        /// Keep syncing on the configured interval until interrupted
        #[arg(long)]
        watch: bool,
        /// Output the pass report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage the key/value response cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand)]
pub enum CacheCommands {
    /// Store a JSON value
    Set {
        key: String,
        /// JSON value
        value: String,
        /// Expire after this many seconds
        #[arg(long, value_name = "SECONDS")]
        ttl: Option<u64>,
    },
    /// Print a cached value
    Get { key: String },
    /// Drop expired entries
    Purge,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ChoiceArg {
    Local,
    Remote,
    Merge,
    Custom,
}

impl From<ChoiceArg> for ManualChoice {
    fn from(value: ChoiceArg) -> Self {
        match value {
            ChoiceArg::Local => Self::Local,
            ChoiceArg::Remote => Self::Remote,
            ChoiceArg::Merge => Self::Merge,
            ChoiceArg::Custom => Self::Custom,
        }
    }
}
