use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "bibsync")]
#[command(about = "Keep a local replica of bibliographic libraries in sync")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// CLI profile name holding API credentials
    #[arg(long, global = true, value_name = "NAME")]
    pub profile: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Synchronize local libraries with the server
    Sync {
        /// Pull every object again, letting the server copy win
        #[arg(long)]
        full: bool,
        /// Restrict the run to these libraries (`u` or `g<id>`)
        #[arg(short, long = "library", value_name = "LIBRARY")]
        libraries: Vec<String>,
        /// Keep running: sync on local changes and on the background interval
        #[arg(long)]
        watch: bool,
        /// Output the outcome as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show libraries, versions and pending local changes
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect and resolve queued sync conflicts
    Conflicts {
        #[command(subcommand)]
        command: ConflictCommands,
    },
    /// Import a file as an attachment and start its upload
    Upload {
        /// File to import (copied into the attachment store)
        path: PathBuf,
        /// Target library (`u` or `g<id>`)
        #[arg(short, long, default_value = "u")]
        library: String,
        /// Key of the parent item
        #[arg(long, value_name = "KEY")]
        parent: Option<String>,
    },
    /// Work the background transfer queue
    Transfers {
        #[command(subcommand)]
        command: TransferCommands,
    },
    /// Configure CLI profiles
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum TransferStateFilter {
    Pending,
    InFlight,
    Succeeded,
    Failed,
}

#[derive(Subcommand)]
pub enum ConflictCommands {
    /// List queued conflicts
    List {
        /// Restrict to one library (`u` or `g<id>`)
        #[arg(short, long)]
        library: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve one conflict
    Resolve {
        /// Conflict id
        id: String,
        /// `local` keeps local edits, `remote` accepts the server copy
        #[arg(value_name = "local|remote")]
        resolution: String,
    },
}

#[derive(Subcommand)]
pub enum TransferCommands {
    /// Upload pending transfers in this process
    Run {
        /// Maximum sessions to claim
        #[arg(short, long, default_value = "10")]
        limit: u32,
    },
    /// Register finished transfers (one session, or every completed one)
    Finalize {
        /// Session id; all completed sessions when omitted
        id: Option<String>,
    },
    /// List transfer sessions
    List {
        /// Filter by state
        #[arg(long, value_enum)]
        state: Option<TransferStateFilter>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the resolved profile (API key redacted)
    Show,
    /// Initialize or update a profile
    Init {
        /// Profile name to initialize
        #[arg(long, value_name = "NAME")]
        profile: Option<String>,
        /// API base URL
        #[arg(long, value_name = "URL")]
        api_base_url: Option<String>,
        /// API key
        #[arg(long, value_name = "KEY")]
        api_key: Option<String>,
        /// Numeric user id
        #[arg(long, value_name = "ID")]
        user_id: Option<i64>,
        /// Root directory for attachment files
        #[arg(long, value_name = "PATH")]
        attachments_dir: Option<PathBuf>,
        /// Background sync interval in seconds
        #[arg(long, value_name = "SECS")]
        background_interval: Option<u64>,
        /// Keep current active profile instead of activating this one
        #[arg(long)]
        no_activate: bool,
    },
}
