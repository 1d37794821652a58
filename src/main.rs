//! # greylit CLI
//!
//! Ingests raw search results, runs the processing pipeline, and shows
//! session status and statistics.
//!
//! ## Usage
//!
//! ```bash
//! greylit --config ./config/greylit.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `greylit init` | Create the SQLite database and run schema migrations |
//! | `greylit ingest <session> <file>` | Load a JSON array of raw results |
//! | `greylit process <session>` | Process, deduplicate and finalize a session |
//! | `greylit retry <session>` | Reset a failed session and process it again |
//! | `greylit status <session>` | Show processing status and recent errors |
//! | `greylit stats <session>` | Show session statistics |
//! | `greylit groups <session>` | List duplicate groups |
//! | `greylit merge <group-id>` | Re-pick a group's canonical result |

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use greylit::progress::ProgressMode;
use greylit::{config, ingest, migrate, pipeline, stats};

/// greylit: grey-literature result processing.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/greylit.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "greylit",
    about = "Normalize, enrich and deduplicate grey-literature search results",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/greylit.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run more than once.
    Init,

    /// Load raw results for a search session from a JSON file.
    ///
    /// The file holds a JSON array of `{id?, title, link, snippet?, date?,
    /// has_pdf?}` objects. The search session is created if needed.
    Ingest {
        /// Search session identifier.
        session: String,
        /// Path to the JSON results file.
        file: PathBuf,
        /// Human-readable title for a new search session.
        #[arg(long)]
        title: Option<String>,
    },

    /// Process every unprocessed raw result of a session.
    ///
    /// Runs normalization and metadata extraction in concurrent batches,
    /// then deduplication and statistics. A completed session is left as is.
    Process {
        session: String,
        /// Progress output on stderr. Defaults to `human` on a TTY, else `off`.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Reset a failed session and process it from scratch.
    Retry {
        session: String,
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Show processing status, counters and recent errors.
    Status {
        session: String,
        /// Number of most recent errors to show.
        #[arg(long, default_value_t = 10)]
        errors: usize,
    },

    /// Show session statistics.
    Stats {
        session: String,
        /// Print statistics as JSON on stdout.
        #[arg(long)]
        json: bool,
    },

    /// List the duplicate groups of a session.
    Groups { session: String },

    /// Promote the most complete member of a duplicate group to canonical.
    Merge {
        /// Duplicate group UUID.
        group_id: String,
    },
}

fn init_tracing(config_path: &Path) {
    // RUST_LOG wins; otherwise use the config's filter when it loads.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directive = config::load_config(config_path)
            .map(|c| c.logging.filter)
            .unwrap_or_else(|_| config::LoggingConfig::default().filter);
        EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.config);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            session,
            file,
            title,
        } => {
            ingest::run_ingest(&cfg, &session, &file, title.as_deref()).await?;
        }
        Commands::Process { session, progress } => {
            let mode = progress.unwrap_or_else(ProgressMode::default_for_tty);
            pipeline::run_process(&cfg, &session, mode).await?;
        }
        Commands::Retry { session, progress } => {
            let mode = progress.unwrap_or_else(ProgressMode::default_for_tty);
            pipeline::run_retry(&cfg, &session, mode).await?;
        }
        Commands::Status { session, errors } => {
            stats::run_status(&cfg, &session, errors).await?;
        }
        Commands::Stats { session, json } => {
            stats::run_stats(&cfg, &session, json).await?;
        }
        Commands::Groups { session } => {
            stats::run_groups(&cfg, &session).await?;
        }
        Commands::Merge { group_id } => {
            pipeline::run_merge(&cfg, &group_id).await?;
        }
    }

    Ok(())
}
