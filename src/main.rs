//! # Casefile CLI (`cf`)
//!
//! ## Usage
//!
//! ```bash
//! cf --config ./config/cf.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cf init` | Create the SQLite database and run schema migrations |
//! | `cf sync` | Pull message ids and metadata from the mailbox |
//! | `cf clusters` | Show messages grouped by correspondent domain |
//! | `cf casefile create\|expand\|list\|show` | Manage casefiles |
//! | `cf enrich <id>` | Fetch, clean, and chunk the bodies of a casefile |
//! | `cf embed <id>` | Embed the chunks of a casefile |
//! | `cf status [<id>]` | Pipeline overview or casefile readiness |
//! | `cf ask <id> "<query>"` | Cited answer scoped to one casefile |
//! | `cf serve` | Start the HTTP API |
//!
//! ## Example
//!
//! ```bash
//! cf init
//! cf sync
//! cf clusters
//! cf casefile create --cluster landlord.example
//! cf enrich <casefile_id>
//! cf embed <casefile_id>
//! cf ask <casefile_id> "When does the lease end?"
//! ```
//!
//! Logging goes to stderr and is controlled by `RUST_LOG`
//! (default `casefile=info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use casefile::{casefile as casefiles, cluster, config, embed_cmd, enrich, ingest, migrate};
use casefile::{retrieve, server, status};

/// Casefile: incremental mail ingestion, casefile scoping, and cited
/// retrieval over an email archive.
#[derive(Parser)]
#[command(name = "cf", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/cf.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Ingest message ids and metadata from the configured mailbox.
    ///
    /// Incremental by default: resumes an interrupted listing from its
    /// checkpoint, otherwise lists messages newer than the last run.
    Sync {
        /// Ignore the checkpoint and list the whole mailbox.
        #[arg(long)]
        full: bool,

        /// Stop after this many listed messages.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show clusters: messages grouped by sender domain, then thread.
    Clusters,

    /// Create, expand, and inspect casefiles.
    Casefile {
        #[command(subcommand)]
        action: CasefileAction,
    },

    /// Fetch, clean, and chunk the bodies of a casefile's messages.
    Enrich {
        casefile_id: String,

        /// Re-fetch processed bodies and re-process those that changed.
        #[arg(long)]
        refresh: bool,
    },

    /// Embed a casefile's chunks. Unchanged chunks are skipped.
    Embed {
        casefile_id: String,

        /// Replace records produced under a different model version.
        #[arg(long)]
        reindex: bool,
    },

    /// Pipeline overview, or readiness of one casefile.
    Status { casefile_id: Option<String> },

    /// Ask a question scoped to one casefile.
    Ask {
        casefile_id: String,
        query: String,

        /// Number of chunks to retrieve.
        #[arg(long)]
        k: Option<usize>,
    },

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum CasefileAction {
    /// Create a casefile from a cluster or from explicit message ids.
    Create {
        /// Sender domain of the cluster to convert.
        #[arg(long, conflicts_with = "message")]
        cluster: Option<String>,

        /// Member message id (repeatable).
        #[arg(long, required_unless_present = "cluster")]
        message: Vec<String>,

        #[arg(long)]
        name: Option<String>,
    },
    /// Derive a new casefile version with additional members.
    Expand {
        casefile_id: String,

        /// Message id to add (repeatable).
        #[arg(long, required = true)]
        message: Vec<String>,
    },
    /// List casefiles, newest first.
    List,
    /// Show a casefile and its members.
    Show { casefile_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("casefile=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sync { full, limit } => {
            ingest::run_sync(&cfg, full, limit).await?;
        }
        Commands::Clusters => {
            cluster::run_clusters(&cfg).await?;
        }
        Commands::Casefile { action } => match action {
            CasefileAction::Create {
                cluster,
                message,
                name,
            } => {
                casefiles::run_create(&cfg, name.as_deref(), cluster.as_deref(), &message).await?;
            }
            CasefileAction::Expand {
                casefile_id,
                message,
            } => {
                casefiles::run_expand(&cfg, &casefile_id, &message).await?;
            }
            CasefileAction::List => {
                casefiles::run_list(&cfg).await?;
            }
            CasefileAction::Show { casefile_id } => {
                casefiles::run_show(&cfg, &casefile_id).await?;
            }
        },
        Commands::Enrich {
            casefile_id,
            refresh,
        } => {
            enrich::run_enrich(&cfg, &casefile_id, refresh).await?;
        }
        Commands::Embed {
            casefile_id,
            reindex,
        } => {
            embed_cmd::run_embed(&cfg, &casefile_id, reindex).await?;
        }
        Commands::Status { casefile_id } => {
            status::run_status(&cfg, casefile_id.as_deref()).await?;
        }
        Commands::Ask {
            casefile_id,
            query,
            k,
        } => {
            retrieve::run_ask(&cfg, &casefile_id, &query, k).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
