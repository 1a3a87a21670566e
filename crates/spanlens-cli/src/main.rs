mod commands;

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "spanlens",
    version,
    about = "Span-level code retrieval with enrichment and freshness gating",
    long_about = "spanlens indexes source spans into a local SQLite store, ranks them with\n\
        fused lexical and vector signals, and refuses to vouch for results when the\n\
        index has drifted from the working tree.\n\n\
        Quick start:\n  \
        spanlens index --embed\n  \
        spanlens status\n  \
        spanlens search \"load config\""
)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Path to an explicit config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Repository root (default: current directory)
    #[arg(short, long, global = true)]
    path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report whether the index can be trusted
    ///
    /// Compares the recorded index state and commit with the current HEAD.
    Status {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Index the repository, one span per file
    Index {
        /// Embed pending spans after indexing
        #[arg(long)]
        embed: bool,

        /// Maximum number of spans to embed
        #[arg(long, default_value = "10000")]
        embed_limit: usize,
    },
    /// Hybrid lexical + vector search
    ///
    /// Example: spanlens search "parse toml config"
    Search {
        query: String,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the enrichment plan as JSON
    Plan {
        /// Maximum number of spans (default: enrichment.batch_limit)
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Drop unparseable lines from the enrichment ledger
    RepairLedger,
    /// Inspect or release a resource lock
    Locks {
        /// Resource name, e.g. "index:/path/to/repo"
        resource: String,

        /// Release the lock on behalf of this task id
        #[arg(long)]
        release: Option<String>,
    },
    /// Attach stored enrichments to a code graph JSON file
    MergeGraph {
        /// Input graph (`{"entities": [...]}`)
        input: PathBuf,

        /// Output file (default: overwrite the input)
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let repo_root = match cli.path {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    let repo_root = std::fs::canonicalize(&repo_root)?;
    let config = spanlens_core::config::Config::load_with_file(Some(&repo_root), cli.config.as_deref())?;
    spanlens_core::logging::init_logging(&spanlens_core::logging::level_for_verbosity(
        &config.logging.level,
        cli.verbose,
    ));

    match cli.command {
        Commands::Status { json } => commands::status::run(&repo_root, &config, json)?,
        Commands::Index { embed, embed_limit } => {
            commands::index::run(&repo_root, config, embed, embed_limit)?
        }
        Commands::Search { query, json } => commands::search::run(&repo_root, config, &query, json)?,
        Commands::Plan { limit } => commands::plan::run(&repo_root, config, limit)?,
        Commands::RepairLedger => commands::ledger::run(&repo_root, &config)?,
        Commands::Locks { resource, release } => {
            commands::locks::run(&repo_root, &config, &resource, release.as_deref())?
        }
        Commands::MergeGraph { input, out } => {
            commands::graph::run(&repo_root, &config, &input, out.as_deref())?
        }
    }

    Ok(())
}
