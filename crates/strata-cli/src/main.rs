//! # Strata CLI
//!
//! Command-line interface for the Strata indexing engine.
//!
//! ## Commands
//!
//! - `strata index <root>` - Build or refresh the catalog index
//! - `strata query <pattern>` - Look up indexed files by key pattern
//! - `strata status` - Show registry, index and mode status
//! - `strata watch <root>` - Track changes and reindex incrementally
//! - `strata clear` - Delete all stored index data
//!
//! ## Example Usage
//!
//! ```bash
//! # Index the current project
//! strata index .
//!
//! # Find indexed Rust sources
//! strata query 'src/**/*.rs'
//!
//! # Keep the index fresh while editing
//! strata watch .
//! ```

mod app;
mod catalog;
mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Strata - incremental file indexing
#[derive(Parser)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build or refresh the catalog index over a directory tree
    Index {
        /// Workspace root to index
        #[arg(default_value = ".")]
        root: PathBuf,

        /// Wipe the stored data and rebuild from scratch
        #[arg(short, long)]
        force: bool,
    },

    /// Look up indexed files whose keys match a glob pattern
    Query {
        /// Key pattern (e.g. "src/**/*.rs")
        pattern: String,

        /// Workspace root the index was built over
        #[arg(short, long, default_value = ".")]
        root: PathBuf,

        /// Maximum number of results to show
        #[arg(short, long, default_value = "100")]
        limit: usize,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        output: OutputFormat,
    },

    /// Show registry, index and mode status
    Status {
        /// Workspace root the index was built over
        #[arg(default_value = ".")]
        root: PathBuf,
    },

    /// Watch a directory tree and reindex incrementally on changes
    Watch {
        /// Workspace root to watch
        #[arg(default_value = ".")]
        root: PathBuf,
    },

    /// Clear all stored index data
    Clear {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Clone, Debug, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .init();

    // Load configuration
    let config = match &cli.config {
        Some(path) => strata_core::Config::load_from(path)?,
        None => strata_core::Config::load()?,
    };

    // Execute command
    match cli.command {
        Commands::Index { root, force } => commands::index::run(config, &root, force),
        Commands::Query {
            pattern,
            root,
            limit,
            output,
        } => commands::query::run(config, &root, &pattern, limit, output),
        Commands::Status { root } => commands::status::run(config, &root),
        Commands::Watch { root } => commands::watch::run(config, &root),
        Commands::Clear { yes } => commands::clear::run(config, yes),
    }
}
