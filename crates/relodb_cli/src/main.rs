//! relodb CLI
//!
//! Command-line tools for the relodb replication engine.
//!
//! # Commands
//!
//! - `replay` - Replay an oplog scenario file and check the resulting state
//! - `version` - Show version information

mod commands;
mod error;
mod scenario;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use commands::replay::ReplayOptions;

/// relodb command-line replication tools.
#[derive(Parser)]
#[command(name = "relodb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay an oplog scenario into an in-memory replica
    Replay {
        /// Scenario file (JSON)
        scenario: PathBuf,

        /// Apply batches with the concurrent executor
        #[arg(short, long)]
        concurrent: bool,

        /// Worker threads for the concurrent executor
        #[arg(short, long)]
        workers: Option<usize>,

        /// Replay as recovery does: lenient matching, updates as upserts
        #[arg(short, long)]
        reapply: bool,

        /// Largest batch handed to the executor
        #[arg(short, long, default_value = "1000")]
        max_batch_size: usize,

        /// Entries returned per fetch
        #[arg(long, default_value = "100")]
        fetch_size: usize,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Replay {
            scenario,
            concurrent,
            workers,
            reapply,
            max_batch_size,
            fetch_size,
            format,
        } => {
            let options = ReplayOptions {
                concurrent,
                workers,
                reapply,
                max_batch_size,
                fetch_size,
            };
            commands::replay::run(&scenario, &options, &format)?;
        }
        Commands::Version => {
            println!("relodb CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("relodb replication v{}", relodb_repl::VERSION);
        }
    }

    Ok(())
}
