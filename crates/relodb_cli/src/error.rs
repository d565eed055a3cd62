//! CLI errors.

use std::path::PathBuf;

use relodb_repl::ReplError;
use thiserror::Error;

/// Errors reported by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// The scenario file could not be read.
    #[error("cannot read {path:?}: {source}")]
    Read {
        /// File that was read.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The scenario file is not valid scenario JSON.
    #[error("invalid scenario {path:?}: {source}")]
    Parse {
        /// File that was parsed.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },

    /// Scenario content the oplog model rejects, such as a namespace that
    /// is not `database.collection` shaped or a document without `_id`.
    #[error("invalid scenario content: {0}")]
    Oplog(#[from] relodb_oplog::OplogError),

    /// The replication engine failed.
    #[error(transparent)]
    Repl(#[from] ReplError),

    /// The async runtime could not be started.
    #[error("cannot start runtime: {0}")]
    Runtime(std::io::Error),

    /// Output could not be rendered.
    #[error("cannot render output: {0}")]
    Render(serde_json::Error),

    /// Unknown `--format` value.
    #[error("unknown output format '{0}' (expected text or json)")]
    Format(String),

    /// The replay did not end the way the scenario expects.
    #[error("scenario '{name}' failed: {reason}")]
    Failed {
        /// Scenario name.
        name: String,
        /// What differed.
        reason: String,
    },
}

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;
