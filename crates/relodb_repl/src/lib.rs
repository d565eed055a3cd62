//! # relodb replication
//!
//! Oplog replication engine for relodb.
//!
//! This crate provides:
//! - `CheckpointStore` for the durable last-applied position
//! - `OplogApplier`, the fetch → filter → accumulate → execute pipeline
//! - `BatchAnalyzer` for folding raw entries into idempotent namespace jobs
//! - Sequential and concurrent batch executors over a `DocumentStore`
//! - `RecoveryService` for initial sync from a sync source
//! - In-memory stores, fetchers and remotes for tests and tooling
//!
//! Storage, topology and remote access are reached through traits; the
//! engine itself performs no network I/O.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod analyzer;
mod checkpoint;
mod config;
mod context;
mod error;
pub mod executor;
mod fetcher;
mod filter;
mod metrics;
mod pipeline;
pub mod recovery;
pub mod store;

pub use analyzer::{AnalyzedBatch, BatchAnalyzer, CudBatch, NamespaceJob};
pub use checkpoint::{Checkpoint, CheckpointReadHandle, CheckpointStore, CheckpointWriteHandle};
pub use config::{
    ApplierConfig, CheckpointConfig, ExecutorConfig, RecoveryConfig, ReplConfig, RetryConfig,
    SubBatchConfig,
};
pub use context::{ApplierContext, MatchStrictness};
pub use error::{Mismatch, ReplError, ReplResult};
pub use executor::{build_executor, BatchExecutor};
pub use fetcher::{OplogFetcher, VecOplogFetcher};
pub use filter::{check_batch, ReplicationFilters, LOCAL_DATABASE};
pub use metrics::{ApplierMetrics, ApplierSnapshot, ExecutorMetrics, ExecutorSnapshot};
pub use pipeline::{ApplyingJob, OplogApplier};
pub use recovery::{RecoveryOutcome, RecoveryService, RecoveryState};
pub use store::{DocumentStore, MemoryDocumentStore};

/// Version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
