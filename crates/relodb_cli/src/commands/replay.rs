//! Replay command implementation.

use std::path::Path;
use std::sync::Arc;

use relodb_repl::{
    build_executor, ApplierConfig, ApplierContext, ApplierMetrics, Checkpoint, CheckpointConfig,
    CheckpointStore, DocumentStore, ExecutorConfig, ExecutorMetrics, MemoryDocumentStore,
    OplogApplier, ReplicationFilters, VecOplogFetcher,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{CliError, CliResult};
use crate::scenario::{diff, normalize, NamespaceState, Scenario};

/// How the scenario is replayed.
#[derive(Debug, Clone)]
pub struct ReplayOptions {
    /// Use the concurrent executor.
    pub concurrent: bool,
    /// Worker threads for the concurrent executor.
    pub workers: Option<usize>,
    /// Replay with the recovery context.
    pub reapply: bool,
    /// Largest batch handed to the executor.
    pub max_batch_size: usize,
    /// Entries per fetch.
    pub fetch_size: usize,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            concurrent: false,
            workers: None,
            reapply: false,
            max_batch_size: 1000,
            fetch_size: 100,
        }
    }
}

/// Replay result.
#[derive(Debug, Serialize)]
pub struct ReplayReport {
    /// Scenario name.
    pub name: String,
    /// Whether the replay ended the way the scenario expects.
    pub passed: bool,
    /// Checkpoint after the replay.
    pub checkpoint: Checkpoint,
    /// Oplog entries executed.
    pub applied_ops: u64,
    /// Batches executed.
    pub batches: u64,
    /// Error the replay stopped with.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Differences from the expected outcome.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub differences: Vec<String>,
    /// Replica contents after the replay.
    pub state: NamespaceState,
}

/// Runs the replay command.
pub fn run(path: &Path, options: &ReplayOptions, format: &str) -> CliResult<()> {
    if format != "text" && format != "json" {
        return Err(CliError::Format(format.to_string()));
    }
    let scenario = Scenario::load(path)?;
    let report = replay(&scenario, options)?;

    if format == "json" {
        let text = serde_json::to_string_pretty(&report).map_err(CliError::Render)?;
        println!("{text}");
    } else {
        print_text(&report);
    }

    if report.passed {
        Ok(())
    } else {
        Err(CliError::Failed {
            name: report.name,
            reason: report
                .differences
                .first()
                .cloned()
                .unwrap_or_else(|| "unexpected outcome".to_string()),
        })
    }
}

/// Replays a scenario into a fresh in-memory replica and compares the
/// outcome with the scenario's expectations.
///
/// # Errors
///
/// Fails if the replica cannot be set up. A failed replay is reported in
/// the returned [`ReplayReport`] rather than as an error.
pub fn replay(scenario: &Scenario, options: &ReplayOptions) -> CliResult<ReplayReport> {
    info!(
        scenario = %scenario.name,
        entries = scenario.oplog.len(),
        concurrent = options.concurrent,
        reapply = options.reapply,
        "replaying scenario"
    );

    let store = MemoryDocumentStore::new();
    for (ns, docs) in scenario.initial_namespaces()? {
        debug!(namespace = %ns, documents = docs.len(), "seeding");
        store.seed(&ns, docs)?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?;
    // The concurrent executor binds its worker pool to the current runtime.
    let _guard = runtime.enter();

    let shared: Arc<dyn DocumentStore> = Arc::new(store.clone());
    let filters = Arc::new(ReplicationFilters::new());
    let checkpoint = Arc::new(CheckpointStore::open(
        Arc::clone(&shared),
        CheckpointConfig::default(),
    )?);
    let executor = build_executor(
        &executor_config(options),
        shared,
        Arc::clone(&filters),
        Arc::new(ExecutorMetrics::new()),
    )?;
    let metrics = Arc::new(ApplierMetrics::new());
    let applier = OplogApplier::new(
        ApplierConfig::default().with_max_batch_size(options.max_batch_size.max(1)),
        checkpoint,
        executor,
        filters,
        Arc::clone(&metrics),
    );

    let context = if options.reapply {
        ApplierContext::recovery()
    } else {
        ApplierContext::new()
    };
    let fetcher = VecOplogFetcher::new(scenario.oplog.clone(), options.fetch_size.max(1));
    let outcome = runtime.block_on(async { applier.apply(fetcher, context).wait().await });

    let state = store.dump();
    let mut differences = Vec::new();
    let error = match (outcome, &scenario.expected_error) {
        (Ok(()), None) => None,
        (Ok(()), Some(expected)) => {
            differences.push(format!("expected an error containing '{expected}'"));
            None
        }
        (Err(e), expected) => {
            let message = e.to_string();
            match expected {
                Some(text) if message.contains(text.as_str()) => {}
                Some(text) => differences.push(format!(
                    "expected an error containing '{text}', got '{message}'"
                )),
                None => differences.push(format!("replay failed: {message}")),
            }
            warn!(error = %message, "replay stopped");
            Some(message)
        }
    };
    if let Some(expected) = &scenario.expected_state {
        differences.extend(diff(&normalize(expected)?, &state));
    }

    let snapshot = metrics.snapshot();
    let report = ReplayReport {
        name: scenario.name.clone(),
        passed: differences.is_empty(),
        checkpoint: applier.checkpoint().current(),
        applied_ops: snapshot.applied_ops,
        batches: snapshot.batches,
        error,
        differences,
        state,
    };
    info!(
        scenario = %report.name,
        passed = report.passed,
        applied_ops = report.applied_ops,
        batches = report.batches,
        "replay finished"
    );
    Ok(report)
}

fn executor_config(options: &ReplayOptions) -> ExecutorConfig {
    if !options.concurrent {
        return ExecutorConfig::sequential();
    }
    match options.workers {
        Some(workers) => ExecutorConfig::default().with_worker_threads(workers),
        None => ExecutorConfig::default(),
    }
}

fn print_text(report: &ReplayReport) {
    println!("Scenario: {}", report.name);
    println!(
        "Checkpoint: hash {} at {}",
        report.checkpoint.hash, report.checkpoint.position
    );
    println!(
        "Applied {} entries in {} batches",
        report.applied_ops, report.batches
    );
    if let Some(error) = &report.error {
        println!("Stopped with: {error}");
    }
    for (ns, docs) in &report.state {
        println!("{ns} ({} documents)", docs.len());
        for doc in docs {
            println!("  {doc}");
        }
    }
    for difference in &report.differences {
        println!("MISMATCH {difference}");
    }
    println!("Result: {}", if report.passed { "PASS" } else { "FAIL" });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn write_scenario(value: serde_json::Value) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{value}").unwrap();
        file
    }

    fn entry(ts: i64, rest: serde_json::Value) -> serde_json::Value {
        let mut entry = json!({
            "position": {"term": 1, "timestampMillis": ts},
            "hash": ts,
            "ns": "shop.items"
        });
        if let (Some(target), Some(fields)) = (entry.as_object_mut(), rest.as_object()) {
            target.extend(fields.clone());
        }
        entry
    }

    fn basic() -> serde_json::Value {
        json!({
            "name": "basic",
            "initialState": {"shop": {"items": [{"_id": 1, "n": 1}]}},
            "oplog": [
                entry(2, json!({"op": "insert", "doc": {"_id": 2, "n": 2}})),
                entry(3, json!({"op": "update", "id": 1, "update": {"$set": {"n": 11}}})),
                entry(4, json!({"op": "delete", "id": 2})),
                entry(5, json!({"op": "insert", "doc": {"_id": 3}}))
            ],
            "expectedState": {"shop": {"items": [{"_id": 1, "n": 11}, {"_id": 3}]}}
        })
    }

    #[test]
    fn sequential_replay_matches_expected_state() {
        let file = write_scenario(basic());
        let scenario = Scenario::load(file.path()).unwrap();
        let report = replay(&scenario, &ReplayOptions::default()).unwrap();

        assert!(report.passed, "{:?}", report.differences);
        assert_eq!(report.checkpoint.hash, 5);
        assert_eq!(report.checkpoint.position.timestamp, 5);
        assert_eq!(report.applied_ops, 4);
    }

    #[test]
    fn concurrent_replay_matches_expected_state() {
        let file = write_scenario(basic());
        let scenario = Scenario::load(file.path()).unwrap();
        let options = ReplayOptions {
            concurrent: true,
            workers: Some(2),
            max_batch_size: 2,
            fetch_size: 1,
            ..ReplayOptions::default()
        };
        let report = replay(&scenario, &options).unwrap();
        assert!(report.passed, "{:?}", report.differences);
    }

    #[test]
    fn wrong_expectation_fails_the_replay() {
        let mut value = basic();
        value["expectedState"] = json!({"shop": {"items": [{"_id": 1, "n": 1}]}});
        let file = write_scenario(value);

        let result = run(file.path(), &ReplayOptions::default(), "json");
        assert!(matches!(result, Err(CliError::Failed { .. })));
    }

    #[test]
    fn expected_error_is_matched_by_message() {
        let value = json!({
            "name": "missing target",
            "oplog": [entry(2, json!({"op": "delete", "id": 9}))],
            "expectedError": "shop.items",
            "expectedState": {}
        });
        let file = write_scenario(value);
        let scenario = Scenario::load(file.path()).unwrap();

        let report = replay(&scenario, &ReplayOptions::default()).unwrap();
        assert!(report.error.is_some());
        assert!(report.passed, "{:?}", report.differences);

        let lenient = ReplayOptions {
            reapply: true,
            ..ReplayOptions::default()
        };
        let report = replay(&scenario, &lenient).unwrap();
        assert!(report.error.is_none());
        assert!(!report.passed);
    }

    #[test]
    fn unknown_format_is_rejected() {
        let file = write_scenario(basic());
        assert!(matches!(
            run(file.path(), &ReplayOptions::default(), "yaml"),
            Err(CliError::Format(_))
        ));
    }
}
