//! Folding a batch never changes the outcome: applying a whole batch must
//! leave the same documents as applying its entries one at a time.

use std::collections::HashSet;
use std::sync::Arc;

use proptest::prelude::*;
use relodb_oplog::{Namespace, OplogOperation, Position};
use relodb_repl::{
    build_executor, ApplierContext, BatchAnalyzer, BatchExecutor, ExecutorConfig,
    ExecutorMetrics, MemoryDocumentStore, ReplError, ReplicationFilters,
};
use serde_json::{json, Value};

fn ns() -> Namespace {
    Namespace::new("db", "docs")
}

/// Turns raw choices into a stream that is valid when applied in order:
/// inserts only target missing documents, plain updates and deletes only
/// existing ones.
fn stream(choices: &[(u8, u8, i64)]) -> Vec<OplogOperation> {
    let mut present = HashSet::new();
    let mut ops = Vec::with_capacity(choices.len());
    for (i, &(action, id, value)) in choices.iter().enumerate() {
        let position = Position::new(1, i as i64 + 1);
        let hash = i as i64;
        let op = if present.contains(&id) {
            match action {
                0 => OplogOperation::update(position, hash, ns(), json!(id), json!({"$set": {"n": value}}), false),
                1 => OplogOperation::update(position, hash, ns(), json!(id), json!({"$set": {"m": value, "n": 0}}), false),
                2 => OplogOperation::update(position, hash, ns(), json!(id), json!({"n": value, "m": 1}), false),
                3 => {
                    present.remove(&id);
                    OplogOperation::delete(position, hash, ns(), json!(id))
                }
                4 => OplogOperation::update(position, hash, ns(), json!(id), json!({"n": value}), true),
                _ => OplogOperation::update(position, hash, ns(), json!(id), json!({"$unset": {"m": ""}}), false),
            }
        } else {
            present.insert(id);
            if action % 2 == 0 {
                OplogOperation::insert(position, hash, ns(), json!({"_id": id, "n": value}))
            } else {
                OplogOperation::update(position, hash, ns(), json!(id), json!({"$set": {"n": value}}), true)
            }
        };
        ops.push(op);
    }
    ops
}

fn executor(store: &MemoryDocumentStore) -> Arc<dyn BatchExecutor> {
    build_executor(
        &ExecutorConfig::sequential(),
        Arc::new(store.clone()),
        Arc::new(ReplicationFilters::new()),
        Arc::new(ExecutorMetrics::new()),
    )
    .unwrap()
}

fn apply(store: &MemoryDocumentStore, ops: &[OplogOperation]) {
    let context = ApplierContext::new();
    let executor = executor(store);
    for batch in BatchAnalyzer::new(context.clone()).analyze(ops).unwrap() {
        executor.apply(batch, &context).unwrap();
    }
}

fn one_at_a_time(ops: &[OplogOperation]) -> Vec<Value> {
    let store = MemoryDocumentStore::new();
    for op in ops {
        apply(&store, std::slice::from_ref(op));
    }
    store.contents(&ns())
}

fn folded(ops: &[OplogOperation]) -> Vec<Value> {
    let store = MemoryDocumentStore::new();
    apply(&store, ops);
    store.contents(&ns())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn folded_batch_matches_sequential_application(
        choices in prop::collection::vec((0u8..6, 0u8..3, -5i64..5), 1..30)
    ) {
        let ops = stream(&choices);
        prop_assert_eq!(folded(&ops), one_at_a_time(&ops));
    }
}

#[test]
fn insert_update_delete_insert_on_one_document() {
    let ops = stream(&[(0, 1, 1), (1, 1, 2), (3, 1, 0), (0, 1, 7)]);
    assert_eq!(folded(&ops), vec![json!({"_id": 1, "n": 7})]);
    assert_eq!(one_at_a_time(&ops), vec![json!({"_id": 1, "n": 7})]);
}

#[test]
fn insert_over_an_existing_document_fails_even_when_replaced_later() {
    let store = MemoryDocumentStore::new();
    store.seed(&ns(), vec![json!({"_id": 1, "n": 0})]).unwrap();
    let ops = vec![
        OplogOperation::insert(Position::new(1, 1), 1, ns(), json!({"_id": 1, "n": 1})),
        OplogOperation::update(Position::new(1, 2), 2, ns(), json!(1), json!({"n": 2}), true),
    ];

    let context = ApplierContext::new();
    let executor = executor(&store);
    let batches = BatchAnalyzer::new(context.clone()).analyze(&ops).unwrap();
    assert_eq!(batches.len(), 2);
    let err = batches
        .into_iter()
        .try_for_each(|batch| executor.apply(batch, &context))
        .unwrap_err();
    assert!(matches!(err, ReplError::DuplicateKey { .. }), "{err}");
    assert_eq!(store.contents(&ns()), vec![json!({"_id": 1, "n": 0})]);
}
