//! # relodb oplog model
//!
//! Operation-log types shared by the relodb replication engine.
//!
//! This crate provides:
//! - `Position` for totally ordered oplog coordinates
//! - `Namespace` and `DocKey` for addressing documents
//! - `OplogOperation` with its CRUD, noop and command kinds
//! - `UpdateAction` for parsing and applying update documents
//! - `OplogBatch` for the raw batches that flow out of a fetcher
//!
//! This is a pure model crate with no I/O operations. Documents are plain
//! `serde_json::Value` objects and every type here is serde-friendly so
//! that oplog scenarios can be stored as JSON.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batch;
mod error;
mod namespace;
mod operation;
mod position;
mod update;

pub use batch::{OpMark, OplogBatch};
pub use error::{OplogError, OplogResult};
pub use namespace::{DocKey, Namespace};
pub use operation::{CommandOp, IndexSpec, OpKind, OplogOperation};
pub use position::Position;
pub use update::{with_id, Modifier, UpdateAction};

/// A stored document: a JSON object that carries an `_id` field.
pub type Document = serde_json::Value;

/// Name of the field that identifies a document inside its collection.
pub const ID_FIELD: &str = "_id";
