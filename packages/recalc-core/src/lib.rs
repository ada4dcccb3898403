//! Incremental recalculation engine for computed fields.
//!
//! Provides snapshot storage with optimistic record versioning, the field
//! dependency graph, per-kind value calculation, link foreign-key
//! maintenance, and change collection into op-maps.

pub mod calc;
pub mod collector;
pub mod config;
pub mod context;
pub mod database;
pub mod document;
pub mod engine;
pub mod error;
pub mod graph;
pub mod link;
pub mod loader;
pub mod metadata;
mod schema;
pub mod table;
pub mod transaction;
pub mod types;

pub use collector::{compose_op_maps, format_changes_to_ops, merge_duplicate_change, OpMap, Operation};
pub use config::RecalcConfig;
pub use context::CalcContext;
pub use database::{CommitReceipt, Database, Snapshot};
pub use document::WorkspaceDocument;
pub use engine::{BulkOutcome, BulkRecalc, Recalculator};
pub use error::{RecalcError, Result};
pub use transaction::CellChange;
