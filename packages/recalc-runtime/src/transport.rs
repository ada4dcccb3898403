//! Collaborative transport types: inbound apply events and outbound bundles.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use recalc_core::{CellChange, OpMap, Operation, RecalcError};

/// Collection name prefix of record documents.
const RECORD_COLLECTION_PREFIX: &str = "rec_";

/// Collection holding the records of `table_id`.
pub fn record_collection(table_id: &str) -> String {
    format!("{}{}", RECORD_COLLECTION_PREFIX, table_id)
}

/// Table id addressed by a record collection name.
pub fn parse_collection(collection: &str) -> recalc_core::Result<&str> {
    collection
        .strip_prefix(RECORD_COLLECTION_PREFIX)
        .filter(|table_id| !table_id.is_empty())
        .ok_or_else(|| {
            RecalcError::InvalidOperation(format!("'{}' is not a record collection", collection))
        })
}

/// A single-field edit submitted through the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyEvent {
    /// Target collection, `rec_<tableId>`
    pub collection: String,
    /// Edited record
    pub record_id: String,
    /// Record version the client based the edit on
    pub version: u64,
    /// Field-set operation
    pub op: Operation,
}

impl ApplyEvent {
    pub fn new(table_id: &str, record_id: &str, version: u64, op: Operation) -> Self {
        Self {
            collection: record_collection(table_id),
            record_id: record_id.to_string(),
            version,
            op,
        }
    }

    /// Table id of the target collection.
    pub fn table_id(&self) -> recalc_core::Result<&str> {
        parse_collection(&self.collection)
    }

    /// The cell change carried by the operation.
    ///
    /// # Returns
    /// `Result<CellChange>`; fails with `InvalidOperation` when no field
    /// can be detected from the operation path.
    pub fn cell_change(&self) -> recalc_core::Result<CellChange> {
        let table_id = self.table_id()?;
        let field_id = self.op.field_id().ok_or_else(|| {
            RecalcError::InvalidOperation(format!(
                "cannot detect a field from operation path {:?}",
                self.op.p
            ))
        })?;
        Ok(CellChange::new(
            table_id,
            &self.record_id,
            field_id,
            self.op.old_value(),
            self.op.new_value(),
        ))
    }
}

/// Everything one committed edit changed, published as a unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedBundle {
    /// Origin and derived operations
    pub op_map: OpMap,
    /// New version of every written record, by table id then record id
    pub versions: BTreeMap<String, BTreeMap<String, u64>>,
}

/// Sink for committed bundles.
///
/// `publish` runs under the database commit lock and must not block on
/// subscribers.
pub trait Publisher: Send + Sync {
    /// Hands a bundle to subscribers, returning how many received it.
    fn publish(&self, bundle: PublishedBundle) -> usize;
}

/// Fans bundles out to tokio broadcast subscribers.
///
/// Slow subscribers lag and lose the oldest bundles rather than stalling
/// commits.
#[derive(Debug)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<PublishedBundle>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PublishedBundle> {
        self.sender.subscribe()
    }
}

impl Publisher for BroadcastPublisher {
    fn publish(&self, bundle: PublishedBundle) -> usize {
        // No subscribers is not an error
        self.sender.send(bundle).unwrap_or(0)
    }
}

/// Keeps every published bundle in memory, in publish order.
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    bundles: Mutex<Vec<PublishedBundle>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns the bundles published so far.
    pub fn drain(&self) -> Vec<PublishedBundle> {
        std::mem::take(&mut *self.bundles.lock())
    }

    pub fn len(&self) -> usize {
        self.bundles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.lock().is_empty()
    }
}

impl Publisher for MemoryPublisher {
    fn publish(&self, bundle: PublishedBundle) -> usize {
        self.bundles.lock().push(bundle);
        1
    }
}
