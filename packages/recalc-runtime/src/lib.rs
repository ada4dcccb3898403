//! Transactional apply bridge for the recalculation engine.
//!
//! Inbound single-field edits arrive as [`ApplyEvent`]s. The bridge runs the
//! full cascade for each edit in one transaction, commits it, and publishes
//! the combined op-map while still holding the commit lock, so subscribers
//! observe bundles in commit order. [`BridgeService`] runs the bridge behind
//! a tokio channel.

pub mod bridge;
pub mod error;
pub mod service;
pub mod transport;

pub use bridge::{ApplyBridge, ApplyOutcome};
pub use error::RuntimeError;
pub use service::{BridgeHandle, BridgeRequest, BridgeService};
pub use transport::{
    parse_collection, record_collection, ApplyEvent, BroadcastPublisher, MemoryPublisher, PublishedBundle,
    Publisher,
};

use tokio::sync::oneshot;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Response channel carrying the result of one request
pub type ResponseSender<T> = oneshot::Sender<Result<T>>;
