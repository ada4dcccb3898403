//! Transaction isolation, staging buffers, and snapshot commit.

mod change;
mod staging_buffer;
#[allow(clippy::module_inception)]
mod transaction;
mod transaction_handle;

pub use change::CellChange;
pub use staging_buffer::{StagedRow, StagingBuffer};
pub use transaction::Transaction;
pub use transaction_handle::TransactionHandle;
