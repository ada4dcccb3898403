use crate::database::{CommitReceipt, Database};
use crate::error::Result;

use super::transaction::Transaction;

/// RAII guard for transaction handling with auto-abort on drop.
///
/// If the transaction is not explicitly committed, it will be
/// automatically aborted when the handle is dropped, so an early `?`
/// return never leaves a half-applied cascade behind.
#[derive(Debug)]
pub struct TransactionHandle {
    /// The transaction being managed
    pub(crate) transaction: Transaction,
    /// Whether to auto-abort on drop
    pub(crate) auto_abort: bool,
}

impl TransactionHandle {
    pub(crate) fn new(transaction: Transaction) -> Self {
        Self {
            transaction,
            auto_abort: true,
        }
    }

    /// Gets a shared reference to the underlying transaction.
    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    /// Gets a mutable reference to the underlying transaction.
    pub fn transaction_mut(&mut self) -> &mut Transaction {
        &mut self.transaction
    }

    /// Commits the transaction.
    ///
    /// # Arguments
    /// * `db` - Database the transaction was started on
    /// * `user_id` - Author stamped on every written record
    ///
    /// # Returns
    /// `Result<CommitReceipt>` with the new version of every written record.
    pub fn commit(self, db: &Database, user_id: &str) -> Result<CommitReceipt> {
        self.commit_with(db, user_id, |_| ())
    }

    /// Commits the transaction and runs `after_swap` under the commit lock.
    pub fn commit_with<F>(mut self, db: &Database, user_id: &str, after_swap: F) -> Result<CommitReceipt>
    where
        F: FnOnce(&CommitReceipt),
    {
        let receipt = db.commit_with(&mut self.transaction, user_id, after_swap)?;
        self.auto_abort = false;
        Ok(receipt)
    }

    /// Aborts the transaction.
    pub fn abort(mut self) {
        self.auto_abort = false;
        self.transaction.abort();
    }

    /// Returns whether the transaction has been committed.
    pub fn is_committed(&self) -> bool {
        self.transaction.is_committed()
    }

    /// Returns whether the transaction is still active.
    pub fn is_active(&self) -> bool {
        self.transaction.is_active()
    }
}

impl Drop for TransactionHandle {
    fn drop(&mut self) {
        if self.auto_abort && self.transaction.is_active() {
            tracing::debug!(
                staged_tables = self.transaction.staged_table_count(),
                "auto-aborting uncommitted transaction"
            );
            self.transaction.abort();
        }
    }
}
