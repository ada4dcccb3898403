use chrono::{DateTime, Utc};

use crate::transaction::Transaction;

/// Per-call state threaded through one cascade.
#[derive(Debug)]
pub struct CalcContext<'a> {
    /// Author of the edit being cascaded
    pub user_id: &'a str,
    /// Time the cascade started
    pub now: DateTime<Utc>,
    /// Transaction every read and write goes through
    pub tx: &'a mut Transaction,
}

impl<'a> CalcContext<'a> {
    pub fn new(user_id: &'a str, tx: &'a mut Transaction) -> Self {
        Self {
            user_id,
            now: Utc::now(),
            tx,
        }
    }

    /// Milliseconds since the cascade started.
    pub fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.now).num_milliseconds()
    }
}
