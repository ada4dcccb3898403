//! Transactional apply bridge: one inbound edit, one committed cascade.

use std::sync::Arc;

use recalc_core::collector::{format_changes_to_ops, op_count};
use recalc_core::{BulkRecalc, CalcContext, OpMap, RecalcError, Recalculator, Result};

use crate::transport::{ApplyEvent, PublishedBundle, Publisher};

/// Result of applying one edit.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyOutcome {
    /// Origin and derived operations that were committed
    pub op_map: OpMap,
    /// Generation of the snapshot published by the commit
    pub generation: u64,
    /// Stale-version retries taken before the commit succeeded
    pub retries: u32,
    /// Subscribers that received the bundle
    pub delivered: usize,
}

/// Applies transport edits through the cascade engine and publishes the
/// committed result.
pub struct ApplyBridge {
    engine: Arc<Recalculator>,
    publisher: Arc<dyn Publisher>,
}

impl ApplyBridge {
    pub fn new(engine: Arc<Recalculator>, publisher: Arc<dyn Publisher>) -> Self {
        Self { engine, publisher }
    }

    pub fn engine(&self) -> &Arc<Recalculator> {
        &self.engine
    }

    /// Applies one edit atomically.
    ///
    /// The edit and every derived change commit together or not at all. A
    /// stale `event.version`, or a commit rejected because a touched record
    /// moved on, is retried against the refreshed version up to
    /// `max_conflict_retries` times. The bundle is published from inside
    /// the commit, so no observer sees the edit without its derivation.
    ///
    /// # Arguments
    /// * `user_id` - Author of the edit
    /// * `event` - Single-field edit from the transport
    ///
    /// # Returns
    /// `Result<ApplyOutcome>`; `VersionConflict` once retries run out, any
    /// other engine error as soon as it occurs.
    pub fn apply(&self, user_id: &str, event: &ApplyEvent) -> Result<ApplyOutcome> {
        let change = event.cell_change()?;
        let db = self.engine.database();
        let max_retries = self.engine.config().max_conflict_retries;
        let db_table = db.snapshot().table(&change.table_id)?.db_table_name.clone();

        let mut expected = event.version;
        let mut retries = 0u32;
        let mut refresh = false;
        loop {
            let mut handle = db.begin();
            let actual = handle
                .transaction()
                .record_version(&db_table, &change.record_id)?;
            if refresh {
                expected = actual;
            }
            if actual != expected {
                if retries >= max_retries {
                    tracing::warn!(
                        record = %change.record_id,
                        expected,
                        actual,
                        retries,
                        "giving up on stale edit"
                    );
                    return Err(RecalcError::VersionConflict {
                        table: change.table_id.clone(),
                        record: change.record_id.clone(),
                        expected,
                        actual,
                    });
                }
                retries += 1;
                tracing::debug!(
                    record = %change.record_id,
                    expected,
                    actual,
                    "rebasing stale edit onto current version"
                );
                expected = actual;
            }

            let changes = {
                let mut ctx = CalcContext::new(user_id, handle.transaction_mut());
                self.engine.run_cascade(&mut ctx, vec![change.clone()])?
            };
            let op_map = format_changes_to_ops(&changes);

            let mut delivered = 0;
            let publisher = &self.publisher;
            let committed = handle.commit_with(db, user_id, |receipt| {
                if !op_map.is_empty() {
                    delivered = publisher.publish(PublishedBundle {
                        op_map: op_map.clone(),
                        versions: receipt.versions.clone(),
                    });
                }
            });

            match committed {
                Ok(receipt) => {
                    tracing::info!(
                        user = user_id,
                        table = %change.table_id,
                        record = %change.record_id,
                        field = %change.field_id,
                        ops = op_count(&op_map),
                        generation = receipt.generation,
                        retries,
                        "applied edit"
                    );
                    return Ok(ApplyOutcome {
                        op_map,
                        generation: receipt.generation,
                        retries,
                        delivered,
                    });
                }
                Err(e) if e.is_retryable() && retries < max_retries => {
                    retries += 1;
                    refresh = true;
                    tracing::debug!(error = %e, retries, "commit raced another writer, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Runs a bulk recomputation and publishes its op-map from inside the
    /// commit, with the versions that commit wrote.
    pub fn run_bulk(&self, user_id: &str, request: &BulkRecalc) -> Result<OpMap> {
        let publisher = &self.publisher;
        let outcome = self.engine.run_bulk(user_id, request, |op_map, receipt| {
            if !op_map.is_empty() {
                publisher.publish(PublishedBundle {
                    op_map: op_map.clone(),
                    versions: receipt.versions.clone(),
                });
            }
        })?;
        Ok(outcome.op_map)
    }

    /// Recomputes fields table-wide and publishes the committed op-map.
    pub fn calculate_fields(&self, user_id: &str, table_id: &str, field_ids: &[String]) -> Result<OpMap> {
        self.run_bulk(
            user_id,
            &BulkRecalc::CalculateFields {
                table_id: table_id.to_string(),
                field_ids: field_ids.to_vec(),
            },
        )
    }

    /// Resets fields table-wide and publishes the committed op-map.
    pub fn reset_fields(&self, user_id: &str, table_id: &str, field_ids: &[String]) -> Result<OpMap> {
        self.run_bulk(
            user_id,
            &BulkRecalc::ResetFields {
                table_id: table_id.to_string(),
                field_ids: field_ids.to_vec(),
            },
        )
    }

    /// Recomputes the given records and publishes the committed op-map.
    pub fn calculate_fields_by_record_ids(
        &self,
        user_id: &str,
        table_id: &str,
        record_ids: &[String],
    ) -> Result<OpMap> {
        self.run_bulk(
            user_id,
            &BulkRecalc::CalculateByRecordIds {
                table_id: table_id.to_string(),
                record_ids: record_ids.to_vec(),
            },
        )
    }
}

impl std::fmt::Debug for ApplyBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplyBridge")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}
