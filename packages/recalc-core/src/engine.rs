//! Cascade engine: origin edits in, every dependent cell recomputed.
//!
//! A cascade stages the origin edits, derives link and foreign-key changes,
//! then walks the dependency graph in topological order recomputing the
//! affected records of each field. Dependents of detached links are
//! computed while the old foreign key is still stored; dependents of
//! attached links after the new key is written.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::calc::{Calculator, LinkedValue};
use crate::collector::{format_changes_to_ops, merge_duplicate_change, OpMap};
use crate::config::RecalcConfig;
use crate::context::CalcContext;
use crate::database::{CommitReceipt, Database};
use crate::error::{RecalcError, Result};
use crate::graph::{flatten_nodes, formula_references, topological_order_from, GraphStore};
use crate::link::{
    derive_link_changes, is_removal, link_ids, records_linking_to, resolve_linked_ids,
    validate_link_value, ForeignKeyPlan,
};
use crate::loader::{load_records_batch, LoadClass, RecordLoadRequest, RecordPager};
use crate::metadata::{load_auxiliary_data, AuxiliaryData};
use crate::table::{Field, FieldKind};
use crate::transaction::{CellChange, Transaction};
use crate::types;

/// Record ids per field id.
type CellSet = BTreeMap<String, BTreeSet<String>>;

fn add_cell(set: &mut CellSet, field_id: &str, record_id: &str) {
    set.entry(field_id.to_string())
        .or_default()
        .insert(record_id.to_string());
}

/// Table-wide or record-scoped recomputation run in one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkRecalc {
    CalculateFields { table_id: String, field_ids: Vec<String> },
    ResetFields { table_id: String, field_ids: Vec<String> },
    CalculateByRecordIds { table_id: String, record_ids: Vec<String> },
}

impl BulkRecalc {
    pub fn label(&self) -> &'static str {
        match self {
            BulkRecalc::CalculateFields { .. } => "calculate_fields",
            BulkRecalc::ResetFields { .. } => "reset_fields",
            BulkRecalc::CalculateByRecordIds { .. } => "calculate_fields_by_record_ids",
        }
    }

    pub fn table_id(&self) -> &str {
        match self {
            BulkRecalc::CalculateFields { table_id, .. }
            | BulkRecalc::ResetFields { table_id, .. }
            | BulkRecalc::CalculateByRecordIds { table_id, .. } => table_id,
        }
    }
}

/// Result of a committed bulk recomputation.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkOutcome {
    pub op_map: OpMap,
    /// Generation of the snapshot published by the commit
    pub generation: u64,
    /// Conflicting commits recomputed before this one succeeded
    pub retries: u32,
}

/// Runs cascades and bulk recomputation against a database.
#[derive(Debug)]
pub struct Recalculator {
    db: Arc<Database>,
    config: RecalcConfig,
    calculator: Calculator,
}

impl Recalculator {
    pub fn new(db: Arc<Database>, config: RecalcConfig) -> Self {
        Self {
            db,
            config,
            calculator: Calculator::new(),
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn config(&self) -> &RecalcConfig {
        &self.config
    }

    /// Runs the full cascade for a batch of user edits.
    ///
    /// Nothing is committed; the caller commits `ctx.tx` or drops it.
    ///
    /// # Arguments
    /// * `ctx` - Cascade context holding the transaction
    /// * `origin` - Edits of raw or link cells; old values are re-read
    ///
    /// # Returns
    /// `Result<Vec<CellChange>>` with the origin edits and every derived
    /// change, merged per cell. Any failure leaves the transaction unusable
    /// for commit.
    pub fn run_cascade(&self, ctx: &mut CalcContext<'_>, origin: Vec<CellChange>) -> Result<Vec<CellChange>> {
        let origin = self.stage_origin(ctx.tx, origin)?;
        let derivation = derive_link_changes(ctx.tx, &origin)?;

        let mut detached = CellSet::new();
        let mut attached = CellSet::new();
        let snapshot = ctx.tx.snapshot().clone();
        for change in origin.iter().chain(&derivation.changes) {
            let field = snapshot.field(&change.field_id)?;
            let target = if field.is_link() && is_removal(change) {
                &mut detached
            } else {
                &mut attached
            };
            add_cell(target, &change.field_id, &change.record_id);
        }

        let mut changes = origin;
        changes.extend(derivation.changes);
        if !detached.is_empty() {
            changes.extend(self.propagate(ctx.tx, &derivation.plan, &detached, &CellSet::new())?);
        }
        derivation.plan.apply(ctx.tx)?;
        changes.extend(self.propagate(ctx.tx, &derivation.plan, &attached, &CellSet::new())?);

        let merged = merge_duplicate_change(changes);
        tracing::debug!(
            user = ctx.user_id,
            changes = merged.len(),
            fk_writes = derivation.plan.len(),
            elapsed_ms = ctx.elapsed_ms(),
            "cascade finished"
        );
        Ok(merged)
    }

    /// Validates and stages origin edits, replacing each old value with the
    /// value the transaction currently reads.
    fn stage_origin(&self, tx: &mut Transaction, origin: Vec<CellChange>) -> Result<Vec<CellChange>> {
        let snapshot = tx.snapshot().clone();
        let mut staged = Vec::with_capacity(origin.len());
        for change in origin {
            let field = snapshot.field(&change.field_id)?;
            if field.table_id != change.table_id {
                return Err(RecalcError::InvalidOperation(format!(
                    "field '{}' does not belong to table '{}'",
                    field.id, change.table_id
                )));
            }
            if field.is_computed() {
                return Err(RecalcError::InvalidOperation(format!(
                    "computed field '{}' cannot be edited",
                    field.id
                )));
            }
            if field.is_link() {
                validate_link_value(field, &change.new_value)?;
            }
            let db_table = &snapshot.table(&change.table_id)?.db_table_name;
            if !tx.record_exists(db_table, &change.record_id) {
                return Err(RecalcError::RecordNotFound {
                    table: change.table_id.clone(),
                    record: change.record_id.clone(),
                });
            }
            let current = types::decode(
                field,
                &tx.read_column(db_table, &change.record_id, &field.db_field_name)?,
            )?;
            if current != change.old_value {
                tracing::debug!(
                    record = %change.record_id,
                    field = %field.id,
                    "rebasing edit onto current value"
                );
            }
            let (stored, new_value) = types::canonicalize(field, &change.new_value)?;
            tx.stage_write(db_table, &change.record_id, &field.db_field_name, stored)?;
            staged.push(CellChange::new(
                &change.table_id,
                &change.record_id,
                &change.field_id,
                current,
                new_value,
            ));
        }
        Ok(staged)
    }

    /// Recomputes everything downstream of `dirty` plus the `forced` cells.
    fn propagate(
        &self,
        tx: &mut Transaction,
        plan: &ForeignKeyPlan,
        dirty: &CellSet,
        forced: &CellSet,
    ) -> Result<Vec<CellChange>> {
        let seeds: Vec<String> = dirty
            .keys()
            .chain(forced.keys())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if seeds.is_empty() {
            return Ok(Vec::new());
        }

        let snapshot = tx.snapshot().clone();
        let component = GraphStore::new(&snapshot).connected_component(&seeds);
        let order = topological_order_from(&seeds, &component, self.config.max_topological_depth)?;
        let mut field_ids = flatten_nodes(&component);
        field_ids.extend(seeds.iter().cloned());
        let aux = load_auxiliary_data(&snapshot, field_ids.iter().map(String::as_str))?;

        let mut dirty = dirty.clone();
        let mut changes = Vec::new();
        for item in &order {
            let field = aux.field(&item.field_id)?;
            // Link fields only re-render titles; their own cell edits are
            // origins, not dependents.
            if !field.is_computed() && !field.is_link() {
                continue;
            }
            let records = self.affected_records(tx, &aux, field, &dirty, forced, plan)?;
            if records.is_empty() {
                continue;
            }

            let db_table = aux.db_table(&field.table_id)?.to_string();
            for (record_id, old, new) in self.compute_field(tx, &aux, field, &records, plan)? {
                let (stored, new) = types::canonicalize(field, &new)?;
                if old == new {
                    continue;
                }
                tx.stage_write(&db_table, &record_id, &field.db_field_name, stored)?;
                add_cell(&mut dirty, &field.id, &record_id);
                changes.push(CellChange::new(&field.table_id, &record_id, &field.id, old, new));
            }
        }

        tracing::debug!(
            seeds = seeds.len(),
            fields = order.len(),
            changes = changes.len(),
            "propagated changes"
        );
        Ok(changes)
    }

    /// Records of `field` whose inputs changed, plus the forced ones.
    fn affected_records(
        &self,
        tx: &Transaction,
        aux: &AuxiliaryData,
        field: &Field,
        dirty: &CellSet,
        forced: &CellSet,
        plan: &ForeignKeyPlan,
    ) -> Result<BTreeSet<String>> {
        let mut records = forced.get(&field.id).cloned().unwrap_or_default();
        match &field.kind {
            FieldKind::Formula { expression } => {
                for reference in formula_references(expression) {
                    if let Some(set) = dirty.get(&reference) {
                        records.extend(set.iter().cloned());
                    }
                }
            }
            FieldKind::Lookup {
                link_field_id,
                lookup_field_id,
            }
            | FieldKind::Rollup {
                link_field_id,
                lookup_field_id,
                ..
            } => {
                if let Some(set) = dirty.get(link_field_id) {
                    records.extend(set.iter().cloned());
                }
                if let Some(set) = dirty.get(lookup_field_id) {
                    let link = aux.field(link_field_id)?;
                    records.extend(records_linking_to(tx, link, set, plan)?);
                }
            }
            FieldKind::Link(options) => {
                if let Some(set) = dirty.get(&options.lookup_field_id) {
                    records.extend(records_linking_to(tx, field, set, plan)?);
                }
            }
            FieldKind::Raw => {}
        }
        Ok(records)
    }

    /// Computes `field` for `records`, returning `(record, old, new)`.
    ///
    /// Link cells are read first to find the linked records; the records
    /// being computed, the sibling values a formula reads and the linked
    /// records are then fetched in one batch.
    fn compute_field(
        &self,
        tx: &Transaction,
        aux: &AuxiliaryData,
        field: &Field,
        records: &BTreeSet<String>,
        plan: &ForeignKeyPlan,
    ) -> Result<Vec<(String, serde_json::Value, serde_json::Value)>> {
        let mut dependency_fields = Vec::new();
        // (link field, foreign table, field read on linked records)
        let mut via: Option<(&Field, String, String)> = None;
        match &field.kind {
            FieldKind::Formula { expression } => dependency_fields.extend(formula_references(expression)),
            FieldKind::Lookup {
                link_field_id,
                lookup_field_id,
            }
            | FieldKind::Rollup {
                link_field_id,
                lookup_field_id,
                ..
            } => {
                let link = aux.field(link_field_id)?;
                let foreign_table = aux.field(lookup_field_id)?.table_id.clone();
                via = Some((link, foreign_table, lookup_field_id.clone()));
            }
            FieldKind::Link(options) => {
                via = Some((field, options.foreign_table_id.clone(), options.lookup_field_id.clone()));
            }
            FieldKind::Raw => {}
        }

        let record_ids: Vec<String> = records.iter().cloned().collect();
        let mut requests = vec![RecordLoadRequest {
            table_id: field.table_id.clone(),
            record_ids: record_ids.clone(),
            field_ids: vec![field.id.clone()],
            class: LoadClass::Origin,
        }];
        if !dependency_fields.is_empty() {
            requests.push(RecordLoadRequest {
                table_id: field.table_id.clone(),
                record_ids,
                field_ids: dependency_fields,
                class: LoadClass::Dependency,
            });
        }

        let mut members: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        if let Some((link, foreign_table, read_field)) = &via {
            let db_table = aux.db_table(&link.table_id)?;
            let mut all_members = BTreeSet::new();
            for record_id in records {
                if !tx.record_exists(db_table, record_id) {
                    continue;
                }
                let cell = types::decode(link, &tx.read_column(db_table, record_id, &link.db_field_name)?)?;
                let ids = if field.is_link() {
                    link_ids(&cell)
                } else {
                    resolve_linked_ids(tx, link, record_id, &cell, plan)?
                };
                all_members.extend(ids.iter().cloned());
                members.insert(record_id.as_str(), ids);
            }
            requests.push(RecordLoadRequest {
                table_id: foreign_table.clone(),
                record_ids: all_members.into_iter().collect(),
                field_ids: vec![read_field.clone()],
                class: LoadClass::Related,
            });
        }

        let loaded = load_records_batch(tx, aux, &requests)?;
        let mut results = Vec::with_capacity(records.len());
        for record_id in records {
            let Some(record) = loaded.get(&field.table_id, record_id) else {
                continue;
            };
            let mut linked = Vec::new();
            if let Some((_, foreign_table, read_field)) = &via {
                for id in members.get(record_id.as_str()).into_iter().flatten() {
                    if let Some(linked_record) = loaded.get(foreign_table, id) {
                        linked.push(LinkedValue::new(id, linked_record.value(read_field).clone()));
                    }
                }
            }
            let new = self.calculator.compute(field, record, &linked)?;
            results.push((record_id.clone(), record.value(&field.id).clone(), new));
        }
        Ok(results)
    }

    /// Runs a bulk recomputation in one transaction and commits it.
    ///
    /// A commit rejected because a concurrent edit moved one of the written
    /// records on is recomputed from a fresh snapshot, up to
    /// `max_conflict_retries` times. `after_commit` runs under the commit
    /// lock with the op-map and receipt of the successful commit.
    ///
    /// # Returns
    /// `Result<BulkOutcome>`; `VersionConflict` once retries run out.
    pub fn run_bulk<F>(&self, user_id: &str, request: &BulkRecalc, after_commit: F) -> Result<BulkOutcome>
    where
        F: FnMut(&OpMap, &CommitReceipt),
    {
        self.commit_bulk(
            user_id,
            request.label(),
            request.table_id(),
            |engine, tx| engine.bulk_changes(tx, request),
            after_commit,
        )
    }

    fn commit_bulk<B, F>(
        &self,
        user_id: &str,
        label: &str,
        table_id: &str,
        body: B,
        mut after_commit: F,
    ) -> Result<BulkOutcome>
    where
        B: Fn(&Self, &mut Transaction) -> Result<Vec<CellChange>>,
        F: FnMut(&OpMap, &CommitReceipt),
    {
        let max_retries = self.config.max_conflict_retries;
        let mut retries = 0u32;
        loop {
            let mut handle = self.db.begin();
            let changes = body(self, handle.transaction_mut())?;
            let op_map = format_changes_to_ops(&changes);
            match handle.commit_with(&self.db, user_id, |receipt| after_commit(&op_map, receipt)) {
                Ok(receipt) => {
                    tracing::info!(
                        operation = label,
                        table = table_id,
                        changes = changes.len(),
                        generation = receipt.generation,
                        retries,
                        "bulk recalculation committed"
                    );
                    return Ok(BulkOutcome {
                        op_map,
                        generation: receipt.generation,
                        retries,
                    });
                }
                Err(e) if e.is_retryable() && retries < max_retries => {
                    retries += 1;
                    tracing::debug!(
                        operation = label,
                        error = %e,
                        retries,
                        "bulk commit raced another writer, recomputing"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn bulk_changes(&self, tx: &mut Transaction, request: &BulkRecalc) -> Result<Vec<CellChange>> {
        match request {
            BulkRecalc::CalculateFields { table_id, field_ids } => {
                let db_table = Self::check_table_fields(tx, table_id, field_ids)?;
                self.recompute_pages(tx, &db_table, field_ids, false)
            }
            BulkRecalc::ResetFields { table_id, field_ids } => {
                let db_table = Self::check_table_fields(tx, table_id, field_ids)?;
                self.recompute_pages(tx, &db_table, field_ids, true)
            }
            BulkRecalc::CalculateByRecordIds { table_id, record_ids } => {
                self.recompute_records(tx, table_id, record_ids)
            }
        }
    }

    fn check_table_fields(tx: &Transaction, table_id: &str, field_ids: &[String]) -> Result<String> {
        let snapshot = tx.snapshot();
        let table = snapshot.table(table_id)?;
        for field_id in field_ids {
            if snapshot.field(field_id)?.table_id != table_id {
                return Err(RecalcError::InvalidOperation(format!(
                    "field '{}' does not belong to table '{}'",
                    field_id, table_id
                )));
            }
        }
        Ok(table.db_table_name.clone())
    }

    /// Pages through every record of a table forcing `field_ids`.
    fn recompute_pages(
        &self,
        tx: &mut Transaction,
        db_table: &str,
        field_ids: &[String],
        mark_dirty: bool,
    ) -> Result<Vec<CellChange>> {
        let mut pager = RecordPager::new(db_table, self.config.page_size);
        let mut changes = Vec::new();
        let mut pages = 0usize;
        while let Some(page) = pager.next_page(tx)? {
            let records: BTreeSet<String> = page.into_iter().collect();
            let forced: CellSet = field_ids
                .iter()
                .map(|field_id| (field_id.clone(), records.clone()))
                .collect();
            let dirty = if mark_dirty { forced.clone() } else { CellSet::new() };
            changes.extend(self.propagate(tx, &ForeignKeyPlan::new(), &dirty, &forced)?);
            pages += 1;
        }
        tracing::debug!(table = db_table, pages, "recomputed table pages");
        Ok(merge_duplicate_change(changes))
    }

    /// Recomputes every computed and link field of the given records and
    /// everything that reads those records, in pages of `page_size`.
    fn recompute_records(&self, tx: &mut Transaction, table_id: &str, record_ids: &[String]) -> Result<Vec<CellChange>> {
        let snapshot = tx.snapshot().clone();
        let table = snapshot.table(table_id)?;
        for record_id in record_ids {
            if !tx.record_exists(&table.db_table_name, record_id) {
                return Err(RecalcError::RecordNotFound {
                    table: table_id.to_string(),
                    record: record_id.clone(),
                });
            }
        }
        let fields = snapshot.table_fields(table_id);
        let mut changes = Vec::new();
        for chunk in record_ids.chunks(self.config.page_size.max(1)) {
            let records: BTreeSet<String> = chunk.iter().cloned().collect();
            let mut dirty = CellSet::new();
            let mut forced = CellSet::new();
            for field in &fields {
                dirty.insert(field.id.clone(), records.clone());
                if field.is_computed() || field.is_link() {
                    forced.insert(field.id.clone(), records.clone());
                }
            }
            changes.extend(self.propagate(tx, &ForeignKeyPlan::new(), &dirty, &forced)?);
        }
        Ok(merge_duplicate_change(changes))
    }

    /// Recomputes computed and link fields for every record of a table,
    /// then their dependents wherever a value changed.
    ///
    /// # Arguments
    /// * `user_id` - Author stamped on written records
    /// * `table_id` - Table owning `field_ids`
    /// * `field_ids` - Fields to recompute; raw fields are skipped
    ///
    /// # Returns
    /// `Result<OpMap>` of the committed changes.
    pub fn calculate_fields(&self, user_id: &str, table_id: &str, field_ids: &[String]) -> Result<OpMap> {
        let request = BulkRecalc::CalculateFields {
            table_id: table_id.to_string(),
            field_ids: field_ids.to_vec(),
        };
        Ok(self.run_bulk(user_id, &request, |_, _| ())?.op_map)
    }

    /// Like [`Recalculator::calculate_fields`], but every dependent of
    /// `field_ids` is recomputed too, whether or not the fields' stored
    /// values change. Raw fields may be named to refresh their dependents.
    pub fn reset_fields(&self, user_id: &str, table_id: &str, field_ids: &[String]) -> Result<OpMap> {
        let request = BulkRecalc::ResetFields {
            table_id: table_id.to_string(),
            field_ids: field_ids.to_vec(),
        };
        Ok(self.run_bulk(user_id, &request, |_, _| ())?.op_map)
    }

    /// Recomputes every computed and link field of the given records and
    /// everything that reads those records.
    pub fn calculate_fields_by_record_ids(
        &self,
        user_id: &str,
        table_id: &str,
        record_ids: &[String],
    ) -> Result<OpMap> {
        let request = BulkRecalc::CalculateByRecordIds {
            table_id: table_id.to_string(),
            record_ids: record_ids.to_vec(),
        };
        Ok(self.run_bulk(user_id, &request, |_, _| ())?.op_map)
    }

    /// Applies user edits as one cascade and commits it.
    ///
    /// # Returns
    /// `Result<OpMap>` with the edits and every derived change.
    pub fn apply_changes(&self, user_id: &str, changes: Vec<CellChange>) -> Result<OpMap> {
        let mut handle = self.db.begin();
        let merged = {
            let mut ctx = CalcContext::new(user_id, handle.transaction_mut());
            self.run_cascade(&mut ctx, changes)?
        };
        handle.commit(&self.db, user_id)?;
        Ok(format_changes_to_ops(&merged))
    }
}
