//! Field and table metadata needed by one cascade.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::database::Snapshot;
use crate::error::{RecalcError, Result};
use crate::table::{Field, FieldKind};

/// Metadata for every field a cascade may touch.
#[derive(Debug, Clone, Default)]
pub struct AuxiliaryData {
    pub field_map: HashMap<String, Field>,
    pub field_to_table: HashMap<String, String>,
    /// Field ids per table, sorted
    pub table_to_fields: BTreeMap<String, Vec<String>>,
    pub table_to_db_name: HashMap<String, String>,
}

impl AuxiliaryData {
    pub fn field(&self, field_id: &str) -> Result<&Field> {
        self.field_map
            .get(field_id)
            .ok_or_else(|| RecalcError::MissingMetadata(format!("field '{}'", field_id)))
    }

    pub fn db_table(&self, table_id: &str) -> Result<&str> {
        self.table_to_db_name
            .get(table_id)
            .map(String::as_str)
            .ok_or_else(|| RecalcError::MissingMetadata(format!("table '{}'", table_id)))
    }

    pub fn contains(&self, field_id: &str) -> bool {
        self.field_map.contains_key(field_id)
    }
}

/// Fields a computed field reads besides its graph dependencies.
fn companions(field: &Field) -> Vec<&str> {
    match &field.kind {
        FieldKind::Lookup {
            link_field_id,
            lookup_field_id,
        }
        | FieldKind::Rollup {
            link_field_id,
            lookup_field_id,
            ..
        } => vec![link_field_id.as_str(), lookup_field_id.as_str()],
        FieldKind::Link(options) => vec![
            options.lookup_field_id.as_str(),
            options.symmetric_field_id.as_str(),
        ],
        FieldKind::Raw | FieldKind::Formula { .. } => Vec::new(),
    }
}

/// Loads metadata for `field_ids` closed over link and lookup companions.
///
/// # Arguments
/// * `snapshot` - Schema source
/// * `field_ids` - Fields named by the affected dependency edges
///
/// # Returns
/// `Result<AuxiliaryData>`; any id without a definition is a
/// `MissingMetadata` error.
pub fn load_auxiliary_data<'a>(
    snapshot: &Snapshot,
    field_ids: impl IntoIterator<Item = &'a str>,
) -> Result<AuxiliaryData> {
    let mut aux = AuxiliaryData::default();
    let mut pending: Vec<String> = field_ids.into_iter().map(str::to_string).collect();
    let mut seen: BTreeSet<String> = BTreeSet::new();

    while let Some(field_id) = pending.pop() {
        if !seen.insert(field_id.clone()) {
            continue;
        }
        let field = snapshot
            .fields
            .get(&field_id)
            .ok_or_else(|| RecalcError::MissingMetadata(format!("field '{}'", field_id)))?;
        let table = snapshot.tables.get(&field.table_id).ok_or_else(|| {
            RecalcError::MissingMetadata(format!(
                "table '{}' of field '{}'",
                field.table_id, field_id
            ))
        })?;

        pending.extend(companions(field).into_iter().map(str::to_string));
        if let Some(options) = field.link_options() {
            let foreign = snapshot.tables.get(&options.foreign_table_id).ok_or_else(|| {
                RecalcError::MissingMetadata(format!("table '{}'", options.foreign_table_id))
            })?;
            aux.table_to_db_name
                .insert(foreign.id.clone(), foreign.db_table_name.clone());
        }

        aux.table_to_db_name
            .insert(table.id.clone(), table.db_table_name.clone());
        aux.field_to_table
            .insert(field_id.clone(), field.table_id.clone());
        aux.table_to_fields
            .entry(field.table_id.clone())
            .or_default()
            .push(field_id.clone());
        aux.field_map.insert(field_id, field.clone());
    }

    for fields in aux.table_to_fields.values_mut() {
        fields.sort();
    }
    Ok(aux)
}
