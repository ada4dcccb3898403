//! Field schema changes applied to a snapshot under construction.

use std::str::FromStr;
use std::sync::Arc;

use crate::calc::RollupFunction;
use crate::database::Snapshot;
use crate::error::{RecalcError, Result};
use crate::graph::{reaches, references_for, Reference};
use crate::table::validation::{physical_name, validate_id, validate_name};
use crate::table::{
    Field, FieldBuilder, FieldKind, FieldSpec, LinkOptions, Relationship, ID_COLUMN,
};
use crate::types::CellValueType;

fn invalid(field: &str, reason: impl Into<String>) -> RecalcError {
    RecalcError::InvalidFieldDefinition {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// Resolved kind, type and multiplicity for a non-link field.
fn resolve_kind(
    snapshot: &Snapshot,
    table_id: &str,
    field_id: &str,
    builder: &FieldBuilder,
) -> Result<(FieldKind, CellValueType, bool)> {
    match &builder.spec {
        FieldSpec::Raw => Ok((
            FieldKind::Raw,
            builder.cell_value_type,
            builder.is_multiple_cell_value,
        )),
        FieldSpec::Formula { expression } => {
            for reference in crate::graph::formula_references(expression) {
                if reference == field_id {
                    return Err(RecalcError::CycleDetected {
                        field: field_id.to_string(),
                    });
                }
                let source = snapshot.field(&reference)?;
                if source.table_id != table_id {
                    return Err(invalid(
                        field_id,
                        format!("formula references field '{}' of another table", reference),
                    ));
                }
            }
            Ok((
                FieldKind::Formula {
                    expression: expression.clone(),
                },
                builder.cell_value_type,
                builder.is_multiple_cell_value,
            ))
        }
        FieldSpec::Lookup {
            link_field_id,
            lookup_field_id,
        } => {
            let (link, lookup) =
                resolve_lookup_pair(snapshot, table_id, field_id, link_field_id, lookup_field_id)?;
            let multiple = link.relationship.is_multiple() || lookup.is_multiple_cell_value;
            Ok((
                FieldKind::Lookup {
                    link_field_id: link_field_id.clone(),
                    lookup_field_id: lookup_field_id.clone(),
                },
                lookup.cell_value_type,
                multiple,
            ))
        }
        FieldSpec::Rollup {
            expression,
            link_field_id,
            lookup_field_id,
        } => {
            resolve_lookup_pair(snapshot, table_id, field_id, link_field_id, lookup_field_id)?;
            let function = RollupFunction::from_str(expression)
                .map_err(|e| invalid(field_id, e.to_string()))?;
            Ok((
                FieldKind::Rollup {
                    expression: expression.clone(),
                    link_field_id: link_field_id.clone(),
                    lookup_field_id: lookup_field_id.clone(),
                },
                builder.cell_value_type,
                builder.is_multiple_cell_value || function.returns_list(),
            ))
        }
        FieldSpec::Link { .. } => Err(invalid(field_id, "links cannot be redefined")),
    }
}

fn resolve_lookup_pair<'a>(
    snapshot: &'a Snapshot,
    table_id: &str,
    field_id: &str,
    link_field_id: &str,
    lookup_field_id: &str,
) -> Result<(&'a LinkOptions, &'a Field)> {
    let link = snapshot.field(link_field_id)?;
    let options = link
        .link_options()
        .ok_or_else(|| invalid(field_id, format!("'{}' is not a link field", link_field_id)))?;
    if link.table_id != table_id {
        return Err(invalid(
            field_id,
            format!("link '{}' belongs to another table", link_field_id),
        ));
    }
    let lookup = snapshot.field(lookup_field_id)?;
    if lookup.table_id != options.foreign_table_id {
        return Err(invalid(
            field_id,
            format!(
                "looked-up field '{}' is not on the linked table",
                lookup_field_id
            ),
        ));
    }
    Ok((options, lookup))
}

/// Inserts fields with their edges, failing if any new field reaches itself.
fn insert_fields(snapshot: &mut Snapshot, fields: Vec<Field>) -> Result<()> {
    for field in &fields {
        snapshot.references.extend(references_for(field));
    }
    let edges: Vec<Reference> = snapshot.references.iter().cloned().collect();
    for field in &fields {
        if reaches(&field.id, &field.id, &edges) {
            return Err(RecalcError::CycleDetected {
                field: field.id.clone(),
            });
        }
    }
    for field in fields {
        snapshot.fields.insert(field.id.clone(), field);
    }
    Ok(())
}

/// Adds a field to `snapshot`.
///
/// # Arguments
/// * `snapshot` - Snapshot under construction
/// * `table_id` - Owning table
/// * `builder` - Field definition
/// * `ids` - Generator for identifiers not supplied by the builder
///
/// # Returns
/// `Result<Field>` with the stored definition.
pub(crate) fn add_field(
    snapshot: &mut Snapshot,
    table_id: &str,
    builder: FieldBuilder,
    ids: &mut dyn FnMut(&str, &Snapshot) -> String,
) -> Result<Field> {
    let table = snapshot.table(table_id)?.clone();
    let id = match &builder.id {
        Some(id) => id.clone(),
        None => ids("fld", snapshot),
    };
    validate_id(&id)?;
    validate_name(&id, &builder.name)?;
    if snapshot.fields.contains_key(&id) {
        return Err(RecalcError::FieldAlreadyExists(id));
    }
    if builder.is_primary && snapshot.primary_field(table_id).is_some() {
        return Err(invalid(&id, "table already has a primary field"));
    }

    let mut fields = Vec::new();
    if let FieldSpec::Link {
        relationship,
        foreign_table_id,
    } = &builder.spec
    {
        let foreign = snapshot.table(foreign_table_id)?.clone();
        let foreign_primary = snapshot
            .primary_field(foreign_table_id)
            .ok_or_else(|| invalid(&id, "linked table has no primary field"))?
            .id
            .clone();
        let own_primary = snapshot
            .primary_field(table_id)
            .ok_or_else(|| invalid(&id, "table has no primary field"))?
            .id
            .clone();
        let symmetric_id = match &builder.symmetric_id {
            Some(symmetric_id) => symmetric_id.clone(),
            None => ids("fld", snapshot),
        };
        validate_id(&symmetric_id)?;
        if symmetric_id == id || snapshot.fields.contains_key(&symmetric_id) {
            return Err(RecalcError::FieldAlreadyExists(symmetric_id));
        }

        let fk_column = format!("__fk_{}", id);
        let options = match relationship {
            Relationship::ManyOne => LinkOptions {
                relationship: Relationship::ManyOne,
                foreign_table_id: foreign.id.clone(),
                lookup_field_id: foreign_primary,
                symmetric_field_id: symmetric_id.clone(),
                fk_host_table_name: table.db_table_name.clone(),
                self_key_name: ID_COLUMN.to_string(),
                foreign_key_name: fk_column,
            },
            Relationship::OneMany => LinkOptions {
                relationship: Relationship::OneMany,
                foreign_table_id: foreign.id.clone(),
                lookup_field_id: foreign_primary,
                symmetric_field_id: symmetric_id.clone(),
                fk_host_table_name: foreign.db_table_name.clone(),
                self_key_name: fk_column,
                foreign_key_name: ID_COLUMN.to_string(),
            },
        };
        let mirrored = options.mirrored(table_id, &own_primary, &id);

        fields.push(Field {
            db_field_name: physical_name(&builder.name, &id),
            id: id.clone(),
            table_id: table_id.to_string(),
            name: builder.name.clone(),
            cell_value_type: CellValueType::String,
            is_multiple_cell_value: relationship.is_multiple(),
            is_primary: false,
            kind: FieldKind::Link(options),
        });
        fields.push(Field {
            db_field_name: physical_name(&table.name, &symmetric_id),
            id: symmetric_id,
            table_id: foreign.id.clone(),
            name: table.name.clone(),
            cell_value_type: CellValueType::String,
            is_multiple_cell_value: mirrored.relationship.is_multiple(),
            is_primary: false,
            kind: FieldKind::Link(mirrored),
        });
    } else {
        let (kind, cell_value_type, is_multiple_cell_value) =
            resolve_kind(snapshot, table_id, &id, &builder)?;
        fields.push(Field {
            db_field_name: physical_name(&builder.name, &id),
            id: id.clone(),
            table_id: table_id.to_string(),
            name: builder.name.clone(),
            cell_value_type,
            is_multiple_cell_value,
            is_primary: builder.is_primary,
            kind,
        });
    }

    let created = fields[0].clone();
    insert_fields(snapshot, fields)?;
    tracing::info!(
        field = %created.id,
        table = table_id,
        kind = created.kind.name(),
        "created field"
    );
    Ok(created)
}

/// Replaces a non-link field's definition and its incoming edges.
pub(crate) fn redefine_field(
    snapshot: &mut Snapshot,
    field_id: &str,
    builder: FieldBuilder,
) -> Result<Field> {
    let existing = snapshot.field(field_id)?.clone();
    if existing.is_link() {
        return Err(invalid(field_id, "links cannot be redefined"));
    }
    validate_name(field_id, &builder.name)?;
    let (kind, cell_value_type, is_multiple_cell_value) =
        resolve_kind(snapshot, &existing.table_id, field_id, &builder)?;

    snapshot.references.retain(|edge| edge.to_field_id != field_id);
    snapshot.fields.remove(field_id);
    let field = Field {
        name: builder.name.clone(),
        cell_value_type,
        is_multiple_cell_value,
        kind,
        ..existing
    };
    insert_fields(snapshot, vec![field.clone()])?;
    tracing::info!(field = field_id, kind = field.kind.name(), "redefined field");
    Ok(field)
}

/// Removes a field, its edges and its physical column.
pub(crate) fn remove_field(snapshot: &mut Snapshot, field_id: &str) -> Result<()> {
    let field = snapshot.field(field_id)?.clone();
    let mut doomed = vec![field.clone()];
    if let Some(options) = field.link_options() {
        doomed.push(snapshot.field(&options.symmetric_field_id)?.clone());
    }

    let doomed_ids: Vec<&str> = doomed.iter().map(|f| f.id.as_str()).collect();
    if let Some(dependent) = snapshot.references.iter().find(|edge| {
        doomed_ids.contains(&edge.from_field_id.as_str())
            && !doomed_ids.contains(&edge.to_field_id.as_str())
    }) {
        return Err(invalid(
            field_id,
            format!("field '{}' depends on it", dependent.to_field_id),
        ));
    }

    snapshot.references.retain(|edge| {
        !doomed_ids.contains(&edge.from_field_id.as_str())
            && !doomed_ids.contains(&edge.to_field_id.as_str())
    });

    let mut columns: Vec<(String, String)> = Vec::new();
    for doomed_field in &doomed {
        let table = snapshot.table(&doomed_field.table_id)?;
        columns.push((table.db_table_name.clone(), doomed_field.db_field_name.clone()));
    }
    if let Some(options) = field.link_options() {
        columns.push((
            options.fk_host_table_name.clone(),
            options.fk_column().to_string(),
        ));
    }
    for (db_table, column) in columns {
        if let Some(data) = snapshot.data.get_mut(&db_table) {
            let data = Arc::make_mut(data);
            for row in data.rows.values_mut() {
                if row.columns.contains_key(&column) {
                    Arc::make_mut(row).columns.remove(&column);
                }
            }
        }
    }

    for doomed_field in &doomed {
        snapshot.fields.remove(&doomed_field.id);
    }
    tracing::info!(field = field_id, removed = doomed.len(), "deleted field");
    Ok(())
}
