//! Field definitions.

use serde::{Deserialize, Serialize};

use super::relation::{LinkOptions, Relationship};
use crate::types::CellValueType;

/// Field definition within a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    /// Field identifier
    pub id: String,
    /// Owning table identifier
    pub table_id: String,
    /// Display name
    pub name: String,
    /// Physical column name
    pub db_field_name: String,
    /// Declared scalar type of the cell values
    pub cell_value_type: CellValueType,
    /// Whether a cell holds a list of values
    #[serde(default)]
    pub is_multiple_cell_value: bool,
    /// Whether this field provides record titles
    #[serde(default)]
    pub is_primary: bool,
    /// Raw or computed behaviour
    pub kind: FieldKind,
}

/// What populates a field's cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum FieldKind {
    /// Written by users only
    Raw,
    /// Expression over `{fieldId}` references in the same table
    Formula { expression: String },
    /// Aggregate of a looked-up field, e.g. `sum({values})`
    Rollup {
        expression: String,
        link_field_id: String,
        lookup_field_id: String,
    },
    /// Values of a foreign field gathered through a link
    Lookup {
        link_field_id: String,
        lookup_field_id: String,
    },
    /// Reference to records in another (or the same) table
    Link(LinkOptions),
}

impl FieldKind {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            FieldKind::Raw => "raw",
            FieldKind::Formula { .. } => "formula",
            FieldKind::Rollup { .. } => "rollup",
            FieldKind::Lookup { .. } => "lookup",
            FieldKind::Link(_) => "link",
        }
    }
}

impl Field {
    /// Whether the engine writes this field's cells.
    pub fn is_computed(&self) -> bool {
        !matches!(self.kind, FieldKind::Raw | FieldKind::Link(_))
    }

    pub fn is_link(&self) -> bool {
        matches!(self.kind, FieldKind::Link(_))
    }

    pub fn link_options(&self) -> Option<&LinkOptions> {
        match &self.kind {
            FieldKind::Link(options) => Some(options),
            _ => None,
        }
    }

    /// Returns `(link_field_id, lookup_field_id)` for lookups and rollups.
    pub fn lookup_options(&self) -> Option<(&str, &str)> {
        match &self.kind {
            FieldKind::Lookup {
                link_field_id,
                lookup_field_id,
            }
            | FieldKind::Rollup {
                link_field_id,
                lookup_field_id,
                ..
            } => Some((link_field_id, lookup_field_id)),
            _ => None,
        }
    }
}

/// Kind-specific part of a new field definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum FieldSpec {
    Raw,
    Formula {
        expression: String,
    },
    Rollup {
        expression: String,
        link_field_id: String,
        lookup_field_id: String,
    },
    Lookup {
        link_field_id: String,
        lookup_field_id: String,
    },
    Link {
        relationship: Relationship,
        foreign_table_id: String,
    },
}

/// Builder for field definitions passed to `Database::create_field`.
///
/// Storage-derived parts (column name, link keys, symmetric field) are
/// filled in by the database when the field is created.
#[derive(Debug, Clone)]
pub struct FieldBuilder {
    pub(crate) id: Option<String>,
    pub(crate) symmetric_id: Option<String>,
    pub(crate) name: String,
    pub(crate) cell_value_type: CellValueType,
    pub(crate) is_multiple_cell_value: bool,
    pub(crate) is_primary: bool,
    pub(crate) spec: FieldSpec,
}

impl FieldBuilder {
    fn new(name: &str, cell_value_type: CellValueType, spec: FieldSpec) -> Self {
        Self {
            id: None,
            symmetric_id: None,
            name: name.to_string(),
            cell_value_type,
            is_multiple_cell_value: false,
            is_primary: false,
            spec,
        }
    }

    /// A user-written field.
    pub fn raw(name: &str, cell_value_type: CellValueType) -> Self {
        Self::new(name, cell_value_type, FieldSpec::Raw)
    }

    /// A formula field producing values of `cell_value_type`.
    pub fn formula(name: &str, expression: &str, cell_value_type: CellValueType) -> Self {
        Self::new(
            name,
            cell_value_type,
            FieldSpec::Formula {
                expression: expression.to_string(),
            },
        )
    }

    /// A rollup aggregating `lookup_field_id` through `link_field_id`.
    pub fn rollup(
        name: &str,
        expression: &str,
        link_field_id: &str,
        lookup_field_id: &str,
        cell_value_type: CellValueType,
    ) -> Self {
        Self::new(
            name,
            cell_value_type,
            FieldSpec::Rollup {
                expression: expression.to_string(),
                link_field_id: link_field_id.to_string(),
                lookup_field_id: lookup_field_id.to_string(),
            },
        )
    }

    /// A lookup; type and multiplicity are taken from the looked-up field.
    pub fn lookup(name: &str, link_field_id: &str, lookup_field_id: &str) -> Self {
        Self::new(
            name,
            CellValueType::String,
            FieldSpec::Lookup {
                link_field_id: link_field_id.to_string(),
                lookup_field_id: lookup_field_id.to_string(),
            },
        )
    }

    /// A link to `foreign_table_id`; a symmetric field is created alongside.
    pub fn link(name: &str, relationship: Relationship, foreign_table_id: &str) -> Self {
        Self::new(
            name,
            CellValueType::String,
            FieldSpec::Link {
                relationship,
                foreign_table_id: foreign_table_id.to_string(),
            },
        )
    }

    /// Uses a fixed identifier instead of a generated one.
    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    /// Fixes the identifier of the symmetric field of a link.
    pub fn with_symmetric_id(mut self, id: &str) -> Self {
        self.symmetric_id = Some(id.to_string());
        self
    }

    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self
    }

    pub fn multiple(mut self) -> Self {
        self.is_multiple_cell_value = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &FieldSpec {
        &self.spec
    }
}
