//! Link relations between tables and their foreign-key layout.

use serde::{Deserialize, Serialize};

/// Physical id column present on every table.
pub const ID_COLUMN: &str = "__id";

/// Cardinality of a link field, seen from the table that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Relationship {
    /// Each record points at no more than one foreign record
    ManyOne,
    /// Each record holds a list of foreign records
    OneMany,
}

impl Relationship {
    /// Relationship of the symmetric field on the foreign table.
    pub fn symmetric(self) -> Self {
        match self {
            Relationship::ManyOne => Relationship::OneMany,
            Relationship::OneMany => Relationship::ManyOne,
        }
    }

    /// Whether a cell of this relationship holds a list.
    pub fn is_multiple(self) -> bool {
        matches!(self, Relationship::OneMany)
    }
}

/// Link configuration.
///
/// The pair `(self_key_name, foreign_key_name)` names two columns of
/// `fk_host_table_name`: host rows whose `self_key_name` column equals a
/// record id of this table carry the linked foreign record ids in their
/// `foreign_key_name` column. Both sides of a link pair share one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkOptions {
    pub relationship: Relationship,
    pub foreign_table_id: String,
    /// Primary field on the foreign table used for display titles
    pub lookup_field_id: String,
    pub symmetric_field_id: String,
    pub fk_host_table_name: String,
    pub self_key_name: String,
    pub foreign_key_name: String,
}

impl LinkOptions {
    /// Name of the foreign-key column holding the single owner reference.
    pub fn fk_column(&self) -> &str {
        if self.self_key_name == ID_COLUMN {
            &self.foreign_key_name
        } else {
            &self.self_key_name
        }
    }

    /// True when the host row is keyed by this side's record id.
    pub fn host_is_self(&self) -> bool {
        self.self_key_name == ID_COLUMN
    }

    /// Builds the options of the symmetric field on the foreign table.
    pub fn mirrored(&self, own_table_id: &str, own_lookup_field_id: &str, own_field_id: &str) -> Self {
        Self {
            relationship: self.relationship.symmetric(),
            foreign_table_id: own_table_id.to_string(),
            lookup_field_id: own_lookup_field_id.to_string(),
            symmetric_field_id: own_field_id.to_string(),
            fk_host_table_name: self.fk_host_table_name.clone(),
            self_key_name: self.foreign_key_name.clone(),
            foreign_key_name: self.self_key_name.clone(),
        }
    }
}
