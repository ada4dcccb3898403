//! Link cells, foreign-key maintenance, and link-aware record joins.
//!
//! A link cell holds `{id, title}` items: one object for a many-to-one
//! link, a list for one-to-many. The foreign-key column of the pair's host
//! table is the source of truth for membership; the cells on both sides are
//! denormalized copies kept in step by [`derive_link_changes`].

mod derive;
mod fk;
mod join;

pub use derive::{derive_link_changes, LinkDerivation};
pub use fk::{FkChange, ForeignKeyPlan};
pub use join::{records_linking_to, resolve_linked_ids};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RecalcError, Result};
use crate::table::Field;
use crate::transaction::CellChange;
use crate::types::is_record_id;

/// One linked record as stored in a link cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkItem {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl LinkItem {
    pub fn new(id: &str, title: Option<String>) -> Self {
        Self {
            id: id.to_string(),
            title,
        }
    }

    fn from_value(value: &Value) -> Option<Self> {
        let id = value.get("id")?.as_str()?;
        if !is_record_id(id) {
            return None;
        }
        let title = value
            .get("title")
            .and_then(|t| t.as_str())
            .map(str::to_string);
        Some(Self::new(id, title))
    }

    fn to_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("id".to_string(), Value::String(self.id.clone()));
        if let Some(title) = &self.title {
            map.insert("title".to_string(), Value::String(title.clone()));
        }
        Value::Object(map)
    }
}

/// Whether `value` is an object, or a non-empty list of objects, carrying a
/// record id.
pub fn is_link_value(value: &Value) -> bool {
    match value {
        Value::Object(_) => LinkItem::from_value(value).is_some(),
        Value::Array(items) => {
            !items.is_empty() && items.iter().all(|item| LinkItem::from_value(item).is_some())
        }
        _ => false,
    }
}

/// Items of a link cell in cell order, first occurrence of each id kept.
pub fn link_items(value: &Value) -> Vec<LinkItem> {
    let candidates: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![value],
        _ => Vec::new(),
    };
    let mut items: Vec<LinkItem> = Vec::new();
    for candidate in candidates {
        if let Some(item) = LinkItem::from_value(candidate) {
            if !items.iter().any(|existing| existing.id == item.id) {
                items.push(item);
            }
        }
    }
    items
}

/// Record ids of a link cell in cell order.
pub fn link_ids(value: &Value) -> Vec<String> {
    link_items(value).into_iter().map(|item| item.id).collect()
}

/// Builds the cell value of `field` holding `items`.
pub fn link_cell(field: &Field, items: Vec<LinkItem>) -> Value {
    if field.is_multiple_cell_value {
        if items.is_empty() {
            Value::Null
        } else {
            Value::Array(items.iter().map(LinkItem::to_value).collect())
        }
    } else {
        items.first().map_or(Value::Null, LinkItem::to_value)
    }
}

/// Checks that `value` has the shape `field` stores.
pub fn validate_link_value(field: &Field, value: &Value) -> Result<()> {
    let valid = match value {
        Value::Null => true,
        Value::Object(_) => !field.is_multiple_cell_value && is_link_value(value),
        Value::Array(items) => field.is_multiple_cell_value && (items.is_empty() || is_link_value(value)),
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(RecalcError::InvalidOperation(format!(
            "value {} is not a link value for field '{}'",
            value, field.id
        )))
    }
}

/// True when a link cell change only detaches records.
pub fn is_removal(change: &CellChange) -> bool {
    let old = link_ids(&change.old_value);
    let new = link_ids(&change.new_value);
    new.len() < old.len() && new.iter().all(|id| old.contains(id))
}
