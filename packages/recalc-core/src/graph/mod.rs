//! Field dependency graph.
//!
//! Edges run from a field to every computed field whose value depends on
//! it. The resolver works on plain edge lists; the store derives edges from
//! field definitions and reads the persisted set from a snapshot.

mod resolver;
mod store;

pub use resolver::{
    connected_component, flatten_nodes, reaches, topological_order, topological_order_from,
};
pub use store::{formula_references, references_for, GraphStore};

use serde::{Deserialize, Serialize};

/// A dependency edge: `to_field_id` depends on `from_field_id`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    pub from_field_id: String,
    pub to_field_id: String,
}

impl Reference {
    pub fn new(from_field_id: &str, to_field_id: &str) -> Self {
        Self {
            from_field_id: from_field_id.to_string(),
            to_field_id: to_field_id.to_string(),
        }
    }
}

/// A field in calculation order with the fields it directly depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopoItem {
    pub field_id: String,
    pub dependencies: Vec<String>,
}
