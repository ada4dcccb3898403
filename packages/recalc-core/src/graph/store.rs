//! Dependency edges derived from field definitions.

use std::sync::OnceLock;

use regex::Regex;

use super::resolver;
use super::Reference;
use crate::database::Snapshot;
use crate::table::{Field, FieldKind};

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{([A-Za-z0-9]+)\}").unwrap())
}

/// Field ids referenced as `{fieldId}` in a formula, in first-use order.
pub fn formula_references(expression: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for capture in reference_pattern().captures_iter(expression) {
        let id = capture[1].to_string();
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}

/// Edges a field contributes to the graph, all ending at the field itself.
pub fn references_for(field: &Field) -> Vec<Reference> {
    let sources: Vec<String> = match &field.kind {
        FieldKind::Raw => Vec::new(),
        FieldKind::Formula { expression } => formula_references(expression),
        FieldKind::Lookup {
            link_field_id,
            lookup_field_id,
        }
        | FieldKind::Rollup {
            link_field_id,
            lookup_field_id,
            ..
        } => vec![link_field_id.clone(), lookup_field_id.clone()],
        FieldKind::Link(options) => vec![options.lookup_field_id.clone()],
    };
    sources
        .iter()
        .map(|from| Reference::new(from, &field.id))
        .collect()
}

/// Read access to the persisted edges of a snapshot.
pub struct GraphStore<'a> {
    snapshot: &'a Snapshot,
}

impl<'a> GraphStore<'a> {
    pub fn new(snapshot: &'a Snapshot) -> Self {
        Self { snapshot }
    }

    /// All persisted edges.
    pub fn edges(&self) -> Vec<Reference> {
        self.snapshot.references.iter().cloned().collect()
    }

    /// Edges in the undirected closure around `seeds`.
    pub fn connected_component(&self, seeds: &[String]) -> Vec<Reference> {
        resolver::connected_component(seeds, &self.edges())
    }
}
