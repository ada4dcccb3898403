//! Pure graph algorithms over dependency edge lists.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use super::{Reference, TopoItem};
use crate::error::{RecalcError, Result};

struct Adjacency<'a> {
    outgoing: BTreeMap<&'a str, Vec<&'a str>>,
    incoming: BTreeMap<&'a str, Vec<&'a str>>,
}

impl<'a> Adjacency<'a> {
    fn build(edges: &'a [Reference]) -> Self {
        let mut outgoing: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        let mut incoming: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for edge in edges {
            outgoing
                .entry(edge.from_field_id.as_str())
                .or_default()
                .push(edge.to_field_id.as_str());
            incoming
                .entry(edge.to_field_id.as_str())
                .or_default()
                .push(edge.from_field_id.as_str());
        }
        for list in outgoing.values_mut().chain(incoming.values_mut()) {
            list.sort_unstable();
            list.dedup();
        }
        Self { outgoing, incoming }
    }

    fn dependencies(&self, node: &str) -> Vec<String> {
        self.incoming
            .get(node)
            .map(|deps| deps.iter().map(|d| d.to_string()).collect())
            .unwrap_or_default()
    }
}

/// Calculation order of everything reachable from `seed`, seed first.
pub fn topological_order(seed: &str, edges: &[Reference]) -> Vec<TopoItem> {
    let seeds = [seed.to_string()];
    // No bound: the stack never exceeds the number of distinct nodes.
    topological_order_from(&seeds, edges, usize::MAX).unwrap_or_default()
}

/// Calculation order of everything reachable from any of `seeds`.
///
/// Every field appears once, after all fields it depends on that are
/// themselves reachable. The depth-first walk keeps an explicit stack
/// bounded by `max_depth`.
///
/// # Arguments
/// * `seeds` - Fields whose values changed
/// * `edges` - Dependency edges
/// * `max_depth` - Upper bound on the traversal stack
///
/// # Returns
/// `Result<Vec<TopoItem>>`, failing with `DepthLimitExceeded` when the
/// stack would grow past `max_depth`.
pub fn topological_order_from(
    seeds: &[String],
    edges: &[Reference],
    max_depth: usize,
) -> Result<Vec<TopoItem>> {
    let adjacency = Adjacency::build(edges);
    let mut visited: HashSet<&str> = HashSet::new();
    let mut post_order: Vec<&str> = Vec::new();

    for seed in seeds {
        if !visited.insert(seed.as_str()) {
            continue;
        }
        let mut stack: Vec<(&str, usize)> = vec![(seed.as_str(), 0)];
        while let Some(frame) = stack.last_mut() {
            let (node, next) = *frame;
            let child = adjacency
                .outgoing
                .get(node)
                .and_then(|children| children.get(next))
                .copied();
            match child {
                Some(child) => {
                    frame.1 += 1;
                    if visited.insert(child) {
                        if stack.len() >= max_depth {
                            return Err(RecalcError::DepthLimitExceeded { limit: max_depth });
                        }
                        stack.push((child, 0));
                    }
                }
                None => {
                    post_order.push(node);
                    stack.pop();
                }
            }
        }
    }

    Ok(post_order
        .into_iter()
        .rev()
        .map(|node| TopoItem {
            field_id: node.to_string(),
            dependencies: adjacency.dependencies(node),
        })
        .collect())
}

/// All edges in the undirected closure around `seeds`.
pub fn connected_component(seeds: &[String], edges: &[Reference]) -> Vec<Reference> {
    let mut neighbours: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for edge in edges {
        neighbours
            .entry(edge.from_field_id.as_str())
            .or_default()
            .push(edge.to_field_id.as_str());
        neighbours
            .entry(edge.to_field_id.as_str())
            .or_default()
            .push(edge.from_field_id.as_str());
    }

    let mut seen: HashSet<&str> = seeds.iter().map(String::as_str).collect();
    let mut queue: VecDeque<&str> = seeds.iter().map(String::as_str).collect();
    while let Some(node) = queue.pop_front() {
        for next in neighbours.get(node).into_iter().flatten() {
            if seen.insert(next) {
                queue.push_back(next);
            }
        }
    }

    let component: BTreeSet<Reference> = edges
        .iter()
        .filter(|edge| seen.contains(edge.from_field_id.as_str()))
        .cloned()
        .collect();
    component.into_iter().collect()
}

/// Every field id named by an edge.
pub fn flatten_nodes(edges: &[Reference]) -> BTreeSet<String> {
    edges
        .iter()
        .flat_map(|edge| [edge.from_field_id.clone(), edge.to_field_id.clone()])
        .collect()
}

/// Whether `to` is reachable from `from` along edge direction.
pub fn reaches(from: &str, to: &str, edges: &[Reference]) -> bool {
    let adjacency = Adjacency::build(edges);
    let mut seen: HashSet<&str> = HashSet::new();
    let mut stack = vec![from];
    while let Some(node) = stack.pop() {
        for &next in adjacency.outgoing.get(node).into_iter().flatten() {
            if next == to {
                return true;
            }
            if seen.insert(next) {
                stack.push(next);
            }
        }
    }
    false
}
