//! Cascades and the dependency graph used to order flush actions.
//!
//! [`cascade_targets`] finds the instances an operation propagates to, as
//! declared by the cascade style of each association. [`ActionGraph`] orders
//! insert and delete actions so that every row a foreign key points at is
//! written first (and deleted last).
//!
//! # Ordering
//!
//! The graph is sorted with Kahn's algorithm. Among actions that are ready
//! at the same time, the one registered first goes first, so the result is
//! deterministic. When no order exists, a DFS names one cycle.

use crate::entity::{EntityRef, PropertyValue, Reference};
use hibernia_core::{CascadeStyle, PropertyKind, Result};
use std::collections::{BTreeSet, HashMap, HashSet};

// ============================================================================
// Cascades
// ============================================================================

/// An entity operation that may propagate across associations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeAction {
    Persist,
    Merge,
    Remove,
    Refresh,
    Evict,
}

impl CascadeAction {
    pub fn applies(self, style: &CascadeStyle) -> bool {
        match self {
            CascadeAction::Persist => style.persist,
            CascadeAction::Merge => style.merge,
            CascadeAction::Remove => style.remove,
            CascadeAction::Refresh => style.refresh,
            CascadeAction::Evict => style.evict,
        }
    }
}

/// Instances directly reachable from `entity` through associations that
/// cascade `action`.
///
/// Uninitialized proxies and collections are skipped unless `initialize`
/// is set, in which case they are loaded first.
#[track_caller]
pub(crate) fn cascade_targets(
    entity: &EntityRef,
    action: CascadeAction,
    initialize: bool,
) -> Result<Vec<EntityRef>> {
    let meta = entity.metadata();
    let mut targets = Vec::new();
    for prop in meta.properties() {
        let style = match &prop.kind {
            PropertyKind::ToOne(t) => t.cascade,
            PropertyKind::Collection(c) => c.cascade,
            PropertyKind::Basic(_) => continue,
        };
        if !action.applies(&style) {
            continue;
        }
        match entity.slot_value(prop.slot) {
            Some(PropertyValue::Reference(Some(Reference::Entity(target)))) => targets.push(target),
            Some(PropertyValue::Reference(Some(Reference::Proxy(proxy)))) => {
                if proxy.is_initialized() || initialize {
                    targets.push(proxy.get()?);
                }
            }
            Some(PropertyValue::Collection(collection)) => {
                if let Some(elements) = collection.loaded_elements() {
                    targets.extend(elements);
                } else if initialize {
                    targets.extend(collection.elements()?);
                }
            }
            _ => {}
        }
    }
    Ok(targets)
}

// ============================================================================
// Action graph
// ============================================================================

/// `before` must execute before `after`; `label` names the association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub before: usize,
    pub after: usize,
    pub label: String,
}

/// A dependency cycle, as the edges along it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle {
    pub edges: Vec<Edge>,
}

/// Actions `0..len` and their ordering constraints.
#[derive(Debug, Default)]
pub struct ActionGraph {
    len: usize,
    edges: Vec<Edge>,
}

impl ActionGraph {
    pub fn new(len: usize) -> Self {
        Self {
            len,
            edges: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn add_edge(&mut self, before: usize, after: usize, label: impl Into<String>) {
        self.edges.push(Edge {
            before,
            after,
            label: label.into(),
        });
    }

    /// A total order respecting every edge, stable by action index.
    pub fn order(&self) -> std::result::Result<Vec<usize>, Cycle> {
        let mut in_degree = vec![0usize; self.len];
        let mut outgoing: HashMap<usize, Vec<usize>> = HashMap::new();
        for edge in &self.edges {
            if edge.before == edge.after {
                continue;
            }
            in_degree[edge.after] += 1;
            outgoing.entry(edge.before).or_default().push(edge.after);
        }

        let mut ready: BTreeSet<usize> = (0..self.len).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.len);
        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &after in outgoing.get(&next).map(Vec::as_slice).unwrap_or_default() {
                in_degree[after] -= 1;
                if in_degree[after] == 0 {
                    ready.insert(after);
                }
            }
        }

        if order.len() == self.len {
            return Ok(order);
        }
        let placed: HashSet<usize> = order.into_iter().collect();
        let remaining: Vec<usize> = (0..self.len).filter(|i| !placed.contains(i)).collect();
        Err(self.find_cycle(&remaining))
    }

    fn find_cycle(&self, remaining: &[usize]) -> Cycle {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();
        for &start in remaining {
            if !visited.contains(&start)
                && self.detect_cycle_dfs(start, &mut visited, &mut rec_stack, &mut path)
            {
                return Cycle { edges: path };
            }
        }
        Cycle { edges: Vec::new() }
    }

    /// DFS over edges; on success `path` holds the edges of one cycle.
    fn detect_cycle_dfs(
        &self,
        node: usize,
        visited: &mut HashSet<usize>,
        rec_stack: &mut HashSet<usize>,
        path: &mut Vec<Edge>,
    ) -> bool {
        visited.insert(node);
        rec_stack.insert(node);

        for edge in self.edges.iter().filter(|e| e.before == node && e.after != node) {
            path.push(edge.clone());
            if !visited.contains(&edge.after) {
                if self.detect_cycle_dfs(edge.after, visited, rec_stack, path) {
                    return true;
                }
            } else if rec_stack.contains(&edge.after) {
                // trim the lead-in so the path starts on the cycle
                if let Some(start) = path.iter().position(|e| e.before == edge.after) {
                    path.drain(..start);
                }
                return true;
            }
            path.pop();
        }

        rec_stack.remove(&node);
        false
    }
}
