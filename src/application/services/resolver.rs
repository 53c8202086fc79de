//! Mapping resolution: own and inherited source mappings per node.
//!
//! Inheritance is strictly upward: a mapping on a descendant surfaces on
//! every ancestor's inherited view, never the other way around. All
//! traversal is iterative over the arena forest with an explicit stack,
//! so subtree depth never risks unbounded recursion.

use std::collections::BTreeMap;

use generational_arena::Index;
use serde::Serialize;
use tracing::debug;

use crate::application::error::ApplicationResult;
use crate::application::services::store::ProjectState;
use crate::domain::arena::NodeArena;
use crate::domain::entities::{NodeId, SourceMapping};
use crate::domain::error::DomainError;

/// Mappings directly on one node, grouped by precedence group.
#[derive(Debug, Clone, Serialize)]
pub struct OwnMappings {
    pub node: NodeId,
    /// Group key → mappings ordered by mapping_index.
    pub groups: BTreeMap<String, Vec<SourceMapping>>,
}

impl OwnMappings {
    pub fn count(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }
}

/// One inherited mapping with the full name path from the queried node
/// down to the mapping's owner, e.g. `["Revenue", "Product", "Licences"]`.
#[derive(Debug, Clone, Serialize)]
pub struct InheritedMapping {
    pub mapping: SourceMapping,
    pub owner: NodeId,
    pub path: Vec<String>,
}

impl InheritedMapping {
    /// Path rendered as `Parent / Child / Grandchild`.
    pub fn path_display(&self) -> String {
        self.path.join(" / ")
    }
}

/// Per-child expansion hint: "X mappings directly on this child" plus
/// "+Y more in its subtree".
#[derive(Debug, Clone, Serialize)]
pub struct ChildBreakdown {
    pub child: NodeId,
    pub name: String,
    pub direct_count: usize,
    pub deeper_count: usize,
}

impl ChildBreakdown {
    /// Total mappings contributed by this child's subtree.
    pub fn subtree_total(&self) -> usize {
        self.direct_count + self.deeper_count
    }
}

/// Aggregated mapping view over a node's whole subtree.
#[derive(Debug, Clone, Serialize)]
pub struct InheritedMappingView {
    pub node: NodeId,
    pub own_count: usize,
    /// Mappings on strict descendants, in traversal order.
    pub entries: Vec<InheritedMapping>,
    pub children: Vec<ChildBreakdown>,
    /// Own + every descendant's mappings.
    pub total: usize,
}

/// Per-precedence-group counts for a summary line.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PrecedenceCount {
    pub own: usize,
    pub inherited: usize,
}

/// Compact rollup used by list views.
#[derive(Debug, Clone, Serialize)]
pub struct MappingSummary {
    pub node: NodeId,
    pub own: usize,
    pub inherited: usize,
    pub total: usize,
    pub by_precedence: BTreeMap<String, PrecedenceCount>,
}

/// Mappings of a node plus all descendants, grouped by precedence group.
#[derive(Debug, Clone, Serialize)]
pub struct PrecedenceView {
    pub node: NodeId,
    pub groups: BTreeMap<String, Vec<SourceMapping>>,
}

/// Read-side service computing mapping views from immutable snapshots.
/// Nothing is cached across calls; every view reflects exactly the
/// snapshot it was computed from.
pub struct MappingResolver;

impl Default for MappingResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl MappingResolver {
    pub fn new() -> Self {
        Self
    }

    /// Mappings directly on `node`, grouped by precedence group.
    pub fn own_mappings(
        &self,
        state: &ProjectState,
        node: &NodeId,
    ) -> ApplicationResult<OwnMappings> {
        if !state.nodes.contains_key(node) {
            return Err(DomainError::UnknownNode(node.clone()).into());
        }
        let mut groups: BTreeMap<String, Vec<SourceMapping>> = BTreeMap::new();
        for mapping in state.mappings_of(node) {
            groups
                .entry(mapping.precedence_group.clone())
                .or_default()
                .push(mapping.clone());
        }
        Ok(OwnMappings {
            node: node.clone(),
            groups,
        })
    }

    /// Aggregate every descendant's mappings with full name paths and a
    /// per-child breakdown. Visits each node at most once.
    pub fn inherited_mappings(
        &self,
        state: &ProjectState,
        node: &NodeId,
    ) -> ApplicationResult<InheritedMappingView> {
        let arena = NodeArena::from_nodes(&state.nodes)?;
        let root_idx = arena
            .index_of(node)
            .ok_or_else(|| DomainError::UnknownNode(node.clone()))?;
        let root_name = arena[root_idx].node.name.clone();

        let own_count = state.mappings_of(node).len();
        let mut entries: Vec<InheritedMapping> = Vec::new();

        // Stack carries the name path from the queried node (inclusive).
        let mut stack: Vec<(Index, Vec<String>)> = vec![(root_idx, vec![root_name])];
        while let Some((idx, path)) = stack.pop() {
            let slot = &arena[idx];
            if idx != root_idx {
                for mapping in state.mappings_of(&slot.node.id) {
                    entries.push(InheritedMapping {
                        mapping: mapping.clone(),
                        owner: slot.node.id.clone(),
                        path: path.clone(),
                    });
                }
            }
            for &child in slot.children.iter().rev() {
                let mut child_path = path.clone();
                child_path.push(arena[child].node.name.clone());
                stack.push((child, child_path));
            }
        }

        let children = arena[root_idx]
            .children
            .iter()
            .map(|&child_idx| {
                let child = &arena[child_idx].node;
                let direct_count = state.mappings_of(&child.id).len();
                let subtree_count: usize = arena
                    .subtree(child_idx)
                    .map(|(_, slot)| state.mappings_of(&slot.node.id).len())
                    .sum();
                ChildBreakdown {
                    child: child.id.clone(),
                    name: child.name.clone(),
                    direct_count,
                    deeper_count: subtree_count - direct_count,
                }
            })
            .collect();

        let total = own_count + entries.len();
        debug!(
            "inherited_mappings: node={} own={} inherited={} total={}",
            node,
            own_count,
            entries.len(),
            total
        );
        Ok(InheritedMappingView {
            node: node.clone(),
            own_count,
            entries,
            children,
            total,
        })
    }

    /// Own, inherited and total counts, split by precedence group.
    pub fn mapping_summary(
        &self,
        state: &ProjectState,
        node: &NodeId,
    ) -> ApplicationResult<MappingSummary> {
        let view = self.inherited_mappings(state, node)?;

        let mut by_precedence: BTreeMap<String, PrecedenceCount> = BTreeMap::new();
        for mapping in state.mappings_of(node) {
            by_precedence
                .entry(mapping.precedence_group.clone())
                .or_default()
                .own += 1;
        }
        for entry in &view.entries {
            by_precedence
                .entry(entry.mapping.precedence_group.clone())
                .or_default()
                .inherited += 1;
        }

        Ok(MappingSummary {
            node: node.clone(),
            own: view.own_count,
            inherited: view.entries.len(),
            total: view.total,
            by_precedence,
        })
    }

    /// Mappings of the node plus all descendants, grouped by precedence
    /// group and ordered by mapping_index within each group.
    pub fn precedence_view(
        &self,
        state: &ProjectState,
        node: &NodeId,
    ) -> ApplicationResult<PrecedenceView> {
        let arena = NodeArena::from_nodes(&state.nodes)?;
        let root_idx = arena
            .index_of(node)
            .ok_or_else(|| DomainError::UnknownNode(node.clone()))?;

        let mut groups: BTreeMap<String, Vec<SourceMapping>> = BTreeMap::new();
        for (_, slot) in arena.subtree(root_idx) {
            for mapping in state.mappings_of(&slot.node.id) {
                groups
                    .entry(mapping.precedence_group.clone())
                    .or_default()
                    .push(mapping.clone());
            }
        }
        for mappings in groups.values_mut() {
            mappings.sort_by_key(|m| (m.mapping_index, m.node_id.clone()));
        }

        Ok(PrecedenceView {
            node: node.clone(),
            groups,
        })
    }
}
