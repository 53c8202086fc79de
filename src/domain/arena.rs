//! Arena-based forest over a project's committed nodes.
//!
//! Built from an immutable store snapshot for read-side traversals
//! (mapping inheritance, rollups, export ordering). Uses a generational
//! arena for memory-safe node references and O(1) lookups; all traversal
//! is iterative over an explicit stack.

use std::collections::{BTreeMap, HashMap, HashSet};

use generational_arena::{Arena, Index};

use crate::domain::entities::{Node, NodeId};
use crate::domain::error::DomainError;

/// One slot in the arena: the node plus its structural links.
#[derive(Debug)]
pub struct TreeSlot {
    pub node: Node,
    pub parent: Option<Index>,
    /// Children ordered by (sort_order, id).
    pub children: Vec<Index>,
}

/// Arena-indexed forest of a project's nodes.
#[derive(Debug)]
pub struct NodeArena {
    arena: Arena<TreeSlot>,
    /// Root slots ordered by (sort_order, id).
    roots: Vec<Index>,
    by_id: HashMap<NodeId, Index>,
}

impl NodeArena {
    /// Build the forest from a snapshot's node map.
    ///
    /// The store enforces acyclicity and parent existence on every write;
    /// both are re-checked here so a corrupted snapshot surfaces as an
    /// error instead of a hung traversal.
    pub fn from_nodes(nodes: &BTreeMap<NodeId, Node>) -> Result<Self, DomainError> {
        let mut arena = Arena::with_capacity(nodes.len());
        let mut by_id = HashMap::with_capacity(nodes.len());

        for node in nodes.values() {
            let idx = arena.insert(TreeSlot {
                node: node.clone(),
                parent: None,
                children: Vec::new(),
            });
            by_id.insert(node.id.clone(), idx);
        }

        // Wire parent/child links.
        let indices: Vec<Index> = by_id.values().copied().collect();
        for idx in indices {
            let parent_id = arena[idx].node.parent_id.clone();
            if let Some(parent_id) = parent_id {
                let parent_idx = *by_id.get(&parent_id).ok_or_else(|| {
                    DomainError::OrphanParent {
                        node: arena[idx].node.id.clone(),
                        parent: parent_id.clone(),
                    }
                })?;
                arena[idx].parent = Some(parent_idx);
                arena[parent_idx].children.push(idx);
            }
        }

        let sort_key = |arena: &Arena<TreeSlot>, idx: Index| {
            let slot = &arena[idx];
            (slot.node.sort_order, slot.node.id.clone())
        };

        let mut roots: Vec<Index> = arena
            .iter()
            .filter(|(_, slot)| slot.parent.is_none())
            .map(|(idx, _)| idx)
            .collect();
        roots.sort_by_key(|&idx| sort_key(&arena, idx));

        let child_lists: Vec<Index> = arena.iter().map(|(idx, _)| idx).collect();
        for idx in child_lists {
            let mut children = std::mem::take(&mut arena[idx].children);
            children.sort_by_key(|&c| sort_key(&arena, c));
            arena[idx].children = children;
        }

        let forest = Self {
            arena,
            roots,
            by_id,
        };
        forest.check_fully_reachable()?;
        Ok(forest)
    }

    /// Every slot must be reachable from a root; an unreachable slot means
    /// a parent cycle survived into the snapshot.
    fn check_fully_reachable(&self) -> Result<(), DomainError> {
        let mut visited = HashSet::with_capacity(self.arena.len());
        for (idx, _) in self.iter() {
            visited.insert(idx);
        }
        if visited.len() != self.arena.len() {
            let stranded = self
                .arena
                .iter()
                .find(|(idx, _)| !visited.contains(idx))
                .map(|(_, slot)| slot.node.id.clone())
                .unwrap_or_else(|| NodeId::new("?"));
            return Err(DomainError::CycleDetected(stranded));
        }
        Ok(())
    }

    pub fn get(&self, idx: Index) -> Option<&TreeSlot> {
        self.arena.get(idx)
    }

    pub fn index_of(&self, id: &NodeId) -> Option<Index> {
        self.by_id.get(id).copied()
    }

    pub fn roots(&self) -> &[Index] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Pre-order traversal of the whole forest, roots in order.
    pub fn iter(&self) -> ForestIterator<'_> {
        ForestIterator {
            arena: self,
            visited: HashSet::with_capacity(self.arena.len()),
            stack: self.roots.iter().rev().copied().collect(),
        }
    }

    /// Pre-order traversal of the subtree rooted at `idx` (inclusive).
    pub fn subtree(&self, idx: Index) -> ForestIterator<'_> {
        ForestIterator {
            arena: self,
            visited: HashSet::new(),
            stack: vec![idx],
        }
    }

    /// Depth of a slot: 0 for roots, parent depth + 1 otherwise.
    pub fn depth_of(&self, idx: Index) -> usize {
        let mut depth = 0;
        let mut current = self.arena.get(idx).and_then(|slot| slot.parent);
        while let Some(parent_idx) = current {
            depth += 1;
            current = self.arena.get(parent_idx).and_then(|slot| slot.parent);
        }
        depth
    }
}

impl std::ops::Index<Index> for NodeArena {
    type Output = TreeSlot;

    fn index(&self, idx: Index) -> &TreeSlot {
        &self.arena[idx]
    }
}

/// Iterative pre-order iterator. A slot seen twice is skipped, so a
/// malformed child list cannot loop the walk.
pub struct ForestIterator<'a> {
    arena: &'a NodeArena,
    visited: HashSet<Index>,
    stack: Vec<Index>,
}

impl<'a> Iterator for ForestIterator<'a> {
    type Item = (Index, &'a TreeSlot);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(current_idx) = self.stack.pop() {
            if !self.visited.insert(current_idx) {
                continue;
            }
            if let Some(slot) = self.arena.get(current_idx) {
                // Push children in reverse order for left-to-right traversal
                for &child in slot.children.iter().rev() {
                    self.stack.push(child);
                }
                return Some((current_idx, slot));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::NodeFlags;

    fn node(id: &str, parent: Option<&str>, sort: i64) -> Node {
        Node {
            id: NodeId::new(id),
            name: id.to_string(),
            parent_id: parent.map(NodeId::new),
            description: String::new(),
            levels: Vec::new(),
            flags: NodeFlags::default(),
            formula_group: None,
            sort_order: sort,
        }
    }

    fn forest(nodes: Vec<Node>) -> NodeArena {
        let map: BTreeMap<NodeId, Node> =
            nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
        NodeArena::from_nodes(&map).unwrap()
    }

    #[test]
    fn given_two_trees_when_iterating_then_preorder_respects_sort_order() {
        let arena = forest(vec![
            node("B_ROOT", None, 2),
            node("A_ROOT", None, 1),
            node("A_CHILD2", Some("A_ROOT"), 2),
            node("A_CHILD1", Some("A_ROOT"), 1),
        ]);

        let order: Vec<String> = arena
            .iter()
            .map(|(_, slot)| slot.node.id.to_string())
            .collect();
        assert_eq!(order, vec!["A_ROOT", "A_CHILD1", "A_CHILD2", "B_ROOT"]);
    }

    #[test]
    fn given_subtree_when_iterating_then_only_descendants_visited() {
        let arena = forest(vec![
            node("ROOT", None, 0),
            node("A", Some("ROOT"), 0),
            node("A1", Some("A"), 0),
            node("B", Some("ROOT"), 1),
        ]);

        let a = arena.index_of(&NodeId::new("A")).unwrap();
        let ids: Vec<String> = arena
            .subtree(a)
            .map(|(_, slot)| slot.node.id.to_string())
            .collect();
        assert_eq!(ids, vec!["A", "A1"]);
    }

    #[test]
    fn given_orphan_parent_when_building_then_errors() {
        let map: BTreeMap<NodeId, Node> = [node("X", Some("MISSING"), 0)]
            .into_iter()
            .map(|n| (n.id.clone(), n))
            .collect();
        let result = NodeArena::from_nodes(&map);
        assert!(matches!(result, Err(DomainError::OrphanParent { .. })));
    }

    #[test]
    fn given_deep_chain_when_computing_depth_then_counts_edges() {
        let arena = forest(vec![
            node("R", None, 0),
            node("C1", Some("R"), 0),
            node("C2", Some("C1"), 0),
        ]);
        let c2 = arena.index_of(&NodeId::new("C2")).unwrap();
        assert_eq!(arena.depth_of(c2), 2);
    }
}
