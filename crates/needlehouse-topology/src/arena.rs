//! Slab arena for topology nodes.
//!
//! Topology nodes reference both their parent and their children. Owning
//! references in both directions would be a cycle, so every node lives in
//! one flat `Vec` and links are plain indexes ([`NodeId`]). Nodes are never
//! removed from the arena mid-flight; detaching a node just unlinks it from
//! its parent and pushes the slot onto a free list for reuse.

use std::collections::HashMap;

/// Index of a node in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    DataCenter,
    Rack,
    DataNode,
}

#[derive(Debug)]
pub struct Node<T> {
    pub kind: NodeKind,
    pub name: String,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub value: T,
}

#[derive(Debug, Default)]
pub struct Arena<T> {
    nodes: Vec<Option<Node<T>>>,
    free: Vec<usize>,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn insert(
        &mut self,
        kind: NodeKind,
        name: String,
        parent: Option<NodeId>,
        value: T,
    ) -> NodeId {
        let node = Node {
            kind,
            name,
            parent,
            children: Vec::new(),
            value,
        };
        let id = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                NodeId(slot)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId(self.nodes.len() - 1)
            }
        };
        if let Some(parent) = parent {
            self.get_mut(parent).children.push(id);
        }
        id
    }

    pub fn get(&self, id: NodeId) -> &Node<T> {
        self.nodes[id.0].as_ref().expect("stale node id")
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut Node<T> {
        self.nodes[id.0].as_mut().expect("stale node id")
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.get(id.0).map(|n| n.is_some()).unwrap_or(false)
    }

    /// Unlink `id` from its parent and free the slot. Children must have
    /// been removed first.
    pub fn remove(&mut self, id: NodeId) -> Node<T> {
        let node = self.nodes[id.0].take().expect("stale node id");
        debug_assert!(node.children.is_empty(), "removing node with children");
        if let Some(parent) = node.parent {
            self.get_mut(parent).children.retain(|c| *c != id);
        }
        self.free.push(id.0);
        node
    }

    /// Find a child of `parent` by name.
    pub fn child_by_name(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.get(parent)
            .children
            .iter()
            .copied()
            .find(|c| self.get(*c).name == name)
    }

    /// All live node ids of a given kind.
    pub fn ids_of_kind(&self, kind: NodeKind) -> Vec<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| match n {
                Some(node) if node.kind == kind => Some(NodeId(i)),
                _ => None,
            })
            .collect()
    }

    /// Name → id map of the children of `parent`.
    pub fn children_by_name(&self, parent: NodeId) -> HashMap<String, NodeId> {
        self.get(parent)
            .children
            .iter()
            .map(|c| (self.get(*c).name.clone(), *c))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_links_parent_and_child() {
        let mut arena: Arena<u32> = Arena::new();
        let dc = arena.insert(NodeKind::DataCenter, "dc1".into(), None, 0);
        let rack = arena.insert(NodeKind::Rack, "rack1".into(), Some(dc), 0);
        assert_eq!(arena.get(rack).parent, Some(dc));
        assert_eq!(arena.get(dc).children, vec![rack]);
    }

    #[test]
    fn test_remove_unlinks_and_reuses_slot() {
        let mut arena: Arena<u32> = Arena::new();
        let dc = arena.insert(NodeKind::DataCenter, "dc1".into(), None, 0);
        let rack = arena.insert(NodeKind::Rack, "rack1".into(), Some(dc), 0);
        arena.remove(rack);
        assert!(arena.get(dc).children.is_empty());
        assert!(!arena.contains(rack));

        // Freed slot is reused
        let rack2 = arena.insert(NodeKind::Rack, "rack2".into(), Some(dc), 0);
        assert_eq!(rack2, rack);
        assert!(arena.contains(rack2));
    }

    #[test]
    fn test_child_by_name() {
        let mut arena: Arena<()> = Arena::new();
        let dc = arena.insert(NodeKind::DataCenter, "dc1".into(), None, ());
        let rack = arena.insert(NodeKind::Rack, "r1".into(), Some(dc), ());
        assert_eq!(arena.child_by_name(dc, "r1"), Some(rack));
        assert_eq!(arena.child_by_name(dc, "r2"), None);
    }
}
