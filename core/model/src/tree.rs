//! Parent index over the group tree.
//!
//! Nodes never store a pointer to their parent. Back-references are answered
//! by a `TreeIndex` built from the tree on demand; it is a snapshot and must
//! be rebuilt after the tree changes.

use std::collections::HashMap;
use uuid::Uuid;

use crate::group::Group;

/// Which uuid namespace a node lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Group,
    Entry,
}

/// Where a node sits in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLocation {
    /// Parent group; `None` only for the root group.
    pub parent: Option<Uuid>,
    /// Position among the parent's children of the same kind.
    pub position: usize,
}

/// Snapshot index of every node's location.
#[derive(Debug, Clone)]
pub struct TreeIndex {
    root: Uuid,
    groups: HashMap<Uuid, NodeLocation>,
    entries: HashMap<Uuid, NodeLocation>,
}

impl TreeIndex {
    /// Index the tree below (and including) `root`.
    pub fn build(root: &Group) -> Self {
        let mut index = Self {
            root: root.uuid,
            groups: HashMap::new(),
            entries: HashMap::new(),
        };
        index.groups.insert(
            root.uuid,
            NodeLocation {
                parent: None,
                position: 0,
            },
        );
        index.visit(root);
        index
    }

    fn visit(&mut self, group: &Group) {
        for (position, entry) in group.entries.iter().enumerate() {
            self.entries.insert(
                entry.uuid,
                NodeLocation {
                    parent: Some(group.uuid),
                    position,
                },
            );
        }
        for (position, child) in group.groups.iter().enumerate() {
            self.groups.insert(
                child.uuid,
                NodeLocation {
                    parent: Some(group.uuid),
                    position,
                },
            );
            self.visit(child);
        }
    }

    pub fn root(&self) -> Uuid {
        self.root
    }

    pub fn location(&self, kind: NodeKind, id: &Uuid) -> Option<&NodeLocation> {
        match kind {
            NodeKind::Group => self.groups.get(id),
            NodeKind::Entry => self.entries.get(id),
        }
    }

    pub fn contains(&self, kind: NodeKind, id: &Uuid) -> bool {
        self.location(kind, id).is_some()
    }

    /// Parent group of a node, `None` for the root or unknown ids.
    pub fn parent(&self, kind: NodeKind, id: &Uuid) -> Option<Uuid> {
        self.location(kind, id).and_then(|l| l.parent)
    }

    /// Whether `group` equals `ancestor` or lies beneath it.
    pub fn is_within(&self, group: &Uuid, ancestor: &Uuid) -> bool {
        let mut current = Some(*group);
        while let Some(id) = current {
            if id == *ancestor {
                return true;
            }
            current = self.parent(NodeKind::Group, &id);
        }
        false
    }

    /// Ancestors of a group, nearest first, ending at the root.
    pub fn ancestors(&self, group: &Uuid) -> Vec<Uuid> {
        let mut out = Vec::new();
        let mut current = self.parent(NodeKind::Group, group);
        while let Some(id) = current {
            out.push(id);
            current = self.parent(NodeKind::Group, &id);
        }
        out
    }

    pub fn group_ids(&self) -> impl Iterator<Item = &Uuid> {
        self.groups.keys()
    }

    pub fn entry_ids(&self) -> impl Iterator<Item = &Uuid> {
        self.entries.keys()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}
