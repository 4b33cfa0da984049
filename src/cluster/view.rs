//! Immutable, ordered snapshots of group membership.

use crate::types::{Node, ViewId};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// An ordered, immutable snapshot of the group's members.
///
/// The first member is the coordinator. A view produced by healing a
/// partition also remembers the sub-views it was merged from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct View {
    id: ViewId,
    members: Vec<Node>,
    subgroups: Vec<Vec<Node>>,
}

impl View {
    /// Create a view. Duplicate members are dropped, keeping the first
    /// occurrence.
    pub fn new(id: ViewId, members: impl IntoIterator<Item = Node>) -> Self {
        Self {
            id,
            members: dedup(members),
            subgroups: Vec::new(),
        }
    }

    /// The initial view of a group: just the local member.
    pub fn initial(local: Node) -> Self {
        Self::new(0, [local])
    }

    /// Union of several sub-views into one merged view.
    ///
    /// Sub-views are ordered largest first (ties broken by coordinator
    /// address), so every node that performs the same merge derives the same
    /// member order and the same coordinator.
    pub fn merged(id: ViewId, subviews: &[Arc<View>]) -> Self {
        let mut ordered: Vec<&Arc<View>> = subviews.iter().collect();
        ordered.sort_by(|a, b| {
            b.len()
                .cmp(&a.len())
                .then_with(|| a.coordinator().cmp(&b.coordinator()))
        });

        let members = ordered
            .iter()
            .flat_map(|view| view.members.iter().cloned())
            .collect::<Vec<_>>();

        Self {
            id,
            members: dedup(members),
            subgroups: ordered.iter().map(|view| view.members.clone()).collect(),
        }
    }

    /// The view identifier.
    pub fn id(&self) -> ViewId {
        self.id
    }

    /// Members in view order.
    pub fn members(&self) -> &[Node] {
        &self.members
    }

    /// The coordinator (first member), if the view is not empty.
    pub fn coordinator(&self) -> Option<&Node> {
        self.members.first()
    }

    /// Whether the node is a member.
    pub fn contains(&self, node: &Node) -> bool {
        self.members.contains(node)
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the view has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Whether this view was produced by a merge.
    pub fn is_merge(&self) -> bool {
        !self.subgroups.is_empty()
    }

    /// Sub-views this view was merged from (empty unless `is_merge`).
    pub fn subgroups(&self) -> &[Vec<Node>] {
        &self.subgroups
    }

    /// Members of `previous` that are not in this view.
    pub fn departed_since(&self, previous: &View) -> Vec<Node> {
        previous
            .members
            .iter()
            .filter(|node| !self.contains(node))
            .cloned()
            .collect()
    }

    /// Members of this view that were not in `previous`.
    pub fn joined_since(&self, previous: &View) -> Vec<Node> {
        self.members
            .iter()
            .filter(|node| !previous.contains(node))
            .cloned()
            .collect()
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] (", self.id)?;
        for (i, node) in self.members.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", node)?;
        }
        f.write_str(")")
    }
}

fn dedup(members: impl IntoIterator<Item = Node>) -> Vec<Node> {
    let mut seen = HashSet::new();
    members
        .into_iter()
        .filter(|node| seen.insert(node.addr))
        .collect()
}
