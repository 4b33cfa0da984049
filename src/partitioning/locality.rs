//! Resolving the owner of an identifier in a view.

use crate::cluster::view::View;
use crate::partitioning::hashring::{HashRing, DEFAULT_VNODES_PER_NODE};
use crate::types::{Node, ViewId};
use parking_lot::Mutex;
use std::hash::Hash;
use std::sync::Arc;

/// Decides which member of a view owns an identifier.
///
/// Every member must derive the same owner from the same view.
pub trait OwnerResolver<I>: Send + Sync + 'static {
    /// The owner of `id` in `view`, or None if the view is empty.
    fn owner(&self, id: &I, view: &View) -> Option<Node>;
}

impl<I, F> OwnerResolver<I> for F
where
    F: Fn(&I, &View) -> Option<Node> + Send + Sync + 'static,
{
    fn owner(&self, id: &I, view: &View) -> Option<Node> {
        self(id, view)
    }
}

/// Resolves owners with a consistent hash ring built from the view.
///
/// The ring for the latest view is cached and rebuilt when the view changes.
pub struct HashRingResolver {
    vnodes_per_node: usize,
    cached: Mutex<Option<(ViewId, Vec<Node>, Arc<HashRing>)>>,
}

impl HashRingResolver {
    /// Create a resolver with the default vnode count.
    pub fn new() -> Self {
        Self::with_vnodes(DEFAULT_VNODES_PER_NODE)
    }

    /// Create a resolver with a custom vnode count.
    pub fn with_vnodes(vnodes_per_node: usize) -> Self {
        Self {
            vnodes_per_node,
            cached: Mutex::new(None),
        }
    }

    /// The ring for `view`.
    pub fn ring(&self, view: &View) -> Arc<HashRing> {
        let mut cached = self.cached.lock();
        if let Some((id, members, ring)) = cached.as_ref() {
            if *id == view.id() && members.as_slice() == view.members() {
                return ring.clone();
            }
        }

        let ring = Arc::new(HashRing::from_members(view.members(), self.vnodes_per_node));
        *cached = Some((view.id(), view.members().to_vec(), ring.clone()));
        ring
    }
}

impl Default for HashRingResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Hash + Send + Sync + 'static> OwnerResolver<I> for HashRingResolver {
    fn owner(&self, id: &I, view: &View) -> Option<Node> {
        self.ring(view).owner(id).cloned()
    }
}

impl std::fmt::Debug for HashRingResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashRingResolver")
            .field("vnodes_per_node", &self.vnodes_per_node)
            .finish()
    }
}
