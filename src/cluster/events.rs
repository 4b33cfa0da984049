//! Cluster membership events.

use crate::cluster::group::GroupListener;
use crate::cluster::view::View;
use crate::types::Node;

/// Discovery-level events that drive view changes.
#[derive(Debug, Clone)]
pub enum MemberEvent {
    /// A new node joined the cluster.
    NodeJoin {
        /// The node.
        node: Node,
    },

    /// A node left the cluster gracefully.
    NodeLeave {
        /// The node.
        node: Node,
    },

    /// A node is suspected to have failed.
    NodeSuspect {
        /// The node.
        node: Node,
        /// Number of failed ping attempts.
        failed_pings: usize,
    },

    /// A node has been confirmed as failed.
    NodeFailed {
        /// The node.
        node: Node,
    },

    /// A previously failed node has recovered.
    NodeRecovered {
        /// The node.
        node: Node,
    },
}

impl MemberEvent {
    /// Get the node associated with this event.
    pub fn node(&self) -> &Node {
        match self {
            MemberEvent::NodeJoin { node } => node,
            MemberEvent::NodeLeave { node } => node,
            MemberEvent::NodeSuspect { node, .. } => node,
            MemberEvent::NodeFailed { node } => node,
            MemberEvent::NodeRecovered { node } => node,
        }
    }

    /// Check if this is a join-type event.
    pub fn is_join(&self) -> bool {
        matches!(
            self,
            MemberEvent::NodeJoin { .. } | MemberEvent::NodeRecovered { .. }
        )
    }

    /// Check if this is a leave-type event.
    pub fn is_leave(&self) -> bool {
        matches!(
            self,
            MemberEvent::NodeLeave { .. } | MemberEvent::NodeFailed { .. }
        )
    }
}

/// Group listener that logs view changes.
pub struct LoggingListener;

impl GroupListener for LoggingListener {
    fn membership_changed(&self, previous: &View, current: &View, merged: bool) {
        let departed = current.departed_since(previous);
        let joined = current.joined_since(previous);

        if merged {
            tracing::info!(
                view_id = current.id(),
                members = current.len(),
                subgroups = current.subgroups().len(),
                "Partition healed, merged view installed"
            );
        } else {
            tracing::info!(
                view_id = current.id(),
                members = current.len(),
                joined = joined.len(),
                departed = departed.len(),
                "View installed"
            );
        }

        for node in &departed {
            tracing::debug!(%node, "Member departed");
        }
        for node in &joined {
            tracing::debug!(%node, "Member joined");
        }
    }
}
