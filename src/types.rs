//! Core types used throughout the crate.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

/// Monotonically increasing identifier of an installed view.
pub type ViewId = u64;

/// An addressable cluster participant.
///
/// Identity is the address: two nodes with the same address are the same
/// member even if their names differ. Equality, ordering and hashing all go
/// through `addr`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Logical name, used in logs.
    pub name: SmolStr,
    /// Address the node's transport listens on.
    pub addr: SocketAddr,
}

impl Node {
    /// Create a new node.
    pub fn new(name: impl Into<SmolStr>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
        }
    }

    /// Create a node named after its address.
    pub fn from_addr(addr: SocketAddr) -> Self {
        Self {
            name: SmolStr::new(addr.to_string()),
            addr,
        }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
    }
}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Node {
    fn cmp(&self, other: &Self) -> Ordering {
        self.addr.cmp(&other.addr)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.addr)
    }
}
