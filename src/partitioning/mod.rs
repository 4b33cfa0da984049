//! Ownership of identifiers across group members.
//!
//! Identifiers are mapped to members with a consistent hash ring so that a
//! view change moves as few identifiers as possible:
//!
//! ```text
//! id "user:123" -> xxHash64 -> first vnode clockwise -> owning member
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let resolver = HashRingResolver::new();
//! let owner = resolver.owner(&"user:123".to_string(), &group.view());
//! ```

mod hashring;
mod locality;

pub use hashring::{hash_key, HashRing, DEFAULT_VNODES_PER_NODE};
pub use locality::{HashRingResolver, OwnerResolver};
