//! Group membership.
//!
//! A group publishes ordered views of its members; the first member of a view
//! is the coordinator. Components interested in membership register a
//! `GroupListener` and receive every view change, including merges that heal
//! a partition.

pub mod events;
pub mod group;
pub mod membership;
pub mod view;

pub use events::{LoggingListener, MemberEvent};
pub use group::{Group, GroupListener, Registration};
pub use membership::MembershipGroup;
pub use view::View;
