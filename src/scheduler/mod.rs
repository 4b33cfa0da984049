//! Keyed schedulers.
//!
//! `LocalScheduler` keeps at most one timer per identifier on this node.
//! `ClusteredScheduler` builds on it so that each identifier's timer lives on
//! the member that owns the identifier, and follows ownership as the view
//! changes.

mod clustered;
mod local;
mod version;

pub use clustered::{ClusteredScheduler, ClusteredSchedulerBuilder, SchedulerCommand, SchedulerContext};
pub use local::{Completion, DeadlineStrategy, LocalScheduler, ScheduledTask};
pub use version::Version;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::hash::Hash;

/// Identifier types a clustered scheduler can route.
pub trait ScheduleKey:
    Clone + Eq + Hash + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> ScheduleKey for T where
    T: Clone + Eq + Hash + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Value types a clustered scheduler can ship between members.
pub trait ScheduleValue: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> ScheduleValue for T where T: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}
