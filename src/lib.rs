//! Cluster command dispatch and owner-aware expiration scheduling.
//!
//! This crate provides the plumbing a distributed cache needs to expire
//! entries exactly once across a group of nodes:
//! - **Group membership** with view change notifications (join, leave, merge)
//! - **Command dispatch** to one member, the coordinator or the whole group,
//!   with the same result and error shapes whether the target is local or
//!   remote
//! - **Keyed scheduling** where each identifier's timer lives on the member
//!   that owns it, and follows ownership as the view changes
//! - **Expiration** of cache entries built on the scheduler, with a
//!   protobuf-compatible metadata encoding
//!
//! # Example
//!
//! ```rust,no_run
//! use crema_dispatch::{
//!     ClusterConfig, CommandDispatcherFactory, ExpirationScheduler, InMemoryStore,
//!     MembershipGroup, Node, TcpTransport,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClusterConfig::new("node-1", "127.0.0.1:7600".parse()?);
//!     let local = Node::new(config.node_name.clone(), config.bind_addr);
//!
//!     // Membership: views are installed by the discovery layer
//!     let group = MembershipGroup::new(local, config.group.clone());
//!
//!     // Dispatch: one factory per node, serving requests over TCP
//!     let transport = Arc::new(TcpTransport::new(&config.dispatcher));
//!     let factory = CommandDispatcherFactory::new(group.clone(), transport, config.dispatcher.clone());
//!     factory.listen(config.bind_addr).await?;
//!
//!     // Expiration over the node's metadata store
//!     let store = Arc::new(InMemoryStore::new());
//!     let expiration = ExpirationScheduler::new(
//!         &factory,
//!         store.clone(),
//!         config.expiration.clone(),
//!         config.scheduler.clone(),
//!     )?;
//!
//!     let metadata = expiration.metadata_now();
//!     store.insert("session-1".to_string(), metadata);
//!     expiration.schedule("session-1".to_string(), metadata);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │            Application Layer                │
//! └─────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │          ExpirationScheduler                │
//! │  • schedule(id, metadata)                   │
//! │  • cancel(id)                               │
//! └─────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │   ClusteredScheduler  ──  LocalScheduler    │
//! └─────────────────────────────────────────────┘
//!                     │
//!     ┌───────────────┼───────────────┐
//!     ▼               ▼               ▼
//! ┌─────────┐   ┌──────────┐   ┌─────────────┐
//! │  Group  │   │ Command  │   │  Hash ring  │
//! │  views  │   │ dispatch │   │  ownership  │
//! └─────────┘   └──────────┘   └─────────────┘
//! ```
//!
//! # Delivery Model
//!
//! - **Schedules**: armed on the owner of the identifier in the current view
//! - **Fires**: forwarded to whoever owns the identifier when the timer fires
//! - **Departures**: responses from departed members settle as cancelled, and
//!   the new owners re-arm from their metadata store

pub mod cache;
pub mod cluster;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod expiration;
pub mod metrics;
pub mod network;
pub mod partitioning;
pub mod scheduler;
#[cfg(test)]
pub(crate) mod testing;
pub mod types;

// Re-export main types for convenience
pub use config::{
    ClusterConfig, DispatcherConfig, ExpirationConfig, GroupConfig, SchedulerConfig,
};
pub use error::{
    CommandError, DispatcherError, Error, ExecutionError, MarshalError, NetworkError, Result,
};
pub use types::{Node, ViewId};

// Re-export cluster types
pub use cluster::{Group, GroupListener, LoggingListener, MemberEvent, MembershipGroup, Registration, View};

// Re-export dispatcher types
pub use dispatcher::{
    Command, CommandDispatcher, CommandDispatcherFactory, CommandResponse, DispatcherRegistry,
};

// Re-export network types
pub use network::{TcpTransport, Transport};

// Re-export partitioning types
pub use partitioning::{HashRing, HashRingResolver, OwnerResolver};

// Re-export scheduling types
pub use cache::{InMemoryStore, MetaDataStore};
pub use scheduler::{ClusteredScheduler, Completion, DeadlineStrategy, LocalScheduler, ScheduledTask};

// Re-export expiration types
pub use expiration::{ExpirationListener, ExpirationMetaData, ExpirationScheduler};

// Re-export metrics types
pub use metrics::{Counter, DispatcherMetrics, Gauge, SchedulerMetrics};
