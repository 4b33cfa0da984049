//! Distributed command dispatch.
//!
//! A `CommandDispatcherFactory` per node creates `CommandDispatcher`s, each
//! bound to a cluster-wide service id and a local context. Dispatchers send
//! `Command`s to one member, to the coordinator or to the whole group, and
//! hand back one `CommandResponse` future per target.

mod command;
mod factory;
mod registry;
mod response;
mod service;

pub use command::Command;
pub use factory::CommandDispatcherFactory;
pub use registry::DispatcherRegistry;
pub use response::CommandResponse;
pub use service::CommandDispatcher;
