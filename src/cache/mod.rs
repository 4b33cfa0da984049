//! Cache-side collaborators of the schedulers.

mod store;

pub use store::{InMemoryStore, MetaDataStore};
