//! Cluster-wide expiration of cache entries.
//!
//! Entries carry `ExpirationMetaData` (idle timeout and last access time).
//! The `ExpirationScheduler` arms one timer per entry on the entry's owner
//! and, when it fires, removes the entry there exactly once and notifies the
//! registered `ExpirationListener`s.

mod marshaller;
mod metadata;
mod scheduler;

pub use marshaller::{ProtoMarshaller, ProtoReader, ProtoWriter};
pub use metadata::ExpirationMetaData;
pub use scheduler::{ExpirationListener, ExpirationRemover, ExpirationScheduler, EXPIRATION_SERVICE};

use std::time::Duration;

/// Idle timeout of an entry whose metadata does not say otherwise.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);
