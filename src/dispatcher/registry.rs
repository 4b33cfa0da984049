//! Named registry of dispatcher factories.

use crate::dispatcher::factory::CommandDispatcherFactory;
use crate::error::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Holds the dispatcher factories of a process, keyed by name.
///
/// Created at start-up and passed to whatever needs a factory. `shutdown`
/// closes every registered factory.
#[derive(Debug, Default)]
pub struct DispatcherRegistry {
    factories: DashMap<String, Arc<CommandDispatcherFactory>>,
    closed: AtomicBool,
}

impl DispatcherRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `name`.
    pub fn register(&self, name: impl Into<String>, factory: Arc<CommandDispatcherFactory>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Internal("dispatcher registry is shut down".to_string()));
        }

        let name = name.into();
        match self.factories.entry(name) {
            Entry::Occupied(entry) => Err(Error::Config(format!(
                "a dispatcher factory named '{}' is already registered",
                entry.key()
            ))),
            Entry::Vacant(entry) => {
                entry.insert(factory);
                Ok(())
            }
        }
    }

    /// Look up a factory.
    pub fn get(&self, name: &str) -> Option<Arc<CommandDispatcherFactory>> {
        self.factories.get(name).map(|entry| entry.value().clone())
    }

    /// Remove a factory without closing it.
    pub fn remove(&self, name: &str) -> Option<Arc<CommandDispatcherFactory>> {
        self.factories.remove(name).map(|(_, factory)| factory)
    }

    /// Registered names.
    pub fn names(&self) -> Vec<String> {
        self.factories.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Close and remove every factory. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let names = self.names();
        for name in names {
            if let Some((_, factory)) = self.factories.remove(&name) {
                factory.close();
            }
        }
        info!("Dispatcher registry shut down");
    }
}
