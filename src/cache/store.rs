//! Metadata persistence accessor.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

/// Read/remove access to the metadata of locally held entries.
///
/// The schedulers use this to re-derive schedules after view changes and to
/// remove expired entries.
pub trait MetaDataStore<I, V>: Send + Sync + 'static {
    /// Metadata stored for `id`.
    fn load(&self, id: &I) -> Option<V>;

    /// Identifiers of every locally held entry.
    fn keys(&self) -> Vec<I>;

    /// Remove the entry, returning its metadata.
    fn remove(&self, id: &I) -> Option<V>;

    /// Remove the entry only if `predicate` accepts its current metadata.
    ///
    /// The default implementation loads then removes; stores that can do both
    /// under one lock should override it.
    fn remove_if(&self, id: &I, predicate: &dyn Fn(&V) -> bool) -> Option<V> {
        match self.load(id) {
            Some(value) if predicate(&value) => self.remove(id),
            _ => None,
        }
    }
}

/// `MetaDataStore` held in memory.
#[derive(Debug)]
pub struct InMemoryStore<I: Eq + Hash, V> {
    entries: DashMap<I, V>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<I, V> InMemoryStore<I, V>
where
    I: Eq + Hash + Clone,
    V: Clone,
{
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Insert or replace an entry, returning the previous metadata.
    pub fn insert(&self, id: I, value: V) -> Option<V> {
        self.entries.insert(id, value)
    }

    /// Whether an entry exists.
    pub fn contains(&self, id: &I) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lookups that found an entry.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Lookups that found nothing.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

impl<I, V> Default for InMemoryStore<I, V>
where
    I: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<I, V> MetaDataStore<I, V> for InMemoryStore<I, V>
where
    I: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn load(&self, id: &I) -> Option<V> {
        let result = self.entries.get(id).map(|entry| entry.value().clone());
        if result.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn keys(&self) -> Vec<I> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    fn remove(&self, id: &I) -> Option<V> {
        self.entries.remove(id).map(|(_, value)| value)
    }

    fn remove_if(&self, id: &I, predicate: &dyn Fn(&V) -> bool) -> Option<V> {
        self.entries
            .remove_if(id, |_, value| predicate(value))
            .map(|(_, value)| value)
    }
}
