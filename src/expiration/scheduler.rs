//! Expiration scheduling and removal.

use crate::cache::MetaDataStore;
use crate::config::{ExpirationConfig, SchedulerConfig};
use crate::dispatcher::CommandDispatcherFactory;
use crate::error::{DispatcherError, ExecutionError};
use crate::expiration::metadata::ExpirationMetaData;
use crate::metrics::SchedulerMetrics;
use crate::partitioning::OwnerResolver;
use crate::scheduler::{ClusteredScheduler, Completion, ScheduleKey, ScheduledTask};
use crate::types::Node;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, error, trace};

/// Service id under which expiration commands travel.
pub const EXPIRATION_SERVICE: &str = "expiration-scheduler";

/// Notified after an entry has been removed because it expired.
pub trait ExpirationListener<I>: Send + Sync + 'static {
    /// `metadata` is what the entry held when it was removed.
    fn expired(&self, id: &I, metadata: &ExpirationMetaData);
}

/// Removes expired entries on the owner.
///
/// The entry is removed only if its stored metadata is expired at the time
/// the task runs. An entry touched since its timer was armed is re-armed with
/// the stored metadata instead, and an absent entry is ignored, so a second
/// fire for the same entry does nothing.
pub struct ExpirationRemover<I> {
    store: Arc<dyn MetaDataStore<I, ExpirationMetaData>>,
    listeners: RwLock<Vec<Arc<dyn ExpirationListener<I>>>>,
    removed: AtomicU64,
}

impl<I: ScheduleKey> ExpirationRemover<I> {
    /// Create a remover over `store`.
    pub fn new(store: Arc<dyn MetaDataStore<I, ExpirationMetaData>>) -> Self {
        Self {
            store,
            listeners: RwLock::new(Vec::new()),
            removed: AtomicU64::new(0),
        }
    }

    /// Register a listener.
    pub fn add_listener(&self, listener: Arc<dyn ExpirationListener<I>>) {
        self.listeners.write().push(listener);
    }

    /// Entries removed by this remover.
    pub fn removed(&self) -> u64 {
        self.removed.load(Ordering::Relaxed)
    }

    fn notify(&self, id: &I, metadata: &ExpirationMetaData) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            let result = catch_unwind(AssertUnwindSafe(|| listener.expired(id, metadata)));
            if result.is_err() {
                error!(id = ?id, "Expiration listener panicked");
            }
        }
    }
}

#[async_trait]
impl<I: ScheduleKey> ScheduledTask<I, ExpirationMetaData> for ExpirationRemover<I> {
    async fn run(
        &self,
        id: I,
        armed: ExpirationMetaData,
    ) -> Result<Completion<ExpirationMetaData>, ExecutionError> {
        let now = SystemTime::now();

        if let Some(metadata) = self.store.remove_if(&id, &|stored| stored.is_expired(now)) {
            self.removed.fetch_add(1, Ordering::Relaxed);
            debug!(id = ?id, "Expired entry removed");
            self.notify(&id, &metadata);
            return Ok(Completion::Done);
        }

        match self.store.load(&id) {
            None => {
                trace!(id = ?id, "Entry already gone");
                Ok(Completion::Done)
            }
            Some(stored) if stored.is_immortal() => Ok(Completion::Done),
            Some(stored) => {
                trace!(id = ?id, touched = (stored != armed), "Entry not yet expired, re-arming");
                Ok(Completion::Rearm(stored))
            }
        }
    }
}

/// Clustered scheduler specialised to entry expiration.
pub struct ExpirationScheduler<I> {
    scheduler: ClusteredScheduler<I, ExpirationMetaData>,
    remover: Arc<ExpirationRemover<I>>,
    config: ExpirationConfig,
}

impl<I: ScheduleKey> ExpirationScheduler<I> {
    /// Create the scheduler and deploy its service on `factory`.
    pub fn new(
        factory: &Arc<CommandDispatcherFactory>,
        store: Arc<dyn MetaDataStore<I, ExpirationMetaData>>,
        config: ExpirationConfig,
        scheduler_config: SchedulerConfig,
    ) -> Result<Self, DispatcherError> {
        Self::build(factory, store, config, scheduler_config, None)
    }

    /// Like `new`, resolving owners with `resolver` instead of the hash ring.
    pub fn with_resolver(
        factory: &Arc<CommandDispatcherFactory>,
        store: Arc<dyn MetaDataStore<I, ExpirationMetaData>>,
        config: ExpirationConfig,
        scheduler_config: SchedulerConfig,
        resolver: Arc<dyn OwnerResolver<I>>,
    ) -> Result<Self, DispatcherError> {
        Self::build(factory, store, config, scheduler_config, Some(resolver))
    }

    fn build(
        factory: &Arc<CommandDispatcherFactory>,
        store: Arc<dyn MetaDataStore<I, ExpirationMetaData>>,
        config: ExpirationConfig,
        scheduler_config: SchedulerConfig,
        resolver: Option<Arc<dyn OwnerResolver<I>>>,
    ) -> Result<Self, DispatcherError> {
        let remover = Arc::new(ExpirationRemover::new(store.clone()));

        let mut builder = ClusteredScheduler::builder(
            EXPIRATION_SERVICE,
            Arc::new(|metadata: &ExpirationMetaData| metadata.deadline()),
            remover.clone(),
            store,
        )
        .config(scheduler_config);
        if let Some(resolver) = resolver {
            builder = builder.resolver(resolver);
        }

        Ok(Self {
            scheduler: builder.build(factory)?,
            remover,
            config,
        })
    }

    /// Schedule expiration of `id` per `metadata`, replacing any earlier
    /// schedule. Immortal metadata cancels instead.
    pub fn schedule(&self, id: I, metadata: ExpirationMetaData) {
        self.scheduler.schedule(id, metadata);
    }

    /// Prevent `id` from expiring, whichever member holds its timer.
    pub fn cancel(&self, id: &I) {
        self.scheduler.cancel(id);
    }

    /// Whether this member knows `id` was cancelled and not scheduled since.
    pub fn is_cancelled(&self, id: &I) -> bool {
        self.scheduler.is_cancelled(id)
    }

    /// Register a listener for removals performed on this member.
    pub fn add_listener(&self, listener: Arc<dyn ExpirationListener<I>>) {
        self.remover.add_listener(listener);
    }

    /// Fresh metadata for an entry created now, with the configured default
    /// timeout.
    pub fn metadata_now(&self) -> ExpirationMetaData {
        ExpirationMetaData::new(self.config.default_timeout, SystemTime::now())
    }

    /// Owner of `id` in the current view.
    pub fn owner(&self, id: &I) -> Option<Node> {
        self.scheduler.owner(id)
    }

    /// Whether this member holds the timer for `id`.
    pub fn is_scheduled_locally(&self, id: &I) -> bool {
        self.scheduler.is_scheduled_locally(id)
    }

    /// Entries this member removed.
    pub fn removed(&self) -> u64 {
        self.remover.removed()
    }

    /// Scheduler metrics.
    pub fn metrics(&self) -> &Arc<SchedulerMetrics> {
        self.scheduler.metrics()
    }

    /// The underlying clustered scheduler.
    pub fn scheduler(&self) -> &ClusteredScheduler<I, ExpirationMetaData> {
        &self.scheduler
    }

    /// Close the scheduler. Idempotent.
    pub fn close(&self) {
        self.scheduler.close();
    }
}
