//! Owner-aware keyed scheduler.
//!
//! Each identifier is owned by one member of the current view. Timers are
//! armed on the owner; a timer that fires anywhere forwards the work to
//! whoever owns the identifier at that moment. View changes move timers to
//! their new owners:
//!
//! - a join that moves ownership hands local timers over with `Schedule`
//! - a departure makes the new owners re-arm from their metadata store
//! - a merge makes every member re-arm what it now owns

use crate::cache::MetaDataStore;
use crate::cluster::group::{Group, GroupListener, Registration};
use crate::cluster::view::View;
use crate::config::SchedulerConfig;
use crate::dispatcher::{Command, CommandDispatcher, CommandDispatcherFactory, CommandResponse};
use crate::error::{CommandError, DispatcherError, ExecutionError};
use crate::metrics::SchedulerMetrics;
use crate::partitioning::{HashRingResolver, OwnerResolver};
use crate::scheduler::local::{Completion, DeadlineStrategy, LocalScheduler, ScheduledTask};
use crate::scheduler::version::{Version, VersionTable};
use crate::scheduler::{ScheduleKey, ScheduleValue};
use crate::types::Node;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, info, warn};

/// Messages exchanged between the members' schedulers.
///
/// Every message carries the stamp of the `schedule` or `cancel` that caused
/// it, so a receiver can tell a late `Schedule` from one issued after a
/// cancel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "I: Serialize, V: Serialize",
    deserialize = "I: serde::de::DeserializeOwned, V: serde::de::DeserializeOwned"
))]
pub enum SchedulerCommand<I, V> {
    /// Arm the timer for `id` on the receiving member.
    Schedule { id: I, value: V, version: u64 },

    /// Cancel the receiving member's timer for `id` and remember the cancel.
    Cancel { id: I, version: u64 },

    /// Record that `id` was scheduled again after a cancel, without arming.
    Resume { id: I, version: u64 },

    /// Run the scheduled task for `id` on the receiving member.
    Execute { id: I, value: V, version: u64 },
}

/// What scheduler commands execute against.
pub struct SchedulerContext<I, V> {
    local_node: Node,
    local: LocalScheduler<I, V>,
    versions: Arc<VersionTable<I>>,
    executor: Arc<dyn ScheduledTask<I, V>>,
    metrics: Arc<SchedulerMetrics>,
    dispatcher: OnceLock<Weak<SchedulerDispatcher<I, V>>>,
}

impl<I, V> SchedulerContext<I, V>
where
    I: ScheduleKey,
    V: ScheduleValue,
{
    /// Tell every other member that `id` is live again at `version`.
    fn resume(&self, id: &I, version: u64, skip: &[Node]) {
        let Some(dispatcher) = self.dispatcher.get().and_then(Weak::upgrade) else {
            return;
        };
        let command = SchedulerCommand::Resume {
            id: id.clone(),
            version,
        };
        let mut excluded = vec![self.local_node.clone()];
        excluded.extend_from_slice(skip);
        if let Err(e) = dispatcher.execute_on_group(&command, &excluded) {
            debug!(id = ?id, error = %e, "Failed to broadcast resume");
        }
    }

    fn suppressed(&self, id: &I, what: &str) {
        self.metrics.suppressed.inc();
        debug!(id = ?id, what, "Dropped by a newer cancel");
    }
}

#[async_trait]
impl<I, V> Command<SchedulerContext<I, V>> for SchedulerCommand<I, V>
where
    I: ScheduleKey,
    V: ScheduleValue,
{
    /// False when nothing changed: a stale or redundant message, or an
    /// execution that re-armed instead of completing.
    type Output = bool;

    async fn execute(&self, context: &SchedulerContext<I, V>) -> Result<bool, ExecutionError> {
        match self {
            SchedulerCommand::Schedule { id, value, version } => {
                context.versions.observe(*version);
                if !context.versions.permits(id, *version) {
                    context.suppressed(id, "schedule");
                    return Ok(false);
                }
                if let Ok(Some(Version::Cancelled(_))) =
                    context.versions.apply(id.clone(), Version::Live(*version))
                {
                    context.resume(id, *version, &[]);
                }
                context.local.schedule(id.clone(), value.clone());
                Ok(true)
            }
            SchedulerCommand::Cancel { id, version } => {
                context.versions.observe(*version);
                match context.versions.apply(id.clone(), Version::Cancelled(*version)) {
                    Ok(_) => Ok(context.local.cancel(id)),
                    Err(Version::Live(newer)) => {
                        // Members that took the cancel must learn about the
                        // newer schedule, or they would skip it on re-arm.
                        context.resume(id, newer, &[]);
                        Ok(false)
                    }
                    Err(Version::Cancelled(_)) => Ok(false),
                }
            }
            SchedulerCommand::Resume { id, version } => {
                context.versions.observe(*version);
                Ok(context.versions.apply(id.clone(), Version::Live(*version)).is_ok())
            }
            SchedulerCommand::Execute { id, value, version } => {
                context.versions.observe(*version);
                if !context.versions.permits(id, *version) {
                    context.suppressed(id, "execute");
                    return Ok(false);
                }
                match context.executor.run(id.clone(), value.clone()).await? {
                    Completion::Done => {
                        context.versions.complete(id, *version);
                        Ok(true)
                    }
                    Completion::Rearm(next) => {
                        // The receiver is the owner, so the new timer lives here.
                        if !context.local.contains(id) && !context.versions.is_cancelled(id) {
                            context.local.schedule(id.clone(), next);
                        }
                        Ok(false)
                    }
                }
            }
        }
    }
}

type SchedulerDispatcher<I, V> = CommandDispatcher<SchedulerContext<I, V>, SchedulerCommand<I, V>>;

/// Local timer task: forwards a fired timer to the current owner.
struct ExecuteForwarder<I, V> {
    group: Arc<dyn Group>,
    resolver: Arc<dyn OwnerResolver<I>>,
    versions: Arc<VersionTable<I>>,
    dispatcher: OnceLock<Weak<SchedulerDispatcher<I, V>>>,
}

#[async_trait]
impl<I, V> ScheduledTask<I, V> for ExecuteForwarder<I, V>
where
    I: ScheduleKey,
    V: ScheduleValue,
{
    async fn run(&self, id: I, value: V) -> Result<Completion<V>, ExecutionError> {
        let Some(dispatcher) = self.dispatcher.get().and_then(Weak::upgrade) else {
            return Ok(Completion::Done);
        };

        // Timers re-armed from the store carry no stamp of their own.
        let version = match self.versions.get(&id) {
            Some(Version::Live(stamp)) => stamp,
            Some(Version::Cancelled(_)) => return Ok(Completion::Done),
            None => 0,
        };

        let view = self.group.view();
        let owner = self
            .resolver
            .owner(&id, &view)
            .unwrap_or_else(|| self.group.local_member());

        let command = SchedulerCommand::Execute {
            id: id.clone(),
            value,
            version,
        };
        let response = match dispatcher.execute_on_member(&command, &owner) {
            Ok(response) => response,
            Err(DispatcherError::Closed(_)) => return Ok(Completion::Done),
            Err(e) => return Err(ExecutionError::from_error(&e)),
        };
        drop(dispatcher);

        match response.await {
            Ok(_) => Ok(Completion::Done),
            Err(CommandError::Cancelled) => {
                debug!(id = ?id, owner = %owner, "Execution cancelled, owner left or service gone");
                Ok(Completion::Done)
            }
            Err(CommandError::Execution(e)) => Err(e),
            Err(e) => Err(ExecutionError::from_error(&e)),
        }
    }
}

struct Inner<I, V> {
    local_node: Node,
    group: Arc<dyn Group>,
    local: LocalScheduler<I, V>,
    versions: Arc<VersionTable<I>>,
    dispatcher: Arc<SchedulerDispatcher<I, V>>,
    resolver: Arc<dyn OwnerResolver<I>>,
    store: Arc<dyn MetaDataStore<I, V>>,
    config: SchedulerConfig,
    registration: Registration,
    closed: AtomicBool,
}

/// Keyed scheduler that arms each identifier's timer on its owner.
pub struct ClusteredScheduler<I, V> {
    inner: Arc<Inner<I, V>>,
}

impl<I, V> Clone for ClusteredScheduler<I, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Builder for `ClusteredScheduler`.
pub struct ClusteredSchedulerBuilder<I, V> {
    service_id: String,
    strategy: Arc<dyn DeadlineStrategy<V>>,
    executor: Arc<dyn ScheduledTask<I, V>>,
    store: Arc<dyn MetaDataStore<I, V>>,
    resolver: Arc<dyn OwnerResolver<I>>,
    config: SchedulerConfig,
}

impl<I, V> ClusteredSchedulerBuilder<I, V>
where
    I: ScheduleKey,
    V: ScheduleValue,
{
    /// Use a custom owner resolver instead of the hash ring.
    pub fn resolver(mut self, resolver: Arc<dyn OwnerResolver<I>>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Set the scheduler configuration.
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Create the scheduler and deploy its service on `factory`.
    pub fn build(self, factory: &Arc<CommandDispatcherFactory>) -> Result<ClusteredScheduler<I, V>, DispatcherError> {
        let group = factory.group().clone();
        let versions = Arc::new(VersionTable::new());

        let forwarder = Arc::new(ExecuteForwarder {
            group: group.clone(),
            resolver: self.resolver.clone(),
            versions: versions.clone(),
            dispatcher: OnceLock::new(),
        });
        let local = LocalScheduler::new(self.strategy, forwarder.clone());

        let context = SchedulerContext {
            local_node: group.local_member(),
            local: local.clone(),
            versions: versions.clone(),
            executor: self.executor,
            metrics: local.metrics().clone(),
            dispatcher: OnceLock::new(),
        };
        let dispatcher = factory
            .create_command_dispatcher::<_, SchedulerCommand<I, V>>(self.service_id.clone(), context)?;
        let _ = forwarder.dispatcher.set(Arc::downgrade(&dispatcher));
        let _ = dispatcher.context().dispatcher.set(Arc::downgrade(&dispatcher));

        let inner = Arc::new_cyclic(|weak: &Weak<Inner<I, V>>| {
            let registration = group.register(Arc::new(OwnershipListener {
                inner: weak.clone(),
            }));
            Inner {
                local_node: group.local_member(),
                group: group.clone(),
                local,
                versions,
                dispatcher,
                resolver: self.resolver,
                store: self.store,
                config: self.config,
                registration,
                closed: AtomicBool::new(false),
            }
        });

        info!(service = %self.service_id, node = %inner.local_node, "Clustered scheduler started");
        Ok(ClusteredScheduler { inner })
    }
}

impl<I, V> ClusteredScheduler<I, V>
where
    I: ScheduleKey,
    V: ScheduleValue,
{
    /// Start building a scheduler for `service_id`.
    ///
    /// `executor` runs on the owner when a timer fires; `store` is consulted
    /// to re-derive schedules after view changes.
    pub fn builder(
        service_id: impl Into<String>,
        strategy: Arc<dyn DeadlineStrategy<V>>,
        executor: Arc<dyn ScheduledTask<I, V>>,
        store: Arc<dyn MetaDataStore<I, V>>,
    ) -> ClusteredSchedulerBuilder<I, V> {
        ClusteredSchedulerBuilder {
            service_id: service_id.into(),
            strategy,
            executor,
            store,
            resolver: Arc::new(HashRingResolver::new()),
            config: SchedulerConfig::default(),
        }
    }

    /// Arm the timer for `id` on its owner, replacing any earlier timer.
    pub fn schedule(&self, id: I, value: V) {
        if self.is_closed() {
            return;
        }
        self.inner.schedule(id, value);
    }

    /// Cancel the timer for `id` on every member.
    ///
    /// The cancel is remembered, so a `Schedule` issued before it that is
    /// still in flight, or a re-arm after a view change, cannot revive the
    /// timer. Only a later `schedule` does.
    pub fn cancel(&self, id: &I) {
        if self.is_closed() {
            return;
        }

        let version = self.inner.versions.tick();
        let _ = self.inner.versions.apply(id.clone(), Version::Cancelled(version));
        self.inner.local.cancel(id);

        let command = SchedulerCommand::Cancel {
            id: id.clone(),
            version,
        };
        match self
            .inner
            .dispatcher
            .execute_on_group(&command, std::slice::from_ref(&self.inner.local_node))
        {
            Ok(responses) => {
                // Fire and forget: members that never saw the id reply false.
                drop(responses);
            }
            Err(e) => debug!(id = ?id, error = %e, "Failed to broadcast cancel"),
        }
    }

    /// Whether the newest operation this member knows of for `id` is a cancel.
    pub fn is_cancelled(&self, id: &I) -> bool {
        self.inner.versions.is_cancelled(id)
    }

    /// The owner of `id` in the current view.
    pub fn owner(&self, id: &I) -> Option<Node> {
        self.inner.resolver.owner(id, &self.inner.group.view())
    }

    /// Whether this member holds a pending timer for `id`.
    pub fn is_scheduled_locally(&self, id: &I) -> bool {
        self.inner.local.contains(id)
    }

    /// The local timer table.
    pub fn local(&self) -> &LocalScheduler<I, V> {
        &self.inner.local
    }

    /// Scheduler metrics.
    pub fn metrics(&self) -> &Arc<SchedulerMetrics> {
        self.inner.local.metrics()
    }

    /// Whether the scheduler has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stop listening to the group, cancel every local timer and close the
    /// dispatcher. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl<I, V> Inner<I, V>
where
    I: ScheduleKey,
    V: ScheduleValue,
{
    fn schedule(&self, id: I, value: V) {
        let version = self.versions.tick();
        let revived = matches!(
            self.versions.apply(id.clone(), Version::Live(version)),
            Ok(Some(Version::Cancelled(_)))
        );

        let view = self.group.view();
        match self.resolver.owner(&id, &view) {
            Some(owner) if owner != self.local_node => {
                if revived {
                    self.dispatcher.context().resume(&id, version, std::slice::from_ref(&owner));
                }
                // Any earlier local timer is superseded by the owner's.
                self.local.cancel(&id);
                self.send_to_owner(id, value, version, owner);
            }
            _ => {
                if revived {
                    self.dispatcher.context().resume(&id, version, &[]);
                }
                self.local.schedule(id, value);
            }
        }
    }

    /// Dispatch `Schedule` to `owner`, arming locally if that fails.
    fn send_to_owner(&self, id: I, value: V, version: u64, owner: Node) {
        let command = SchedulerCommand::Schedule {
            id: id.clone(),
            value: value.clone(),
            version,
        };

        match self.dispatcher.execute_on_member(&command, &owner) {
            Ok(response) => self.fallback_on_failure(response, id, value, version, owner),
            Err(DispatcherError::Closed(_)) => {}
            Err(e) => {
                warn!(id = ?id, owner = %owner, error = %e, "Failed to dispatch schedule, arming locally");
                if self.versions.permits(&id, version) {
                    self.local.schedule(id, value);
                }
            }
        }
    }

    fn fallback_on_failure(
        &self,
        response: CommandResponse<bool>,
        id: I,
        value: V,
        version: u64,
        owner: Node,
    ) {
        let local = self.local.clone();
        let versions = self.versions.clone();
        tokio::spawn(async move {
            if let Err(e) = response.await {
                // A newer schedule may already have armed a local timer, or a
                // cancel may have overtaken this one.
                if !local.contains(&id) && versions.permits(&id, version) {
                    debug!(id = ?id, owner = %owner, error = %e, "Schedule not delivered, arming locally");
                    local.schedule(id, value);
                }
            }
        });
    }

    fn on_view_change(&self, previous: &View, current: &View, merged: bool) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        if self.config.handoff_on_join {
            self.hand_off(current);
        }

        if self.config.rearm_on_view_change {
            self.rearm(previous, current, merged);
        }

        if merged {
            self.share_cancels();
        }

        self.prune_versions();
    }

    /// Replay known cancels to the merged view. Members on the other side of
    /// the partition never saw them and may just have re-armed those ids.
    fn share_cancels(&self) {
        let cancelled = self.versions.cancelled();
        if cancelled.is_empty() {
            return;
        }

        let excluded = std::slice::from_ref(&self.local_node);
        for (id, version) in &cancelled {
            let command = SchedulerCommand::Cancel {
                id: id.clone(),
                version: *version,
            };
            if let Err(e) = self.dispatcher.execute_on_group(&command, excluded) {
                debug!(id = ?id, error = %e, "Failed to replay cancel");
            }
        }
        debug!(count = cancelled.len(), "Replayed cancels to merged view");
    }

    /// Forget versions of identifiers that are neither armed here nor held
    /// in the store. A late message for such an id finds nothing to act on.
    fn prune_versions(&self) {
        let before = self.versions.len();
        self.versions
            .retain(|id, _| self.local.contains(id) || self.store.load(id).is_some());
        let pruned = before.saturating_sub(self.versions.len());
        if pruned > 0 {
            debug!(pruned, "Pruned schedule versions");
        }
    }

    /// Move local timers whose owner changed to the new owner.
    fn hand_off(&self, current: &View) {
        let mut handed_off = 0usize;
        for (id, value) in self.local.scheduled() {
            let Some(owner) = self.resolver.owner(&id, current) else {
                continue;
            };
            if owner == self.local_node {
                continue;
            }
            let version = match self.versions.get(&id) {
                Some(Version::Live(stamp)) => stamp,
                Some(Version::Cancelled(_)) => {
                    self.local.cancel(&id);
                    continue;
                }
                None => 0,
            };
            if self.local.cancel(&id) {
                self.send_to_owner(id, value, version, owner);
                self.local.metrics().handoffs.inc();
                handed_off += 1;
            }
        }

        if handed_off > 0 {
            info!(view_id = current.id(), handed_off, "Handed schedules to new owners");
        }
    }

    /// Re-arm identifiers this member now owns from the metadata store.
    fn rearm(&self, previous: &View, current: &View, merged: bool) {
        let departed: HashSet<Node> = current.departed_since(previous).into_iter().collect();
        if departed.is_empty() && !merged {
            return;
        }

        // Resolve against the current view first, then the previous one, so a
        // caching resolver builds each ring once.
        let owned: Vec<I> = self
            .store
            .keys()
            .into_iter()
            .filter(|id| !self.local.contains(id) && !self.versions.is_cancelled(id))
            .filter(|id| self.resolver.owner(id, current).as_ref() == Some(&self.local_node))
            .collect();

        let mut rearmed = 0usize;
        for id in owned {
            let previous_owner = self.resolver.owner(&id, previous);
            let inherited = match &previous_owner {
                Some(owner) => departed.contains(owner),
                None => true,
            };
            if !(merged || inherited) {
                continue;
            }

            if let Some(value) = self.store.load(&id) {
                self.local.schedule(id, value);
                self.local.metrics().rearmed.inc();
                rearmed += 1;
            }
        }

        if rearmed > 0 {
            info!(view_id = current.id(), rearmed, merged, "Re-armed schedules from store");
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.registration.close();
        self.local.close();
        self.dispatcher.close();
        debug!(node = %self.local_node, "Clustered scheduler closed");
    }
}

impl<I, V> Drop for Inner<I, V> {
    fn drop(&mut self) {
        self.registration.close();
    }
}

/// Reacts to view changes on behalf of a clustered scheduler.
struct OwnershipListener<I, V> {
    inner: Weak<Inner<I, V>>,
}

impl<I, V> GroupListener for OwnershipListener<I, V>
where
    I: ScheduleKey,
    V: ScheduleValue,
{
    fn membership_changed(&self, previous: &View, current: &View, merged: bool) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_view_change(previous, current, merged);
        }
    }
}

impl<I, V> std::fmt::Debug for ClusteredScheduler<I, V>
where
    I: ScheduleKey,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusteredScheduler")
            .field("local_node", &self.inner.local_node)
            .field("versions", &self.inner.versions.len())
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}
