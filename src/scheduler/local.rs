//! Per-node keyed timers.

use crate::error::ExecutionError;
use crate::metrics::SchedulerMetrics;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Derives the absolute deadline of a scheduled value.
pub trait DeadlineStrategy<V>: Send + Sync + 'static {
    /// When `value` is due, or None if it never is.
    fn deadline(&self, value: &V) -> Option<SystemTime>;
}

impl<V, F> DeadlineStrategy<V> for F
where
    F: Fn(&V) -> Option<SystemTime> + Send + Sync + 'static,
{
    fn deadline(&self, value: &V) -> Option<SystemTime> {
        self(value)
    }
}

/// What a fired task asks of the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion<V> {
    /// Nothing further to do.
    Done,
    /// The value changed since the timer was armed; arm again with it.
    Rearm(V),
}

/// Work performed when a timer fires.
#[async_trait]
pub trait ScheduledTask<I, V>: Send + Sync + 'static {
    /// Run for the identifier whose timer fired.
    async fn run(&self, id: I, value: V) -> Result<Completion<V>, ExecutionError>;
}

struct Entry<V> {
    value: V,
    deadline: SystemTime,
    generation: u64,
    cancel: CancellationToken,
}

struct Inner<I, V> {
    entries: DashMap<I, Entry<V>>,
    strategy: Arc<dyn DeadlineStrategy<V>>,
    task: Arc<dyn ScheduledTask<I, V>>,
    next_generation: AtomicU64,
    metrics: Arc<SchedulerMetrics>,
    closed: AtomicBool,
}

/// Keeps at most one pending timer per identifier.
///
/// Scheduling an identifier that already has a timer replaces it. Firing
/// retires the timer before the task runs, so a failing task never leaves a
/// stale entry behind.
pub struct LocalScheduler<I, V> {
    inner: Arc<Inner<I, V>>,
}

impl<I, V> Clone for LocalScheduler<I, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<I, V> LocalScheduler<I, V>
where
    I: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a scheduler.
    pub fn new(strategy: Arc<dyn DeadlineStrategy<V>>, task: Arc<dyn ScheduledTask<I, V>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                strategy,
                task,
                next_generation: AtomicU64::new(1),
                metrics: Arc::new(SchedulerMetrics::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Arm (or re-arm) the timer for `id`.
    ///
    /// A value without a deadline cancels any existing timer.
    pub fn schedule(&self, id: I, value: V) {
        if self.is_closed() {
            debug!(id = ?id, "Scheduler closed, ignoring schedule");
            return;
        }

        let Some(deadline) = self.inner.strategy.deadline(&value) else {
            self.cancel(&id);
            return;
        };

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let entry = Entry {
            value,
            deadline,
            generation,
            cancel: cancel.clone(),
        };

        match self.inner.entries.entry(id.clone()) {
            MapEntry::Occupied(mut occupied) => {
                occupied.get().cancel.cancel();
                occupied.insert(entry);
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(entry);
                self.inner.metrics.active.inc();
            }
        }
        self.inner.metrics.scheduled.inc();

        // close() may have drained the table while we were inserting.
        if self.is_closed() {
            self.retire(&id, generation);
            cancel.cancel();
            return;
        }

        let delay = deadline
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);
        trace!(id = ?id, generation, delay_ms = delay.as_millis() as u64, "Timer armed");

        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(inner) = inner.upgrade() {
                        Self::fire(inner, id, generation).await;
                    }
                }
            }
        });
    }

    /// Cancel the timer for `id`. Returns whether one was pending.
    pub fn cancel(&self, id: &I) -> bool {
        match self.inner.entries.remove(id) {
            Some((_, entry)) => {
                entry.cancel.cancel();
                self.inner.metrics.cancelled.inc();
                self.inner.metrics.active.dec();
                trace!(id = ?id, "Timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Whether a timer is pending for `id`.
    pub fn contains(&self, id: &I) -> bool {
        self.inner.entries.contains_key(id)
    }

    /// Deadline of the pending timer for `id`.
    pub fn deadline(&self, id: &I) -> Option<SystemTime> {
        self.inner.entries.get(id).map(|entry| entry.deadline)
    }

    /// Identifiers and values of every pending timer.
    pub fn scheduled(&self) -> Vec<(I, V)> {
        self.inner
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().value.clone()))
            .collect()
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    /// Whether no timer is pending.
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Scheduler metrics.
    pub fn metrics(&self) -> &Arc<SchedulerMetrics> {
        &self.inner.metrics
    }

    /// Whether the scheduler has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Cancel every pending timer and ignore further schedules. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut cancelled = 0usize;
        self.inner.entries.retain(|_, entry| {
            entry.cancel.cancel();
            cancelled += 1;
            false
        });
        self.inner.metrics.active.set(0);
        debug!(cancelled, "Scheduler closed");
    }

    fn retire(&self, id: &I, generation: u64) -> Option<Entry<V>> {
        Self::retire_from(&self.inner, id, generation)
    }

    fn retire_from(inner: &Inner<I, V>, id: &I, generation: u64) -> Option<Entry<V>> {
        let removed = inner
            .entries
            .remove_if(id, |_, entry| entry.generation == generation)
            .map(|(_, entry)| entry);
        if removed.is_some() {
            inner.metrics.active.dec();
        }
        removed
    }

    async fn fire(inner: Arc<Inner<I, V>>, id: I, generation: u64) {
        // A replaced or cancelled timer no longer owns the entry.
        let Some(entry) = Self::retire_from(&inner, &id, generation) else {
            return;
        };

        inner.metrics.fired.inc();
        trace!(id = ?id, generation, "Timer fired");

        let task = inner.task.clone();
        let weak = Arc::downgrade(&inner);
        drop(inner);

        let outcome = task.run(id.clone(), entry.value).await;

        let Some(inner) = weak.upgrade() else {
            return;
        };
        match outcome {
            Ok(Completion::Done) => {}
            Ok(Completion::Rearm(value)) => {
                let scheduler = Self { inner };
                // A newer schedule takes precedence over the task's request.
                if !scheduler.contains(&id) {
                    trace!(id = ?id, "Re-arming at task request");
                    scheduler.schedule(id, value);
                }
            }
            Err(e) => {
                inner.metrics.task_failures.inc();
                warn!(id = ?id, error = %e, "Scheduled task failed");
            }
        }
    }
}

impl<I: Eq + Hash, V> std::fmt::Debug for LocalScheduler<I, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalScheduler")
            .field("pending", &self.inner.entries.len())
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}
