//! Group membership backed by explicitly installed views.
//!
//! `MembershipGroup` is the group implementation used by the dispatcher and
//! the schedulers. Views are installed by whatever drives membership (a
//! discovery layer feeding `MemberEvent`s, a test harness, an operator):
//!
//! - `install_view` replaces the view after joins or departures
//! - `merge_views` heals a partition and reports `merged = true`
//! - `handle_event` turns discovery events into view installations
//!
//! Listeners are notified from a dedicated notifier task, never from the
//! caller that installed the view. A panicking listener is logged and skipped;
//! the remaining listeners still receive the change.

use crate::cluster::events::MemberEvent;
use crate::cluster::group::{Group, GroupListener, Registration};
use crate::cluster::view::View;
use crate::config::GroupConfig;
use crate::types::Node;
use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type Listeners = Arc<RwLock<Vec<(u64, Arc<dyn GroupListener>)>>>;

/// A view change queued for delivery.
struct ViewChange {
    previous: Arc<View>,
    current: Arc<View>,
    merged: bool,
}

enum Notification {
    Change(ViewChange),
    Flush(oneshot::Sender<()>),
}

/// Group whose views are installed explicitly.
pub struct MembershipGroup {
    /// This node.
    local: Node,

    /// Configuration.
    config: GroupConfig,

    /// The current view.
    view: RwLock<Arc<View>>,

    /// Registered listeners, keyed by registration id.
    listeners: Listeners,

    /// Counter for registration ids.
    next_listener_id: AtomicU64,

    /// Queue feeding the notifier task.
    notify_tx: mpsc::UnboundedSender<Notification>,

    /// The notifier task.
    notifier: Mutex<Option<JoinHandle<()>>>,

    /// Whether the group has been closed.
    closed: AtomicBool,
}

impl MembershipGroup {
    /// Create a group whose initial view contains only the local member.
    ///
    /// Must be called from within a tokio runtime: the notifier task is
    /// spawned here.
    pub fn new(local: Node, config: GroupConfig) -> Arc<Self> {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let listeners: Listeners = Arc::new(RwLock::new(Vec::new()));

        let notifier = tokio::spawn(Self::run_notifier(listeners.clone(), notify_rx));

        Arc::new(Self {
            view: RwLock::new(Arc::new(View::initial(local.clone()))),
            local,
            config,
            listeners,
            next_listener_id: AtomicU64::new(1),
            notify_tx,
            notifier: Mutex::new(Some(notifier)),
            closed: AtomicBool::new(false),
        })
    }

    /// Install a new view after members joined or departed.
    pub fn install_view(&self, members: impl IntoIterator<Item = Node>) -> Arc<View> {
        let current = {
            let mut view = self.view.write();
            let previous = view.clone();
            let current = Arc::new(View::new(previous.id() + 1, members));
            *view = current.clone();
            // Queued under the lock so listeners see changes in install order.
            self.publish(previous, current.clone(), false);
            current
        };

        if !current.contains(&self.local) {
            warn!(local = %self.local, view = %current, "Installed view does not contain the local member");
        }
        current
    }

    /// Heal a partition: the current view becomes the union of `subviews`.
    ///
    /// The merged view id is one past the highest sub-view id, so every
    /// member merging the same sub-views installs the same id.
    pub fn merge_views(&self, subviews: &[Arc<View>]) -> Arc<View> {
        let next_id = subviews.iter().map(|v| v.id()).max().unwrap_or(0) + 1;

        let mut view = self.view.write();
        let previous = view.clone();
        if next_id <= previous.id() {
            warn!(
                view_id = previous.id(),
                merged_id = next_id,
                "Merged view id does not advance past the current view"
            );
        }
        let current = Arc::new(View::merged(next_id, subviews));
        *view = current.clone();
        self.publish(previous, current.clone(), true);
        current
    }

    /// Apply a discovery event to the current view.
    ///
    /// Returns the new view when the event changed membership.
    pub fn handle_event(&self, event: MemberEvent) -> Option<Arc<View>> {
        let current = self.view();
        let node = event.node().clone();

        if event.is_join() {
            if current.contains(&node) {
                return None;
            }
            let members = current.members().iter().cloned().chain(std::iter::once(node));
            Some(self.install_view(members.collect::<Vec<_>>()))
        } else if event.is_leave() {
            if !current.contains(&node) {
                return None;
            }
            let members = current
                .members()
                .iter()
                .filter(|member| **member != node)
                .cloned()
                .collect::<Vec<_>>();
            Some(self.install_view(members))
        } else {
            debug!(%node, "Ignoring suspect event until failure is confirmed");
            None
        }
    }

    /// Wait until every view change queued so far has been delivered.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.notify_tx.send(Notification::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Stop delivering notifications. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.listeners.write().clear();
        if let Some(notifier) = self.notifier.lock().take() {
            notifier.abort();
        }
        info!(cluster = %self.config.cluster_name, local = %self.local, "Group closed");
    }

    fn publish(&self, previous: Arc<View>, current: Arc<View>, merged: bool) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        info!(
            cluster = %self.config.cluster_name,
            view = %current,
            merged,
            "Installing view"
        );

        let change = ViewChange {
            previous,
            current,
            merged,
        };
        if self.notify_tx.send(Notification::Change(change)).is_err() {
            debug!("Notifier stopped, view change not delivered");
        }
    }

    async fn run_notifier(listeners: Listeners, mut rx: mpsc::UnboundedReceiver<Notification>) {
        while let Some(notification) = rx.recv().await {
            match notification {
                Notification::Change(change) => Self::deliver(&listeners, &change),
                Notification::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
    }

    fn deliver(listeners: &Listeners, change: &ViewChange) {
        // Snapshot so listeners may register or close while being notified.
        let snapshot: Vec<_> = listeners.read().iter().map(|(_, l)| l.clone()).collect();

        for listener in snapshot {
            let result = catch_unwind(AssertUnwindSafe(|| {
                listener.membership_changed(&change.previous, &change.current, change.merged)
            }));
            if result.is_err() {
                error!(view_id = change.current.id(), "Membership listener panicked");
            }
        }
    }
}

impl Group for MembershipGroup {
    fn local_member(&self) -> Node {
        self.local.clone()
    }

    fn view(&self) -> Arc<View> {
        self.view.read().clone()
    }

    fn register(&self, listener: Arc<dyn GroupListener>) -> Registration {
        if self.closed.load(Ordering::SeqCst) {
            return Registration::empty();
        }

        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.write().push((id, listener));

        let listeners = Arc::downgrade(&self.listeners);
        Registration::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                listeners.write().retain(|(registered, _)| *registered != id);
            }
        })
    }
}

impl Drop for MembershipGroup {
    fn drop(&mut self) {
        if let Some(notifier) = self.notifier.lock().take() {
            notifier.abort();
        }
    }
}

impl std::fmt::Debug for MembershipGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembershipGroup")
            .field("local", &self.local)
            .field("view", &self.view.read().id())
            .field("listener_count", &self.listeners.read().len())
            .finish()
    }
}
