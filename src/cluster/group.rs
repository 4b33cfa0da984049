//! Group membership contract consumed by the dispatcher and schedulers.

use crate::cluster::view::View;
use crate::types::Node;
use parking_lot::Mutex;
use std::sync::Arc;

/// Receives view changes from a group.
pub trait GroupListener: Send + Sync + 'static {
    /// Called once per installed view, after the view is authoritative.
    ///
    /// `merged` is true when the new view heals a partition; identifiers owned
    /// by the merged peers need their ownership re-resolved.
    fn membership_changed(&self, previous: &View, current: &View, merged: bool);
}

/// A group of cluster members.
pub trait Group: Send + Sync + 'static {
    /// The local member.
    fn local_member(&self) -> Node;

    /// The current view.
    fn view(&self) -> Arc<View>;

    /// Register a listener for view changes.
    fn register(&self, listener: Arc<dyn GroupListener>) -> Registration;

    /// Whether the node is the local member.
    fn is_local(&self, node: &Node) -> bool {
        *node == self.local_member()
    }
}

/// Scoped handle that undoes a prior `register` call.
///
/// Closing is idempotent and also happens when the handle is dropped.
pub struct Registration {
    closer: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Registration {
    /// Create a registration that runs `closer` once when closed.
    pub fn new(closer: impl FnOnce() + Send + 'static) -> Self {
        Self {
            closer: Mutex::new(Some(Box::new(closer))),
        }
    }

    /// A registration with nothing to undo.
    pub fn empty() -> Self {
        Self {
            closer: Mutex::new(None),
        }
    }

    /// Unregister. Subsequent calls do nothing.
    pub fn close(&self) {
        let closer = self.closer.lock().take();
        if let Some(closer) = closer {
            closer();
        }
    }

    /// Whether `close` has already run.
    pub fn is_closed(&self) -> bool {
        self.closer.lock().is_none()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("closed", &self.is_closed())
            .finish()
    }
}
