//! Command dispatcher bound to one service.

use crate::cluster::group::{GroupListener, Registration};
use crate::cluster::view::View;
use crate::dispatcher::command::Command;
use crate::dispatcher::factory::{CallSlot, CommandDispatcherFactory};
use crate::dispatcher::response::CommandResponse;
use crate::error::{CommandError, DispatcherError, ExecutionError, NetworkError};
use crate::network::rpc::{CommandReply, CommandRequest, ReplyBody};
use crate::types::Node;
use dashmap::DashMap;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// A call awaiting its response.
struct PendingCall {
    target: Node,
    cancel: CancellationToken,
}

type PendingCalls = DashMap<u64, PendingCall>;

/// Sends commands of type `M` to the members running service `service_id`.
///
/// Every dispatch is non-blocking: the returned `CommandResponse` is
/// completed by a spawned task. Local targets go through the same request
/// path as remote ones, minus the network.
pub struct CommandDispatcher<C, M> {
    service_id: String,
    context: Arc<C>,
    factory: Arc<CommandDispatcherFactory>,
    pending: Arc<PendingCalls>,
    cancel: CancellationToken,
    registration: Registration,
    closed: AtomicBool,
    _command: PhantomData<fn() -> M>,
}

impl<C, M> CommandDispatcher<C, M>
where
    C: Send + Sync + 'static,
    M: Command<C>,
{
    pub(crate) fn new(
        service_id: String,
        context: Arc<C>,
        factory: Arc<CommandDispatcherFactory>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let pending: Arc<PendingCalls> = Arc::new(DashMap::new());

        let listener = DepartureListener {
            service_id: service_id.clone(),
            pending: Arc::downgrade(&pending),
        };
        let registration = factory.group().register(Arc::new(listener));

        Arc::new(Self {
            service_id,
            context,
            factory,
            pending,
            cancel,
            registration,
            closed: AtomicBool::new(false),
            _command: PhantomData,
        })
    }

    /// The service this dispatcher is bound to.
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// The context incoming commands execute against.
    pub fn context(&self) -> &Arc<C> {
        &self.context
    }

    /// The local member.
    pub fn local_member(&self) -> &Node {
        self.factory.local_member()
    }

    /// The factory that created this dispatcher.
    pub fn factory(&self) -> &Arc<CommandDispatcherFactory> {
        &self.factory
    }

    /// Number of calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Send `command` to `target`.
    ///
    /// Fails synchronously only if the dispatcher is closed, the target is not
    /// in the current view, the command cannot be serialized, or too many
    /// calls are pending.
    pub fn execute_on_member(
        &self,
        command: &M,
        target: &Node,
    ) -> Result<CommandResponse<M::Output>, DispatcherError> {
        self.ensure_open()?;

        if !self.factory.group().view().contains(target) {
            return Err(DispatcherError::UnknownTarget(target.clone()));
        }

        let payload = encode(command)?;
        self.dispatch(payload, target.clone())
    }

    /// Send `command` to every member of the current view except `excluded`.
    ///
    /// Either every member is sent the command or none is: pending-call
    /// slots for all targets are reserved before the first dispatch.
    pub fn execute_on_group(
        &self,
        command: &M,
        excluded: &[Node],
    ) -> Result<HashMap<Node, CommandResponse<M::Output>>, DispatcherError> {
        self.ensure_open()?;

        let view = self.factory.group().view();
        let payload = encode(command)?;

        let targets: Vec<&Node> = view
            .members()
            .iter()
            .filter(|member| !excluded.contains(member))
            .collect();
        let slots = targets
            .iter()
            .map(|_| self.factory.acquire_slot())
            .collect::<Result<Vec<_>, _>>()?;

        let responses = targets
            .into_iter()
            .zip(slots)
            .map(|(member, slot)| {
                let response = self.dispatch_in(slot, payload.clone(), member.clone());
                (member.clone(), response)
            })
            .collect();

        Ok(responses)
    }

    /// Send `command` to the coordinator of the current view.
    pub fn execute_on_coordinator(
        &self,
        command: &M,
    ) -> Result<CommandResponse<M::Output>, DispatcherError> {
        self.ensure_open()?;

        let view = self.factory.group().view();
        let coordinator = view
            .coordinator()
            .cloned()
            .unwrap_or_else(|| self.factory.local_member().clone());

        let payload = encode(command)?;
        self.dispatch(payload, coordinator)
    }

    fn dispatch(
        &self,
        payload: Vec<u8>,
        target: Node,
    ) -> Result<CommandResponse<M::Output>, DispatcherError> {
        let slot = self.factory.acquire_slot()?;
        Ok(self.dispatch_in(slot, payload, target))
    }

    fn dispatch_in(&self, slot: CallSlot, payload: Vec<u8>, target: Node) -> CommandResponse<M::Output> {
        let request_id = self.factory.next_request_id();
        let local = *self.factory.local_member() == target;

        let metrics = self.factory.metrics();
        metrics.calls_total.inc();
        if local {
            metrics.calls_local.inc();
        }

        // Child of the dispatcher token: already cancelled if we were closed
        // concurrently.
        let cancel = self.cancel.child_token();
        self.pending.insert(
            request_id,
            PendingCall {
                target: target.clone(),
                cancel: cancel.clone(),
            },
        );

        // The view may have changed since the caller checked it; a departure
        // notified before the insert above would otherwise be missed.
        if !self.factory.group().view().contains(&target) {
            cancel.cancel();
        }

        let (tx, rx) = oneshot::channel();
        let request = CommandRequest::new(
            request_id,
            self.factory.local_member().clone(),
            self.service_id.clone(),
            payload,
        );
        let factory = self.factory.clone();
        let pending = self.pending.clone();
        let response_target = target.clone();

        tokio::spawn(async move {
            let _slot = slot;
            let call_timeout = factory.config().call_timeout;

            let call = async {
                let reply = match call_timeout {
                    Some(timeout) => {
                        match tokio::time::timeout(timeout, factory.send(&target, request)).await {
                            Ok(reply) => reply,
                            Err(_) => return Err(CommandError::Timeout),
                        }
                    }
                    None => factory.send(&target, request).await,
                };
                settle::<M::Output>(&factory, &target, reply)
            };

            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(CommandError::Cancelled),
                outcome = call => outcome,
            };

            pending.remove(&request_id);
            factory.metrics().record_outcome(&outcome);
            trace!(request_id, target = %target, ok = outcome.is_ok(), "Call settled");

            let _ = tx.send(outcome);
        });

        CommandResponse::new(response_target, rx)
    }

    fn ensure_open(&self) -> Result<(), DispatcherError> {
        if self.closed.load(Ordering::SeqCst) || self.factory.is_closed() {
            return Err(DispatcherError::Closed(self.service_id.clone()));
        }
        Ok(())
    }

    /// Whether the dispatcher has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the dispatcher: unregister the service and the group listener,
    /// and settle every pending response as cancelled. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.factory.unregister(&self.service_id);
        self.registration.close();
        debug!(service = %self.service_id, "Command dispatcher closed");
    }
}

impl<C, M> Drop for CommandDispatcher<C, M> {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.cancel.cancel();
            self.factory.unregister(&self.service_id);
        }
    }
}

impl<C, M> std::fmt::Debug for CommandDispatcher<C, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("service_id", &self.service_id)
            .field("pending_calls", &self.pending.len())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

fn encode<T: serde::Serialize>(command: &T) -> Result<Vec<u8>, DispatcherError> {
    bincode::serialize(command).map_err(|e| DispatcherError::Serialization(e.to_string()))
}

/// Turn a transport outcome into the caller-visible result.
fn settle<R: serde::de::DeserializeOwned>(
    factory: &CommandDispatcherFactory,
    target: &Node,
    reply: Result<CommandReply, NetworkError>,
) -> Result<R, CommandError> {
    match reply {
        Ok(reply) => match reply.body {
            ReplyBody::Completed(bytes) => {
                match bincode::deserialize::<Result<R, ExecutionError>>(&bytes) {
                    Ok(result) => result.map_err(CommandError::Execution),
                    Err(e) => Err(CommandError::Execution(ExecutionError::new(format!(
                        "failed to decode response: {}",
                        e
                    )))),
                }
            }
            ReplyBody::NoService => Err(CommandError::Cancelled),
            ReplyBody::Rejected(reason) => Err(CommandError::Execution(ExecutionError::new(reason))),
        },
        Err(e) => {
            if factory.group().view().contains(target) {
                debug!(target = %target, error = %e, "Target unreachable");
                Err(CommandError::Unreachable {
                    node: target.clone(),
                    reason: e.to_string(),
                })
            } else {
                Err(CommandError::Cancelled)
            }
        }
    }
}

/// Cancels pending calls whose target left the view.
struct DepartureListener {
    service_id: String,
    pending: Weak<PendingCalls>,
}

impl GroupListener for DepartureListener {
    fn membership_changed(&self, _previous: &View, current: &View, _merged: bool) {
        let Some(pending) = self.pending.upgrade() else {
            return;
        };

        let mut cancelled = 0usize;
        for call in pending.iter() {
            if !current.contains(&call.target) {
                call.cancel.cancel();
                cancelled += 1;
            }
        }

        if cancelled > 0 {
            debug!(service = %self.service_id, cancelled, view_id = current.id(), "Cancelled calls to departed members");
        }
    }
}
