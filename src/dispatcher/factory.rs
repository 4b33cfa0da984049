//! Per-node factory of command dispatchers.
//!
//! The factory owns everything a node's dispatchers share: the group, the
//! transport, the table of deployed services and the pending-call budget.
//! It is also the receiving side: incoming requests are routed by service id
//! to the handler registered by `create_command_dispatcher`.

use crate::cluster::group::Group;
use crate::config::DispatcherConfig;
use crate::dispatcher::command::{Command, CommandHandler, ServiceHandler};
use crate::dispatcher::service::CommandDispatcher;
use crate::error::{DispatcherError, NetworkError, Result};
use crate::metrics::DispatcherMetrics;
use crate::network::rpc::{CommandReply, CommandRequest, Message, PongResponse, ReplyBody};
use crate::network::server::{MessageHandler, NetworkServer};
use crate::network::transport::Transport;
use crate::types::Node;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Creates dispatchers and serves requests addressed to them.
pub struct CommandDispatcherFactory {
    /// This node.
    local: Node,

    /// Group membership.
    group: Arc<dyn Group>,

    /// Outgoing transport.
    transport: Arc<dyn Transport>,

    /// Configuration.
    config: DispatcherConfig,

    /// Deployed services by id.
    services: DashMap<String, Arc<dyn ServiceHandler>>,

    /// Parent of every dispatcher's cancellation token.
    shutdown: CancellationToken,

    /// Calls awaiting a response, across all dispatchers.
    in_flight: AtomicUsize,

    /// Counter for request IDs.
    next_request_id: AtomicU64,

    /// Metrics.
    metrics: Arc<DispatcherMetrics>,

    /// Whether the factory has been closed.
    closed: AtomicBool,
}

impl CommandDispatcherFactory {
    /// Create a new factory.
    pub fn new(
        group: Arc<dyn Group>,
        transport: Arc<dyn Transport>,
        config: DispatcherConfig,
    ) -> Arc<Self> {
        let local = group.local_member();
        info!(node = %local, "Creating command dispatcher factory");

        Arc::new(Self {
            local,
            group,
            transport,
            config,
            services: DashMap::new(),
            shutdown: CancellationToken::new(),
            in_flight: AtomicUsize::new(0),
            next_request_id: AtomicU64::new(1),
            metrics: Arc::new(DispatcherMetrics::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Create a dispatcher for `service_id`, executing incoming commands
    /// against `context`.
    pub fn create_command_dispatcher<C, M>(
        self: &Arc<Self>,
        service_id: impl Into<String>,
        context: C,
    ) -> std::result::Result<Arc<CommandDispatcher<C, M>>, DispatcherError>
    where
        C: Send + Sync + 'static,
        M: Command<C>,
    {
        let service_id = service_id.into();
        if self.is_closed() {
            return Err(DispatcherError::Closed(service_id));
        }

        let context = Arc::new(context);
        match self.services.entry(service_id.clone()) {
            Entry::Occupied(_) => return Err(DispatcherError::DuplicateService(service_id)),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(CommandHandler::<C, M>::new(context.clone())));
            }
        }

        debug!(node = %self.local, service = %service_id, "Registered command dispatcher");

        Ok(CommandDispatcher::new(
            service_id,
            context,
            self.clone(),
            self.shutdown.child_token(),
        ))
    }

    /// Execute an incoming request and build its reply.
    pub async fn handle_request(&self, request: CommandRequest) -> CommandReply {
        let CommandRequest {
            request_id,
            sender,
            service_id,
            payload,
        } = request;

        let handler = if self.is_closed() {
            None
        } else {
            self.services.get(&service_id).map(|entry| entry.value().clone())
        };

        let Some(handler) = handler else {
            self.metrics.requests_no_service.inc();
            debug!(node = %self.local, %sender, service = %service_id, "No service deployed for request");
            return CommandReply::new(request_id, ReplyBody::NoService);
        };

        self.metrics.requests_handled.inc();

        // Run on its own task so a panicking command only fails this request.
        let body = match tokio::spawn(async move { handler.handle(payload).await }).await {
            Ok(body) => body,
            Err(e) => {
                error!(node = %self.local, %sender, service = %service_id, error = %e, "Command execution aborted");
                ReplyBody::Rejected(format!("command execution aborted: {}", e))
            }
        };

        CommandReply::new(request_id, body)
    }

    /// Deliver a request: in-process for the local member, over the transport
    /// otherwise.
    pub(crate) async fn send(
        &self,
        target: &Node,
        request: CommandRequest,
    ) -> std::result::Result<CommandReply, NetworkError> {
        if *target == self.local {
            Ok(self.handle_request(request).await)
        } else {
            self.transport.send(target, request).await
        }
    }

    /// Reserve a pending-call slot, enforcing `max_pending_calls`.
    pub(crate) fn acquire_slot(self: &Arc<Self>) -> std::result::Result<CallSlot, DispatcherError> {
        let max = self.config.max_pending_calls;
        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            if current >= max {
                warn!(node = %self.local, pending = current, "Too many pending calls");
                return Err(DispatcherError::ServerBusy { pending: current });
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        self.metrics.pending_calls.inc();
        Ok(CallSlot {
            factory: self.clone(),
        })
    }

    pub(crate) fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn unregister(&self, service_id: &str) {
        if self.services.remove(service_id).is_some() {
            debug!(node = %self.local, service = %service_id, "Unregistered command dispatcher");
        }
    }

    /// Start accepting requests over TCP on `bind_addr`.
    ///
    /// Returns the bound address and a sender that stops the server.
    pub async fn listen(self: &Arc<Self>, bind_addr: SocketAddr) -> Result<(SocketAddr, mpsc::Sender<()>)> {
        let (server, shutdown_tx) =
            NetworkServer::bind(bind_addr, self.clone(), self.config.max_message_size).await?;
        let addr = server.local_addr()?;

        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "Network server failed");
            }
        });

        Ok((addr, shutdown_tx))
    }

    /// Close the factory and every dispatcher it created. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        self.services.clear();
        info!(node = %self.local, "Command dispatcher factory closed");
    }

    /// Whether the factory has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// This node.
    pub fn local_member(&self) -> &Node {
        &self.local
    }

    /// Group membership.
    pub fn group(&self) -> &Arc<dyn Group> {
        &self.group
    }

    /// Configuration.
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Dispatch metrics.
    pub fn metrics(&self) -> &Arc<DispatcherMetrics> {
        &self.metrics
    }

    /// Number of calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Whether a service id is deployed on this node.
    pub fn has_service(&self, service_id: &str) -> bool {
        self.services.contains_key(service_id)
    }
}

#[async_trait]
impl MessageHandler for CommandDispatcherFactory {
    async fn handle(&self, msg: Message) -> Option<Message> {
        match msg {
            Message::CommandRequest(request) => {
                Some(Message::CommandReply(self.handle_request(request).await))
            }
            Message::Ping(_) => Some(Message::Pong(PongResponse {
                responder: self.local.clone(),
            })),
            other => {
                debug!(node = %self.local, message = ?other, "Ignoring unexpected message");
                None
            }
        }
    }
}

impl std::fmt::Debug for CommandDispatcherFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcherFactory")
            .field("local", &self.local)
            .field("services", &self.services.len())
            .field("pending_calls", &self.pending_calls())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A reserved pending-call slot, released on drop.
pub(crate) struct CallSlot {
    factory: Arc<CommandDispatcherFactory>,
}

impl Drop for CallSlot {
    fn drop(&mut self) {
        self.factory.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.factory.metrics.pending_calls.dec();
    }
}
