//! In-process transport with failure injection.

use crate::dispatcher::CommandDispatcherFactory;
use crate::error::NetworkError;
use crate::metrics::Counter;
use crate::network::rpc::{decode_message, encode_message, CommandReply, CommandRequest, Message};
use crate::network::transport::Transport;
use crate::types::Node;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tracing::trace;

/// Routes requests between factories living in the same process.
///
/// Requests go through the wire codec so commands are serialized exactly as
/// they would be over TCP. Two kinds of failure can be injected:
/// - a *suspended* node never answers, so calls to it stay pending until
///   they are cancelled
/// - an *isolated* node cannot be reached and cannot reach anyone
#[derive(Debug)]
pub struct InMemoryNetwork {
    endpoints: DashMap<SocketAddr, Weak<CommandDispatcherFactory>>,
    suspended: RwLock<HashSet<SocketAddr>>,
    isolated: RwLock<HashSet<SocketAddr>>,
    delivered: Counter,
}

impl InMemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: DashMap::new(),
            suspended: RwLock::new(HashSet::new()),
            isolated: RwLock::new(HashSet::new()),
            delivered: Counter::new("in_memory_delivered", "Requests delivered in process"),
        })
    }

    /// A transport sending from `local`.
    pub fn transport(self: &Arc<Self>, local: &Node) -> Arc<InMemoryTransport> {
        Arc::new(InMemoryTransport {
            network: self.clone(),
            local: local.clone(),
        })
    }

    /// Make `factory` reachable at its local member's address.
    pub fn attach(&self, factory: &Arc<CommandDispatcherFactory>) {
        self.endpoints
            .insert(factory.local_member().addr, Arc::downgrade(factory));
    }

    /// Remove the endpoint at `addr`.
    pub fn detach(&self, addr: &SocketAddr) {
        self.endpoints.remove(addr);
    }

    /// Stop answering requests sent to `addr`.
    pub fn suspend(&self, addr: SocketAddr) {
        self.suspended.write().insert(addr);
    }

    /// Answer requests sent to `addr` again. Requests already hanging stay
    /// hung.
    pub fn resume(&self, addr: &SocketAddr) {
        self.suspended.write().remove(addr);
    }

    /// Cut `addr` off from every other node.
    pub fn isolate(&self, addr: SocketAddr) {
        self.isolated.write().insert(addr);
    }

    /// Undo `isolate`.
    pub fn heal(&self, addr: &SocketAddr) {
        self.isolated.write().remove(addr);
    }

    /// Requests delivered to a remote factory so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.get()
    }

    fn is_isolated(&self, addr: &SocketAddr) -> bool {
        self.isolated.read().contains(addr)
    }

    fn is_suspended(&self, addr: &SocketAddr) -> bool {
        self.suspended.read().contains(addr)
    }

    fn endpoint(&self, addr: &SocketAddr) -> Option<Arc<CommandDispatcherFactory>> {
        self.endpoints.get(addr).and_then(|entry| entry.value().upgrade())
    }
}

/// One node's view of an `InMemoryNetwork`.
#[derive(Debug)]
pub struct InMemoryTransport {
    network: Arc<InMemoryNetwork>,
    local: Node,
}

fn unreachable(target: &Node, reason: &str) -> NetworkError {
    NetworkError::ConnectionFailed {
        addr: target.addr.to_string(),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, target: &Node, request: CommandRequest) -> Result<CommandReply, NetworkError> {
        let network = &self.network;
        if network.is_isolated(&self.local.addr) || network.is_isolated(&target.addr) {
            return Err(unreachable(target, "partitioned"));
        }

        if network.is_suspended(&target.addr) {
            trace!(from = %self.local, to = %target, "Target suspended, request will hang");
            std::future::pending::<()>().await;
        }

        let factory = network
            .endpoint(&target.addr)
            .ok_or_else(|| unreachable(target, "no endpoint"))?;

        let bytes = encode_message(&Message::CommandRequest(request))
            .map_err(|e| NetworkError::Serialization(e.to_string()))?;
        let request = match decode_message(&bytes).map_err(|e| NetworkError::Serialization(e.to_string()))? {
            Message::CommandRequest(request) => request,
            other => return Err(NetworkError::UnexpectedMessage(format!("{:?}", other))),
        };

        let reply = factory.handle_request(request).await;
        network.delivered.inc();

        let bytes = encode_message(&Message::CommandReply(reply))
            .map_err(|e| NetworkError::Serialization(e.to_string()))?;
        match decode_message(&bytes).map_err(|e| NetworkError::Serialization(e.to_string()))? {
            Message::CommandReply(reply) => Ok(reply),
            other => Err(NetworkError::UnexpectedMessage(format!("{:?}", other))),
        }
    }
}
