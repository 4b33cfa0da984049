//! Outgoing request transport.

use crate::config::DispatcherConfig;
use crate::error::NetworkError;
use crate::network::rpc::{
    decode_message, frame_message, read_frame, CommandReply, CommandRequest, Message,
};
use crate::types::Node;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::trace;

/// Delivers a command request to a node and waits for its reply.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send `request` to `target`.
    async fn send(&self, target: &Node, request: CommandRequest) -> Result<CommandReply, NetworkError>;
}

/// Transport over TCP using length-prefixed bincode frames.
///
/// Each request opens its own connection, writes one frame and reads one
/// reply frame.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
    max_message_size: usize,
}

impl TcpTransport {
    /// Create a transport from dispatcher configuration.
    pub fn new(config: &DispatcherConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            max_message_size: config.max_message_size,
        }
    }

    async fn connect(&self, target: &Node) -> Result<TcpStream, NetworkError> {
        tokio::time::timeout(self.connect_timeout, TcpStream::connect(target.addr))
            .await
            .map_err(|_| NetworkError::ConnectionFailed {
                addr: target.addr.to_string(),
                reason: "connection timeout".to_string(),
            })?
            .map_err(|e| NetworkError::ConnectionFailed {
                addr: target.addr.to_string(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, target: &Node, request: CommandRequest) -> Result<CommandReply, NetworkError> {
        let request_id = request.request_id;
        let stream = self.connect(target).await?;
        let (mut reader, mut writer) = stream.into_split();

        let framed = frame_message(&Message::CommandRequest(request))
            .map_err(|e| NetworkError::Serialization(e.to_string()))?;
        if framed.len() - 4 > self.max_message_size {
            return Err(NetworkError::SendFailed("message too large".to_string()));
        }

        writer
            .write_all(&framed)
            .await
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;

        let reply = read_frame(&mut reader, self.max_message_size)
            .await?
            .ok_or(NetworkError::ConnectionClosed)?;

        let message =
            decode_message(&reply).map_err(|e| NetworkError::Serialization(e.to_string()))?;

        match message {
            Message::CommandReply(reply) if reply.request_id == request_id => {
                trace!(target = %target, request_id, "Received reply");
                Ok(reply)
            }
            Message::CommandReply(reply) => Err(NetworkError::UnexpectedMessage(format!(
                "reply for request {} while waiting for {}",
                reply.request_id, request_id
            ))),
            other => Err(NetworkError::UnexpectedMessage(format!("{:?}", other))),
        }
    }
}
