//! TCP server for incoming command traffic.

use crate::error::{NetworkError, Result};
use crate::network::rpc::{decode_message, frame_message, read_frame, Message};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Handler for incoming messages.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle an incoming message and optionally return a response.
    async fn handle(&self, msg: Message) -> Option<Message>;
}

/// TCP server that feeds framed messages to a handler.
pub struct NetworkServer {
    /// Listener, bound at construction so the port is known up front.
    listener: TcpListener,

    /// Message handler.
    handler: Arc<dyn MessageHandler>,

    /// Largest frame accepted from a peer.
    max_message_size: usize,

    /// Shutdown signal receiver.
    shutdown_rx: mpsc::Receiver<()>,
}

impl NetworkServer {
    /// Bind a new network server.
    pub async fn bind(
        bind_addr: SocketAddr,
        handler: Arc<dyn MessageHandler>,
        max_message_size: usize,
    ) -> Result<(Self, mpsc::Sender<()>)> {
        let listener = TcpListener::bind(bind_addr).await.map_err(NetworkError::Io)?;
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let server = Self {
            listener,
            handler,
            max_message_size,
            shutdown_rx,
        };

        Ok((server, shutdown_tx))
    }

    /// The address actually bound.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr().map_err(NetworkError::Io)?)
    }

    /// Run the server until the shutdown signal fires.
    pub async fn run(mut self) -> Result<()> {
        info!(addr = ?self.listener.local_addr().ok(), "Network server listening");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "Accepted connection");
                            let handler = self.handler.clone();
                            let max_message_size = self.max_message_size;
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, handler, max_message_size).await {
                                    debug!(error = %e, "Connection handler error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!("Network server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(
        mut stream: TcpStream,
        handler: Arc<dyn MessageHandler>,
        max_message_size: usize,
    ) -> Result<()> {
        while let Some(frame) = read_frame(&mut stream, max_message_size).await? {
            let Some(response) = handler.handle(decode_message(&frame)?).await else {
                continue;
            };
            let framed = frame_message(&response)?;
            stream.write_all(&framed).await.map_err(NetworkError::Io)?;
            stream.flush().await.map_err(NetworkError::Io)?;
        }
        Ok(())
    }
}
