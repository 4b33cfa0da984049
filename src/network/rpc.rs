//! RPC message types for command traffic between nodes.

use crate::error::NetworkError;
use crate::types::Node;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Network message wrapper for all communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// A command addressed to a service on the receiving node.
    CommandRequest(CommandRequest),

    /// Reply to a command request.
    CommandReply(CommandReply),

    /// Liveness check.
    Ping(PingRequest),

    /// Response to ping.
    Pong(PongResponse),
}

/// A serialized command addressed to a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Unique request ID for correlation.
    pub request_id: u64,

    /// The sending node.
    pub sender: Node,

    /// Cluster-wide name of the target service.
    pub service_id: String,

    /// bincode-encoded command.
    pub payload: Vec<u8>,
}

impl CommandRequest {
    /// Create a new command request.
    pub fn new(request_id: u64, sender: Node, service_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            request_id,
            sender,
            service_id: service_id.into(),
            payload,
        }
    }
}

/// Reply to a command request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReply {
    /// The request ID this is responding to.
    pub request_id: u64,

    /// What happened on the receiving node.
    pub body: ReplyBody,
}

impl CommandReply {
    /// Create a new reply.
    pub fn new(request_id: u64, body: ReplyBody) -> Self {
        Self { request_id, body }
    }
}

/// Outcome of a request on the receiving node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyBody {
    /// The command ran. Holds a bincode-encoded
    /// `Result<Output, ExecutionError>`.
    Completed(Vec<u8>),

    /// No dispatcher for the service id is registered on the receiver.
    NoService,

    /// The receiver could not decode the request or encode the result.
    Rejected(String),
}

/// Ping request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingRequest {
    /// Sending node.
    pub sender: Node,
}

/// Response to ping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PongResponse {
    /// Responding node.
    pub responder: Node,
}

/// Encode a message to bytes.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(msg)
}

/// Decode a message from bytes.
pub fn decode_message(data: &[u8]) -> Result<Message, bincode::Error> {
    bincode::deserialize(data)
}

/// Frame a message with length prefix for TCP transmission.
pub fn frame_message(msg: &Message) -> Result<Vec<u8>, bincode::Error> {
    let data = encode_message(msg)?;
    let len = data.len() as u32;

    let mut framed = Vec::with_capacity(4 + data.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&data);

    Ok(framed)
}

/// Read one length-prefixed frame body.
///
/// Returns `None` when the peer closes the connection cleanly between frames.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Vec<u8>>, NetworkError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut prefix).await {
        return match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Ok(None),
            _ => Err(NetworkError::ReceiveFailed(e.to_string())),
        };
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > max_len {
        return Err(NetworkError::ReceiveFailed(format!(
            "frame of {} bytes exceeds limit of {}",
            len, max_len
        )));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| NetworkError::ReceiveFailed(e.to_string()))?;
    Ok(Some(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> Node {
        Node::new("node-1", "127.0.0.1:9000".parse().unwrap())
    }

    #[test]
    fn test_command_request_serialization() {
        let req = CommandRequest::new(42, node(), "expiration", vec![1, 2, 3]);

        let msg = Message::CommandRequest(req);
        let encoded = encode_message(&msg).unwrap();
        let decoded = decode_message(&encoded).unwrap();

        match decoded {
            Message::CommandRequest(decoded_req) => {
                assert_eq!(decoded_req.request_id, 42);
                assert_eq!(decoded_req.sender, node());
                assert_eq!(decoded_req.service_id, "expiration");
                assert_eq!(decoded_req.payload, vec![1, 2, 3]);
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_reply_bodies() {
        let reply = CommandReply::new(7, ReplyBody::NoService);
        let encoded = encode_message(&Message::CommandReply(reply)).unwrap();

        match decode_message(&encoded).unwrap() {
            Message::CommandReply(reply) => {
                assert_eq!(reply.request_id, 7);
                assert_eq!(reply.body, ReplyBody::NoService);
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_frame_message() {
        let msg = Message::Ping(PingRequest { sender: node() });

        let framed = frame_message(&msg).unwrap();

        // First 4 bytes should be length
        let len = u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
        assert_eq!(len, framed.len() - 4);

        let decoded = decode_message(&framed[4..]).unwrap();
        if let Message::Ping(ping) = decoded {
            assert_eq!(ping.sender, node());
        } else {
            panic!("Wrong message type");
        }
    }

    #[tokio::test]
    async fn test_read_frame() {
        let msg = Message::Ping(PingRequest { sender: node() });
        let mut wire = frame_message(&msg).unwrap();
        wire.extend(frame_message(&msg).unwrap());

        let mut reader = &wire[..];
        for _ in 0..2 {
            let body = read_frame(&mut reader, 1024).await.unwrap().unwrap();
            assert!(matches!(decode_message(&body).unwrap(), Message::Ping(_)));
        }
        assert!(read_frame(&mut reader, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized() {
        let wire = frame_message(&Message::Ping(PingRequest { sender: node() })).unwrap();
        let mut reader = &wire[..];

        let err = read_frame(&mut reader, 4).await.unwrap_err();
        assert!(matches!(err, NetworkError::ReceiveFailed(_)));
    }
}
