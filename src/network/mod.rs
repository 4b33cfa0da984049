//! Network communication layer.

pub mod rpc;
pub mod server;
pub mod transport;

pub use rpc::{CommandReply, CommandRequest, Message, PingRequest, PongResponse, ReplyBody};
pub use server::{MessageHandler, NetworkServer};
pub use transport::{TcpTransport, Transport};
