//! Commands and their type-erased execution on the receiving side.

use crate::error::ExecutionError;
use crate::network::rpc::ReplyBody;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

/// A unit of work executed against a service context on some member.
///
/// Commands cross the wire, so they and their output are serde types. The
/// same command runs the same way whether the target is local or remote.
#[async_trait]
pub trait Command<C>: Serialize + DeserializeOwned + Send + Sync + 'static
where
    C: Send + Sync + 'static,
{
    /// Value produced by a successful execution.
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Execute against the context of the service on the target member.
    async fn execute(&self, context: &C) -> Result<Self::Output, ExecutionError>;
}

/// Decodes and executes requests for one service.
#[async_trait]
pub(crate) trait ServiceHandler: Send + Sync + 'static {
    async fn handle(&self, payload: Vec<u8>) -> ReplyBody;
}

/// `ServiceHandler` for commands of type `M` against context `C`.
pub(crate) struct CommandHandler<C, M> {
    context: Arc<C>,
    _command: PhantomData<fn() -> M>,
}

impl<C, M> CommandHandler<C, M> {
    pub(crate) fn new(context: Arc<C>) -> Self {
        Self {
            context,
            _command: PhantomData,
        }
    }
}

#[async_trait]
impl<C, M> ServiceHandler for CommandHandler<C, M>
where
    C: Send + Sync + 'static,
    M: Command<C>,
{
    async fn handle(&self, payload: Vec<u8>) -> ReplyBody {
        let command: M = match bincode::deserialize(&payload) {
            Ok(command) => command,
            Err(e) => return ReplyBody::Rejected(format!("failed to decode command: {}", e)),
        };

        let result = command.execute(&self.context).await;

        match bincode::serialize(&result) {
            Ok(bytes) => ReplyBody::Completed(bytes),
            Err(e) => ReplyBody::Rejected(format!("failed to encode result: {}", e)),
        }
    }
}
