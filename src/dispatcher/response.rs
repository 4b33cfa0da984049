//! Per-target response futures.

use crate::error::CommandError;
use crate::types::Node;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Eventual outcome of a command sent to one target.
///
/// Resolves to the command's output, the command's own `ExecutionError`, or
/// `Cancelled` when the target left the view or the dispatcher was closed.
#[derive(Debug)]
pub struct CommandResponse<R> {
    target: Node,
    rx: oneshot::Receiver<Result<R, CommandError>>,
}

impl<R> CommandResponse<R> {
    pub(crate) fn new(target: Node, rx: oneshot::Receiver<Result<R, CommandError>>) -> Self {
        Self { target, rx }
    }

    /// The member this response is from.
    pub fn target(&self) -> &Node {
        &self.target
    }
}

impl<R> Future for CommandResponse<R> {
    type Output = Result<R, CommandError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        // A dropped sender means the call was abandoned without an outcome.
        Pin::new(&mut this.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(CommandError::Cancelled)))
    }
}
