use crate::dispatcher::Command;
use crate::error::ExecutionError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::time::sleep;

/// Allocate OS-assigned loopback addresses by briefly binding to port 0.
pub(crate) async fn allocate_os_ports(count: usize) -> Vec<SocketAddr> {
    let mut results = Vec::with_capacity(count);
    for _ in 0..count {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        results.push(listener.local_addr().unwrap());
        drop(listener); // Release the port immediately
    }
    results
}

/// Wait for a condition with timeout
pub(crate) async fn wait_for<F>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// A command answering with facts about the member it runs on.
///
/// The context is the member's name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum Echo {
    /// Reply with the member name.
    Name,
    /// Fail with the given message, caused by "root cause".
    Fail(String),
    /// Sleep, then reply with the member name.
    Sleep(u64),
}

#[async_trait]
impl Command<String> for Echo {
    type Output = String;

    async fn execute(&self, context: &String) -> Result<String, ExecutionError> {
        match self {
            Echo::Name => Ok(context.clone()),
            Echo::Fail(message) => {
                Err(ExecutionError::new(message.clone()).with_cause(ExecutionError::new("root cause")))
            }
            Echo::Sleep(millis) => {
                sleep(Duration::from_millis(*millis)).await;
                Ok(context.clone())
            }
        }
    }
}

pub(crate) const ECHO_SERVICE: &str = "echo";
