//! Testing utilities for multi-node scenarios.
//!
//! Nodes run in one process and talk through an `InMemoryNetwork`, which
//! serializes every request like the TCP transport does and can inject two
//! kinds of failure:
//! - suspended nodes, whose calls hang until cancelled
//! - isolated nodes, whose calls fail as unreachable
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                       TestCluster                         │
//! │                                                           │
//! │   TestNode ─┐      TestNode ─┐      TestNode ─┐           │
//! │   group     │      group     │      group     │           │
//! │   factory ──┼──────factory ──┼──────factory ──┤           │
//! │   expiration│      expiration│      expiration│           │
//! │             ▼                ▼                ▼           │
//! │  ┌─────────────────────────────────────────────────────┐  │
//! │  │                  InMemoryNetwork                    │  │
//! │  │   suspend / resume / isolate / heal                 │  │
//! │  └─────────────────────────────────────────────────────┘  │
//! │                                                           │
//! │  shared InMemoryStore<String, ExpirationMetaData>         │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let cluster = TestCluster::new(3, Duration::from_millis(100)).await;
//! cluster.touch(0, "session-1");
//! cluster.leave(cluster.owner_index(0, "session-1")).await;
//! ```

mod cluster;
mod network;
mod utils;

mod dispatcher_tests;
mod expiration_tests;

#[cfg(test)]
mod tests {
    use crate::cluster::Group;
    use crate::testing::cluster::TestCluster;
    use crate::testing::utils::wait_for;
    use std::time::Duration;

    #[tokio::test]
    async fn test_test_cluster() {
        let cluster = TestCluster::new(3, Duration::from_secs(60)).await;

        assert_eq!(cluster.running(), vec![0, 1, 2]);
        for node in &cluster.nodes {
            assert_eq!(node.group.view().len(), 3);
        }
        assert_eq!(cluster.members(&[0, 2]), vec![cluster.nodes[0].node.clone(), cluster.nodes[2].node.clone()]);

        cluster.leave(1).await;
        assert_eq!(cluster.running(), vec![0, 2]);
        assert_eq!(cluster.nodes[0].group.view().len(), 2);

        cluster.shutdown();
    }

    #[tokio::test]
    async fn test_wait_for() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let flag = Arc::new(AtomicBool::new(false));
        let flag_clone = flag.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag_clone.store(true, Ordering::Relaxed);
        });

        let result = wait_for(|| flag.load(Ordering::Relaxed), Duration::from_millis(500)).await;

        assert!(result);
    }
}
