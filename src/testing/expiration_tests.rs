//! End-to-end expiration across an in-memory cluster.
//!
//! Deadlines are wall-clock times, so these tests run in real time with short
//! timeouts.

use crate::cache::MetaDataStore;
use crate::expiration::ExpirationMetaData;
use crate::testing::cluster::TestCluster;
use crate::testing::utils::wait_for;
use std::time::{Duration, SystemTime};
use tokio::time::sleep;

#[tokio::test]
async fn test_entry_expires_exactly_once_on_owner() {
    let cluster = TestCluster::new(3, Duration::from_millis(100)).await;
    let owner = cluster.owner_index(0, "k");
    let from = (owner + 1) % 3;

    cluster.touch(from, "k");
    assert!(!cluster.nodes[from].expiration.is_scheduled_locally(&"k".to_string()));

    assert!(wait_for(|| cluster.total_removed() == 1, Duration::from_secs(2)).await);
    sleep(Duration::from_millis(200)).await;

    assert_eq!(cluster.total_removed(), 1);
    assert_eq!(cluster.nodes[owner].recorder.expired(), vec!["k".to_string()]);
    assert!(cluster.store.load(&"k".to_string()).is_none());

    cluster.shutdown();
}

#[tokio::test]
async fn test_cancel_from_any_node_prevents_expiration() {
    let cluster = TestCluster::new(3, Duration::from_millis(300)).await;

    for canceller in 0..3 {
        let id = format!("k-{}", canceller);
        let owner = cluster.owner_index(0, &id);

        cluster.touch(0, &id);
        assert!(
            wait_for(
                || cluster.nodes[owner].expiration.is_scheduled_locally(&id),
                Duration::from_millis(150)
            )
            .await
        );

        cluster.nodes[canceller].expiration.cancel(&id);
    }

    sleep(Duration::from_millis(600)).await;

    assert_eq!(cluster.total_removed(), 0);
    assert_eq!(cluster.store.len(), 3);
    for node in &cluster.nodes {
        assert!(node.expiration.scheduler().local().is_empty());
    }

    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_right_after_touch_overtakes_schedule() {
    let cluster = TestCluster::new(3, Duration::from_millis(100)).await;
    let ids: Vec<String> = (0..40).map(|i| format!("race-{}", i)).collect();

    // The schedule is still on its way to the owner when the cancel is sent.
    for id in &ids {
        let from = (cluster.owner_index(0, id) + 1) % 3;
        cluster.touch(from, id);
        cluster.nodes[from].expiration.cancel(id);
    }

    sleep(Duration::from_millis(400)).await;

    assert_eq!(cluster.total_removed(), 0);
    assert_eq!(cluster.store.len(), ids.len());
    for node in &cluster.nodes {
        assert!(node.expiration.scheduler().local().is_empty());
    }

    cluster.shutdown();
}

#[tokio::test]
async fn test_cancel_survives_owner_departure() {
    let cluster = TestCluster::new(3, Duration::from_millis(300)).await;
    let id = "k".to_string();
    let owner = cluster.owner_index(0, &id);
    let canceller = (owner + 1) % 3;

    cluster.touch(canceller, &id);
    assert!(
        wait_for(
            || cluster.nodes[owner].expiration.is_scheduled_locally(&id),
            Duration::from_millis(150)
        )
        .await
    );

    cluster.nodes[canceller].expiration.cancel(&id);
    cluster.leave(owner).await;

    sleep(Duration::from_millis(600)).await;

    assert_eq!(cluster.total_removed(), 0);
    assert!(cluster.store.contains(&id));
    for i in cluster.running() {
        assert!(!cluster.nodes[i].expiration.is_scheduled_locally(&id));
        assert!(cluster.nodes[i].expiration.is_cancelled(&id));
    }

    cluster.shutdown();
}

#[tokio::test]
async fn test_touch_after_cancel_schedules_again() {
    let cluster = TestCluster::new(3, Duration::from_millis(150)).await;
    let id = "k".to_string();

    cluster.touch(0, &id);
    cluster.nodes[1].expiration.cancel(&id);
    sleep(Duration::from_millis(50)).await;

    cluster.touch(2, &id);
    assert!(wait_for(|| cluster.total_removed() == 1, Duration::from_secs(2)).await);
    assert!(!cluster.store.contains(&id));

    cluster.shutdown();
}

#[tokio::test]
async fn test_touch_postpones_expiration() {
    let cluster = TestCluster::new(3, Duration::from_millis(200)).await;

    cluster.touch(0, "k");
    sleep(Duration::from_millis(120)).await;
    cluster.touch(1, "k");

    // Past the first deadline, before the second.
    sleep(Duration::from_millis(150)).await;
    assert_eq!(cluster.total_removed(), 0);
    assert!(cluster.store.contains(&"k".to_string()));

    assert!(wait_for(|| cluster.total_removed() == 1, Duration::from_secs(2)).await);

    cluster.shutdown();
}

#[tokio::test]
async fn test_touch_without_reschedule_rearms_on_owner() {
    let cluster = TestCluster::new(2, Duration::from_millis(150)).await;
    let owner = cluster.owner_index(0, "k");

    let first = cluster.touch(0, "k");
    sleep(Duration::from_millis(100)).await;
    // Only the store sees the access; the owner's timer still holds `first`.
    cluster
        .store
        .insert("k".to_string(), first.touched(SystemTime::now()));

    sleep(Duration::from_millis(100)).await;
    assert_eq!(cluster.total_removed(), 0);
    assert!(cluster.nodes[owner].expiration.is_scheduled_locally(&"k".to_string()));

    assert!(wait_for(|| cluster.total_removed() == 1, Duration::from_secs(2)).await);

    cluster.shutdown();
}

#[tokio::test]
async fn test_immortal_entry_is_never_scheduled() {
    let cluster = TestCluster::new(3, Duration::from_millis(50)).await;
    let id = "immortal".to_string();
    let owner = cluster.owner_index(0, &id);

    let metadata = ExpirationMetaData::immortal(SystemTime::now());
    cluster.store.insert(id.clone(), metadata);
    cluster.nodes[0].expiration.schedule(id.clone(), metadata);

    sleep(Duration::from_millis(200)).await;
    assert_eq!(cluster.total_removed(), 0);
    assert!(!cluster.nodes[owner].expiration.is_scheduled_locally(&id));
    assert!(cluster.store.contains(&id));

    cluster.shutdown();
}

#[tokio::test]
async fn test_metadata_now_uses_configured_timeout() {
    let cluster = TestCluster::new(1, Duration::from_millis(75)).await;
    let metadata = cluster.nodes[0].expiration.metadata_now();
    assert_eq!(metadata.timeout(), Some(Duration::from_millis(75)));
    cluster.shutdown();
}
