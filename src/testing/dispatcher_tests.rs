//! Dispatcher scenarios across several in-memory nodes.

use crate::dispatcher::CommandDispatcher;
use crate::error::{CommandError, ExecutionError};
use crate::testing::cluster::TestCluster;
use crate::testing::utils::{wait_for, Echo, ECHO_SERVICE};
use std::sync::Arc;
use std::time::Duration;

type EchoDispatcher = Arc<CommandDispatcher<String, Echo>>;

fn deploy_echoes(cluster: &TestCluster) -> Vec<EchoDispatcher> {
    cluster
        .nodes
        .iter()
        .map(|n| {
            n.factory
                .create_command_dispatcher::<String, Echo>(ECHO_SERVICE, n.node.name.to_string())
                .unwrap()
        })
        .collect()
}

#[tokio::test]
async fn test_group_of_three_answers_three_times() {
    let cluster = TestCluster::new(3, Duration::from_secs(60)).await;
    let echoes = deploy_echoes(&cluster);

    let responses = echoes[0].execute_on_group(&Echo::Name, &[]).unwrap();
    assert_eq!(responses.len(), 3);

    for (target, response) in responses {
        assert_eq!(response.await.unwrap(), target.name.to_string());
    }

    cluster.shutdown();
}

#[tokio::test]
async fn test_departing_member_response_is_cancelled() {
    let cluster = TestCluster::new(3, Duration::from_secs(60)).await;
    let echoes = deploy_echoes(&cluster);
    let departing = cluster.nodes[2].node.clone();

    // Calls to the departing member hang until the view change settles them.
    cluster.network.suspend(departing.addr);
    let responses = echoes[0].execute_on_group(&Echo::Name, &[]).unwrap();
    assert!(wait_for(|| echoes[0].pending_calls() == 1, Duration::from_secs(2)).await);

    cluster.install(&[0, 1]).await;

    let mut completed = 0;
    for (target, response) in responses {
        let outcome = response.await;
        if target == departing {
            assert_eq!(outcome, Err(CommandError::Cancelled));
        } else {
            assert_eq!(outcome.unwrap(), target.name.to_string());
            completed += 1;
        }
    }
    assert_eq!(completed, 2);
    assert_eq!(echoes[0].pending_calls(), 0);

    cluster.shutdown();
}

#[tokio::test]
async fn test_local_and_remote_outcomes_have_same_shape() {
    let cluster = TestCluster::new(2, Duration::from_secs(60)).await;
    let echoes = deploy_echoes(&cluster);
    let local = cluster.nodes[0].node.clone();
    let remote = cluster.nodes[1].node.clone();

    let command = Echo::Fail("boom".to_string());
    let local_err = echoes[0].execute_on_member(&command, &local).unwrap().await.unwrap_err();
    let remote_err = echoes[0].execute_on_member(&command, &remote).unwrap().await.unwrap_err();

    let expected = ExecutionError::new("boom").with_cause(ExecutionError::new("root cause"));
    assert_eq!(local_err, CommandError::Execution(expected.clone()));
    assert_eq!(remote_err, CommandError::Execution(expected));
    assert_eq!(remote_err.execution_error().unwrap().root_cause().message(), "root cause");

    let local_ok = echoes[0].execute_on_member(&Echo::Name, &local).unwrap().await;
    let remote_ok = echoes[0].execute_on_member(&Echo::Name, &remote).unwrap().await;
    assert_eq!(local_ok, Ok("node-0".to_string()));
    assert_eq!(remote_ok, Ok("node-1".to_string()));

    // Only the remote calls crossed the network.
    assert_eq!(cluster.network.delivered(), 2);

    cluster.shutdown();
}

#[tokio::test]
async fn test_isolated_member_is_unreachable() {
    let cluster = TestCluster::new(2, Duration::from_secs(60)).await;
    let echoes = deploy_echoes(&cluster);
    let remote = cluster.nodes[1].node.clone();

    cluster.network.isolate(remote.addr);
    let outcome = echoes[0].execute_on_member(&Echo::Name, &remote).unwrap().await;
    match outcome {
        Err(CommandError::Unreachable { node, .. }) => assert_eq!(node, remote),
        other => panic!("expected unreachable, got {:?}", other),
    }

    cluster.network.heal(&remote.addr);
    let outcome = echoes[0].execute_on_member(&Echo::Name, &remote).unwrap().await;
    assert_eq!(outcome, Ok("node-1".to_string()));

    cluster.shutdown();
}

#[tokio::test]
async fn test_missing_service_is_cancelled() {
    let cluster = TestCluster::new(2, Duration::from_secs(60)).await;
    let echo = cluster.nodes[0]
        .factory
        .create_command_dispatcher::<String, Echo>(ECHO_SERVICE, "node-0".to_string())
        .unwrap();

    let remote = cluster.nodes[1].node.clone();
    let outcome = echo.execute_on_member(&Echo::Name, &remote).unwrap().await;
    assert_eq!(outcome, Err(CommandError::Cancelled));
    assert_eq!(cluster.nodes[1].factory.metrics().requests_no_service.get(), 1);

    cluster.shutdown();
}

#[tokio::test]
async fn test_closing_remote_dispatcher_cancels_later_calls() {
    let cluster = TestCluster::new(2, Duration::from_secs(60)).await;
    let echoes = deploy_echoes(&cluster);
    let remote = cluster.nodes[1].node.clone();

    echoes[1].close();
    assert!(!cluster.nodes[1].factory.has_service(ECHO_SERVICE));

    let outcome = echoes[0].execute_on_member(&Echo::Name, &remote).unwrap().await;
    assert_eq!(outcome, Err(CommandError::Cancelled));

    cluster.shutdown();
}

#[tokio::test]
async fn test_slow_members_do_not_delay_fast_ones() {
    let cluster = TestCluster::new(3, Duration::from_secs(60)).await;
    let echoes = deploy_echoes(&cluster);

    let slow = cluster.nodes[2].node.clone();
    let fast = cluster.nodes[1].node.clone();
    let slow_response = echoes[0].execute_on_member(&Echo::Sleep(500), &slow).unwrap();
    let fast_response = echoes[0].execute_on_member(&Echo::Name, &fast).unwrap();

    let fast_outcome = tokio::time::timeout(Duration::from_millis(250), fast_response)
        .await
        .expect("fast member answered first");
    assert_eq!(fast_outcome, Ok("node-1".to_string()));
    assert_eq!(slow_response.await, Ok("node-2".to_string()));

    cluster.shutdown();
}
