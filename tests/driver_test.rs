//! Tests for the async control loop and long-poll listeners

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use backend_controller::admission::Unbounded;
use backend_controller::controller::{BackendController, ControllerHandle};
use backend_controller::models::BackendConfigUpdate;
use backend_controller::notifications::{LongPollHost, Topic, Update};
use backend_controller::replica::ReplicaState;
use backend_controller::runtime::{LocalRuntime, LocalRuntimeConfig};
use backend_controller::storage::MemoryKvStore;
use common::{config, options, replica_config, tag};
use tokio::sync::watch;

fn spawn_handle(runtime: LocalRuntime, host: Arc<LongPollHost>) -> ControllerHandle {
    let controller = BackendController::new(
        options(),
        Arc::new(runtime),
        Arc::new(Unbounded),
        Arc::new(MemoryKvStore::new()),
        host,
    )
    .unwrap();
    ControllerHandle::new(controller)
}

#[tokio::test]
async fn test_listener_sees_running_handles() {
    let runtime = LocalRuntime::new(LocalRuntimeConfig::automatic());
    let host = Arc::new(LongPollHost::new());
    let handle = spawn_handle(runtime, host.clone());
    let svc = tag("svc");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let control = handle.spawn_control_loop(Duration::from_millis(5), shutdown_rx);

    let goal = handle
        .create_backend(&svc, config(2), replica_config())
        .await
        .unwrap()
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle.wait_for_goal(goal))
        .await
        .expect("goal should complete");

    let mut known = HashMap::from([(Topic::ReplicaHandles, 0u64)]);
    let running = loop {
        let updates = tokio::time::timeout(Duration::from_secs(5), host.listen_for_change(&known))
            .await
            .unwrap()
            .unwrap();
        let snapshot = &updates[&Topic::ReplicaHandles];
        known.insert(Topic::ReplicaHandles, snapshot.snapshot_id);
        if let Update::ReplicaHandles(handles) = snapshot.update.as_ref() {
            if handles.get(&svc).map_or(0, Vec::len) == 2 {
                break handles[&svc].clone();
            }
        }
    };
    assert_eq!(running.len(), 2);

    shutdown_tx.send(true).unwrap();
    control.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_scale_down_while_loop_runs() {
    let runtime = LocalRuntime::new(LocalRuntimeConfig::automatic());
    let handle = spawn_handle(runtime.clone(), Arc::new(LongPollHost::new()));
    let svc = tag("svc-a");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let control = handle.spawn_control_loop(Duration::from_millis(5), shutdown_rx);

    let goal = handle
        .create_backend(&svc, config(2), replica_config())
        .await
        .unwrap()
        .unwrap();
    handle.wait_for_goal(goal).await;

    let goal = handle
        .update_backend_config(&svc, &BackendConfigUpdate::replicas(1))
        .await
        .unwrap();
    handle.wait_for_goal(goal).await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while runtime.live_workers().len() != 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("one worker should be terminated");

    let counts = handle.with(|c| c.replica_counts(&svc)).await;
    assert_eq!(counts[&ReplicaState::Running], 1);
    assert_eq!(runtime.forced_terminations().len(), 0);

    shutdown_tx.send(true).unwrap();
    control.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_goal_for_unknown_id_resolves() {
    let handle = spawn_handle(LocalRuntime::manual(), Arc::new(LongPollHost::new()));
    let goal = backend_controller::models::GoalId::new();

    tokio::time::timeout(Duration::from_millis(100), handle.wait_for_goal(goal))
        .await
        .expect("unknown goals resolve immediately");
}
