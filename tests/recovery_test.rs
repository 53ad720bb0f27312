//! Tests for rebuilding a controller from its checkpoint

mod common;

use std::sync::Arc;

use backend_controller::admission::Unbounded;
use backend_controller::config::DEFAULT_CHECKPOINT_KEY;
use backend_controller::controller::BackendController;
use backend_controller::error::Error;
use backend_controller::models::BackendConfigUpdate;
use backend_controller::notifications::{LongPollHost, Topic, Update};
use backend_controller::replica::ReplicaState;
use backend_controller::runtime::LocalRuntime;
use backend_controller::storage::{FileKvStore, KvStore};
use common::{config, options, replica_config, tag, Harness};

#[test]
fn test_restart_mid_scale_up_matches_uninterrupted_run() {
    let svc = tag("svc");

    let mut reference = Harness::new();
    reference.controller.create_backend(&svc, config(3), replica_config()).unwrap();
    reference.settle();

    let mut h = Harness::new();
    h.controller.create_backend(&svc, config(3), replica_config()).unwrap();
    let mut h = h.restart();
    assert_eq!(h.count(&svc, ReplicaState::ShouldStart), 3);
    assert_eq!(h.runtime.creation_count(), 0);

    h.settle();
    assert_eq!(
        h.controller.replica_counts(&svc),
        reference.controller.replica_counts(&svc)
    );
    assert_eq!(h.runtime.creation_count(), 3);
}

#[test]
fn test_restart_while_starting_does_not_duplicate_workers() {
    let svc = tag("svc");
    let mut h = Harness::new();
    h.controller.create_backend(&svc, config(2), replica_config()).unwrap();
    h.controller.update().unwrap();
    assert_eq!(h.runtime.creation_count(), 2);

    let mut h = h.restart();
    assert_eq!(h.count(&svc, ReplicaState::Starting), 2);
    assert_eq!(h.runtime.creation_count(), 2);

    h.runtime.mark_all_ready();
    h.controller.update().unwrap();
    assert_eq!(h.count(&svc, ReplicaState::Running), 2);
    assert_eq!(h.runtime.creation_count(), 2);
}

#[test]
fn test_restart_republishes_running_handles() {
    let svc = tag("svc");
    let mut h = Harness::new();
    h.controller.create_backend(&svc, config(2), replica_config()).unwrap();
    h.settle();
    let before = h.controller.get_replica_handles();

    let h = h.restart();
    assert_eq!(h.controller.get_replica_handles(), before);

    let snapshot = h.host.get_snapshot(Topic::ReplicaHandles).unwrap();
    match snapshot.update.as_ref() {
        Update::ReplicaHandles(handles) => assert_eq!(handles[&svc].len(), 2),
        other => panic!("unexpected update: {other:?}"),
    }
}

#[test]
fn test_restart_replaces_lost_running_replica() {
    let svc = tag("svc");
    let mut h = Harness::new();
    h.controller.create_backend(&svc, config(2), replica_config()).unwrap();
    h.settle();

    let lost = h.runtime.live_workers()[0].clone();
    h.runtime.kill(&lost);

    let mut h = h.restart();
    assert_eq!(h.count(&svc, ReplicaState::Running), 1);
    assert_eq!(h.count(&svc, ReplicaState::Starting), 1);
    assert_eq!(h.runtime.creation_count(), 3);
    assert!(h.runtime.is_alive(&lost));

    h.runtime.mark_all_ready();
    h.controller.update().unwrap();
    assert_eq!(h.count(&svc, ReplicaState::Running), 2);
}

#[test]
fn test_restart_resumes_drain() {
    let svc = tag("svc");
    let mut h = Harness::new();
    h.controller.create_backend(&svc, config(1), replica_config()).unwrap();
    h.settle();
    h.controller
        .update_backend_config(&svc, &BackendConfigUpdate::replicas(0))
        .unwrap();
    h.controller.update().unwrap();
    assert_eq!(h.count(&svc, ReplicaState::Stopping), 1);

    let mut h = h.restart();
    assert_eq!(h.count(&svc, ReplicaState::Stopping), 1);
    assert_eq!(h.runtime.drain_requests().len(), 2);

    h.runtime.finish_all_drains();
    h.controller.update().unwrap();
    assert_eq!(h.count(&svc, ReplicaState::Stopping), 0);
    assert!(h.runtime.live_workers().is_empty());
    assert!(h.runtime.forced_terminations().is_empty());
}

#[test]
fn test_restart_restores_pending_goals() {
    let svc = tag("svc");
    let mut h = Harness::new();
    let superseded = h
        .controller
        .create_backend(&svc, config(1), replica_config())
        .unwrap()
        .unwrap();
    let current = h
        .controller
        .update_backend_config(&svc, &BackendConfigUpdate::replicas(2))
        .unwrap();

    let mut h = h.restart();
    assert!(!h.controller.is_goal_pending(&superseded));
    assert!(h.controller.is_goal_pending(&current));
    assert_eq!(h.controller.goal_for(&svc), Some(current));

    let waiter = h.controller.watch_goal(current);
    h.settle();
    h.controller.update().unwrap();
    assert!(waiter.is_complete());
}

#[test]
fn test_restart_after_delete_collects_backend() {
    let svc = tag("svc");
    let mut h = Harness::new();
    h.controller.create_backend(&svc, config(2), replica_config()).unwrap();
    h.settle();
    let goal = h.controller.delete_backend(&svc, true).unwrap().unwrap();

    let mut h = h.restart();
    assert!(h.controller.get_backend(&svc).is_none());
    assert_eq!(h.count(&svc, ReplicaState::ShouldStop), 2);

    h.controller.update().unwrap();
    assert!(h.controller.is_idle());
    assert!(!h.controller.is_goal_pending(&goal));
    assert!(h.runtime.live_workers().is_empty());
}

#[test]
fn test_restart_from_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = LocalRuntime::manual();
    let svc = tag("svc");

    let build = |runtime: &LocalRuntime| {
        BackendController::new(
            options(),
            Arc::new(runtime.clone()),
            Arc::new(Unbounded),
            Arc::new(FileKvStore::new(dir.path()).unwrap()),
            Arc::new(LongPollHost::new()),
        )
        .unwrap()
    };

    let mut controller = build(&runtime);
    controller.create_backend(&svc, config(2), replica_config()).unwrap();
    controller.update().unwrap();
    let snapshot = controller.snapshot();
    drop(controller);

    let restored = build(&runtime);
    assert_eq!(restored.snapshot(), snapshot);
    assert_eq!(runtime.creation_count(), 2);
}

#[test]
fn test_corrupt_checkpoint_fails_construction() {
    let h = Harness::new();
    h.store.put(DEFAULT_CHECKPOINT_KEY, b"{not json").unwrap();

    let result = BackendController::new(
        options(),
        Arc::new(h.runtime.clone()),
        Arc::new(Unbounded),
        Arc::new(h.store.clone()),
        Arc::new(LongPollHost::new()),
    );
    assert!(matches!(result, Err(Error::Checkpoint(_))));
}
