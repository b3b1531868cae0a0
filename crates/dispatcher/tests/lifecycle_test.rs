mod common;

use common::Harness;
use fleet_core::models::{ConfigStatus, DependencyKind};
use fleet_core::FleetError;
use fleet_testing_utils::{TaskBuilder, WorkerBuilder};

#[tokio::test]
async fn test_soft_reset_resubmits_abandoned_task() {
    let h = Harness::new().await;
    let address = h
        .register(WorkerBuilder::new("10.0.0.1").configured().build())
        .await;
    h.orchestrator.add_worker(address).await.unwrap();
    let task = TaskBuilder::new().build();
    h.orchestrator.assign_task(task.clone()).await;

    h.lifecycle.soft_reset(address).await.unwrap();

    assert!(h.channel.ran(address, "docker ps -aq"));
    assert_eq!(h.orchestrator.task_of(address).await, Some(task.clone()));
    assert_eq!(h.launcher.count(), 2);
    assert_eq!(h.worker(address).await.analysis_id, Some(task.analysis_id));
}

#[tokio::test]
async fn test_soft_reset_of_unreachable_worker() {
    let h = Harness::new().await;
    let address = h
        .register(WorkerBuilder::new("10.0.0.1").configured().build())
        .await;
    h.orchestrator.add_worker(address).await.unwrap();
    h.channel.set_reachable(address, false);

    let err = h.lifecycle.soft_reset(address).await.unwrap_err();

    assert!(err.is_channel_failure());
    assert!(!h.worker(address).await.reachable);
    assert!(!h.orchestrator.is_tracked(address).await);
}

#[tokio::test]
async fn test_hard_reset_refuses_busy_worker() {
    let h = Harness::new().await;
    let address = h
        .register(WorkerBuilder::new("10.0.0.1").configured().build())
        .await;
    h.orchestrator.add_worker(address).await.unwrap();
    h.orchestrator.assign_task(TaskBuilder::new().build()).await;

    let err = h.lifecycle.hard_reset(address).await.unwrap_err();
    assert!(matches!(err, FleetError::WorkerBusy { .. }));
    assert!(h.orchestrator.is_busy(address).await);
    assert!(!h.channel.ran(address, "full_uninstaller.sh"));
}

#[tokio::test]
async fn test_hard_reset_unconfigures_worker() {
    let h = Harness::new().await;
    let address = h
        .register(WorkerBuilder::new("10.0.0.1").configured().build())
        .await;
    h.orchestrator.add_worker(address).await.unwrap();
    h.updates
        .enqueue(address, DependencyKind::Repo, Some("abc"))
        .await
        .unwrap();

    h.lifecycle.hard_reset(address).await.unwrap();

    assert!(h.channel.ran(address, "bash /root/emba/full_uninstaller.sh"));
    assert_eq!(h.worker(address).await.status, ConfigStatus::Unconfigured);
    assert!(!h.orchestrator.is_tracked(address).await);
    assert!(!h.updates.has_pending(address).await.unwrap());
}

#[tokio::test]
async fn test_failed_hard_reset_returns_worker_to_service() {
    let h = Harness::new().await;
    let address = h
        .register(WorkerBuilder::new("10.0.0.1").configured().build())
        .await;
    h.orchestrator.add_worker(address).await.unwrap();
    h.channel.set_reachable(address, false);

    assert!(h.lifecycle.hard_reset(address).await.is_err());

    let worker = h.worker(address).await;
    assert_eq!(worker.status, ConfigStatus::Configured);
    assert!(!worker.reachable);
    assert!(h.orchestrator.is_free(address).await);
}

#[tokio::test]
async fn test_finish_analysis_for_untracked_worker() {
    let h = Harness::new().await;
    let task = TaskBuilder::new().build();
    let address = h
        .register(
            WorkerBuilder::new("10.0.0.1")
                .configured()
                .with_analysis(task.analysis_id, Some(7))
                .build(),
        )
        .await;

    h.lifecycle.finish_analysis(address).await.unwrap();

    assert!(h.channel.ran(address, "kill 7"));
    assert_eq!(h.worker(address).await.analysis_id, None);
    assert!(h.orchestrator.is_free(address).await);
}

#[tokio::test]
async fn test_reset_all_cleans_every_busy_worker() {
    let h = Harness::new().await;
    let mut addresses = Vec::new();
    for address in ["10.0.0.1", "10.0.0.2"] {
        let address = h
            .register(WorkerBuilder::new(address).configured().build())
            .await;
        h.orchestrator.add_worker(address).await.unwrap();
        addresses.push(address);
    }
    for _ in 0..3 {
        h.orchestrator.assign_task(TaskBuilder::new().build()).await;
    }

    let reset = h.lifecycle.reset_all().await.unwrap();

    assert_eq!(reset, addresses);
    for address in addresses {
        assert!(h.orchestrator.is_free(address).await);
        assert_eq!(h.worker(address).await.analysis_id, None);
        assert!(h.channel.ran(address, "docker ps -aq"));
    }
    assert!(h.orchestrator.snapshot().await.tasks.is_empty());
}

#[tokio::test]
async fn test_stop_analysis_keeps_custody() {
    let h = Harness::new().await;
    let address = h
        .register(WorkerBuilder::new("10.0.0.1").configured().build())
        .await;
    h.orchestrator.add_worker(address).await.unwrap();
    h.orchestrator.assign_task(TaskBuilder::new().build()).await;
    h.repos
        .workers
        .set_analysis_pid(address, Some(99))
        .await
        .unwrap();

    h.lifecycle.stop_analysis(address).await.unwrap();

    assert!(h.channel.ran(address, "kill 99"));
    assert!(h.orchestrator.is_busy(address).await);
}
