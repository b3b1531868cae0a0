mod common;

use std::sync::Arc;
use std::time::Duration;

use common::Harness;
use fleet_dispatcher::{
    AssignmentRunner, ChannelLauncher, LaunchOutcome, TaskPlacement, WorkerOrchestrator,
};
use fleet_testing_utils::{wait_for, FakeResponse, TaskBuilder, WorkerBuilder};
use fleet_worker::RemotePaths;
use tokio::sync::broadcast;

fn runner(h: &Harness) -> AssignmentRunner {
    AssignmentRunner::new(
        Arc::clone(&h.orchestrator),
        Arc::new(h.channel.clone()),
        h.repos.clone(),
        RemotePaths::default(),
    )
}

async fn configured(h: &Harness, address: &str) -> std::net::IpAddr {
    let address = h
        .register(WorkerBuilder::new(address).configured().build())
        .await;
    h.orchestrator.add_worker(address).await.unwrap();
    address
}

#[tokio::test]
async fn test_execute_records_pid() {
    let h = Harness::new().await;
    let address = configured(&h, "10.0.0.1").await;
    h.channel
        .respond(address, "echo $!", FakeResponse::output("4242\n"));
    h.orchestrator.assign_task(TaskBuilder::new().build()).await;

    let outcome = runner(&h).execute(h.launcher.launched()[0].clone()).await;

    assert_eq!(outcome, LaunchOutcome::Started { pid: 4242 });
    assert_eq!(h.worker(address).await.analysis_pid, Some(4242));
    assert_eq!(h.channel.uploads(address).len(), 1);
}

#[tokio::test]
async fn test_execute_skips_withdrawn_assignment() {
    let h = Harness::new().await;
    let address = configured(&h, "10.0.0.1").await;
    h.orchestrator.assign_task(TaskBuilder::new().build()).await;
    h.orchestrator.remove_worker(address, true).await.unwrap();

    let outcome = runner(&h).execute(h.launcher.launched()[0].clone()).await;

    assert_eq!(outcome, LaunchOutcome::Skipped);
    assert_eq!(h.channel.connect_count(address), 0);
}

#[tokio::test]
async fn test_unreachable_worker_hands_task_to_another() {
    let h = Harness::new().await;
    let first = configured(&h, "10.0.0.1").await;
    let second = configured(&h, "10.0.0.2").await;
    h.channel.set_reachable(first, false);
    let task = TaskBuilder::new().build();
    h.orchestrator.assign_task(task.clone()).await;

    let outcome = runner(&h).execute(h.launcher.launched()[0].clone()).await;

    assert_eq!(outcome, LaunchOutcome::Resubmitted(TaskPlacement::Assigned(second)));
    assert!(!h.orchestrator.is_tracked(first).await);
    assert!(!h.worker(first).await.reachable);
    assert_eq!(h.worker(first).await.analysis_id, None);
    assert_eq!(h.orchestrator.task_of(second).await, Some(task));
}

#[tokio::test]
async fn test_unreachable_last_worker_queues_task() {
    let h = Harness::new().await;
    let address = configured(&h, "10.0.0.1").await;
    h.channel.set_reachable(address, false);
    h.orchestrator.assign_task(TaskBuilder::new().build()).await;

    let outcome = runner(&h).execute(h.launcher.launched()[0].clone()).await;

    assert_eq!(outcome, LaunchOutcome::Resubmitted(TaskPlacement::Queued(1)));
    assert_eq!(h.orchestrator.snapshot().await.tasks.len(), 1);
}

#[tokio::test]
async fn test_failed_start_releases_worker() {
    let h = Harness::new().await;
    let address = configured(&h, "10.0.0.1").await;
    h.channel
        .respond(address, "echo $!", FakeResponse::output("not a pid"));
    h.orchestrator.assign_task(TaskBuilder::new().build()).await;

    let outcome = runner(&h).execute(h.launcher.launched()[0].clone()).await;

    assert_eq!(outcome, LaunchOutcome::Failed);
    assert!(h.orchestrator.is_free(address).await);
    assert_eq!(h.worker(address).await.analysis_id, None);
    assert!(h.worker(address).await.reachable);
}

#[tokio::test]
async fn test_run_loop_starts_assignments() {
    let h = Harness::new().await;
    let (launcher, receiver) = ChannelLauncher::new();
    let orchestrator = Arc::new(WorkerOrchestrator::from_repositories(
        &h.repos,
        Arc::new(launcher),
    ));
    let address = h
        .register(WorkerBuilder::new("10.0.0.1").configured().build())
        .await;
    h.channel
        .respond(address, "echo $!", FakeResponse::output("77"));

    let runner = Arc::new(AssignmentRunner::new(
        Arc::clone(&orchestrator),
        Arc::new(h.channel.clone()),
        h.repos.clone(),
        RemotePaths::default(),
    ));
    let (shutdown, _) = broadcast::channel(1);
    let loop_handle = tokio::spawn(runner.run(receiver, shutdown.subscribe()));

    orchestrator.add_worker(address).await.unwrap();
    orchestrator.assign_task(TaskBuilder::new().build()).await;

    let repos = h.repos.clone();
    let started = wait_for(
        || {
            let repos = repos.clone();
            async move {
                repos
                    .workers
                    .get(address)
                    .await
                    .ok()
                    .flatten()
                    .and_then(|w| w.analysis_pid)
                    == Some(77)
            }
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(started);

    shutdown.send(()).unwrap();
    loop_handle.await.unwrap();
}
