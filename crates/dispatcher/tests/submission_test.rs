mod common;

use std::sync::Arc;

use common::Harness;
use fleet_core::FleetError;
use fleet_dispatcher::{AnalysisSubmitter, Submission};
use fleet_testing_utils::{TaskBuilder, WorkerBuilder};
use fleet_worker::{LocalAnalysisRunner, LocalBoundedExecutor};

fn submitter(h: &Harness, executor: LocalBoundedExecutor, work_dir: &std::path::Path) -> AnalysisSubmitter {
    AnalysisSubmitter::new(
        Arc::clone(&h.orchestrator),
        Arc::clone(&h.repos.workers),
        Arc::new(executor),
        LocalAnalysisRunner::new(work_dir),
    )
}

#[tokio::test]
async fn test_runs_locally_without_workers() {
    let h = Harness::new().await;
    let dir = tempfile::tempdir().unwrap();
    let submitter = submitter(&h, LocalBoundedExecutor::new(1, 0), dir.path());

    let task = TaskBuilder::new().with_command("echo analysed").build();
    let handle = match submitter.submit(task).await.unwrap() {
        Submission::Local(handle) => handle,
        _ => panic!("expected local execution"),
    };

    let log = handle.join().await.unwrap();
    assert_eq!(std::fs::read_to_string(log).unwrap().trim(), "analysed");
    assert!(h.launcher.launched().is_empty());
}

#[tokio::test]
async fn test_local_execution_rejects_when_full() {
    let h = Harness::new().await;
    let dir = tempfile::tempdir().unwrap();
    let submitter = submitter(&h, LocalBoundedExecutor::new(1, 0), dir.path());

    let first = submitter
        .submit(TaskBuilder::new().with_command("sleep 1").build())
        .await
        .unwrap();
    let err = submitter
        .submit(TaskBuilder::new().build())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, FleetError::AdmissionRejected));

    if let Submission::Local(handle) = first {
        handle.abort();
    }
}

#[tokio::test]
async fn test_registered_workers_take_the_task() {
    let h = Harness::new().await;
    let dir = tempfile::tempdir().unwrap();
    let address = h
        .register(WorkerBuilder::new("10.0.0.1").configured().build())
        .await;
    let submitter = submitter(&h, LocalBoundedExecutor::new(1, 0), dir.path());

    // registered but not yet in the pool: queued rather than run locally
    let queued = TaskBuilder::new().build();
    assert!(matches!(
        submitter.submit(queued.clone()).await.unwrap(),
        Submission::Queued(1)
    ));

    assert!(submitter.cancel(queued.analysis_id).await);
    h.orchestrator.add_worker(address).await.unwrap();
    assert!(matches!(
        submitter.submit(TaskBuilder::new().build()).await.unwrap(),
        Submission::Assigned(a) if a == address
    ));
}
