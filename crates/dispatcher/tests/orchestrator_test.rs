use std::sync::Arc;

use fleet_core::models::OrchestratorState;
use fleet_core::traits::OrchestratorStateRepository;
use fleet_core::FleetError;
use fleet_dispatcher::{TaskPlacement, WorkerAssignment, WorkerOrchestrator};
use fleet_infrastructure::InMemoryStore;
use fleet_testing_utils::{ip, RecordingLauncher, TaskBuilder, WorkerBuilder};

fn orchestrator() -> (WorkerOrchestrator, RecordingLauncher, InMemoryStore) {
    let store = InMemoryStore::new();
    let launcher = RecordingLauncher::new();
    let orchestrator =
        WorkerOrchestrator::from_repositories(&store.repositories(), Arc::new(launcher.clone()));
    (orchestrator, launcher, store)
}

fn assert_partitions_disjoint(state: &OrchestratorState) {
    for address in &state.free_workers {
        assert!(
            !state.busy_workers.contains_key(address),
            "{address} is both free and busy"
        );
    }
}

#[tokio::test]
async fn test_add_worker_rejects_duplicates() {
    let (orchestrator, _, _) = orchestrator();

    orchestrator.add_worker(ip("10.0.0.1")).await.unwrap();
    let err = orchestrator.add_worker(ip("10.0.0.1")).await.unwrap_err();
    assert!(matches!(err, FleetError::AlreadyExists { .. }));
    assert!(orchestrator.is_free(ip("10.0.0.1")).await);
}

#[tokio::test]
async fn test_assign_prefers_lowest_free_address() {
    let (orchestrator, launcher, _) = orchestrator();
    orchestrator.add_worker(ip("10.0.0.9")).await.unwrap();
    orchestrator.add_worker(ip("10.0.0.3")).await.unwrap();

    let task = TaskBuilder::new().build();
    let placement = orchestrator.assign_task(task.clone()).await;

    assert_eq!(placement, TaskPlacement::Assigned(ip("10.0.0.3")));
    assert_eq!(orchestrator.task_of(ip("10.0.0.3")).await, Some(task.clone()));
    let launched = launcher.launched();
    assert_eq!(launched.len(), 1);
    assert_eq!(launched[0].worker, ip("10.0.0.3"));
    assert_eq!(launched[0].task, task);
}

#[tokio::test]
async fn test_partitions_stay_disjoint() {
    let (orchestrator, _, _) = orchestrator();
    let addresses = [ip("10.0.0.1"), ip("10.0.0.2"), ip("10.0.0.3")];

    for address in addresses {
        orchestrator.add_worker(address).await.unwrap();
        assert_partitions_disjoint(&orchestrator.snapshot().await);
    }
    for _ in 0..5 {
        orchestrator.assign_task(TaskBuilder::new().build()).await;
        assert_partitions_disjoint(&orchestrator.snapshot().await);
    }
    for address in addresses {
        orchestrator.release_worker(address).await.unwrap();
        assert_partitions_disjoint(&orchestrator.snapshot().await);
    }
    for address in addresses {
        let _ = orchestrator.release_worker(address).await;
        assert_partitions_disjoint(&orchestrator.snapshot().await);
    }

    let state = orchestrator.snapshot().await;
    assert_eq!(state.free_workers.len(), 3);
    assert!(state.tasks.is_empty());
}

#[tokio::test]
async fn test_release_reassigns_while_queue_is_non_empty() {
    let (orchestrator, _, _) = orchestrator();
    orchestrator.add_worker(ip("10.0.0.1")).await.unwrap();

    orchestrator.assign_task(TaskBuilder::new().build()).await;
    orchestrator.assign_task(TaskBuilder::new().build()).await;
    assert_eq!(orchestrator.snapshot().await.tasks.len(), 1);

    orchestrator.release_worker(ip("10.0.0.1")).await.unwrap();
    let state = orchestrator.snapshot().await;
    assert!(state.tasks.is_empty());
    assert!(state.busy_workers.contains_key(&ip("10.0.0.1")));

    orchestrator.release_worker(ip("10.0.0.1")).await.unwrap();
    let state = orchestrator.snapshot().await;
    assert!(state.tasks.is_empty());
    assert!(state.free_workers.contains(&ip("10.0.0.1")));
}

#[tokio::test]
async fn test_release_of_free_worker_fails() {
    let (orchestrator, _, _) = orchestrator();
    orchestrator.add_worker(ip("10.0.0.1")).await.unwrap();

    let err = orchestrator.release_worker(ip("10.0.0.1")).await.unwrap_err();
    assert!(matches!(err, FleetError::WorkerNotBusy { .. }));
}

#[tokio::test]
async fn test_remove_busy_worker_requires_force() {
    let (orchestrator, _, _) = orchestrator();
    orchestrator.add_worker(ip("10.0.0.1")).await.unwrap();
    let task = TaskBuilder::new().build();
    orchestrator.assign_task(task.clone()).await;

    let before = orchestrator.snapshot().await;
    let err = orchestrator
        .remove_worker(ip("10.0.0.1"), false)
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::WorkerBusy { .. }));
    assert_eq!(orchestrator.snapshot().await, before);

    let abandoned = orchestrator.remove_worker(ip("10.0.0.1"), true).await.unwrap();
    assert_eq!(abandoned, Some(task));
    assert!(!orchestrator.is_tracked(ip("10.0.0.1")).await);

    let err = orchestrator
        .remove_worker(ip("10.0.0.1"), true)
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::NotFound { .. }));
}

#[tokio::test]
async fn test_queued_tasks_run_in_submission_order() {
    let (orchestrator, launcher, _) = orchestrator();
    let tasks: Vec<_> = (0..3).map(|_| TaskBuilder::new().build()).collect();

    for (i, task) in tasks.iter().enumerate() {
        let placement = orchestrator.assign_task(task.clone()).await;
        assert_eq!(placement, TaskPlacement::Queued(i + 1));
    }

    orchestrator.add_worker(ip("10.0.0.1")).await.unwrap();
    orchestrator.release_worker(ip("10.0.0.1")).await.unwrap();
    orchestrator.release_worker(ip("10.0.0.1")).await.unwrap();

    let order: Vec<_> = launcher
        .launched()
        .into_iter()
        .map(|a| a.task.analysis_id)
        .collect();
    let expected: Vec<_> = tasks.iter().map(|t| t.analysis_id).collect();
    assert_eq!(order, expected);
}

#[tokio::test]
async fn test_get_specific_workers() {
    let (orchestrator, _, _) = orchestrator();
    orchestrator.add_worker(ip("10.0.0.1")).await.unwrap();
    orchestrator.add_worker(ip("10.0.0.2")).await.unwrap();
    let task = TaskBuilder::new().build();
    orchestrator.assign_task(task.clone()).await;

    let err = orchestrator
        .get_specific_workers(&[ip("10.0.0.1"), ip("10.0.0.7")])
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::NotFound { address } if address == ip("10.0.0.7")));

    let workers = orchestrator
        .get_specific_workers(&[ip("10.0.0.1"), ip("10.0.0.2")])
        .await
        .unwrap();
    assert_eq!(workers[&ip("10.0.0.2")], WorkerAssignment::Free);
    assert_eq!(workers[&ip("10.0.0.2")].to_string(), "free");
    assert_eq!(
        workers[&ip("10.0.0.1")].to_string(),
        task.analysis_id.to_string()
    );
}

#[tokio::test]
async fn test_cancel_only_affects_queued_tasks() {
    let (orchestrator, _, _) = orchestrator();
    orchestrator.add_worker(ip("10.0.0.1")).await.unwrap();

    let running = TaskBuilder::new().build();
    let queued = TaskBuilder::new().build();
    orchestrator.assign_task(running.clone()).await;
    orchestrator.assign_task(queued.clone()).await;

    assert!(!orchestrator.cancel_task(running.analysis_id).await);
    assert!(orchestrator.cancel_task(queued.analysis_id).await);
    assert!(!orchestrator.cancel_task(queued.analysis_id).await);

    orchestrator.release_worker(ip("10.0.0.1")).await.unwrap();
    assert!(orchestrator.is_free(ip("10.0.0.1")).await);
}

#[tokio::test]
async fn test_assignment_records_analysis_on_worker() {
    let (orchestrator, _, store) = orchestrator();
    let repos = store.repositories();
    repos
        .workers
        .upsert(
            &WorkerBuilder::new("10.0.0.1")
                .configured()
                .with_analysis(uuid::Uuid::new_v4(), Some(99))
                .build(),
        )
        .await
        .unwrap();
    orchestrator.add_worker(ip("10.0.0.1")).await.unwrap();

    let task = TaskBuilder::new().build();
    orchestrator.assign_task(task.clone()).await;

    let worker = repos.workers.get_required(ip("10.0.0.1")).await.unwrap();
    assert_eq!(worker.analysis_id, Some(task.analysis_id));
    assert_eq!(worker.analysis_pid, None);
}

#[tokio::test]
async fn test_reset_frees_busy_workers_and_drops_queue() {
    let (orchestrator, _, _) = orchestrator();
    orchestrator.add_worker(ip("10.0.0.1")).await.unwrap();
    orchestrator.add_worker(ip("10.0.0.2")).await.unwrap();
    for _ in 0..3 {
        orchestrator.assign_task(TaskBuilder::new().build()).await;
    }

    let busy = orchestrator.reset().await;
    assert_eq!(busy, vec![ip("10.0.0.1"), ip("10.0.0.2")]);

    let state = orchestrator.snapshot().await;
    assert!(state.tasks.is_empty());
    assert!(state.busy_workers.is_empty());
    assert_eq!(state.free_workers.len(), 2);
}

#[tokio::test]
async fn test_state_is_mirrored_and_recovered() {
    let (orchestrator, launcher, store) = orchestrator();
    let repos = store.repositories();

    let started = TaskBuilder::new().build();
    let unstarted = TaskBuilder::new().build();
    let waiting = TaskBuilder::new().build();
    for address in ["10.0.0.1", "10.0.0.2"] {
        repos
            .workers
            .upsert(&WorkerBuilder::new(address).configured().build())
            .await
            .unwrap();
        orchestrator.add_worker(ip(address)).await.unwrap();
    }
    orchestrator.assign_task(started.clone()).await;
    orchestrator.assign_task(unstarted.clone()).await;
    orchestrator.assign_task(waiting.clone()).await;
    repos
        .workers
        .set_analysis_pid(ip("10.0.0.1"), Some(4242))
        .await
        .unwrap();

    let mirrored = repos.orchestrator.load().await.unwrap().unwrap();
    assert_eq!(mirrored.busy_workers.len(), 2);
    assert_eq!(mirrored.tasks.len(), 1);
    let launched_before = launcher.count();

    let restarted = WorkerOrchestrator::from_repositories(&repos, Arc::new(launcher.clone()));
    let recovered = restarted.recover().await.unwrap();

    assert_eq!(recovered.busy_workers[&ip("10.0.0.1")], started);
    assert_eq!(recovered.busy_workers[&ip("10.0.0.2")], unstarted);
    assert_eq!(recovered.tasks.front(), Some(&waiting));
    assert_eq!(launcher.count(), launched_before + 1);
    assert_eq!(
        launcher.launched().last().unwrap().task.analysis_id,
        unstarted.analysis_id
    );
}

#[tokio::test]
async fn test_recover_drops_deleted_workers() {
    let store = InMemoryStore::new();
    let repos = store.repositories();

    let mut saved = OrchestratorState::default();
    saved.free_workers.insert(ip("10.0.0.1"));
    saved.free_workers.insert(ip("10.0.0.2"));
    repos.orchestrator.save(&saved).await.unwrap();
    repos
        .workers
        .upsert(&WorkerBuilder::new("10.0.0.2").configured().build())
        .await
        .unwrap();

    let orchestrator =
        WorkerOrchestrator::from_repositories(&repos, Arc::new(RecordingLauncher::new()));
    let recovered = orchestrator.recover().await.unwrap();

    assert!(!recovered.free_workers.contains(&ip("10.0.0.1")));
    assert!(recovered.free_workers.contains(&ip("10.0.0.2")));
}
