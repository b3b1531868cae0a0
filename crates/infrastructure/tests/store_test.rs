#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use fleet_core::config::DatabaseConfig;
    use fleet_core::models::{
        CachedDependencyVersion, Cidr, ConfigStatus, Configuration, DependencyKind,
        DependencyState, OrchestratorState, ScanStatus, Worker, WorkerUpdate, Availability,
        AnalysisTask,
    };
    use fleet_core::traits::Repositories;
    use fleet_core::FleetError;
    use fleet_infrastructure::{InMemoryStore, SqliteStore};
    use uuid::Uuid;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    async fn sqlite_repositories() -> Repositories {
        let config = DatabaseConfig {
            backend: "sqlite".to_string(),
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
        };
        SqliteStore::connect(&config).await.unwrap().repositories()
    }

    async fn exercise_workers(repos: &Repositories) {
        let worker = Worker::discovered(addr("10.0.0.2"), 1);
        repos.workers.upsert(&worker).await.unwrap();
        repos
            .workers
            .upsert(&Worker::discovered(addr("10.0.0.3"), 2))
            .await
            .unwrap();

        let loaded = repos.workers.get(addr("10.0.0.2")).await.unwrap().unwrap();
        assert_eq!(loaded.status, ConfigStatus::Unconfigured);
        assert_eq!(repos.workers.list().await.unwrap().len(), 2);
        assert_eq!(repos.workers.list_by_configuration(2).await.unwrap().len(), 1);

        let previous = repos
            .workers
            .transition_status(addr("10.0.0.2"), ConfigStatus::Configuring)
            .await
            .unwrap();
        assert_eq!(previous, ConfigStatus::Unconfigured);

        let err = repos
            .workers
            .transition_status(addr("10.0.0.3"), ConfigStatus::Configured)
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::InvalidTransition { .. }));

        let analysis = Uuid::new_v4();
        repos
            .workers
            .set_analysis(addr("10.0.0.2"), Some(analysis))
            .await
            .unwrap();
        repos
            .workers
            .set_analysis_pid(addr("10.0.0.2"), Some(4242))
            .await
            .unwrap();
        repos
            .workers
            .set_reachability(addr("10.0.0.2"), false, None)
            .await
            .unwrap();

        let loaded = repos.workers.get_required(addr("10.0.0.2")).await.unwrap();
        assert_eq!(loaded.analysis_id, Some(analysis));
        assert_eq!(loaded.analysis_pid, Some(4242));
        assert!(!loaded.reachable);

        repos.workers.set_analysis(addr("10.0.0.2"), None).await.unwrap();
        let loaded = repos.workers.get_required(addr("10.0.0.2")).await.unwrap();
        assert_eq!(loaded.analysis_pid, None);

        repos.workers.delete(addr("10.0.0.3")).await.unwrap();
        let err = repos.workers.delete(addr("10.0.0.3")).await.unwrap_err();
        assert!(matches!(err, FleetError::NotFound { .. }));
        assert!(repos.workers.get_required(addr("10.0.0.3")).await.is_err());
    }

    async fn exercise_configurations(repos: &Repositories) {
        let configuration = Configuration::new(
            7,
            "admin",
            "lab",
            "root",
            "secret",
            "10.0.0.0/29".parse::<Cidr>().unwrap(),
        );
        repos.configurations.upsert(&configuration).await.unwrap();
        repos
            .configurations
            .set_scan_status(7, ScanStatus::Finished)
            .await
            .unwrap();

        let loaded = repos.configurations.get(7).await.unwrap().unwrap();
        assert_eq!(loaded.scan_status, ScanStatus::Finished);
        assert_eq!(loaded.ip_range.to_string(), "10.0.0.0/29");

        let worker = Worker::discovered(addr("10.0.0.4"), 7);
        let owned = repos.configurations.for_worker(&worker).await.unwrap();
        assert_eq!(owned.len(), 1);

        repos.configurations.delete(7).await.unwrap();
        assert!(repos.configurations.list().await.unwrap().is_empty());
    }

    async fn exercise_dependencies(repos: &Repositories) {
        let state = repos
            .dependencies
            .get_state(DependencyKind::Repo)
            .await
            .unwrap();
        assert_eq!(state.availability, Availability::Unavailable);

        let mut state = DependencyState::new(DependencyKind::Repo);
        state.availability = Availability::Available;
        state.used_by.insert(addr("10.0.0.2"));
        repos.dependencies.save_state(&state).await.unwrap();

        let states = repos.dependencies.list_states().await.unwrap();
        assert_eq!(states.len(), 4);
        assert!(states.contains(&state));

        let mut cached = CachedDependencyVersion::default();
        cached.set(DependencyKind::Repo, "abc");
        repos.dependencies.save_cached(&cached).await.unwrap();
        assert_eq!(repos.dependencies.get_cached().await.unwrap(), cached);

        let mut record = repos.dependencies.get_record(addr("10.0.0.2")).await.unwrap();
        record.repo_head = Some("abc".to_string());
        repos
            .dependencies
            .save_record(addr("10.0.0.2"), &record)
            .await
            .unwrap();
        assert_eq!(
            repos
                .dependencies
                .get_record(addr("10.0.0.2"))
                .await
                .unwrap()
                .repo_head
                .as_deref(),
            Some("abc")
        );
        repos
            .dependencies
            .delete_record(addr("10.0.0.2"))
            .await
            .unwrap();
        assert!(repos
            .dependencies
            .get_record(addr("10.0.0.2"))
            .await
            .unwrap()
            .repo_head
            .is_none());
    }

    async fn exercise_updates(repos: &Repositories) {
        let worker = addr("10.0.0.2");
        let first = WorkerUpdate::new(worker, DependencyKind::Repo, "a");
        let second = WorkerUpdate::new(worker, DependencyKind::Deps, "b");
        let other = WorkerUpdate::new(addr("10.0.0.9"), DependencyKind::Repo, "c");

        repos.updates.push(&first).await.unwrap();
        repos.updates.push(&other).await.unwrap();
        repos.updates.push(&second).await.unwrap();

        assert_eq!(repos.updates.count(worker).await.unwrap(), 2);
        let listed = repos.updates.list(worker).await.unwrap();
        assert_eq!(listed, vec![first.clone(), second.clone()]);

        let oldest = repos.updates.pop_oldest(worker).await.unwrap().unwrap();
        assert_eq!(oldest.id, first.id);

        repos.updates.remove(second.id).await.unwrap();
        assert_eq!(repos.updates.count(worker).await.unwrap(), 0);
        assert_eq!(repos.updates.clear(addr("10.0.0.9")).await.unwrap(), 1);
        assert!(repos.updates.pop_oldest(worker).await.unwrap().is_none());
    }

    async fn exercise_orchestrator_state(repos: &Repositories) {
        assert!(repos.orchestrator.load().await.unwrap().is_none());

        let mut state = OrchestratorState::default();
        state.free_workers.insert(addr("10.0.0.2"));
        state.busy_workers.insert(
            addr("10.0.0.3"),
            AnalysisTask::new(Uuid::new_v4(), "emba -f fw.bin", "/tmp/fw.bin", "/root/fw.bin"),
        );
        repos.orchestrator.save(&state).await.unwrap();

        assert_eq!(repos.orchestrator.load().await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let repos = InMemoryStore::new().repositories();
        exercise_workers(&repos).await;
        exercise_configurations(&repos).await;
        exercise_dependencies(&repos).await;
        exercise_updates(&repos).await;
        exercise_orchestrator_state(&repos).await;
    }

    #[tokio::test]
    async fn test_sqlite_store() {
        let repos = sqlite_repositories().await;
        exercise_workers(&repos).await;
        exercise_configurations(&repos).await;
        exercise_dependencies(&repos).await;
        exercise_updates(&repos).await;
        exercise_orchestrator_state(&repos).await;
    }
}
