#![allow(dead_code)]

use std::net::IpAddr;
use std::sync::Arc;

use fleet_core::config::{RedisConfig, UpdateConfig};
use fleet_core::models::Worker;
use fleet_core::traits::{DistributedLock, Repositories};
use fleet_dispatcher::{DependencyCoordinator, UpdateQueue, WorkerLifecycle, WorkerOrchestrator};
use fleet_infrastructure::{InMemoryStore, MemoryLock};
use fleet_testing_utils::{
    ConfigurationBuilder, CountingStager, FakeRemoteChannel, FakeResponse, RecordingLauncher,
};
use fleet_worker::RemotePaths;

pub fn fast_locks() -> RedisConfig {
    RedisConfig {
        enabled: false,
        lock_retry_interval_ms: 10,
        lock_ttl_seconds: 30,
        ..RedisConfig::default()
    }
}

/// Wires every dispatcher service over the in-memory store and fake channel
pub struct Harness {
    pub store: InMemoryStore,
    pub repos: Repositories,
    pub launcher: RecordingLauncher,
    pub channel: FakeRemoteChannel,
    pub stager: CountingStager,
    pub lock: Arc<dyn DistributedLock>,
    pub orchestrator: Arc<WorkerOrchestrator>,
    pub coordinator: Arc<DependencyCoordinator>,
    pub updates: Arc<UpdateQueue>,
    pub lifecycle: Arc<WorkerLifecycle>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_queue_size(10).await
    }

    pub async fn with_queue_size(queue_size: usize) -> Self {
        let store = InMemoryStore::new();
        let repos = store.repositories();
        repos
            .configurations
            .upsert(&ConfigurationBuilder::new(1).build())
            .await
            .unwrap();

        let launcher = RecordingLauncher::new();
        let channel = FakeRemoteChannel::new();
        let stager = CountingStager::new();
        let lock: Arc<dyn DistributedLock> = Arc::new(MemoryLock::new());

        let orchestrator = Arc::new(WorkerOrchestrator::from_repositories(
            &repos,
            Arc::new(launcher.clone()),
        ));
        let coordinator = Arc::new(DependencyCoordinator::new(
            Arc::clone(&repos.dependencies),
            Arc::clone(&lock),
            Arc::new(stager.clone()),
            &fast_locks(),
        ));
        let config = UpdateConfig {
            queue_size,
            staging_dir: "/tmp/fleet-staging".to_string(),
            ..UpdateConfig::default()
        };
        let updates = Arc::new(UpdateQueue::new(
            repos.clone(),
            Arc::clone(&orchestrator),
            Arc::clone(&coordinator),
            Arc::new(channel.clone()),
            RemotePaths::default(),
            &config,
        ));
        let lifecycle = Arc::new(WorkerLifecycle::new(
            repos.clone(),
            Arc::clone(&orchestrator),
            Arc::clone(&updates),
            Arc::new(channel.clone()),
            RemotePaths::default(),
        ));

        Self {
            store,
            repos,
            launcher,
            channel,
            stager,
            lock,
            orchestrator,
            coordinator,
            updates,
            lifecycle,
        }
    }

    pub async fn register(&self, worker: Worker) -> IpAddr {
        let address = worker.address;
        self.repos.workers.upsert(&worker).await.unwrap();
        address
    }

    pub async fn worker(&self, address: IpAddr) -> Worker {
        self.repos.workers.get_required(address).await.unwrap()
    }

    /// Analysis log carries no completion marker and the process is alive
    pub fn analysis_running(&self, address: IpAddr) {
        self.channel.respond(address, "grep -qF", FakeResponse::Exit(1));
        self.channel.respond(address, "kill -0", FakeResponse::output(""));
    }

    /// The recorded process has exited
    pub fn analysis_exited(&self, address: IpAddr) {
        self.channel.respond(address, "grep -qF", FakeResponse::Exit(1));
        self.channel.respond(address, "kill -0", FakeResponse::Exit(1));
    }
}
