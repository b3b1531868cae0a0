mod common;

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::Harness;
use fleet_core::config::ScanConfig;
use fleet_core::models::{ConfigStatus, DependencyKind, ScanStatus};
use fleet_core::FleetError;
use fleet_dispatcher::{HostProbe, RefreshPlan, Registration, WorkerRegistry};
use fleet_testing_utils::{
    ip, wait_for, ConfigurationBuilder, FakeResponse, TaskBuilder, WorkerBuilder,
};

struct FixedProbe {
    open: HashSet<IpAddr>,
}

impl FixedProbe {
    fn new(addresses: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            open: addresses.iter().map(|a| ip(a)).collect(),
        })
    }
}

#[async_trait]
impl HostProbe for FixedProbe {
    async fn is_open(&self, address: IpAddr) -> bool {
        self.open.contains(&address)
    }
}

fn registry(h: &Harness, probe: Arc<FixedProbe>) -> WorkerRegistry {
    let config = ScanConfig {
        concurrency: 4,
        max_hosts: 256,
        ..ScanConfig::default()
    };
    WorkerRegistry::new(
        h.repos.clone(),
        Arc::clone(&h.orchestrator),
        Arc::clone(&h.updates),
        Arc::clone(&h.coordinator),
        Arc::new(h.channel.clone()),
        probe,
        &config,
    )
}

#[tokio::test]
async fn test_scan_registers_answering_hosts() {
    let h = Harness::new().await;
    h.repos
        .configurations
        .upsert(&ConfigurationBuilder::new(2).with_range("10.0.1.0/29").build())
        .await
        .unwrap();
    let registry = registry(&h, FixedProbe::new(&["10.0.1.5", "10.0.1.2"]));

    let found = registry.scan_configuration(2).await.unwrap();

    assert_eq!(found, vec![ip("10.0.1.2"), ip("10.0.1.5")]);
    let workers = h.repos.workers.list_by_configuration(2).await.unwrap();
    assert_eq!(workers.len(), 2);
    assert!(workers
        .iter()
        .all(|w| w.status == ConfigStatus::Unconfigured && w.reachable));
    let configuration = h.repos.configurations.get(2).await.unwrap().unwrap();
    assert_eq!(configuration.scan_status, ScanStatus::Finished);
}

#[tokio::test]
async fn test_scan_marks_silent_workers_unreachable() {
    let h = Harness::new().await;
    let known = h
        .register(WorkerBuilder::new("10.0.0.7").configured().build())
        .await;
    let registry = registry(&h, FixedProbe::new(&["10.0.0.3"]));

    registry.scan_configuration(1).await.unwrap();

    assert!(!h.worker(known).await.reachable);
    assert!(h.worker(ip("10.0.0.3")).await.reachable);
}

#[tokio::test]
async fn test_oversized_range_fails_scan() {
    let h = Harness::new().await;
    h.repos
        .configurations
        .upsert(&ConfigurationBuilder::new(3).with_range("10.8.0.0/16").build())
        .await
        .unwrap();
    let registry = registry(&h, FixedProbe::new(&[]));

    assert!(registry.scan_configuration(3).await.is_err());
    let configuration = h.repos.configurations.get(3).await.unwrap().unwrap();
    assert_eq!(configuration.scan_status, ScanStatus::Error);

    let err = registry.scan_configuration(42).await.unwrap_err();
    assert!(matches!(err, FleetError::ConfigurationNotFound { id: 42 }));
}

#[tokio::test]
async fn test_register_discovered_attaches_and_skips_errors() {
    let h = Harness::new().await;
    let registry = registry(&h, FixedProbe::new(&[]));
    h.register(WorkerBuilder::new("10.0.0.1").configured().unreachable().build())
        .await;
    h.register(
        WorkerBuilder::new("10.0.0.2")
            .with_status(ConfigStatus::Error)
            .build(),
    )
    .await;

    assert_eq!(
        registry.register_discovered(2, ip("10.0.0.1")).await.unwrap(),
        Registration::Updated
    );
    let worker = h.worker(ip("10.0.0.1")).await;
    assert!(worker.reachable);
    assert_eq!(worker.configuration_ids.len(), 2);

    assert_eq!(
        registry.register_discovered(2, ip("10.0.0.2")).await.unwrap(),
        Registration::SkippedError
    );
    assert_eq!(h.worker(ip("10.0.0.2")).await.configuration_ids.len(), 1);

    assert_eq!(
        registry.register_discovered(2, ip("10.0.0.3")).await.unwrap(),
        Registration::Created
    );
}

#[tokio::test]
async fn test_delete_configuration_fails_for_busy_worker() {
    let h = Harness::new().await;
    let address = h
        .register(WorkerBuilder::new("10.0.0.1").configured().build())
        .await;
    h.orchestrator.add_worker(address).await.unwrap();
    h.orchestrator.assign_task(TaskBuilder::new().build()).await;
    let registry = registry(&h, FixedProbe::new(&[]));

    let err = registry.delete_configuration(1).await.unwrap_err();

    assert!(matches!(err, FleetError::WorkerBusy { .. }));
    assert!(h.repos.configurations.get(1).await.unwrap().is_some());
    assert!(h.repos.workers.get(address).await.unwrap().is_some());
}

#[tokio::test]
async fn test_delete_configuration_removes_exclusive_workers() {
    let h = Harness::new().await;
    h.repos
        .configurations
        .upsert(&ConfigurationBuilder::new(2).build())
        .await
        .unwrap();
    let exclusive = h
        .register(WorkerBuilder::new("10.0.0.1").configured().build())
        .await;
    let shared = h
        .register(
            WorkerBuilder::new("10.0.0.2")
                .configured()
                .with_configuration(2)
                .build(),
        )
        .await;
    h.orchestrator.add_worker(exclusive).await.unwrap();
    h.updates
        .enqueue(exclusive, DependencyKind::Repo, Some("abc"))
        .await
        .unwrap();
    h.coordinator
        .use_dependency(DependencyKind::Repo, "abc", exclusive)
        .await
        .unwrap();
    let registry = registry(&h, FixedProbe::new(&[]));

    registry.delete_configuration(1).await.unwrap();

    assert!(h.repos.workers.get(exclusive).await.unwrap().is_none());
    assert!(!h.orchestrator.is_tracked(exclusive).await);
    assert!(!h.updates.has_pending(exclusive).await.unwrap());
    let state = h
        .repos
        .dependencies
        .get_state(DependencyKind::Repo)
        .await
        .unwrap();
    assert!(!state.used_by.contains(&exclusive));

    let remaining = h.worker(shared).await;
    assert_eq!(remaining.configuration_ids.into_iter().collect::<Vec<_>>(), vec![2]);
    assert!(h.repos.configurations.get(1).await.unwrap().is_none());
}

#[tokio::test]
async fn test_retry_only_from_error() {
    let h = Harness::new().await;
    let registry = registry(&h, FixedProbe::new(&[]));
    let configured = h
        .register(WorkerBuilder::new("10.0.0.1").configured().build())
        .await;
    let failed = h
        .register(
            WorkerBuilder::new("10.0.0.2")
                .with_status(ConfigStatus::Error)
                .build(),
        )
        .await;
    h.updates
        .enqueue(failed, DependencyKind::Repo, Some("stale"))
        .await
        .unwrap();

    let err = registry.retry(configured).await.unwrap_err();
    assert!(matches!(
        err,
        FleetError::InvalidTransition {
            from: ConfigStatus::Configured,
            to: ConfigStatus::Configuring
        }
    ));

    match registry.retry(failed).await.unwrap() {
        RefreshPlan::Started(handle) => handle.await.unwrap(),
        other => panic!("expected the retry to start, got {other:?}"),
    }
    assert_eq!(h.worker(failed).await.status, ConfigStatus::Configured);
    assert!(h.orchestrator.is_free(failed).await);
    assert!(h
        .stager
        .calls()
        .iter()
        .all(|(_, version)| version != "stale"));
}

#[tokio::test]
async fn test_scan_skips_hosts_rejecting_credentials() {
    let h = Harness::new().await;
    h.repos
        .configurations
        .upsert(
            &ConfigurationBuilder::new(2)
                .with_range("10.0.1.0/29")
                .with_user("emba")
                .build(),
        )
        .await
        .unwrap();
    h.channel.accept_users(ip("10.0.1.2"), &["root"]);
    h.channel
        .respond(ip("10.0.1.3"), "sudo -n true", FakeResponse::Exit(1));
    let registry = registry(&h, FixedProbe::new(&["10.0.1.2", "10.0.1.3", "10.0.1.5"]));

    let found = registry.scan_configuration(2).await.unwrap();

    assert_eq!(found, vec![ip("10.0.1.5")]);
    assert!(h.repos.workers.get(ip("10.0.1.2")).await.unwrap().is_none());
    assert!(h.repos.workers.get(ip("10.0.1.3")).await.unwrap().is_none());
    assert!(h.channel.ran(ip("10.0.1.5"), "sudo -n true"));
}

#[tokio::test]
async fn test_scan_records_host_details() {
    let h = Harness::new().await;
    let address = ip("10.0.0.4");
    h.channel.respond(address, "nproc", FakeResponse::output("8"));
    h.channel.respond(
        address,
        "free -h",
        FakeResponse::output("Mem:            31Gi        12Gi        10Gi"),
    );
    h.channel.respond(
        address,
        "df -h",
        FakeResponse::output("/dev/sda1       457G  120G  314G  28% /"),
    );
    h.channel.respond(
        address,
        "docker-compose.yml",
        FakeResponse::output("    image: embeddedanalyzer/emba:1.5.2"),
    );
    let registry = registry(&h, FixedProbe::new(&["10.0.0.4"]));

    registry.scan_configuration(1).await.unwrap();

    let worker = h.worker(address).await;
    assert_eq!(worker.system_info["cpu_info"], "8 cores");
    assert_eq!(worker.system_info["ram_info"], "31GB");
    let record = h.repos.dependencies.get_record(address).await.unwrap();
    assert_eq!(record.image_tag.as_deref(), Some("1.5.2"));
    // root logins need no sudo check
    assert!(!h.channel.ran(address, "sudo -n true"));
}

#[tokio::test]
async fn test_rescan_configures_new_workers() {
    let h = Harness::new().await;
    let known = h
        .register(WorkerBuilder::new("10.0.0.7").configured().build())
        .await;
    h.orchestrator.add_worker(known).await.unwrap();
    let registry = registry(&h, FixedProbe::new(&["10.0.0.4", "10.0.0.7"]));

    let found = registry.rescan_all().await.unwrap();
    assert_eq!(found, vec![ip("10.0.0.4"), known]);

    let address = ip("10.0.0.4");
    assert!(
        wait_for(
            || async { h.orchestrator.is_free(address).await },
            Duration::from_secs(5)
        )
        .await
    );
    assert_eq!(h.worker(address).await.status, ConfigStatus::Configured);
    assert!(h.orchestrator.is_free(known).await);
}
