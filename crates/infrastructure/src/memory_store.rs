//! 所有仓库trait的内存实现
//!
//! 用于单进程部署（`database.backend = "memory"`）和测试。

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use fleet_core::models::{
    AvailableDependencyVersion, CachedDependencyVersion, ConfigStatus, Configuration,
    DependencyKind, DependencyState, DependencyVersionRecord, OrchestratorState, ScanStatus,
    Worker, WorkerUpdate,
};
use fleet_core::traits::{
    ConfigurationRepository, DependencyRepository, OrchestratorStateRepository, Repositories,
    UpdateRepository, WorkerRepository,
};
use fleet_core::{FleetError, FleetResult};

#[derive(Debug, Default)]
struct StoreData {
    workers: BTreeMap<IpAddr, Worker>,
    configurations: BTreeMap<i64, Configuration>,
    states: BTreeMap<DependencyKind, DependencyState>,
    cached: CachedDependencyVersion,
    available: AvailableDependencyVersion,
    records: BTreeMap<IpAddr, DependencyVersionRecord>,
    /// 保持插入顺序
    updates: Vec<WorkerUpdate>,
    orchestrator: Option<OrchestratorState>,
}

/// 共享的内存存储，克隆体共用同一份数据
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    data: Arc<RwLock<StoreData>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以各仓库trait的形式提供存储
    pub fn repositories(&self) -> Repositories {
        Repositories {
            workers: Arc::new(self.clone()),
            configurations: Arc::new(self.clone()),
            dependencies: Arc::new(self.clone()),
            updates: Arc::new(self.clone()),
            orchestrator: Arc::new(self.clone()),
        }
    }
}

#[async_trait]
impl WorkerRepository for InMemoryStore {
    async fn upsert(&self, worker: &Worker) -> FleetResult<()> {
        let mut data = self.data.write().await;
        data.workers.insert(worker.address, worker.clone());
        Ok(())
    }

    async fn get(&self, address: IpAddr) -> FleetResult<Option<Worker>> {
        let data = self.data.read().await;
        Ok(data.workers.get(&address).cloned())
    }

    async fn list(&self) -> FleetResult<Vec<Worker>> {
        let data = self.data.read().await;
        Ok(data.workers.values().cloned().collect())
    }

    async fn list_by_configuration(&self, configuration_id: i64) -> FleetResult<Vec<Worker>> {
        let data = self.data.read().await;
        Ok(data
            .workers
            .values()
            .filter(|w| w.configuration_ids.contains(&configuration_id))
            .cloned()
            .collect())
    }

    async fn delete(&self, address: IpAddr) -> FleetResult<()> {
        let mut data = self.data.write().await;
        data.workers
            .remove(&address)
            .map(|_| ())
            .ok_or(FleetError::NotFound { address })
    }

    async fn set_reachability(
        &self,
        address: IpAddr,
        reachable: bool,
        system_info: Option<BTreeMap<String, String>>,
    ) -> FleetResult<()> {
        let mut data = self.data.write().await;
        let worker = data
            .workers
            .get_mut(&address)
            .ok_or(FleetError::NotFound { address })?;

        if reachable {
            worker.mark_reached();
        } else {
            worker.reachable = false;
        }
        if let Some(info) = system_info {
            worker.system_info = info;
        }
        Ok(())
    }

    async fn set_analysis(&self, address: IpAddr, analysis_id: Option<Uuid>) -> FleetResult<()> {
        let mut data = self.data.write().await;
        let worker = data
            .workers
            .get_mut(&address)
            .ok_or(FleetError::NotFound { address })?;

        worker.clear_analysis();
        worker.analysis_id = analysis_id;
        Ok(())
    }

    async fn set_analysis_pid(&self, address: IpAddr, pid: Option<u32>) -> FleetResult<()> {
        let mut data = self.data.write().await;
        let worker = data
            .workers
            .get_mut(&address)
            .ok_or(FleetError::NotFound { address })?;
        worker.analysis_pid = pid;
        Ok(())
    }

    async fn transition_status(
        &self,
        address: IpAddr,
        next: ConfigStatus,
    ) -> FleetResult<ConfigStatus> {
        let mut data = self.data.write().await;
        let worker = data
            .workers
            .get_mut(&address)
            .ok_or(FleetError::NotFound { address })?;

        let previous = worker.status;
        worker.transition_to(next)?;
        Ok(previous)
    }
}

#[async_trait]
impl ConfigurationRepository for InMemoryStore {
    async fn upsert(&self, configuration: &Configuration) -> FleetResult<()> {
        let mut data = self.data.write().await;
        data.configurations
            .insert(configuration.id, configuration.clone());
        Ok(())
    }

    async fn get(&self, id: i64) -> FleetResult<Option<Configuration>> {
        let data = self.data.read().await;
        Ok(data.configurations.get(&id).cloned())
    }

    async fn list(&self) -> FleetResult<Vec<Configuration>> {
        let data = self.data.read().await;
        Ok(data.configurations.values().cloned().collect())
    }

    async fn delete(&self, id: i64) -> FleetResult<()> {
        let mut data = self.data.write().await;
        data.configurations
            .remove(&id)
            .map(|_| ())
            .ok_or(FleetError::ConfigurationNotFound { id })
    }

    async fn set_scan_status(&self, id: i64, status: ScanStatus) -> FleetResult<()> {
        let mut data = self.data.write().await;
        let configuration = data
            .configurations
            .get_mut(&id)
            .ok_or(FleetError::ConfigurationNotFound { id })?;
        configuration.scan_status = status;
        Ok(())
    }
}

#[async_trait]
impl DependencyRepository for InMemoryStore {
    async fn get_state(&self, kind: DependencyKind) -> FleetResult<DependencyState> {
        let data = self.data.read().await;
        Ok(data
            .states
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| DependencyState::new(kind)))
    }

    async fn save_state(&self, state: &DependencyState) -> FleetResult<()> {
        let mut data = self.data.write().await;
        data.states.insert(state.kind, state.clone());
        Ok(())
    }

    async fn list_states(&self) -> FleetResult<Vec<DependencyState>> {
        let data = self.data.read().await;
        Ok(DependencyKind::ALL
            .iter()
            .map(|kind| {
                data.states
                    .get(kind)
                    .cloned()
                    .unwrap_or_else(|| DependencyState::new(*kind))
            })
            .collect())
    }

    async fn get_cached(&self) -> FleetResult<CachedDependencyVersion> {
        Ok(self.data.read().await.cached.clone())
    }

    async fn save_cached(&self, cached: &CachedDependencyVersion) -> FleetResult<()> {
        self.data.write().await.cached = cached.clone();
        Ok(())
    }

    async fn get_available(&self) -> FleetResult<AvailableDependencyVersion> {
        Ok(self.data.read().await.available.clone())
    }

    async fn save_available(&self, available: &AvailableDependencyVersion) -> FleetResult<()> {
        self.data.write().await.available = available.clone();
        Ok(())
    }

    async fn get_record(&self, worker: IpAddr) -> FleetResult<DependencyVersionRecord> {
        let data = self.data.read().await;
        Ok(data.records.get(&worker).cloned().unwrap_or_default())
    }

    async fn save_record(
        &self,
        worker: IpAddr,
        record: &DependencyVersionRecord,
    ) -> FleetResult<()> {
        let mut data = self.data.write().await;
        data.records.insert(worker, record.clone());
        Ok(())
    }

    async fn delete_record(&self, worker: IpAddr) -> FleetResult<()> {
        let mut data = self.data.write().await;
        data.records.remove(&worker);
        Ok(())
    }
}

#[async_trait]
impl UpdateRepository for InMemoryStore {
    async fn push(&self, update: &WorkerUpdate) -> FleetResult<()> {
        let mut data = self.data.write().await;
        data.updates.push(update.clone());
        Ok(())
    }

    async fn list(&self, worker: IpAddr) -> FleetResult<Vec<WorkerUpdate>> {
        let data = self.data.read().await;
        Ok(data
            .updates
            .iter()
            .filter(|u| u.worker == worker)
            .cloned()
            .collect())
    }

    async fn remove(&self, id: Uuid) -> FleetResult<()> {
        let mut data = self.data.write().await;
        data.updates.retain(|u| u.id != id);
        Ok(())
    }

    async fn pop_oldest(&self, worker: IpAddr) -> FleetResult<Option<WorkerUpdate>> {
        let mut data = self.data.write().await;
        match data.updates.iter().position(|u| u.worker == worker) {
            Some(index) => Ok(Some(data.updates.remove(index))),
            None => Ok(None),
        }
    }

    async fn count(&self, worker: IpAddr) -> FleetResult<usize> {
        let data = self.data.read().await;
        Ok(data.updates.iter().filter(|u| u.worker == worker).count())
    }

    async fn clear(&self, worker: IpAddr) -> FleetResult<usize> {
        let mut data = self.data.write().await;
        let before = data.updates.len();
        data.updates.retain(|u| u.worker != worker);
        Ok(before - data.updates.len())
    }
}

#[async_trait]
impl OrchestratorStateRepository for InMemoryStore {
    async fn load(&self) -> FleetResult<Option<OrchestratorState>> {
        Ok(self.data.read().await.orchestrator.clone())
    }

    async fn save(&self, state: &OrchestratorState) -> FleetResult<()> {
        self.data.write().await.orchestrator = Some(state.clone());
        Ok(())
    }
}
