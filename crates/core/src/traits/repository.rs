//! 数据仓储层接口定义
//!
//! 持久化层对编排核心而言是外部协作者，这里只定义编排所需的最小接口：
//! - `WorkerRepository` - Worker身份、可达性、配置状态与当前分析
//! - `ConfigurationRepository` - 凭据与地址段配置
//! - `DependencyRepository` - 依赖缓存状态、缓存版本、可用版本以及每个Worker的安装记录
//! - `UpdateRepository` - 每个Worker的待处理依赖更新
//! - `OrchestratorStateRepository` - 编排器状态镜像
//!
//! 每次调用都应具备单次调用范围内的事务语义。

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::{FleetError, FleetResult};
use crate::models::{
    AvailableDependencyVersion, CachedDependencyVersion, ConfigStatus, Configuration,
    DependencyKind, DependencyState, DependencyVersionRecord, OrchestratorState, ScanStatus,
    Worker, WorkerUpdate,
};

/// Worker仓储接口
#[async_trait]
pub trait WorkerRepository: Send + Sync {
    /// 插入或整体覆盖Worker记录
    async fn upsert(&self, worker: &Worker) -> FleetResult<()>;

    async fn get(&self, address: IpAddr) -> FleetResult<Option<Worker>>;

    async fn list(&self) -> FleetResult<Vec<Worker>>;

    async fn list_by_configuration(&self, configuration_id: i64) -> FleetResult<Vec<Worker>>;

    /// 删除Worker，不存在时返回 `NotFound`
    async fn delete(&self, address: IpAddr) -> FleetResult<()>;

    /// 更新可达性，可达时同时刷新最后连通时间和系统信息
    async fn set_reachability(
        &self,
        address: IpAddr,
        reachable: bool,
        system_info: Option<BTreeMap<String, String>>,
    ) -> FleetResult<()>;

    /// 设置当前分析，同时清空上一次分析的进程ID
    async fn set_analysis(&self, address: IpAddr, analysis_id: Option<Uuid>) -> FleetResult<()>;

    async fn set_analysis_pid(&self, address: IpAddr, pid: Option<u32>) -> FleetResult<()>;

    /// 按状态机规则原子地修改配置状态，返回修改前的状态
    async fn transition_status(
        &self,
        address: IpAddr,
        next: ConfigStatus,
    ) -> FleetResult<ConfigStatus>;

    async fn get_required(&self, address: IpAddr) -> FleetResult<Worker> {
        self.get(address)
            .await?
            .ok_or(FleetError::NotFound { address })
    }
}

/// 配置仓储接口
#[async_trait]
pub trait ConfigurationRepository: Send + Sync {
    async fn upsert(&self, configuration: &Configuration) -> FleetResult<()>;

    async fn get(&self, id: i64) -> FleetResult<Option<Configuration>>;

    async fn list(&self) -> FleetResult<Vec<Configuration>>;

    async fn delete(&self, id: i64) -> FleetResult<()>;

    async fn set_scan_status(&self, id: i64, status: ScanStatus) -> FleetResult<()>;

    /// 按ID顺序返回Worker所属的全部配置
    async fn for_worker(&self, worker: &Worker) -> FleetResult<Vec<Configuration>> {
        let mut configurations = Vec::with_capacity(worker.configuration_ids.len());
        for id in &worker.configuration_ids {
            if let Some(configuration) = self.get(*id).await? {
                configurations.push(configuration);
            }
        }
        Ok(configurations)
    }
}

/// 依赖仓储接口
#[async_trait]
pub trait DependencyRepository: Send + Sync {
    /// 获取依赖缓存状态，不存在时返回初始的 UNAVAILABLE 状态
    async fn get_state(&self, kind: DependencyKind) -> FleetResult<DependencyState>;

    async fn save_state(&self, state: &DependencyState) -> FleetResult<()>;

    async fn list_states(&self) -> FleetResult<Vec<DependencyState>>;

    async fn get_cached(&self) -> FleetResult<CachedDependencyVersion>;

    async fn save_cached(&self, cached: &CachedDependencyVersion) -> FleetResult<()>;

    async fn get_available(&self) -> FleetResult<AvailableDependencyVersion>;

    async fn save_available(&self, available: &AvailableDependencyVersion) -> FleetResult<()>;

    /// 获取Worker的已安装依赖记录，不存在时返回空记录
    async fn get_record(&self, worker: IpAddr) -> FleetResult<DependencyVersionRecord>;

    async fn save_record(&self, worker: IpAddr, record: &DependencyVersionRecord)
        -> FleetResult<()>;

    async fn delete_record(&self, worker: IpAddr) -> FleetResult<()>;
}

/// 依赖更新队列仓储接口
#[async_trait]
pub trait UpdateRepository: Send + Sync {
    async fn push(&self, update: &WorkerUpdate) -> FleetResult<()>;

    /// 按入队顺序列出Worker的待处理更新
    async fn list(&self, worker: IpAddr) -> FleetResult<Vec<WorkerUpdate>>;

    async fn remove(&self, id: Uuid) -> FleetResult<()>;

    /// 移除并返回最早入队的更新
    async fn pop_oldest(&self, worker: IpAddr) -> FleetResult<Option<WorkerUpdate>>;

    async fn count(&self, worker: IpAddr) -> FleetResult<usize>;

    /// 清空Worker的队列，返回被清除的数量
    async fn clear(&self, worker: IpAddr) -> FleetResult<usize>;
}

/// 编排器状态镜像仓储接口
#[async_trait]
pub trait OrchestratorStateRepository: Send + Sync {
    async fn load(&self) -> FleetResult<Option<OrchestratorState>>;

    async fn save(&self, state: &OrchestratorState) -> FleetResult<()>;
}

/// 全部仓储的一组共享句柄，便于依赖注入
#[derive(Clone)]
pub struct Repositories {
    pub workers: Arc<dyn WorkerRepository>,
    pub configurations: Arc<dyn ConfigurationRepository>,
    pub dependencies: Arc<dyn DependencyRepository>,
    pub updates: Arc<dyn UpdateRepository>,
    pub orchestrator: Arc<dyn OrchestratorStateRepository>,
}
