//! 依赖更新队列
//!
//! 每个Worker一个有界FIFO队列。队列满时丢弃最早的请求而不是拒绝调用方，
//! 用有界的内存换取生产者永不阻塞。Worker在 CONFIGURING 期间不在编排器的
//! 空闲/忙碌集合中，只有回到 CONFIGURED 后才重新加入。

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use fleet_core::config::UpdateConfig;
use fleet_core::models::{ConfigStatus, DependencyKind, DependencyVersionRecord, WorkerUpdate};
use fleet_core::traits::{RemoteChannel, RemoteSession, Repositories};
use fleet_core::{FleetError, FleetResult};
use fleet_worker::remote::{self, RemotePaths};

use crate::dependency_coordinator::DependencyCoordinator;
use crate::orchestrator::WorkerOrchestrator;
use crate::session::open_session;
use crate::staging::staged_archive;

/// 入队后何时开始处理
#[derive(Debug)]
pub enum RefreshPlan {
    /// Worker正在分析，结束后由生命周期管理处理队列
    AfterCurrentJob,
    /// 已有一次处理在进行，新请求会被它一并消化
    AlreadyConfiguring,
    /// 已在后台开始处理
    Started(JoinHandle<()>),
}

#[derive(Debug)]
pub struct QueueReceipt {
    pub update: WorkerUpdate,
    /// 队列已满时被挤掉的最早请求
    pub dropped: Option<WorkerUpdate>,
    pub refresh: RefreshPlan,
}

pub struct UpdateQueue {
    repos: Repositories,
    orchestrator: Arc<WorkerOrchestrator>,
    coordinator: Arc<DependencyCoordinator>,
    channel: Arc<dyn RemoteChannel>,
    paths: RemotePaths,
    staging_dir: PathBuf,
    capacity: usize,
}

impl UpdateQueue {
    pub fn new(
        repos: Repositories,
        orchestrator: Arc<WorkerOrchestrator>,
        coordinator: Arc<DependencyCoordinator>,
        channel: Arc<dyn RemoteChannel>,
        paths: RemotePaths,
        config: &UpdateConfig,
    ) -> Self {
        Self {
            repos,
            orchestrator,
            coordinator,
            channel,
            paths,
            staging_dir: PathBuf::from(&config.staging_dir),
            capacity: config.queue_size.max(1),
        }
    }

    /// 请求更新Worker的某类依赖，未指定版本时使用最新可用版本
    pub async fn queue_update(
        self: &Arc<Self>,
        address: IpAddr,
        kind: DependencyKind,
        version: Option<&str>,
    ) -> FleetResult<QueueReceipt> {
        let (update, dropped) = self.enqueue(address, kind, version).await?;
        let refresh = self.trigger(address).await?;
        Ok(QueueReceipt {
            update,
            dropped,
            refresh,
        })
    }

    /// 只入队不触发处理，返回新请求以及被挤掉的请求
    pub async fn enqueue(
        &self,
        address: IpAddr,
        kind: DependencyKind,
        version: Option<&str>,
    ) -> FleetResult<(WorkerUpdate, Option<WorkerUpdate>)> {
        self.repos.workers.get_required(address).await?;

        let version = match version {
            Some(version) => version.to_string(),
            None => self.repos.dependencies.get_available().await?.version_for(kind),
        };

        let mut dropped = None;
        if self.repos.updates.count(address).await? >= self.capacity {
            dropped = self.repos.updates.pop_oldest(address).await?;
            if let Some(old) = &dropped {
                warn!(
                    "Worker {} 的更新队列已满 ({})，丢弃最早的请求 {} {}",
                    address, self.capacity, old.kind, old.version
                );
                counter!("fleet_updates_dropped_total").increment(1);
            }
        }

        let update = WorkerUpdate::new(address, kind, version);
        self.repos.updates.push(&update).await?;
        info!("Worker {} 排队更新 {} -> {}", address, update.kind, update.version);

        Ok((update, dropped))
    }

    /// 空闲或未纳入编排的Worker立即在后台处理队列
    pub async fn trigger(self: &Arc<Self>, address: IpAddr) -> FleetResult<RefreshPlan> {
        if self.orchestrator.is_busy(address).await {
            info!("Worker {} 正在分析，结束后再处理更新", address);
            return Ok(RefreshPlan::AfterCurrentJob);
        }

        match self.orchestrator.remove_worker(address, false).await {
            Ok(_) | Err(FleetError::NotFound { .. }) => {}
            Err(FleetError::WorkerBusy { .. }) => return Ok(RefreshPlan::AfterCurrentJob),
            Err(e) => return Err(e),
        }

        let previous = self
            .repos
            .workers
            .transition_status(address, ConfigStatus::Configuring)
            .await?;
        if previous == ConfigStatus::Configuring {
            debug!("Worker {} 已在配置中", address);
            return Ok(RefreshPlan::AlreadyConfiguring);
        }

        let queue = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if let Err(e) = queue.update_worker(address).await {
                error!("Worker {} 更新失败: {}", address, e);
            }
        });
        Ok(RefreshPlan::Started(handle))
    }

    /// 为Worker排队全部四类依赖的默认版本，用于首次配置和出错后的重试
    pub async fn configure(self: &Arc<Self>, address: IpAddr) -> FleetResult<RefreshPlan> {
        for kind in DependencyKind::ALL {
            self.enqueue(address, kind, None).await?;
        }
        self.trigger(address).await
    }

    /// 处理队列，成功回到 CONFIGURED 后重新加入编排器
    pub async fn update_worker(&self, address: IpAddr) -> FleetResult<()> {
        let result = self.process_update_queue(address).await;

        let worker = self.repos.workers.get_required(address).await?;
        if worker.is_configured() {
            match self.orchestrator.add_worker(address).await {
                Ok(()) | Err(FleetError::AlreadyExists { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        result
    }

    /// 依次执行Worker的待处理更新
    ///
    /// 每项成功后从队列删除；任一项失败时Worker进入 ERROR，剩余项保留在队列中，
    /// 需要运维人员显式重试。
    pub async fn process_update_queue(&self, address: IpAddr) -> FleetResult<()> {
        if self.orchestrator.is_busy(address).await {
            return Err(FleetError::WorkerBusy { address });
        }

        if self.repos.updates.count(address).await? == 0 {
            let worker = self.repos.workers.get_required(address).await?;
            if worker.status == ConfigStatus::Configuring {
                self.repos
                    .workers
                    .transition_status(address, ConfigStatus::Configured)
                    .await?;
            }
            debug!("Worker {} 没有待处理的更新", address);
            return Ok(());
        }

        match self.orchestrator.remove_worker(address, false).await {
            Ok(_) | Err(FleetError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        self.repos
            .workers
            .transition_status(address, ConfigStatus::Configuring)
            .await?;

        let session = match open_session(&self.repos, self.channel.as_ref(), address).await {
            Ok((_, session)) => session,
            Err(e) => {
                self.fail(address, &e).await;
                return Err(e);
            }
        };

        while let Some(update) = self.repos.updates.list(address).await?.into_iter().next() {
            if let Err(e) = self.perform_update(session.as_ref(), &update).await {
                self.fail(address, &e).await;
                return Err(e);
            }
            self.repos.updates.remove(update.id).await?;
        }

        self.repos
            .workers
            .transition_status(address, ConfigStatus::Configured)
            .await?;
        info!("Worker {} 配置完成", address);
        Ok(())
    }

    async fn perform_update(
        &self,
        session: &dyn RemoteSession,
        update: &WorkerUpdate,
    ) -> FleetResult<()> {
        let address = update.worker;
        let record = self.repos.dependencies.get_record(address).await?;
        if record.has_installed(update.kind, &update.version) {
            info!(
                "Worker {} 已安装 {} {}，跳过",
                address, update.kind, update.version
            );
            return Ok(());
        }

        self.coordinator
            .use_dependency(update.kind, &update.version, address)
            .await?;
        let copied = remote::copy_dependency(
            session,
            update.kind,
            &staged_archive(&self.staging_dir, update.kind),
        )
        .await;
        self.coordinator
            .release_dependency(update.kind, address, false)
            .await?;
        copied?;

        remote::install_dependency(session, update.kind).await?;

        if let Err(e) = self.refresh_installed(session).await {
            warn!("刷新Worker {} 的已安装版本失败: {}", address, e);
        }
        Ok(())
    }

    /// 读取Worker上的已安装版本，与最新可用版本比较后保存
    pub async fn refresh_installed(
        &self,
        session: &dyn RemoteSession,
    ) -> FleetResult<DependencyVersionRecord> {
        let mut record = remote::read_installed_versions(session, &self.paths).await?;
        let available = self.repos.dependencies.get_available().await?;
        record.evaluate_outdated(&available);
        self.repos
            .dependencies
            .save_record(session.address(), &record)
            .await?;
        Ok(record)
    }

    async fn fail(&self, address: IpAddr, cause: &FleetError) {
        error!("Worker {} 配置失败: {}", address, cause);
        if let Err(e) = self
            .repos
            .workers
            .transition_status(address, ConfigStatus::Error)
            .await
        {
            warn!("将Worker {} 标记为 ERROR 失败: {}", address, e);
        }
    }

    pub async fn pending(&self, address: IpAddr) -> FleetResult<Vec<WorkerUpdate>> {
        self.repos.updates.list(address).await
    }

    pub async fn has_pending(&self, address: IpAddr) -> FleetResult<bool> {
        Ok(self.repos.updates.count(address).await? > 0)
    }

    /// 管理操作：清空Worker的更新队列
    pub async fn clear(&self, address: IpAddr) -> FleetResult<usize> {
        let cleared = self.repos.updates.clear(address).await?;
        if cleared > 0 {
            info!("已清空Worker {} 的 {} 个待处理更新", address, cleared);
        }
        Ok(cleared)
    }
}
