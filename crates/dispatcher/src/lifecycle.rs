//! Worker生命周期操作：分析结束回收、软/硬重置、重新连接

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{info, warn};

use fleet_core::models::{ConfigStatus, Worker};
use fleet_core::traits::{RemoteChannel, Repositories};
use fleet_core::{FleetError, FleetResult};
use fleet_worker::remote::{self, RemotePaths};

use crate::orchestrator::WorkerOrchestrator;
use crate::session::open_session;
use crate::update_queue::UpdateQueue;

pub struct WorkerLifecycle {
    repos: Repositories,
    orchestrator: Arc<WorkerOrchestrator>,
    updates: Arc<UpdateQueue>,
    channel: Arc<dyn RemoteChannel>,
    paths: RemotePaths,
}

impl WorkerLifecycle {
    pub fn new(
        repos: Repositories,
        orchestrator: Arc<WorkerOrchestrator>,
        updates: Arc<UpdateQueue>,
        channel: Arc<dyn RemoteChannel>,
        paths: RemotePaths,
    ) -> Self {
        Self {
            repos,
            orchestrator,
            updates,
            channel,
            paths,
        }
    }

    /// 分析结束后回收Worker
    ///
    /// 有待处理的依赖更新时先处理更新，否则直接交还编排器（可能立即接手排队任务）。
    pub async fn finish_analysis(&self, address: IpAddr) -> FleetResult<()> {
        let worker = self.repos.workers.get_required(address).await?;
        info!("回收Worker {}，分析 {:?} 已结束", address, worker.analysis_id);

        if let Err(e) = self.remote_soft_reset(&worker).await {
            warn!("Worker {} 远程清理失败: {}", address, e);
        }
        self.repos.workers.set_analysis(address, None).await?;

        if self.updates.has_pending(address).await? {
            match self.orchestrator.remove_worker(address, true).await {
                Ok(_) | Err(FleetError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
            return self.updates.update_worker(address).await;
        }

        match self.orchestrator.release_worker(address).await {
            Ok(_) => Ok(()),
            Err(FleetError::WorkerNotBusy { .. }) => self.return_to_service(&worker).await,
            Err(e) => Err(e),
        }
    }

    /// 软重置：放弃当前任务并重新提交，清理远程状态后重新投入使用
    pub async fn soft_reset(&self, address: IpAddr) -> FleetResult<()> {
        let worker = self.repos.workers.get_required(address).await?;

        let abandoned = match self.orchestrator.remove_worker(address, true).await {
            Ok(task) => task,
            Err(FleetError::NotFound { .. }) => None,
            Err(e) => return Err(e),
        };

        let reset = self.remote_soft_reset(&worker).await;
        self.repos.workers.set_analysis(address, None).await?;

        if let Some(task) = abandoned {
            let placement = self.orchestrator.assign_task(task).await;
            info!("Worker {} 软重置，被放弃的任务重新提交: {:?}", address, placement);
        }

        reset?;
        self.return_to_service(&worker).await
    }

    /// 长时间不可达的Worker移出编排器，正在进行的任务重新提交给其他Worker
    ///
    /// 不触碰远程主机，Worker恢复连通后由健康轮询重新接入。
    pub async fn evict(&self, address: IpAddr) -> FleetResult<()> {
        let abandoned = match self.orchestrator.remove_worker(address, true).await {
            Ok(task) => task,
            Err(FleetError::NotFound { .. }) => None,
            Err(e) => return Err(e),
        };
        self.repos.workers.set_analysis(address, None).await?;

        if let Some(task) = abandoned {
            let placement = self.orchestrator.assign_task(task).await;
            info!("Worker {} 已移出，其任务重新提交: {:?}", address, placement);
        }
        Ok(())
    }

    /// 硬重置：卸载分析工具并回到 UNCONFIGURED
    ///
    /// 忙碌的Worker返回 `WorkerBusy`，需要先结束或软重置。
    pub async fn hard_reset(&self, address: IpAddr) -> FleetResult<()> {
        match self.orchestrator.remove_worker(address, false).await {
            Ok(_) | Err(FleetError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        let worker = self.repos.workers.get_required(address).await?;

        let result = async {
            let (_, session) = open_session(&self.repos, self.channel.as_ref(), address).await?;
            remote::hard_reset_remote(session.as_ref(), worker.analysis_pid, &self.paths).await?;
            Ok::<_, FleetError>(session)
        }
        .await;

        let session = match result {
            Ok(session) => session,
            Err(e) => {
                warn!("Worker {} 硬重置失败: {}", address, e);
                self.mark_if_unreachable(address, &e).await;
                self.return_to_service(&worker).await?;
                return Err(e);
            }
        };

        self.repos.workers.set_analysis(address, None).await?;
        self.repos
            .workers
            .transition_status(address, ConfigStatus::Unconfigured)
            .await?;
        self.updates.clear(address).await?;

        if let Err(e) = self.updates.refresh_installed(session.as_ref()).await {
            warn!("刷新Worker {} 的已安装版本失败: {}", address, e);
        }
        info!("Worker {} 已硬重置", address);
        Ok(())
    }

    /// 之前不可达的已配置Worker恢复连通后重新投入使用
    pub async fn reconnect(&self, address: IpAddr) -> FleetResult<()> {
        let worker = self.repos.workers.get_required(address).await?;
        if !worker.is_configured() || self.orchestrator.is_tracked(address).await {
            return Ok(());
        }

        info!("Worker {} 恢复连通，重新投入使用", address);
        self.remote_soft_reset(&worker).await?;
        self.repos.workers.set_analysis(address, None).await?;
        self.updates.update_worker(address).await
    }

    /// 尽力终止Worker上的分析，不改变编排器中的归属
    pub async fn stop_analysis(&self, address: IpAddr) -> FleetResult<()> {
        let (worker, session) = open_session(&self.repos, self.channel.as_ref(), address).await?;
        remote::stop_analysis(session.as_ref(), worker.analysis_pid).await
    }

    /// 管理操作：重置编排器，并清理所有原先忙碌的Worker
    pub async fn reset_all(&self) -> FleetResult<Vec<IpAddr>> {
        let busy = self.orchestrator.reset().await;
        for address in &busy {
            let worker = self.repos.workers.get_required(*address).await?;
            if let Err(e) = self.remote_soft_reset(&worker).await {
                warn!("Worker {} 远程清理失败: {}", address, e);
            }
            self.repos.workers.set_analysis(*address, None).await?;
        }
        Ok(busy)
    }

    async fn remote_soft_reset(&self, worker: &Worker) -> FleetResult<()> {
        let address = worker.address;
        let result = async {
            let (_, session) = open_session(&self.repos, self.channel.as_ref(), address).await?;
            remote::soft_reset(session.as_ref(), worker.analysis_pid, &self.paths).await
        }
        .await;

        if let Err(e) = &result {
            self.mark_if_unreachable(address, e).await;
        }
        result
    }

    async fn mark_if_unreachable(&self, address: IpAddr, error: &FleetError) {
        if !error.is_channel_failure() {
            return;
        }
        if let Err(e) = self
            .repos
            .workers
            .set_reachability(address, false, None)
            .await
        {
            warn!("标记Worker {} 不可达失败: {}", address, e);
        }
    }

    /// 已配置且未被编排器管理的Worker重新加入空闲集合
    async fn return_to_service(&self, worker: &Worker) -> FleetResult<()> {
        if !worker.is_configured() {
            return Ok(());
        }
        match self.orchestrator.add_worker(worker.address).await {
            Ok(()) | Err(FleetError::AlreadyExists { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
