//! Worker编排器
//!
//! 空闲集合、忙碌集合与待分配FIFO队列在同一把互斥锁下整体修改，
//! 调用方永远看不到"队列非空且存在空闲Worker"的中间状态。
//! 持久化的状态只是尽力而为的镜像，写入失败只记录告警。

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use metrics::{counter, gauge};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use fleet_core::models::{AnalysisTask, OrchestratorState};
use fleet_core::traits::{
    Assignment, OrchestratorStateRepository, Repositories, TaskLauncher, WorkerRepository,
};
use fleet_core::{FleetError, FleetResult};

/// 任务提交后的去向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPlacement {
    Assigned(IpAddr),
    /// 进入等待队列，值为排队位置（从1开始）
    Queued(usize),
}

/// 单个Worker在编排器中的占用情况
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerAssignment {
    Free,
    Busy { task: AnalysisTask },
}

impl fmt::Display for WorkerAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerAssignment::Free => write!(f, "free"),
            WorkerAssignment::Busy { task } => write!(f, "{}", task.analysis_id),
        }
    }
}

pub struct WorkerOrchestrator {
    state: Mutex<OrchestratorState>,
    launcher: Arc<dyn TaskLauncher>,
    workers: Arc<dyn WorkerRepository>,
    mirror: Arc<dyn OrchestratorStateRepository>,
}

impl WorkerOrchestrator {
    pub fn new(
        launcher: Arc<dyn TaskLauncher>,
        workers: Arc<dyn WorkerRepository>,
        mirror: Arc<dyn OrchestratorStateRepository>,
    ) -> Self {
        Self {
            state: Mutex::new(OrchestratorState::default()),
            launcher,
            workers,
            mirror,
        }
    }

    pub fn from_repositories(repos: &Repositories, launcher: Arc<dyn TaskLauncher>) -> Self {
        Self::new(
            launcher,
            Arc::clone(&repos.workers),
            Arc::clone(&repos.orchestrator),
        )
    }

    /// 将Worker加入空闲集合，并立即尝试消化等待队列
    pub async fn add_worker(&self, address: IpAddr) -> FleetResult<()> {
        let mut state = self.state.lock().await;
        if state.is_tracked(&address) {
            return Err(FleetError::AlreadyExists { address });
        }

        state.free_workers.insert(address);
        info!("Worker {} 加入编排器", address);

        self.drain_queue(&mut state).await;
        self.publish(&state).await;
        Ok(())
    }

    /// 将Worker移出编排器
    ///
    /// 忙碌的Worker只有在 `force` 时才会被移除，此时返回被放弃的任务，
    /// 是否重新入队由调用方决定。
    pub async fn remove_worker(
        &self,
        address: IpAddr,
        force: bool,
    ) -> FleetResult<Option<AnalysisTask>> {
        let mut state = self.state.lock().await;

        if state.free_workers.remove(&address) {
            info!("空闲Worker {} 已移出编排器", address);
            self.publish(&state).await;
            return Ok(None);
        }

        if !state.busy_workers.contains_key(&address) {
            return Err(FleetError::NotFound { address });
        }
        if !force {
            return Err(FleetError::WorkerBusy { address });
        }

        let abandoned = state.busy_workers.remove(&address);
        if let Some(task) = &abandoned {
            warn!(
                "强制移出忙碌Worker {}，放弃分析 {}",
                address, task.analysis_id
            );
        }
        self.publish(&state).await;
        Ok(abandoned)
    }

    /// 分配任务：有空闲Worker时选择地址最小的一个，否则追加到等待队列
    pub async fn assign_task(&self, task: AnalysisTask) -> TaskPlacement {
        let mut state = self.state.lock().await;

        let placement = match state.free_workers.pop_first() {
            Some(address) => {
                self.start_task(&mut state, address, task).await;
                TaskPlacement::Assigned(address)
            }
            None => {
                info!("没有空闲Worker，分析 {} 进入等待队列", task.analysis_id);
                state.tasks.push_back(task);
                TaskPlacement::Queued(state.tasks.len())
            }
        };

        self.publish(&state).await;
        placement
    }

    /// 释放忙碌Worker，返回它刚完成的任务
    ///
    /// 等待队列非空时，Worker直接接手最早的任务并保持忙碌。
    pub async fn release_worker(&self, address: IpAddr) -> FleetResult<AnalysisTask> {
        let mut state = self.state.lock().await;

        let finished = state
            .busy_workers
            .remove(&address)
            .ok_or(FleetError::WorkerNotBusy { address })?;
        debug!("Worker {} 完成分析 {}", address, finished.analysis_id);

        match state.tasks.pop_front() {
            Some(next) => self.start_task(&mut state, address, next).await,
            None => {
                state.free_workers.insert(address);
            }
        }

        self.publish(&state).await;
        Ok(finished)
    }

    /// 查询一组Worker的占用情况，任一地址未被编排器管理时返回 `NotFound`
    pub async fn get_specific_workers(
        &self,
        addresses: &[IpAddr],
    ) -> FleetResult<BTreeMap<IpAddr, WorkerAssignment>> {
        let state = self.state.lock().await;

        let mut result = BTreeMap::new();
        for address in addresses {
            let assignment = if state.free_workers.contains(address) {
                WorkerAssignment::Free
            } else if let Some(task) = state.busy_workers.get(address) {
                WorkerAssignment::Busy { task: task.clone() }
            } else {
                return Err(FleetError::NotFound { address: *address });
            };
            result.insert(*address, assignment);
        }
        Ok(result)
    }

    pub async fn is_busy(&self, address: IpAddr) -> bool {
        self.state.lock().await.busy_workers.contains_key(&address)
    }

    pub async fn is_free(&self, address: IpAddr) -> bool {
        self.state.lock().await.free_workers.contains(&address)
    }

    pub async fn is_tracked(&self, address: IpAddr) -> bool {
        self.state.lock().await.is_tracked(&address)
    }

    /// Worker当前执行的任务
    pub async fn task_of(&self, address: IpAddr) -> Option<AnalysisTask> {
        self.state.lock().await.busy_workers.get(&address).cloned()
    }

    pub async fn snapshot(&self) -> OrchestratorState {
        self.state.lock().await.clone()
    }

    /// 从等待队列中撤销尚未分配的任务
    pub async fn cancel_task(&self, analysis_id: Uuid) -> bool {
        let mut state = self.state.lock().await;

        let before = state.tasks.len();
        state.tasks.retain(|task| task.analysis_id != analysis_id);
        let removed = state.tasks.len() != before;

        if removed {
            info!("已从等待队列撤销分析 {}", analysis_id);
            self.publish(&state).await;
        }
        removed
    }

    /// 管理操作：清空等待队列并释放全部Worker
    ///
    /// 返回原先忙碌的Worker，由调用方负责清理远程状态。
    pub async fn reset(&self) -> Vec<IpAddr> {
        let mut state = self.state.lock().await;

        let dropped = state.tasks.len();
        state.tasks.clear();
        let busy: Vec<IpAddr> = state.busy_workers.keys().copied().collect();
        state.busy_workers.clear();
        state.free_workers.extend(busy.iter().copied());

        warn!(
            "编排器已重置: 丢弃 {} 个排队任务，释放 {} 个忙碌Worker",
            dropped,
            busy.len()
        );
        self.publish(&state).await;
        busy
    }

    /// 启动时从持久化镜像恢复
    ///
    /// 已记录进程ID的忙碌Worker保持忙碌，由健康轮询判断其分析是否仍在运行；
    /// 没有进程ID的任务视为尚未启动，放回队首重新分配。
    pub async fn recover(&self) -> FleetResult<OrchestratorState> {
        let saved = self.mirror.load().await?;
        let mut state = self.state.lock().await;

        if let Some(saved) = saved {
            info!(
                "恢复编排器状态: 空闲 {}，忙碌 {}，排队 {}",
                saved.free_workers.len(),
                saved.busy_workers.len(),
                saved.tasks.len()
            );
            *state = saved;
        }

        let mut unstarted = Vec::new();
        for address in state.busy_workers.keys().copied().collect::<Vec<_>>() {
            let worker = self.workers.get(address).await?;
            if worker.as_ref().and_then(|w| w.analysis_pid).is_some() {
                continue;
            }
            if let Some(task) = state.busy_workers.remove(&address) {
                unstarted.push(task);
            }
            if worker.is_some() {
                state.free_workers.insert(address);
            }
        }
        for address in state.free_workers.clone() {
            if self.workers.get(address).await?.is_none() {
                warn!("Worker {} 已不存在，不再恢复", address);
                state.free_workers.remove(&address);
            }
        }
        for task in unstarted.into_iter().rev() {
            info!("分析 {} 尚未启动，重新排队", task.analysis_id);
            state.tasks.push_front(task);
        }

        self.drain_queue(&mut state).await;
        self.publish(&state).await;
        Ok(state.clone())
    }

    async fn drain_queue(&self, state: &mut OrchestratorState) {
        while !state.tasks.is_empty() {
            let Some(address) = state.free_workers.pop_first() else {
                break;
            };
            if let Some(task) = state.tasks.pop_front() {
                self.start_task(state, address, task).await;
            }
        }
    }

    /// 在锁内登记忙碌关系并交给启动器，启动器本身不阻塞
    async fn start_task(&self, state: &mut OrchestratorState, address: IpAddr, task: AnalysisTask) {
        state.busy_workers.insert(address, task.clone());

        if let Err(e) = self.workers.set_analysis(address, Some(task.analysis_id)).await {
            warn!("记录Worker {} 的当前分析失败: {}", address, e);
        }

        counter!("fleet_tasks_assigned_total").increment(1);
        info!("分析 {} 分配给Worker {}", task.analysis_id, address);

        // 启动器只会在停机时失败，忙碌关系随镜像保留
        if let Err(e) = self.launcher.launch(Assignment {
            worker: address,
            task,
        }) {
            error!("提交Worker {} 的启动请求失败: {}", address, e);
        }
    }

    async fn publish(&self, state: &OrchestratorState) {
        gauge!("fleet_free_workers").set(state.free_workers.len() as f64);
        gauge!("fleet_busy_workers").set(state.busy_workers.len() as f64);
        gauge!("fleet_tasks_queued").set(state.tasks.len() as f64);

        if let Err(e) = self.mirror.save(state).await {
            warn!("保存编排器状态镜像失败: {}", e);
        }
    }
}
