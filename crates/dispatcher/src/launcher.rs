//! 任务启动
//!
//! 编排器在临界区内只把分配写入通道，真正的远程启动由 [`AssignmentRunner`]
//! 在独立任务中完成。

use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use fleet_core::traits::{Assignment, RemoteChannel, Repositories, TaskLauncher};
use fleet_core::{FleetError, FleetResult};
use fleet_worker::remote::{self, RemotePaths};

use crate::orchestrator::{TaskPlacement, WorkerOrchestrator};
use crate::session::open_session;

/// 基于无界通道的启动器，`launch` 永不阻塞
#[derive(Debug, Clone)]
pub struct ChannelLauncher {
    sender: mpsc::UnboundedSender<Assignment>,
}

impl ChannelLauncher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Assignment>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl TaskLauncher for ChannelLauncher {
    fn launch(&self, assignment: Assignment) -> FleetResult<()> {
        self.sender.send(assignment).map_err(|e| {
            FleetError::Internal(format!(
                "任务分发通道已关闭，无法启动分析 {}",
                e.0.task.analysis_id
            ))
        })
    }
}

/// 启动结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    Started { pid: u32 },
    /// Worker已不再执行这个任务（被撤销或重置）
    Skipped,
    /// Worker不可达，任务已重新提交
    Resubmitted(TaskPlacement),
    /// 启动失败，任务被丢弃
    Failed,
}

pub struct AssignmentRunner {
    orchestrator: Arc<WorkerOrchestrator>,
    channel: Arc<dyn RemoteChannel>,
    repos: Repositories,
    paths: RemotePaths,
}

impl AssignmentRunner {
    pub fn new(
        orchestrator: Arc<WorkerOrchestrator>,
        channel: Arc<dyn RemoteChannel>,
        repos: Repositories,
        paths: RemotePaths,
    ) -> Self {
        Self {
            orchestrator,
            channel,
            repos,
            paths,
        }
    }

    /// 消费分配直到通道关闭或收到停止信号
    pub async fn run(
        self: Arc<Self>,
        mut receiver: mpsc::UnboundedReceiver<Assignment>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("启动任务分发循环");
        loop {
            tokio::select! {
                assignment = receiver.recv() => match assignment {
                    Some(assignment) => {
                        let runner = Arc::clone(&self);
                        tokio::spawn(async move {
                            runner.execute(assignment).await;
                        });
                    }
                    None => {
                        info!("任务分发通道已关闭");
                        break;
                    }
                },
                _ = shutdown.recv() => {
                    info!("收到停止信号，退出任务分发循环");
                    break;
                }
            }
        }
    }

    /// 在Worker上启动分析并记录进程ID
    pub async fn execute(&self, assignment: Assignment) -> LaunchOutcome {
        let Assignment { worker, task } = assignment;

        let current = self.orchestrator.task_of(worker).await;
        if current.map(|t| t.analysis_id) != Some(task.analysis_id) {
            info!("Worker {} 已不再执行分析 {}，跳过启动", worker, task.analysis_id);
            return LaunchOutcome::Skipped;
        }

        let result = async {
            let (_, session) = open_session(&self.repos, self.channel.as_ref(), worker).await?;
            let pid = remote::start_analysis(session.as_ref(), &task, &self.paths).await?;
            self.repos.workers.set_analysis_pid(worker, Some(pid)).await?;
            Ok::<_, FleetError>(pid)
        }
        .await;

        match result {
            Ok(pid) => LaunchOutcome::Started { pid },
            Err(e) if e.is_channel_failure() => {
                warn!("Worker {} 不可达，重新提交分析 {}: {}", worker, task.analysis_id, e);
                if let Err(e) = self.repos.workers.set_reachability(worker, false, None).await {
                    warn!("标记Worker {} 不可达失败: {}", worker, e);
                }
                if let Err(e) = self.orchestrator.remove_worker(worker, true).await {
                    warn!("移出Worker {} 失败: {}", worker, e);
                }
                self.clear_analysis(worker).await;

                let placement = self.orchestrator.assign_task(task).await;
                LaunchOutcome::Resubmitted(placement)
            }
            Err(e) => {
                error!("Worker {} 启动分析 {} 失败: {}", worker, task.analysis_id, e);
                self.clear_analysis(worker).await;
                if let Err(e) = self.orchestrator.release_worker(worker).await {
                    warn!("释放Worker {} 失败: {}", worker, e);
                }
                LaunchOutcome::Failed
            }
        }
    }

    async fn clear_analysis(&self, worker: IpAddr) {
        if let Err(e) = self.repos.workers.set_analysis(worker, None).await {
            warn!("清除Worker {} 的当前分析失败: {}", worker, e);
        }
    }
}
