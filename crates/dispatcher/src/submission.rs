use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use fleet_core::models::AnalysisTask;
use fleet_core::traits::WorkerRepository;
use fleet_core::FleetResult;
use fleet_worker::{JobHandle, LocalAnalysisRunner, LocalBoundedExecutor};

use crate::orchestrator::{TaskPlacement, WorkerOrchestrator};

/// 提交结果
pub enum Submission {
    /// 没有注册任何Worker，已交给本地执行器
    Local(JobHandle<PathBuf>),
    Assigned(IpAddr),
    /// 在队列中的位置
    Queued(usize),
}

/// 分析任务提交入口
pub struct AnalysisSubmitter {
    orchestrator: Arc<WorkerOrchestrator>,
    workers: Arc<dyn WorkerRepository>,
    executor: Arc<LocalBoundedExecutor>,
    runner: LocalAnalysisRunner,
}

impl AnalysisSubmitter {
    pub fn new(
        orchestrator: Arc<WorkerOrchestrator>,
        workers: Arc<dyn WorkerRepository>,
        executor: Arc<LocalBoundedExecutor>,
        runner: LocalAnalysisRunner,
    ) -> Self {
        Self {
            orchestrator,
            workers,
            executor,
            runner,
        }
    }

    /// 本地执行器已满时返回 `AdmissionRejected`，不会排队等待
    pub async fn submit(&self, task: AnalysisTask) -> FleetResult<Submission> {
        if self.workers.list().await?.is_empty() {
            info!("没有注册的Worker，分析 {} 在本地执行", task.analysis_id);
            let runner = self.runner.clone();
            let name = task.analysis_id.to_string();
            let handle = self
                .executor
                .submit(&name, async move { runner.run(&task).await })?;
            return Ok(Submission::Local(handle));
        }

        Ok(match self.orchestrator.assign_task(task).await {
            TaskPlacement::Assigned(address) => Submission::Assigned(address),
            TaskPlacement::Queued(position) => Submission::Queued(position),
        })
    }

    /// 取消仍在排队的任务
    pub async fn cancel(&self, analysis_id: Uuid) -> bool {
        self.orchestrator.cancel_task(analysis_id).await
    }
}
