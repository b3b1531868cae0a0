use std::net::IpAddr;

use async_trait::async_trait;

use crate::errors::FleetResult;
use crate::models::{AnalysisTask, DependencyKind};

/// 一次Worker分配：由编排器在临界区内产生，在临界区外执行
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub worker: IpAddr,
    pub task: AnalysisTask,
}

/// 任务启动器
///
/// `launch` 在编排器持锁期间调用，实现不得阻塞，只负责把分配交给执行方。
pub trait TaskLauncher: Send + Sync {
    fn launch(&self, assignment: Assignment) -> FleetResult<()>;
}

/// 依赖暂存器：在本地拉取并打包某类依赖的指定版本
#[async_trait]
pub trait DependencyStager: Send + Sync {
    async fn stage(&self, kind: DependencyKind, version: &str) -> FleetResult<()>;
}
