use std::path::PathBuf;

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use fleet_core::traits::RemoteSession;
use fleet_core::FleetResult;
use fleet_worker::remote::RemotePaths;

/// 健康轮询检测到分析结束后、远程清理之前调用
#[async_trait]
pub trait CompletionHook: Send + Sync {
    async fn analysis_finished(
        &self,
        session: &dyn RemoteSession,
        analysis_id: Uuid,
    ) -> FleetResult<()>;
}

/// 把分析日志和运行输出下载到 `<results_dir>/<analysis_id>/`
#[derive(Debug, Clone)]
pub struct LogCollector {
    results_dir: PathBuf,
    paths: RemotePaths,
}

impl LogCollector {
    pub fn new(results_dir: impl Into<PathBuf>, paths: RemotePaths) -> Self {
        Self {
            results_dir: results_dir.into(),
            paths,
        }
    }

    pub fn target_dir(&self, analysis_id: Uuid) -> PathBuf {
        self.results_dir.join(analysis_id.to_string())
    }
}

#[async_trait]
impl CompletionHook for LogCollector {
    async fn analysis_finished(
        &self,
        session: &dyn RemoteSession,
        analysis_id: Uuid,
    ) -> FleetResult<()> {
        let target = self.target_dir(analysis_id);
        tokio::fs::create_dir_all(&target).await?;

        session
            .get_file(&self.paths.analysis_log_file(), &target.join("analysis.log"))
            .await?;
        session
            .get_file(&self.paths.run_log_path(session), &target.join("run.log"))
            .await?;

        info!(
            "已收集Worker {} 上分析 {} 的日志到 {}",
            session.address(),
            analysis_id,
            target.display()
        );
        Ok(())
    }
}
