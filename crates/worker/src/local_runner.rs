use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{info, warn};

use fleet_core::config::LocalConfig;
use fleet_core::models::AnalysisTask;
use fleet_core::{FleetError, FleetResult};

/// 本地回退执行：没有注册任何Worker时在本机运行分析命令
#[derive(Debug, Clone)]
pub struct LocalAnalysisRunner {
    work_dir: PathBuf,
}

impl LocalAnalysisRunner {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    pub fn from_config(config: &LocalConfig) -> Self {
        Self::new(&config.work_dir)
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// 分析输出日志路径
    pub fn log_path(&self, task: &AnalysisTask) -> PathBuf {
        self.work_dir.join(format!("{}.log", task.analysis_id))
    }

    /// 运行分析命令直到退出，返回日志路径
    pub async fn run(&self, task: &AnalysisTask) -> FleetResult<PathBuf> {
        tokio::fs::create_dir_all(&self.work_dir).await?;

        let log_path = self.log_path(task);
        let log = std::fs::File::create(&log_path)?;
        let stderr = log.try_clone()?;

        info!(
            "本地执行分析: analysis_id={}, command={}",
            task.analysis_id, task.command
        );

        let status = Command::new("sh")
            .arg("-c")
            .arg(&task.command)
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .status()
            .await?;

        match status.code() {
            Some(0) => {
                info!("本地分析完成: analysis_id={}", task.analysis_id);
                Ok(log_path)
            }
            code => {
                warn!(
                    "本地分析失败: analysis_id={}, exit_code={:?}",
                    task.analysis_id, code
                );
                Err(FleetError::NonZeroExit {
                    code: code.unwrap_or(-1),
                    command: task.command.clone(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn task(command: &str) -> AnalysisTask {
        AnalysisTask::new(Uuid::new_v4(), command, "/tmp/in.bin", "in.bin")
    }

    #[tokio::test]
    async fn test_run_writes_log() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalAnalysisRunner::new(dir.path().join("work"));

        let log = runner.run(&task("echo analysing; echo done >&2")).await.unwrap();
        let contents = std::fs::read_to_string(log).unwrap();
        assert!(contents.contains("analysing"));
        assert!(contents.contains("done"));
    }

    #[tokio::test]
    async fn test_failing_command() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalAnalysisRunner::new(dir.path());

        let err = runner.run(&task("exit 3")).await.unwrap_err();
        assert!(matches!(err, FleetError::NonZeroExit { code: 3, .. }));
    }
}
