use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use fleet_core::config::UpdateConfig;
use fleet_core::models::DependencyKind;
use fleet_core::traits::DependencyStager;
use fleet_core::{FleetError, FleetResult};

/// 本地打包好的依赖归档路径
pub fn staged_archive(staging_dir: &Path, kind: DependencyKind) -> PathBuf {
    staging_dir.join(kind.archive_name())
}

/// 通过本地脚本准备依赖
///
/// 脚本参数依次为: 目标目录、归档路径、版本。输出写入 `<kind>_stage.log`。
#[derive(Debug, Clone)]
pub struct ScriptStager {
    script_dir: PathBuf,
    staging_dir: PathBuf,
    timeout: Duration,
}

impl ScriptStager {
    pub fn new(
        script_dir: impl Into<PathBuf>,
        staging_dir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            script_dir: script_dir.into(),
            staging_dir: staging_dir.into(),
            timeout,
        }
    }

    pub fn from_config(config: &UpdateConfig) -> Self {
        Self::new(
            &config.script_dir,
            &config.staging_dir,
            Duration::from_secs(config.stage_timeout_seconds),
        )
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub fn log_path(&self, kind: DependencyKind) -> PathBuf {
        self.staging_dir
            .join(format!("{}_stage.log", kind.folder_name().to_lowercase()))
    }
}

#[async_trait]
impl DependencyStager for ScriptStager {
    async fn stage(&self, kind: DependencyKind, version: &str) -> FleetResult<()> {
        tokio::fs::create_dir_all(&self.staging_dir).await?;

        let script = self.script_dir.join(kind.script_name());
        let log_path = self.log_path(kind);
        let log = std::fs::File::create(&log_path)?;
        let stderr = log.try_clone()?;

        info!("准备依赖 {} 版本 {}: {}", kind, version, script.display());

        let status = Command::new("sh")
            .arg(&script)
            .arg(self.staging_dir.join(kind.folder_name()))
            .arg(staged_archive(&self.staging_dir, kind))
            .arg(version)
            .current_dir(&self.staging_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .status();

        match tokio::time::timeout(self.timeout, status).await {
            Ok(Ok(status)) if status.success() => {
                info!("依赖 {} 版本 {} 准备完成", kind, version);
                Ok(())
            }
            Ok(Ok(status)) => {
                warn!("依赖 {} 准备脚本失败，日志见 {}", kind, log_path.display());
                Err(FleetError::StagingFailed {
                    kind,
                    message: format!(
                        "脚本 {} 退出码 {:?}",
                        script.display(),
                        status.code()
                    ),
                })
            }
            Ok(Err(e)) => Err(FleetError::StagingFailed {
                kind,
                message: format!("无法运行脚本 {}: {e}", script.display()),
            }),
            Err(_) => Err(FleetError::StagingFailed {
                kind,
                message: format!("脚本 {} 超过 {:?} 未结束", script.display(), self.timeout),
            }),
        }
    }
}
