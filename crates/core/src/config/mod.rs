mod sections;

use std::path::Path;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::errors::{FleetError, FleetResult};

pub use sections::{
    DatabaseConfig, ExecutorConfig, HealthConfig, LocalConfig, LoggingConfig,
    ObservabilityConfig, RedisConfig, RemoteConfig, ScanConfig, UpdateConfig, VersionCheckConfig,
};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub executor: ExecutorConfig,
    pub health: HealthConfig,
    pub updates: UpdateConfig,
    pub remote: RemoteConfig,
    pub scan: ScanConfig,
    pub local: LocalConfig,
    pub version_check: VersionCheckConfig,
    pub observability: ObservabilityConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Defaults of every section
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: FLEET_, nested keys joined by `__`)
    pub fn load(config_path: Option<&str>) -> FleetResult<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(FleetError::Configuration(format!("配置文件不存在: {path}")));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else {
            let default_paths = ["config/fleet.toml", "fleet.toml", "/etc/fleet/config.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("FLEET")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .map_err(|e| FleetError::Configuration(format!("构建配置失败: {e}")))?
            .try_deserialize()
            .map_err(|e| FleetError::Configuration(format!("反序列化配置失败: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> FleetResult<Self> {
        let config: AppConfig = toml::from_str(toml_str)
            .map_err(|e| FleetError::Configuration(format!("解析TOML配置失败: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> FleetResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| FleetError::Configuration(format!("序列化配置为TOML失败: {e}")))
    }

    /// Validate configuration effectiveness
    pub fn validate(&self) -> FleetResult<()> {
        self.database.validate()?;
        self.redis.validate()?;

        if self.executor.max_workers == 0 {
            return Err(FleetError::Configuration("执行器并发数必须大于0".to_string()));
        }
        if self.updates.queue_size == 0 {
            return Err(FleetError::Configuration("更新队列长度必须大于0".to_string()));
        }
        if self.health.poll_interval_seconds == 0 {
            return Err(FleetError::Configuration("健康轮询间隔必须大于0".to_string()));
        }
        if self.health.unreachable_timeout_seconds == 0 {
            return Err(FleetError::Configuration("不可达超时必须大于0".to_string()));
        }
        if self.remote.completion_marker.trim().is_empty() {
            return Err(FleetError::Configuration("分析完成标记不能为空".to_string()));
        }
        if self.scan.concurrency == 0 {
            return Err(FleetError::Configuration("扫描并发数必须大于0".to_string()));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            return Err(FleetError::Configuration(format!(
                "不支持的日志格式: {}",
                self.logging.format
            )));
        }

        Ok(())
    }
}
