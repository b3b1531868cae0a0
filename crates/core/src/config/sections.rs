use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{FleetError, FleetResult};

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    /// 存储后端: memory | sqlite
    pub backend: String,
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            url: "sqlite://fleet.db?mode=rwc".to_string(),
            max_connections: 5,
        }
    }
}

impl DatabaseConfig {
    pub fn validate(&self) -> FleetResult<()> {
        match self.backend.as_str() {
            "memory" => Ok(()),
            "sqlite" => {
                if !self.url.starts_with("sqlite:") {
                    return Err(FleetError::Configuration(
                        "数据库URL必须是SQLite格式".to_string(),
                    ));
                }
                if self.max_connections == 0 {
                    return Err(FleetError::Configuration("最大连接数必须大于0".to_string()));
                }
                Ok(())
            }
            other => Err(FleetError::Configuration(format!(
                "不支持的存储后端: {other}"
            ))),
        }
    }
}

/// Redis分布式锁配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RedisConfig {
    /// 关闭时退化为进程内锁，仅适用于单进程部署
    pub enabled: bool,
    pub url: String,
    pub key_prefix: String,
    pub lock_ttl_seconds: u64,
    pub lock_retry_interval_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "redis://127.0.0.1:6379/0".to_string(),
            key_prefix: "fleet".to_string(),
            lock_ttl_seconds: 300,     // 5分钟
            lock_retry_interval_ms: 500,
        }
    }
}

impl RedisConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_seconds)
    }

    pub fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_interval_ms)
    }

    pub fn validate(&self) -> FleetResult<()> {
        if self.lock_ttl_seconds == 0 {
            return Err(FleetError::Configuration("锁超时时间必须大于0".to_string()));
        }
        if self.enabled && !self.url.starts_with("redis://") && !self.url.starts_with("rediss://") {
            return Err(FleetError::Configuration("Redis URL格式无效".to_string()));
        }
        Ok(())
    }
}

/// 本地有界执行器配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// 并发执行的任务数 W
    pub max_workers: usize,
    /// 额外排队容量 Q
    pub max_queue: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_queue: 4,
        }
    }
}

/// 健康轮询配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    pub poll_interval_seconds: u64,
    /// 单条探测命令的超时时间
    pub probe_timeout_seconds: u64,
    /// 连续不可达超过该时长后移出编排器，并重新提交其任务
    pub unreachable_timeout_seconds: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 120, // 2分钟
            probe_timeout_seconds: 60,
            unreachable_timeout_seconds: 600, // 10分钟
        }
    }
}

impl HealthConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }

    pub fn unreachable_timeout(&self) -> Duration {
        Duration::from_secs(self.unreachable_timeout_seconds)
    }
}

/// 依赖更新配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpdateConfig {
    /// 每个Worker最多排队的更新数，超出时丢弃最旧的
    pub queue_size: usize,
    /// 本地依赖缓存目录
    pub staging_dir: String,
    /// 本地依赖准备脚本目录
    pub script_dir: String,
    pub stage_timeout_seconds: u64,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            queue_size: 10,
            staging_dir: "/var/lib/fleet/worker_files".to_string(),
            script_dir: "/usr/share/fleet/update".to_string(),
            stage_timeout_seconds: 3600, // 1小时
        }
    }
}

/// 远程Worker访问配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RemoteConfig {
    pub ssh_binary: String,
    pub scp_binary: String,
    pub sshpass_binary: String,
    pub port: u16,
    pub connect_timeout_seconds: u64,
    /// 远程固件存放目录
    pub firmware_dir: String,
    /// 远程分析日志目录
    pub analysis_log_dir: String,
    /// 远程分析工具安装目录
    pub install_root: String,
    /// 分析进程的输出文件，相对登录用户主目录
    pub run_log: String,
    /// 分析日志中表示运行结束的标记
    pub completion_marker: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            ssh_binary: "ssh".to_string(),
            scp_binary: "scp".to_string(),
            sshpass_binary: "sshpass".to_string(),
            port: 22,
            connect_timeout_seconds: 10,
            firmware_dir: "/root/firmware".to_string(),
            analysis_log_dir: "/root/analysis_logs".to_string(),
            install_root: "/root/emba".to_string(),
            run_log: "analysis_run.log".to_string(),
            completion_marker: "Test ended".to_string(),
        }
    }
}

/// 网络扫描配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScanConfig {
    pub port: u16,
    pub timeout_ms: u64,
    pub concurrency: usize,
    pub max_hosts: usize,
    /// 服务模式下重新扫描全部配置的间隔，0 表示不定期扫描
    pub interval_seconds: u64,
    /// 扫描后自动配置新发现的 UNCONFIGURED Worker
    pub auto_configure: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            port: 22,
            timeout_ms: 1000,
            concurrency: 50,
            max_hosts: 4096,
            interval_seconds: 3600, // 1小时
            auto_configure: true,
        }
    }
}

/// 本地回退执行配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LocalConfig {
    pub work_dir: String,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            work_dir: "/var/lib/fleet/local".to_string(),
        }
    }
}

/// 依赖版本检查配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VersionCheckConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    pub api_base: String,
    /// 包含镜像标签的compose文件地址
    pub compose_url: String,
    /// 从compose文件中提取镜像标签的正则，第一个捕获组为标签
    pub image_pattern: String,
    pub repo: String,
    pub nvd_repo: String,
    pub epss_repo: String,
}

impl Default for VersionCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_seconds: 86400, // 每天一次
            api_base: "https://api.github.com".to_string(),
            compose_url:
                "https://raw.githubusercontent.com/e-m-b-a/emba/master/docker-compose.yml"
                    .to_string(),
            image_pattern: r"image:\s?embeddedanalyzer/emba:(.*?)\n".to_string(),
            repo: "e-m-b-a/emba".to_string(),
            nvd_repo: "EMBA-support-repos/nvd-json-data-feeds".to_string(),
            epss_repo: "EMBA-support-repos/EPSS-data".to_string(),
        }
    }
}

/// 可观测性配置
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Prometheus指标监听地址，未配置时不导出
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_listen: Option<String>,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// json | pretty
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
