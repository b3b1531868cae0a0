use std::net::IpAddr;

use thiserror::Error;

use crate::models::{ConfigStatus, DependencyKind};

/// 编排系统错误类型定义
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("本地执行器已满，拒绝提交")]
    AdmissionRejected,

    #[error("Worker正忙: {address}")]
    WorkerBusy { address: IpAddr },

    #[error("Worker不处于忙碌状态: {address}")]
    WorkerNotBusy { address: IpAddr },

    #[error("Worker已存在: {address}")]
    AlreadyExists { address: IpAddr },

    #[error("Worker未找到: {address}")]
    NotFound { address: IpAddr },

    #[error("配置未找到: {id}")]
    ConfigurationNotFound { id: i64 },

    #[error("所有凭据均无法连接Worker: {address}")]
    AuthExhausted { address: IpAddr },

    #[error("命令执行失败，退出码 {code}: {command}")]
    NonZeroExit { code: i32, command: String },

    #[error("Worker不可达 {address}: {message}")]
    ChannelUnreachable { address: IpAddr, message: String },

    #[error("命令执行超时: {command}")]
    CommandTimeout { command: String },

    #[error("Worker {worker} 已在使用依赖 {kind}")]
    AlreadyUsing { kind: DependencyKind, worker: IpAddr },

    #[error("Worker {worker} 未使用依赖 {kind}")]
    NotUsing { kind: DependencyKind, worker: IpAddr },

    #[error("非法的配置状态转换: {from} -> {to}")]
    InvalidTransition { from: ConfigStatus, to: ConfigStatus },

    #[error("依赖准备失败 {kind}: {message}")]
    StagingFailed { kind: DependencyKind, message: String },

    #[error("分布式锁错误: {0}")]
    Lock(String),

    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis错误: {0}")]
    Redis(String),

    #[error("HTTP请求错误: {0}")]
    Http(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl FleetError {
    /// 是否为远程通道层面的失败（连接、认证、不可达）
    pub fn is_channel_failure(&self) -> bool {
        matches!(
            self,
            FleetError::AuthExhausted { .. }
                | FleetError::ChannelUnreachable { .. }
                | FleetError::CommandTimeout { .. }
        )
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(e: serde_json::Error) -> Self {
        FleetError::Serialization(e.to_string())
    }
}

/// 统一的Result类型
pub type FleetResult<T> = std::result::Result<T, FleetError>;
