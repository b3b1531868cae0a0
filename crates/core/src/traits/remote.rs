use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::{FleetError, FleetResult};
use crate::models::{Configuration, Worker};

/// 到单个Worker的已认证远程会话
#[async_trait]
pub trait RemoteSession: Send + Sync {
    fn address(&self) -> IpAddr;

    /// 连接成功时使用的用户名，用于构造特权命令
    fn user(&self) -> &str;

    fn is_root(&self) -> bool {
        self.user() == "root"
    }

    /// 执行命令直到退出，非零退出码返回 `NonZeroExit`
    async fn exec(&self, command: &str) -> FleetResult<String>;

    /// 上传本地文件到远程路径
    async fn put_file(&self, local: &Path, remote: &str) -> FleetResult<()>;

    /// 下载远程文件到本地路径
    async fn get_file(&self, remote: &str, local: &Path) -> FleetResult<()>;

    /// 带调用方超时的命令执行
    async fn exec_with_timeout(&self, command: &str, timeout: Duration) -> FleetResult<String> {
        match tokio::time::timeout(timeout, self.exec(command)).await {
            Ok(result) => result,
            Err(_) => Err(FleetError::CommandTimeout {
                command: command.to_string(),
            }),
        }
    }
}

/// 远程执行通道
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// 依次尝试Worker所属配置的凭据，第一个成功的胜出
    ///
    /// 全部失败时返回 `AuthExhausted`。
    async fn connect(
        &self,
        worker: &Worker,
        configurations: &[Configuration],
    ) -> FleetResult<Box<dyn RemoteSession>>;
}
