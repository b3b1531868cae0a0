//! 基于系统 `ssh`/`scp` 命令的远程执行
//!
//! 密码凭据通过 `sshpass -e` 经环境变量传递，不出现在命令行上。
//! 密钥凭据使用 batch 模式。

use std::net::IpAddr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use fleet_core::config::RemoteConfig;
use fleet_core::models::{Configuration, Worker};
use fleet_core::traits::{RemoteChannel, RemoteSession};
use fleet_core::{FleetError, FleetResult};

/// ssh 自身失败（连接、认证）时使用的退出码
const SSH_FAILURE_EXIT: i32 = 255;

#[derive(Debug, Clone)]
enum Credential {
    Password(String),
    Key(String),
}

#[derive(Debug, Clone)]
struct SshTarget {
    address: IpAddr,
    user: String,
    credential: Credential,
}

impl SshTarget {
    fn from_configuration(address: IpAddr, configuration: &Configuration) -> Self {
        let credential = match &configuration.private_key_path {
            Some(path) => Credential::Key(path.clone()),
            None => Credential::Password(configuration.ssh_password.clone()),
        };
        Self {
            address,
            user: configuration.ssh_user.clone(),
            credential,
        }
    }

    fn ssh_destination(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }

    fn scp_destination(&self, path: &str) -> String {
        match self.address {
            IpAddr::V4(v4) => format!("{}@{}:{}", self.user, v4, path),
            IpAddr::V6(v6) => format!("{}@[{}]:{}", self.user, v6, path),
        }
    }
}

/// 按顺序尝试各配置的凭据来打开会话
#[derive(Debug, Clone)]
pub struct SshChannel {
    config: RemoteConfig,
}

impl SshChannel {
    pub fn new(config: RemoteConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RemoteChannel for SshChannel {
    async fn connect(
        &self,
        worker: &Worker,
        configurations: &[Configuration],
    ) -> FleetResult<Box<dyn RemoteSession>> {
        for configuration in configurations {
            let session = SshSession {
                target: SshTarget::from_configuration(worker.address, configuration),
                config: self.config.clone(),
            };

            let probe_timeout = Duration::from_secs(self.config.connect_timeout_seconds + 5);
            match session.exec_with_timeout("true", probe_timeout).await {
                Ok(_) => {
                    info!(
                        "已连接到 {}，用户 {}（配置 {}）",
                        worker.address, configuration.ssh_user, configuration.id
                    );
                    return Ok(Box::new(session));
                }
                Err(e) => {
                    debug!(
                        "配置 {} 的凭据被 {} 拒绝: {}",
                        configuration.id, worker.address, e
                    );
                }
            }
        }

        warn!(
            "没有凭据能打开到 {} 的会话（已尝试 {} 个）",
            worker.address,
            configurations.len()
        );
        Err(FleetError::AuthExhausted {
            address: worker.address,
        })
    }
}

/// 到单个Worker的已认证会话
#[derive(Debug, Clone)]
pub struct SshSession {
    target: SshTarget,
    config: RemoteConfig,
}

impl SshSession {
    /// `binary` 的基础命令，密码凭据时由 sshpass 包装
    fn base_command(&self, binary: &str) -> Command {
        let mut command = match &self.target.credential {
            Credential::Password(password) => {
                let mut command = Command::new(&self.config.sshpass_binary);
                command.arg("-e").arg(binary).env("SSHPASS", password);
                command
            }
            Credential::Key(path) => {
                let mut command = Command::new(binary);
                command.arg("-i").arg(path).arg("-o").arg("BatchMode=yes");
                command
            }
        };

        command
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.config.connect_timeout_seconds))
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg("LogLevel=ERROR")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    async fn run(&self, mut command: Command, description: &str) -> FleetResult<String> {
        let output = command.output().await.map_err(|e| FleetError::ChannelUnreachable {
            address: self.target.address,
            message: format!("启动ssh客户端失败: {e}"),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        match output.status.code() {
            Some(0) => Ok(stdout),
            Some(SSH_FAILURE_EXIT) => Err(FleetError::ChannelUnreachable {
                address: self.target.address,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
            Some(code) => Err(FleetError::NonZeroExit {
                code,
                command: description.to_string(),
            }),
            None => Err(FleetError::NonZeroExit {
                code: -1,
                command: description.to_string(),
            }),
        }
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    fn address(&self) -> IpAddr {
        self.target.address
    }

    fn user(&self) -> &str {
        &self.target.user
    }

    async fn exec(&self, command: &str) -> FleetResult<String> {
        debug!("[{}] 执行: {}", self.target.address, command);

        let mut ssh = self.base_command(&self.config.ssh_binary);
        ssh.arg("-p")
            .arg(self.config.port.to_string())
            .arg(self.target.ssh_destination())
            .arg("--")
            .arg(command);

        self.run(ssh, command).await
    }

    async fn put_file(&self, local: &Path, remote: &str) -> FleetResult<()> {
        debug!("[{}] 上传 {} -> {}", self.target.address, local.display(), remote);

        let mut scp = self.base_command(&self.config.scp_binary);
        scp.arg("-P")
            .arg(self.config.port.to_string())
            .arg(local)
            .arg(self.target.scp_destination(remote));

        let description = format!("scp {} {}", local.display(), remote);
        self.run(scp, &description).await.map(|_| ())
    }

    async fn get_file(&self, remote: &str, local: &Path) -> FleetResult<()> {
        debug!("[{}] 下载 {} -> {}", self.target.address, remote, local.display());

        let mut scp = self.base_command(&self.config.scp_binary);
        scp.arg("-P")
            .arg(self.config.port.to_string())
            .arg(self.target.scp_destination(remote))
            .arg(local);

        let description = format!("scp {} {}", remote, local.display());
        self.run(scp, &description).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::models::Cidr;

    fn configuration(key: Option<&str>) -> Configuration {
        let mut configuration = Configuration::new(
            1,
            "admin",
            "lab",
            "analyst",
            "secret",
            "10.0.0.0/24".parse::<Cidr>().unwrap(),
        );
        configuration.private_key_path = key.map(str::to_string);
        configuration
    }

    #[test]
    fn test_credential_selection() {
        let address: IpAddr = "10.0.0.7".parse().unwrap();

        let target = SshTarget::from_configuration(address, &configuration(None));
        assert!(matches!(target.credential, Credential::Password(ref p) if p == "secret"));

        let target = SshTarget::from_configuration(address, &configuration(Some("/keys/id")));
        assert!(matches!(target.credential, Credential::Key(ref k) if k == "/keys/id"));
    }

    #[test]
    fn test_destinations() {
        let v4 = SshTarget::from_configuration("10.0.0.7".parse().unwrap(), &configuration(None));
        assert_eq!(v4.ssh_destination(), "analyst@10.0.0.7");
        assert_eq!(v4.scp_destination("/tmp/a"), "analyst@10.0.0.7:/tmp/a");

        let v6 = SshTarget::from_configuration("fd00::7".parse().unwrap(), &configuration(None));
        assert_eq!(v6.scp_destination("/tmp/a"), "analyst@[fd00::7]:/tmp/a");
    }

    #[tokio::test]
    async fn test_missing_client_is_unreachable() {
        let config = RemoteConfig {
            ssh_binary: "/nonexistent/ssh".to_string(),
            ..RemoteConfig::default()
        };
        let session = SshSession {
            target: SshTarget::from_configuration(
                "10.0.0.7".parse().unwrap(),
                &configuration(Some("/keys/id")),
            ),
            config,
        };

        let err = session.exec("true").await.unwrap_err();
        assert!(matches!(err, FleetError::ChannelUnreachable { .. }));
    }

    #[tokio::test]
    async fn test_connect_without_configurations() {
        let channel = SshChannel::new(RemoteConfig::default());
        let worker = Worker::discovered("10.0.0.7".parse().unwrap(), 1);

        let err = channel.connect(&worker, &[]).await.err().unwrap();
        assert!(matches!(err, FleetError::AuthExhausted { .. }));
    }
}
