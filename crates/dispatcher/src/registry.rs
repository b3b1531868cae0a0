//! Worker注册表：按配置扫描地址段发现Worker，维护Worker与配置的归属关系
//!
//! 端口开放的主机还要能用配置的凭据登录并使用 sudo，才会登记为Worker。

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use fleet_core::config::ScanConfig;
use fleet_core::models::{ConfigStatus, Configuration, ScanStatus, Worker};
use fleet_core::traits::{RemoteChannel, Repositories};
use fleet_core::{FleetError, FleetResult};
use fleet_worker::remote;

use crate::dependency_coordinator::DependencyCoordinator;
use crate::orchestrator::WorkerOrchestrator;
use crate::session::open_session;
use crate::update_queue::{RefreshPlan, UpdateQueue};

/// 判断主机是否在线
#[async_trait]
pub trait HostProbe: Send + Sync {
    async fn is_open(&self, address: IpAddr) -> bool;
}

/// 尝试在超时时间内建立TCP连接
#[derive(Debug, Clone)]
pub struct TcpProbe {
    port: u16,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }

    pub fn from_config(config: &ScanConfig) -> Self {
        Self::new(config.port, Duration::from_millis(config.timeout_ms))
    }
}

#[async_trait]
impl HostProbe for TcpProbe {
    async fn is_open(&self, address: IpAddr) -> bool {
        let target = SocketAddr::new(address, self.port);
        matches!(
            tokio::time::timeout(self.timeout, TcpStream::connect(target)).await,
            Ok(Ok(_))
        )
    }
}

/// 扫描发现一个主机后的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    Updated,
    /// ERROR 状态的Worker需要显式重试，不参与重新注册
    SkippedError,
}

pub struct WorkerRegistry {
    repos: Repositories,
    orchestrator: Arc<WorkerOrchestrator>,
    updates: Arc<UpdateQueue>,
    coordinator: Arc<DependencyCoordinator>,
    channel: Arc<dyn RemoteChannel>,
    probe: Arc<dyn HostProbe>,
    concurrency: usize,
    max_hosts: usize,
    auto_configure: bool,
}

impl WorkerRegistry {
    pub fn new(
        repos: Repositories,
        orchestrator: Arc<WorkerOrchestrator>,
        updates: Arc<UpdateQueue>,
        coordinator: Arc<DependencyCoordinator>,
        channel: Arc<dyn RemoteChannel>,
        probe: Arc<dyn HostProbe>,
        config: &ScanConfig,
    ) -> Self {
        Self {
            repos,
            orchestrator,
            updates,
            coordinator,
            channel,
            probe,
            concurrency: config.concurrency.max(1),
            max_hosts: config.max_hosts,
            auto_configure: config.auto_configure,
        }
    }

    /// 扫描配置的地址段，返回有响应的主机（按地址排序）
    pub async fn scan_configuration(&self, configuration_id: i64) -> FleetResult<Vec<IpAddr>> {
        let configuration = self
            .repos
            .configurations
            .get(configuration_id)
            .await?
            .ok_or(FleetError::ConfigurationNotFound { id: configuration_id })?;

        self.repos
            .configurations
            .set_scan_status(configuration_id, ScanStatus::Scanning)
            .await?;
        info!("开始扫描配置 {} 的地址段 {}", configuration.name, configuration.ip_range);

        let result = self.scan(&configuration).await;
        let status = match &result {
            Ok(found) => {
                info!("配置 {} 扫描完成，发现 {} 个主机", configuration.name, found.len());
                ScanStatus::Finished
            }
            Err(e) => {
                error!("配置 {} 扫描失败: {}", configuration.name, e);
                ScanStatus::Error
            }
        };
        self.repos
            .configurations
            .set_scan_status(configuration_id, status)
            .await?;

        result
    }

    async fn scan(&self, configuration: &Configuration) -> FleetResult<Vec<IpAddr>> {
        let range = &configuration.ip_range;
        let hosts: Vec<IpAddr> = range
            .hosts(self.max_hosts)?
            .into_iter()
            .filter(|addr| !addr.is_loopback() && !addr.is_unspecified())
            .collect();
        debug!("待探测主机 {} 个", hosts.len());

        let mut found: Vec<IpAddr> = stream::iter(hosts)
            .map(|address| async move { (address, self.admit(configuration, address).await) })
            .buffer_unordered(self.concurrency)
            .filter_map(|(address, admitted)| futures::future::ready(admitted.then_some(address)))
            .collect()
            .await;
        found.sort();

        for address in &found {
            let registration = self.register_discovered(configuration.id, *address).await?;
            debug!("主机 {} 注册结果: {:?}", address, registration);
            if registration != Registration::SkippedError {
                if let Err(e) = self.refresh_host(*address).await {
                    warn!("刷新Worker {} 的主机信息失败: {}", address, e);
                }
            }
        }

        for worker in self
            .repos
            .workers
            .list_by_configuration(configuration.id)
            .await?
        {
            if configuration.ip_range.contains(worker.address)
                && worker.reachable
                && found.binary_search(&worker.address).is_err()
            {
                warn!("Worker {} 在扫描中未响应，标记为不可达", worker.address);
                self.repos
                    .workers
                    .set_reachability(worker.address, false, None)
                    .await?;
            }
        }

        Ok(found)
    }

    /// 依次扫描全部配置，开启自动配置时为新发现的Worker排队首次配置
    pub async fn rescan_all(&self) -> FleetResult<Vec<IpAddr>> {
        let mut found = Vec::new();
        for configuration in self.repos.configurations.list().await? {
            match self.scan_configuration(configuration.id).await {
                Ok(hosts) => found.extend(hosts),
                Err(e) => warn!("扫描配置 {} 失败: {}", configuration.name, e),
            }
        }
        found.sort();
        found.dedup();

        if self.auto_configure {
            for address in &found {
                let worker = self.repos.workers.get_required(*address).await?;
                if worker.status != ConfigStatus::Unconfigured {
                    continue;
                }
                match self.configure(*address).await {
                    Ok(_) => info!("开始配置新Worker {}", address),
                    Err(e) => warn!("配置新Worker {} 失败: {}", address, e),
                }
            }
        }
        Ok(found)
    }

    /// 按间隔重新扫描，直到收到停止信号
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        info!("启动定期扫描，间隔 {:?}", interval);
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.rescan_all().await {
                        Ok(found) => debug!("定期扫描完成，在线Worker {} 个", found.len()),
                        Err(e) => error!("定期扫描失败: {}", e),
                    }
                }
                _ = shutdown.recv() => {
                    info!("收到停止信号，退出定期扫描");
                    break;
                }
            }
        }
    }

    /// 端口开放，且配置的凭据能登录并使用 sudo
    async fn admit(&self, configuration: &Configuration, address: IpAddr) -> bool {
        if !self.probe.is_open(address).await {
            return false;
        }

        let candidate = Worker::discovered(address, configuration.id);
        let session = match self
            .channel
            .connect(&candidate, std::slice::from_ref(configuration))
            .await
        {
            Ok(session) => session,
            Err(e) => {
                warn!(
                    "主机 {} 无法以 {} 登录，不登记: {}",
                    address, configuration.ssh_user, e
                );
                return false;
            }
        };

        match remote::check_privileges(session.as_ref()).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "主机 {} 的用户 {} 没有sudo权限，不登记: {}",
                    address, configuration.ssh_user, e
                );
                false
            }
        }
    }

    async fn refresh_host(&self, address: IpAddr) -> FleetResult<()> {
        let (_, session) = open_session(&self.repos, self.channel.as_ref(), address).await?;
        match remote::fetch_system_info(session.as_ref()).await {
            Ok(info) => {
                self.repos
                    .workers
                    .set_reachability(address, true, Some(info))
                    .await?
            }
            Err(e) => warn!("采集Worker {} 系统信息失败: {}", address, e),
        }
        self.updates.refresh_installed(session.as_ref()).await?;
        Ok(())
    }

    /// 登记扫描发现的主机
    pub async fn register_discovered(
        &self,
        configuration_id: i64,
        address: IpAddr,
    ) -> FleetResult<Registration> {
        match self.repos.workers.get(address).await? {
            None => {
                self.repos
                    .workers
                    .upsert(&Worker::discovered(address, configuration_id))
                    .await?;
                info!("发现新Worker {}", address);
                Ok(Registration::Created)
            }
            Some(worker) if worker.status == ConfigStatus::Error => {
                debug!("Worker {} 处于 ERROR 状态，跳过", address);
                Ok(Registration::SkippedError)
            }
            Some(mut worker) => {
                worker.configuration_ids.insert(configuration_id);
                worker.mark_reached();
                self.repos.workers.upsert(&worker).await?;
                Ok(Registration::Updated)
            }
        }
    }

    /// 删除配置
    ///
    /// 只属于该配置的Worker随之删除；其中任一Worker忙碌时整体失败，不做任何删除。
    /// 同时属于其他配置的Worker只解除归属。
    pub async fn delete_configuration(&self, configuration_id: i64) -> FleetResult<()> {
        if self
            .repos
            .configurations
            .get(configuration_id)
            .await?
            .is_none()
        {
            return Err(FleetError::ConfigurationNotFound { id: configuration_id });
        }

        let workers = self
            .repos
            .workers
            .list_by_configuration(configuration_id)
            .await?;
        let (exclusive, shared): (Vec<Worker>, Vec<Worker>) = workers
            .into_iter()
            .partition(|w| w.configuration_ids.len() == 1);

        for worker in &exclusive {
            if self.orchestrator.is_busy(worker.address).await {
                return Err(FleetError::WorkerBusy {
                    address: worker.address,
                });
            }
        }

        for worker in exclusive {
            let address = worker.address;
            match self.orchestrator.remove_worker(address, false).await {
                Ok(_) | Err(FleetError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
            self.updates.clear(address).await?;
            self.coordinator.release_all(address).await?;
            self.repos.dependencies.delete_record(address).await?;
            self.repos.workers.delete(address).await?;
            info!("已删除Worker {}", address);
        }

        for mut worker in shared {
            worker.configuration_ids.remove(&configuration_id);
            self.repos.workers.upsert(&worker).await?;
        }

        self.repos.configurations.delete(configuration_id).await?;
        info!("已删除配置 {}", configuration_id);
        Ok(())
    }

    /// 首次配置 UNCONFIGURED 的Worker
    pub async fn configure(&self, address: IpAddr) -> FleetResult<RefreshPlan> {
        self.repos.workers.get_required(address).await?;
        self.updates.configure(address).await
    }

    /// 重试配置失败的Worker，只允许从 ERROR 开始，并丢弃上次遗留的更新请求
    pub async fn retry(&self, address: IpAddr) -> FleetResult<RefreshPlan> {
        let worker = self.repos.workers.get_required(address).await?;
        if worker.status != ConfigStatus::Error {
            return Err(FleetError::InvalidTransition {
                from: worker.status,
                to: ConfigStatus::Configuring,
            });
        }

        self.updates.clear(address).await?;
        info!("重试配置Worker {}", address);
        self.updates.configure(address).await
    }
}
