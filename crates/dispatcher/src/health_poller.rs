//! 健康轮询
//!
//! Worker端不主动上报任何状态，由这里按固定间隔拉取：刷新可达性和系统信息，
//! 探测已分配分析是否结束，并回收已结束分析的Worker。状态最多滞后一个轮询间隔。
//! 回收（含待处理的依赖更新）在独立任务中进行，不占用轮询本身。
//! 通道故障只把Worker标记为不可达，不改变其配置状态和已分配的任务；
//! 不可达超过阈值后才移出编排器并重新提交其任务。

use std::collections::HashSet;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use chrono::Utc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use fleet_core::config::HealthConfig;
use fleet_core::models::{AnalysisStatus, Worker};
use fleet_core::traits::{DistributedLock, RemoteChannel, Repositories};
use fleet_core::{FleetError, FleetResult, LockLease};
use fleet_worker::remote::{self, RemotePaths};

use crate::lifecycle::WorkerLifecycle;
use crate::orchestrator::WorkerOrchestrator;
use crate::results::CompletionHook;
use crate::session::open_session;

/// 多个进程同时运行时只允许一个执行轮询
pub const POLL_LOCK_KEY: &str = "health:poll";

/// 单次轮询的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollReport {
    /// 其他进程持有轮询锁，本次跳过
    pub skipped: bool,
    pub polled: usize,
    pub unreachable: Vec<IpAddr>,
    /// 分析已结束、回收任务已启动的Worker
    pub finished: Vec<IpAddr>,
    pub reconnected: Vec<IpAddr>,
    /// 不可达超时、已移出编排器的Worker
    pub evicted: Vec<IpAddr>,
}

#[derive(Debug, Default)]
struct WorkerOutcome {
    reachable: bool,
    finished: bool,
    reconnected: bool,
    evicted: bool,
}

pub struct HealthPoller {
    repos: Repositories,
    channel: Arc<dyn RemoteChannel>,
    orchestrator: Arc<WorkerOrchestrator>,
    lifecycle: Arc<WorkerLifecycle>,
    lock: Arc<dyn DistributedLock>,
    paths: RemotePaths,
    hook: Option<Arc<dyn CompletionHook>>,
    interval: Duration,
    probe_timeout: Duration,
    unreachable_timeout: Duration,
    lock_ttl: Duration,
    reclaiming: Arc<Mutex<HashSet<IpAddr>>>,
    running: RwLock<bool>,
}

impl HealthPoller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repos: Repositories,
        channel: Arc<dyn RemoteChannel>,
        orchestrator: Arc<WorkerOrchestrator>,
        lifecycle: Arc<WorkerLifecycle>,
        lock: Arc<dyn DistributedLock>,
        paths: RemotePaths,
        config: &HealthConfig,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            repos,
            channel,
            orchestrator,
            lifecycle,
            lock,
            paths,
            hook: None,
            interval: config.poll_interval(),
            probe_timeout: config.probe_timeout(),
            unreachable_timeout: config.unreachable_timeout(),
            lock_ttl,
            reclaiming: Arc::new(Mutex::new(HashSet::new())),
            running: RwLock::new(false),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn CompletionHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Worker的回收任务是否仍在进行
    pub async fn is_reclaiming(&self, address: IpAddr) -> bool {
        self.reclaiming.lock().await.contains(&address)
    }

    /// 按轮询间隔循环执行，直到收到停止信号
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        *self.running.write().await = true;
        info!("启动健康轮询，间隔 {:?}", self.interval);

        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(report) if !report.skipped => {
                            debug!(
                                "健康轮询完成: 共 {}，不可达 {}，回收 {}",
                                report.polled,
                                report.unreachable.len(),
                                report.finished.len()
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!("健康轮询出错: {}", e),
                    }
                }
                _ = shutdown.recv() => {
                    info!("收到停止信号，退出健康轮询");
                    break;
                }
            }
        }

        *self.running.write().await = false;
    }

    /// 轮询全部Worker一次
    pub async fn poll_once(&self) -> FleetResult<PollReport> {
        let Some(lease) =
            LockLease::try_acquire(Arc::clone(&self.lock), POLL_LOCK_KEY, self.lock_ttl).await?
        else {
            debug!("其他进程正在执行健康轮询，本次跳过");
            return Ok(PollReport {
                skipped: true,
                ..PollReport::default()
            });
        };

        let workers = self.repos.workers.list().await?;
        let addresses: Vec<IpAddr> = workers.iter().map(|w| w.address).collect();
        let outcomes = join_all(workers.into_iter().map(|w| self.poll_worker(w))).await;
        lease.release().await?;

        let mut report = PollReport {
            polled: addresses.len(),
            ..PollReport::default()
        };
        for (address, outcome) in addresses.into_iter().zip(outcomes) {
            if !outcome.reachable {
                report.unreachable.push(address);
            }
            if outcome.finished {
                report.finished.push(address);
            }
            if outcome.reconnected {
                report.reconnected.push(address);
            }
            if outcome.evicted {
                report.evicted.push(address);
            }
        }
        Ok(report)
    }

    async fn within<T>(
        &self,
        command: &str,
        future: impl Future<Output = FleetResult<T>>,
    ) -> FleetResult<T> {
        match tokio::time::timeout(self.probe_timeout, future).await {
            Ok(result) => result,
            Err(_) => Err(FleetError::CommandTimeout {
                command: command.to_string(),
            }),
        }
    }

    async fn poll_worker(&self, worker: Worker) -> WorkerOutcome {
        let address = worker.address;
        let mut outcome = WorkerOutcome::default();

        let connected = self
            .within(
                "connect",
                open_session(&self.repos, self.channel.as_ref(), address),
            )
            .await;
        let session = match connected {
            Ok((_, session)) => session,
            Err(e) => {
                outcome.evicted = self.mark_unreachable(&worker, &e).await;
                return outcome;
            }
        };

        let system_info = match self
            .within("system info", remote::fetch_system_info(session.as_ref()))
            .await
        {
            Ok(info) => Some(info),
            Err(e) if e.is_channel_failure() => {
                outcome.evicted = self.mark_unreachable(&worker, &e).await;
                return outcome;
            }
            Err(e) => {
                warn!("采集Worker {} 系统信息失败: {}", address, e);
                None
            }
        };
        outcome.reachable = true;
        if let Err(e) = self
            .repos
            .workers
            .set_reachability(address, true, system_info)
            .await
        {
            warn!("更新Worker {} 可达性失败: {}", address, e);
        }

        if !worker.reachable
            && worker.is_configured()
            && !self.orchestrator.is_tracked(address).await
        {
            match self.lifecycle.reconnect(address).await {
                Ok(()) => outcome.reconnected = true,
                Err(e) => warn!("Worker {} 重新接入失败: {}", address, e),
            }
            return outcome;
        }

        let Some(analysis_id) = worker.analysis_id else {
            return outcome;
        };
        if worker.analysis_pid.is_none() && self.orchestrator.is_busy(address).await {
            debug!("Worker {} 的分析 {} 仍在启动", address, analysis_id);
            return outcome;
        }

        let probed = self
            .within(
                "probe analysis",
                remote::probe_analysis(session.as_ref(), worker.analysis_pid, &self.paths),
            )
            .await;
        match probed {
            Ok(AnalysisStatus::Running) => {
                debug!("Worker {} 的分析 {} 仍在运行", address, analysis_id);
            }
            Ok(AnalysisStatus::Unassigned) => {
                if !self.reclaiming.lock().await.insert(address) {
                    debug!("Worker {} 的回收仍在进行", address);
                    return outcome;
                }
                info!("Worker {} 的分析 {} 已结束", address, analysis_id);

                let hook = self.hook.clone();
                let lifecycle = Arc::clone(&self.lifecycle);
                let reclaiming = Arc::clone(&self.reclaiming);
                tokio::spawn(async move {
                    if let Some(hook) = hook {
                        if let Err(e) = hook.analysis_finished(session.as_ref(), analysis_id).await
                        {
                            warn!("处理分析 {} 的结束回调失败: {}", analysis_id, e);
                        }
                    }
                    drop(session);

                    if let Err(e) = lifecycle.finish_analysis(address).await {
                        error!("回收Worker {} 失败: {}", address, e);
                    }
                    reclaiming.lock().await.remove(&address);
                });
                outcome.finished = true;
            }
            Err(e) if e.is_channel_failure() => {
                outcome.evicted = self.mark_unreachable(&worker, &e).await;
                outcome.reachable = false;
            }
            Err(e) => {
                debug!("探测Worker {} 的分析状态失败: {}", address, e);
            }
        }
        outcome
    }

    /// 标记不可达，超过阈值时移出编排器，返回是否发生了移出
    async fn mark_unreachable(&self, worker: &Worker, cause: &FleetError) -> bool {
        let address = worker.address;
        if !cause.is_channel_failure() {
            warn!("轮询Worker {} 失败: {}", address, cause);
        } else {
            debug!("Worker {} 不可达: {}", address, cause);
        }
        if let Err(e) = self
            .repos
            .workers
            .set_reachability(address, false, None)
            .await
        {
            warn!("标记Worker {} 不可达失败: {}", address, e);
        }

        let silent_for = worker
            .last_reached
            .and_then(|at| (Utc::now() - at).to_std().ok())
            .unwrap_or(Duration::MAX);
        if silent_for < self.unreachable_timeout || !self.orchestrator.is_tracked(address).await {
            return false;
        }

        warn!(
            "Worker {} 已超过 {:?} 不可达，移出编排器",
            address, self.unreachable_timeout
        );
        match self.lifecycle.evict(address).await {
            Ok(()) => true,
            Err(e) => {
                error!("移出不可达Worker {} 失败: {}", address, e);
                false
            }
        }
    }
}
