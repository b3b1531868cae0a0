use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fleet_core::config::AppConfig;
use fleet_core::models::AnalysisTask;
use fleet_core::traits::{Assignment, DistributedLock, RemoteChannel, Repositories};
use fleet_dispatcher::{
    AnalysisSubmitter, AssignmentRunner, ChannelLauncher, DependencyCoordinator,
    GithubVersionSource, HealthPoller, LogCollector, ScriptStager, Submission, TcpProbe,
    UpdateQueue, VersionChecker, WorkerLifecycle, WorkerOrchestrator, WorkerRegistry,
};
use fleet_infrastructure::{InMemoryStore, MemoryLock, RedisLock, SqliteStore, SshChannel};
use fleet_worker::{LocalAnalysisRunner, LocalBoundedExecutor, RemotePaths};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::shutdown::ShutdownManager;

/// 批处理模式下检查分析是否结束的间隔
const COMPLETION_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// 主应用程序，持有所有长期运行的服务
pub struct Application {
    orchestrator: Arc<WorkerOrchestrator>,
    runner: Arc<AssignmentRunner>,
    assignments: Mutex<Option<mpsc::UnboundedReceiver<Assignment>>>,
    poller: Arc<HealthPoller>,
    registry: Arc<WorkerRegistry>,
    submitter: AnalysisSubmitter,
    scan_interval: Option<Duration>,
    version_checker: Option<Arc<VersionChecker>>,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        let repos = create_repositories(&config).await?;
        let lock = create_lock(&config).await?;

        let channel: Arc<dyn RemoteChannel> = Arc::new(SshChannel::new(config.remote.clone()));
        let paths = RemotePaths::from_config(&config.remote);

        let (launcher, assignments) = ChannelLauncher::new();
        let orchestrator = Arc::new(WorkerOrchestrator::from_repositories(
            &repos,
            Arc::new(launcher),
        ));
        let runner = Arc::new(AssignmentRunner::new(
            Arc::clone(&orchestrator),
            Arc::clone(&channel),
            repos.clone(),
            paths.clone(),
        ));

        let coordinator = Arc::new(DependencyCoordinator::new(
            Arc::clone(&repos.dependencies),
            Arc::clone(&lock),
            Arc::new(ScriptStager::from_config(&config.updates)),
            &config.redis,
        ));
        let updates = Arc::new(UpdateQueue::new(
            repos.clone(),
            Arc::clone(&orchestrator),
            Arc::clone(&coordinator),
            Arc::clone(&channel),
            paths.clone(),
            &config.updates,
        ));
        let lifecycle = Arc::new(WorkerLifecycle::new(
            repos.clone(),
            Arc::clone(&orchestrator),
            Arc::clone(&updates),
            Arc::clone(&channel),
            paths.clone(),
        ));

        let registry = Arc::new(WorkerRegistry::new(
            repos.clone(),
            Arc::clone(&orchestrator),
            updates,
            coordinator,
            Arc::clone(&channel),
            Arc::new(TcpProbe::from_config(&config.scan)),
            &config.scan,
        ));
        let submitter = AnalysisSubmitter::new(
            Arc::clone(&orchestrator),
            Arc::clone(&repos.workers),
            Arc::new(LocalBoundedExecutor::from_config(&config.executor)),
            LocalAnalysisRunner::from_config(&config.local),
        );
        let scan_interval = (config.scan.interval_seconds > 0)
            .then(|| Duration::from_secs(config.scan.interval_seconds));

        let results_dir = Path::new(&config.local.work_dir).join("results");
        let poller = Arc::new(
            HealthPoller::new(
                repos.clone(),
                Arc::clone(&channel),
                Arc::clone(&orchestrator),
                lifecycle,
                lock,
                paths.clone(),
                &config.health,
                config.redis.lock_ttl(),
            )
            .with_hook(Arc::new(LogCollector::new(results_dir, paths))),
        );

        let version_checker = if config.version_check.enabled {
            let source = GithubVersionSource::new(config.version_check.clone())
                .context("创建版本检查客户端失败")?;
            Some(Arc::new(VersionChecker::new(
                Arc::new(source),
                repos.clone(),
                Duration::from_secs(config.version_check.interval_seconds),
            )))
        } else {
            None
        };

        Ok(Self {
            orchestrator,
            runner,
            assignments: Mutex::new(Some(assignments)),
            poller,
            registry,
            submitter,
            scan_interval,
            version_checker,
        })
    }

    /// 恢复编排器状态并运行所有后台循环直到收到停止信号
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let loops = self.start(shutdown_rx).await?;
        join_loops(loops).await;
        Ok(())
    }

    /// 批处理：启动后台循环，提交一个分析，等它结束后停止所有循环
    pub async fn run_task(&self, task: AnalysisTask, shutdown: &ShutdownManager) -> Result<()> {
        let loops = self.start(shutdown.subscribe().await).await?;
        let analysis_id = task.analysis_id;

        let outcome = match self.submitter.submit(task).await.context("提交分析失败")? {
            Submission::Local(handle) => match handle.join().await {
                Some(log) => {
                    info!("本地分析 {} 完成，输出: {}", analysis_id, log.display());
                    Ok(())
                }
                None => Err(anyhow::anyhow!("本地分析 {analysis_id} 执行失败")),
            },
            Submission::Assigned(address) => {
                info!("分析 {} 已分配给Worker {}", analysis_id, address);
                self.wait_until_done(analysis_id).await;
                Ok(())
            }
            Submission::Queued(position) => {
                info!("分析 {} 排在队列第 {} 位", analysis_id, position);
                self.wait_until_done(analysis_id).await;
                Ok(())
            }
        };

        shutdown.shutdown().await;
        join_loops(loops).await;
        outcome
    }

    /// 单次扫描一个配置，只登记发现的Worker
    pub async fn scan(&self, configuration_id: i64) -> Result<Vec<IpAddr>> {
        self.registry
            .scan_configuration(configuration_id)
            .await
            .with_context(|| format!("扫描配置 {configuration_id} 失败"))
    }

    async fn start(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<Vec<JoinHandle<()>>> {
        let Some(assignments) = self.assignments.lock().await.take() else {
            return Err(anyhow::anyhow!("应用已经在运行"));
        };

        let mut loops = vec![tokio::spawn(
            Arc::clone(&self.runner).run(assignments, shutdown_rx.resubscribe()),
        )];

        let recovered = self
            .orchestrator
            .recover()
            .await
            .context("恢复编排器状态失败")?;
        info!(
            "编排器就绪: 空闲 {}，忙碌 {}，排队 {}",
            recovered.free_workers.len(),
            recovered.busy_workers.len(),
            recovered.tasks.len()
        );

        loops.push(tokio::spawn(
            Arc::clone(&self.poller).run(shutdown_rx.resubscribe()),
        ));
        if let Some(interval) = self.scan_interval {
            loops.push(tokio::spawn(
                Arc::clone(&self.registry).run(interval, shutdown_rx.resubscribe()),
            ));
        }
        if let Some(checker) = &self.version_checker {
            loops.push(tokio::spawn(
                Arc::clone(checker).run(shutdown_rx.resubscribe()),
            ));
        }
        Ok(loops)
    }

    /// 任务既不在忙碌Worker上也不在等待队列中即视为结束
    async fn wait_until_done(&self, analysis_id: Uuid) {
        loop {
            let state = self.orchestrator.snapshot().await;
            let pending = state
                .busy_workers
                .values()
                .chain(state.tasks.iter())
                .any(|task| task.analysis_id == analysis_id);
            if !pending {
                info!("分析 {} 已结束", analysis_id);
                return;
            }
            tokio::time::sleep(COMPLETION_CHECK_INTERVAL).await;
        }
    }
}

async fn join_loops(loops: Vec<JoinHandle<()>>) {
    for handle in futures::future::join_all(loops).await {
        if let Err(e) = handle {
            warn!("后台任务异常退出: {e}");
        }
    }
    info!("所有后台任务已停止");
}

async fn create_repositories(config: &AppConfig) -> Result<Repositories> {
    match config.database.backend.as_str() {
        "memory" => {
            warn!("使用内存存储，进程退出后状态将丢失");
            Ok(InMemoryStore::new().repositories())
        }
        _ => {
            let store = SqliteStore::connect(&config.database)
                .await
                .with_context(|| format!("连接数据库失败: {}", config.database.url))?;
            Ok(store.repositories())
        }
    }
}

async fn create_lock(config: &AppConfig) -> Result<Arc<dyn DistributedLock>> {
    if config.redis.enabled {
        let lock = RedisLock::connect(&config.redis)
            .await
            .with_context(|| format!("连接Redis失败: {}", config.redis.url))?;
        info!("使用Redis分布式锁: {}", config.redis.url);
        Ok(Arc::new(lock))
    } else {
        info!("Redis未启用，使用进程内锁");
        Ok(Arc::new(MemoryLock::new()))
    }
}
