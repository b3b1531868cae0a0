//! 依赖协调器
//!
//! 每种依赖一份共享缓存状态，读写都在以依赖类型为键的分布式锁内完成，
//! 保证多个进程不会同时重复准备同一个依赖。耗时的准备过程不持有状态锁，
//! 而是以 IN_PROGRESS 状态占位，并在整个准备期间持有续约中的准备锁。
//! IN_PROGRESS 但准备锁已失效，说明准备者已崩溃，状态视为 UNAVAILABLE。

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tracing::{debug, error, info, warn};

use fleet_core::config::RedisConfig;
use fleet_core::models::{Availability, DependencyKind, DependencyState};
use fleet_core::traits::{DependencyRepository, DependencyStager, DistributedLock};
use fleet_core::{FleetError, FleetResult, LockLease};

pub fn lock_key(kind: DependencyKind) -> String {
    format!("dependency:{}", kind.folder_name())
}

/// 准备过程期间持有的锁
pub fn staging_key(kind: DependencyKind) -> String {
    format!("staging:{}", kind.folder_name())
}

pub struct DependencyCoordinator {
    repo: Arc<dyn DependencyRepository>,
    lock: Arc<dyn DistributedLock>,
    stager: Arc<dyn DependencyStager>,
    lock_ttl: Duration,
    retry_interval: Duration,
}

impl DependencyCoordinator {
    pub fn new(
        repo: Arc<dyn DependencyRepository>,
        lock: Arc<dyn DistributedLock>,
        stager: Arc<dyn DependencyStager>,
        config: &RedisConfig,
    ) -> Self {
        Self {
            repo,
            lock,
            stager,
            lock_ttl: config.lock_ttl(),
            retry_interval: config.lock_retry_interval(),
        }
    }

    async fn lease(&self, kind: DependencyKind) -> FleetResult<LockLease> {
        LockLease::acquire(
            Arc::clone(&self.lock),
            &lock_key(kind),
            self.lock_ttl,
            self.retry_interval,
        )
        .await
    }

    /// 登记Worker使用某个版本的依赖，必要时由本次调用负责准备缓存
    ///
    /// 缓存已满足请求时直接登记返回；缓存不可用且无人使用时，本次调用将其置为
    /// IN_PROGRESS 并执行准备，完成后回到循环开头再登记。其余情况按重试间隔等待。
    pub async fn use_dependency(
        &self,
        kind: DependencyKind,
        version: &str,
        worker: IpAddr,
    ) -> FleetResult<()> {
        loop {
            let lease = self.lease(kind).await?;
            let mut state = self.repo.get_state(kind).await?;

            if state.used_by.contains(&worker) {
                lease.release().await?;
                return Err(FleetError::AlreadyUsing { kind, worker });
            }

            let cached = self.repo.get_cached().await?;
            let abandoned = state.availability == Availability::InProgress
                && !self.lock.is_locked(&staging_key(kind)).await?;
            match state.availability {
                Availability::Available if cached.satisfies(kind, version) => {
                    state.used_by.insert(worker);
                    self.repo.save_state(&state).await?;
                    lease.release().await?;
                    debug!("Worker {} 开始使用依赖 {} 版本 {}", worker, kind, version);
                    return Ok(());
                }
                Availability::Available if !state.in_use() => {
                    info!(
                        "依赖 {} 的缓存版本 {:?} 不满足 {}，重新准备",
                        kind,
                        cached.current(kind),
                        version
                    );
                    state.availability = Availability::Unavailable;
                    self.repo.save_state(&state).await?;
                    lease.release().await?;
                }
                Availability::Unavailable if !state.in_use() => {
                    let Some(staging) = LockLease::try_acquire(
                        Arc::clone(&self.lock),
                        &staging_key(kind),
                        self.lock_ttl,
                    )
                    .await?
                    else {
                        lease.release().await?;
                        tokio::time::sleep(self.retry_interval).await;
                        continue;
                    };

                    state.availability = Availability::InProgress;
                    self.repo.save_state(&state).await?;
                    lease.release().await?;

                    self.stage(kind, version, staging).await?;
                }
                Availability::InProgress if abandoned => {
                    warn!("依赖 {} 处于 IN_PROGRESS 但准备者已失联，重置为不可用", kind);
                    state.availability = Availability::Unavailable;
                    self.repo.save_state(&state).await?;
                    lease.release().await?;
                }
                _ => {
                    lease.release().await?;
                    debug!(
                        "依赖 {} 暂不可用 ({:?}, 使用者 {})，等待重试",
                        kind,
                        state.availability,
                        state.used_by.len()
                    );
                    tokio::time::sleep(self.retry_interval).await;
                }
            }
        }
    }

    /// 准备锁在状态写回后才释放
    async fn stage(
        &self,
        kind: DependencyKind,
        version: &str,
        staging: LockLease,
    ) -> FleetResult<()> {
        counter!("fleet_dependency_stage_total").increment(1);
        let result = self.stager.stage(kind, version).await;

        let lease = self.lease(kind).await?;
        let mut state = self.repo.get_state(kind).await?;
        match &result {
            Ok(()) => {
                let mut cached = self.repo.get_cached().await?;
                cached.set(kind, version);
                self.repo.save_cached(&cached).await?;
                state.availability = Availability::Available;
                info!("依赖 {} 版本 {} 已缓存", kind, version);
            }
            Err(e) => {
                state.availability = Availability::Unavailable;
                error!("准备依赖 {} 版本 {} 失败: {}", kind, version, e);
            }
        }
        self.repo.save_state(&state).await?;
        lease.release().await?;
        staging.release().await?;

        result
    }

    /// 取消Worker对依赖的使用登记，未登记时除非 `force` 否则返回 `NotUsing`
    pub async fn release_dependency(
        &self,
        kind: DependencyKind,
        worker: IpAddr,
        force: bool,
    ) -> FleetResult<()> {
        let lease = self.lease(kind).await?;
        let mut state = self.repo.get_state(kind).await?;

        let removed = state.used_by.remove(&worker);
        if removed {
            self.repo.save_state(&state).await?;
        }
        lease.release().await?;

        if !removed && !force {
            return Err(FleetError::NotUsing { kind, worker });
        }
        debug!("Worker {} 停止使用依赖 {}", worker, kind);
        Ok(())
    }

    /// 强制清除Worker对所有依赖的使用登记
    pub async fn release_all(&self, worker: IpAddr) -> FleetResult<()> {
        for kind in DependencyKind::ALL {
            self.release_dependency(kind, worker, true).await?;
        }
        Ok(())
    }

    /// 等待无人使用后设置可用性，用于外部刷新使缓存失效的场景
    pub async fn set_availability(&self, kind: DependencyKind, available: bool) -> FleetResult<()> {
        loop {
            let lease = self.lease(kind).await?;
            let mut state = self.repo.get_state(kind).await?;

            if state.in_use() {
                lease.release().await?;
                tokio::time::sleep(self.retry_interval).await;
                continue;
            }

            state.availability = if available {
                Availability::Available
            } else {
                Availability::Unavailable
            };
            self.repo.save_state(&state).await?;
            lease.release().await?;

            info!("依赖 {} 可用性设置为 {:?}", kind, state.availability);
            return Ok(());
        }
    }

    /// 管理操作：清空所有使用登记并将全部依赖置为不可用
    pub async fn reset_states(&self) -> FleetResult<()> {
        for kind in DependencyKind::ALL {
            let lease = self.lease(kind).await?;
            self.repo.save_state(&DependencyState::new(kind)).await?;
            lease.release().await?;
        }
        info!("已重置全部依赖状态");
        Ok(())
    }

    pub async fn states(&self) -> FleetResult<Vec<DependencyState>> {
        let mut states = Vec::with_capacity(DependencyKind::ALL.len());
        for kind in DependencyKind::ALL {
            states.push(self.repo.get_state(kind).await?);
        }
        Ok(states)
    }
}
