use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use metrics::counter;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use fleet_core::config::ExecutorConfig;
use fleet_core::{FleetError, FleetResult};

/// 本地有界执行器
///
/// 最多 `W` 个任务同时运行，另有 `Q` 个排队名额。准入许可池大小为 `W + Q`，
/// 提交时非阻塞地获取许可，失败立即返回 `AdmissionRejected`。
/// 许可随任务结束（成功、失败、panic或被中止）恰好释放一次。
pub struct LocalBoundedExecutor {
    max_workers: usize,
    max_queue: usize,
    admission: Arc<Semaphore>,
    run_slots: Arc<Semaphore>,
}

/// 已提交任务的句柄，任务失败或panic时结果为 `None`
pub struct JobHandle<T> {
    name: String,
    handle: JoinHandle<Option<T>>,
}

impl<T> JobHandle<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    /// 等待任务结束
    pub async fn join(self) -> Option<T> {
        self.handle.await.ok().flatten()
    }
}

impl LocalBoundedExecutor {
    pub fn new(max_workers: usize, max_queue: usize) -> Self {
        info!("创建本地执行器: 并发数={}, 排队容量={}", max_workers, max_queue);
        Self {
            max_workers,
            max_queue,
            admission: Arc::new(Semaphore::new(max_workers + max_queue)),
            run_slots: Arc::new(Semaphore::new(max_workers)),
        }
    }

    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self::new(config.max_workers, config.max_queue)
    }

    pub fn capacity(&self) -> usize {
        self.max_workers + self.max_queue
    }

    /// 已准入（运行中或排队中）的任务数
    pub fn in_flight(&self) -> usize {
        self.capacity()
            .saturating_sub(self.admission.available_permits())
    }

    /// 拒绝后续所有提交，已准入的任务继续执行
    pub fn close(&self) {
        self.admission.close();
    }

    /// 提交异步任务
    pub fn submit<F, T>(&self, name: &str, job: F) -> FleetResult<JobHandle<T>>
    where
        F: Future<Output = FleetResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let permit = match Arc::clone(&self.admission).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!("本地执行器已满，拒绝任务 {}", name);
                counter!("fleet_executor_rejected_total").increment(1);
                return Err(FleetError::AdmissionRejected);
            }
        };

        let run_slots = Arc::clone(&self.run_slots);
        let job_name = name.to_string();
        let handle = tokio::spawn(async move {
            // 准入许可在任务结束时随作用域释放
            let _permit = permit;
            let _slot = run_slots.acquire_owned().await.ok()?;

            debug!("开始执行本地任务 {}", job_name);
            match AssertUnwindSafe(job).catch_unwind().await {
                Ok(Ok(value)) => {
                    debug!("本地任务 {} 执行完成", job_name);
                    Some(value)
                }
                Ok(Err(e)) => {
                    error!("本地任务 {} 执行失败: {}", job_name, e);
                    None
                }
                Err(_) => {
                    error!("本地任务 {} 发生panic", job_name);
                    None
                }
            }
        });

        Ok(JobHandle {
            name: name.to_string(),
            handle,
        })
    }

    /// 提交阻塞任务，在阻塞线程池中执行
    pub fn submit_blocking<F, T>(&self, name: &str, job: F) -> FleetResult<JobHandle<T>>
    where
        F: FnOnce() -> FleetResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let job_name = name.to_string();
        self.submit(name, async move {
            tokio::task::spawn_blocking(job)
                .await
                .map_err(|e| FleetError::Internal(format!("阻塞任务 {job_name} 异常退出: {e}")))?
        })
    }
}
