use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::FleetResult;
use crate::traits::DistributedLock;

/// 生成锁持有令牌: `主机名:进程ID:随机UUID`
pub fn lock_token() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{}:{}:{}", host, std::process::id(), Uuid::new_v4())
}

/// 持有中的锁租约
///
/// 后台任务每隔 TTL/3 续约一次。显式 `release` 会删除锁；
/// 若租约被直接丢弃（例如错误提前返回），会在后台尽力释放。
pub struct LockLease {
    lock: Arc<dyn DistributedLock>,
    key: String,
    token: String,
    renewal: Option<JoinHandle<()>>,
    released: bool,
}

impl LockLease {
    /// 尝试获取一次，不等待
    pub async fn try_acquire(
        lock: Arc<dyn DistributedLock>,
        key: &str,
        ttl: Duration,
    ) -> FleetResult<Option<Self>> {
        match lock.try_acquire(key, ttl).await? {
            Some(token) => Ok(Some(Self::start(lock, key, token, ttl))),
            None => Ok(None),
        }
    }

    /// 按重试间隔等待直到获取成功
    pub async fn acquire(
        lock: Arc<dyn DistributedLock>,
        key: &str,
        ttl: Duration,
        retry_interval: Duration,
    ) -> FleetResult<Self> {
        loop {
            if let Some(lease) = Self::try_acquire(Arc::clone(&lock), key, ttl).await? {
                return Ok(lease);
            }
            debug!("锁 {} 已被占用，{:?} 后重试", key, retry_interval);
            tokio::time::sleep(retry_interval).await;
        }
    }

    fn start(lock: Arc<dyn DistributedLock>, key: &str, token: String, ttl: Duration) -> Self {
        let interval = (ttl / 3).max(Duration::from_millis(10));
        let renewal = {
            let lock = Arc::clone(&lock);
            let key = key.to_string();
            let token = token.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    match lock.renew(&key, &token, ttl).await {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!("锁 {} 续约失败，租约已丢失", key);
                            break;
                        }
                        Err(e) => warn!("锁 {} 续约出错: {}", key, e),
                    }
                }
            })
        };

        Self {
            lock,
            key: key.to_string(),
            token,
            renewal: Some(renewal),
            released: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// 停止续约并释放锁
    pub async fn release(mut self) -> FleetResult<()> {
        if let Some(renewal) = self.renewal.take() {
            renewal.abort();
        }
        self.released = true;

        if !self.lock.release(&self.key, &self.token).await? {
            warn!("锁 {} 在释放前已过期", self.key);
        }
        Ok(())
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        if let Some(renewal) = self.renewal.take() {
            renewal.abort();
        }
        if self.released {
            return;
        }

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let lock = Arc::clone(&self.lock);
            let key = std::mem::take(&mut self.key);
            let token = std::mem::take(&mut self.token);
            handle.spawn(async move {
                if let Err(e) = lock.release(&key, &token).await {
                    warn!("后台释放锁 {} 失败: {}", key, e);
                }
            });
        }
    }
}
