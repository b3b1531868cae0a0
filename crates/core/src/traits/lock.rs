use std::time::Duration;

use async_trait::async_trait;

use crate::errors::FleetResult;

/// 跨进程的租约式分布式锁
///
/// 持有者必须在TTL内续约，否则锁自动过期，避免持有者崩溃后其他进程死锁。
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// 尝试获取锁，成功时返回持有令牌
    async fn try_acquire(&self, key: &str, ttl: Duration) -> FleetResult<Option<String>>;

    /// 令牌仍匹配时延长租约
    async fn renew(&self, key: &str, token: &str, ttl: Duration) -> FleetResult<bool>;

    /// 令牌仍匹配时释放锁
    async fn release(&self, key: &str, token: &str) -> FleetResult<bool>;

    async fn is_locked(&self, key: &str) -> FleetResult<bool>;
}
