use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use fleet_core::traits::DistributedLock;
use fleet_core::{lock_token, FleetError, FleetResult};

/// 进程内锁，过期语义与Redis锁相同
///
/// 只适用于单个进程访问共享依赖缓存的部署。
#[derive(Debug, Clone, Default)]
pub struct MemoryLock {
    entries: Arc<Mutex<HashMap<String, (String, Instant)>>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> FleetResult<std::sync::MutexGuard<'_, HashMap<String, (String, Instant)>>> {
        self.entries
            .lock()
            .map_err(|_| FleetError::Lock("内存锁已中毒".to_string()))
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> FleetResult<Option<String>> {
        let mut entries = self.entries()?;
        let now = Instant::now();

        if let Some((_, expires_at)) = entries.get(key) {
            if *expires_at > now {
                return Ok(None);
            }
        }

        let token = lock_token();
        entries.insert(key.to_string(), (token.clone(), now + ttl));
        Ok(Some(token))
    }

    async fn renew(&self, key: &str, token: &str, ttl: Duration) -> FleetResult<bool> {
        let mut entries = self.entries()?;
        let now = Instant::now();

        match entries.get_mut(key) {
            Some((held, expires_at)) if held == token && *expires_at > now => {
                *expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, token: &str) -> FleetResult<bool> {
        let mut entries = self.entries()?;

        match entries.get(key) {
            Some((held, expires_at)) if held == token => {
                let live = *expires_at > Instant::now();
                entries.remove(key);
                Ok(live)
            }
            _ => Ok(false),
        }
    }

    async fn is_locked(&self, key: &str) -> FleetResult<bool> {
        let entries = self.entries()?;
        Ok(entries
            .get(key)
            .map(|(_, expires_at)| *expires_at > Instant::now())
            .unwrap_or(false))
    }
}
