use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tokio::time::sleep;
use tracing::{debug, error, warn};

use fleet_core::config::RedisConfig;
use fleet_core::traits::DistributedLock;
use fleet_core::{lock_token, FleetError, FleetResult};

const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const RENEW_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Redis上的租约锁：`SET key token NX PX ttl` 获取，
/// 令牌匹配时删除以释放，令牌匹配时 PEXPIRE 以续约。
#[derive(Clone)]
pub struct RedisLock {
    connection: ConnectionManager,
    key_prefix: String,
}

impl RedisLock {
    pub async fn connect(config: &RedisConfig) -> FleetResult<Self> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| FleetError::Redis(format!("创建Redis客户端失败: {e}")))?;

        let mut last_error = None;
        for attempt in 1..=CONNECT_ATTEMPTS {
            match ConnectionManager::new(client.clone()).await {
                Ok(connection) => {
                    debug!("已连接到Redis: {}", config.url);
                    return Ok(Self {
                        connection,
                        key_prefix: config.key_prefix.clone(),
                    });
                }
                Err(e) => {
                    warn!(
                        "连接Redis失败 (第 {}/{} 次): {}",
                        attempt, CONNECT_ATTEMPTS, e
                    );
                    last_error = Some(e);
                    if attempt < CONNECT_ATTEMPTS {
                        sleep(CONNECT_RETRY_DELAY).await;
                    }
                }
            }
        }

        let message = format!(
            "连接Redis失败，已重试 {} 次，最后错误: {}",
            CONNECT_ATTEMPTS,
            last_error.map_or("未知".to_string(), |e| e.to_string())
        );
        error!("{}", message);
        Err(FleetError::Redis(message))
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:lock:{}", self.key_prefix, key)
    }

    fn ttl_millis(ttl: Duration) -> u64 {
        ttl.as_millis().max(1) as u64
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> FleetResult<Option<String>> {
        let token = lock_token();
        let mut connection = self.connection.clone();

        let reply: Option<String> = redis::cmd("SET")
            .arg(self.full_key(key))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(Self::ttl_millis(ttl))
            .query_async(&mut connection)
            .await
            .map_err(|e| FleetError::Redis(format!("Redis SET NX 失败: {e}")))?;

        Ok(reply.map(|_| token))
    }

    async fn renew(&self, key: &str, token: &str, ttl: Duration) -> FleetResult<bool> {
        let mut connection = self.connection.clone();
        let renewed: i64 = Script::new(RENEW_SCRIPT)
            .key(self.full_key(key))
            .arg(token)
            .arg(Self::ttl_millis(ttl))
            .invoke_async(&mut connection)
            .await
            .map_err(|e| FleetError::Redis(format!("Redis锁续约失败: {e}")))?;

        Ok(renewed == 1)
    }

    async fn release(&self, key: &str, token: &str) -> FleetResult<bool> {
        let mut connection = self.connection.clone();
        let deleted: i64 = Script::new(RELEASE_SCRIPT)
            .key(self.full_key(key))
            .arg(token)
            .invoke_async(&mut connection)
            .await
            .map_err(|e| FleetError::Redis(format!("Redis锁释放失败: {e}")))?;

        Ok(deleted == 1)
    }

    async fn is_locked(&self, key: &str) -> FleetResult<bool> {
        let mut connection = self.connection.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(self.full_key(key))
            .query_async(&mut connection)
            .await
            .map_err(|e| FleetError::Redis(format!("Redis EXISTS 失败: {e}")))?;

        Ok(exists)
    }
}
