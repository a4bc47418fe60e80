use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, Client as RedisClient};

use super::{KeyValueStore, StoreError};

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// EX 按整秒计，向上取整且至少为 1 秒
fn expire_secs(ttl: Duration) -> u64 {
    (ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0)).max(1)
}

/// Redis 后端，过期交给 Redis 自身的 TTL
#[derive(Clone)]
pub struct RedisStore {
    redis: Arc<RedisClient>,
}

impl RedisStore {
    pub fn new(redis: RedisClient) -> Self {
        Self {
            redis: Arc::new(redis),
        }
    }

    pub fn open(url: &str) -> Result<Self, StoreError> {
        Ok(Self::new(RedisClient::open(url)?))
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.get_multiplexed_async_connection().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.redis.get_multiplexed_async_connection().await?;
        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(key, value, expire_secs(ttl)).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.get_multiplexed_async_connection().await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let mut conn = self.redis.get_multiplexed_async_connection().await?;

        // SCAN 分批遍历，不阻塞 Redis
        let mut keys: Vec<String> = Vec::new();
        {
            let mut iter = conn.scan_match::<_, String>(format!("{}*", prefix)).await?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }
        // SCAN 可能返回重复的键
        keys.sort();
        keys.dedup();

        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            // 遍历期间被过期删除的键直接跳过
            let value: Option<String> = conn.get(&key).await?;
            if let Some(value) = value {
                entries.push((key, value));
            }
        }

        Ok(entries)
    }
}
