use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::models::{CacheEntry, CacheEntryInfo, CacheStats};
use crate::{
    clock::Clock,
    config::Config,
    store::{KeyValueStore, StoreError, get_json, keys, set_json},
};

/// 查询过短不缓存
const MIN_CACHEABLE_QUERY_CHARS: usize = 10;
/// 序列化后的响应过短不缓存
const MIN_CACHEABLE_RESPONSE_CHARS: usize = 50;

/// 非加密滚动哈希，只用于去重
pub fn content_hash(text: &str) -> String {
    let mut hash: u32 = 0;
    let mut len: usize = 0;
    for c in text.chars() {
        hash = hash.wrapping_mul(31).wrapping_add(c as u32);
        len += 1;
    }
    format!("{:08x}{:x}", hash, len)
}

fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn compress(data: &[u8]) -> std::io::Result<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(STANDARD.encode(encoder.finish()?))
}

fn decompress(encoded: &str) -> std::io::Result<String> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let mut decoder = GzDecoder::new(bytes.as_slice());
    let mut out = String::new();
    decoder.read_to_string(&mut out)?;
    Ok(out)
}

#[derive(Clone)]
pub struct ResponseCache {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: Arc<Config>,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, config: Arc<Config>) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// 生成缓存指纹：操作名、模式、查询哈希、文档哈希
    pub fn make_key(operation: &str, query: &str, document: Option<&str>, intensive: bool) -> String {
        let mode = if intensive { "intensive" } else { "standard" };
        let document_hash = document
            .filter(|d| !d.is_empty())
            .map(content_hash)
            .unwrap_or_else(|| "none".to_string());
        format!(
            "{}{}:{}:{}:{}",
            keys::RESPONSE_CACHE_PREFIX,
            operation,
            mode,
            content_hash(query),
            document_hash
        )
    }

    /// 过滤掉廉价或错误的结果，避免污染缓存
    pub fn should_cache(query: &str, response: &Value) -> bool {
        if query.trim().chars().count() < MIN_CACHEABLE_QUERY_CHARS {
            return false;
        }
        if response.get("error").is_some() {
            return false;
        }
        let serialized_len = serde_json::to_string(response)
            .map(|s| s.chars().count())
            .unwrap_or(0);
        serialized_len >= MIN_CACHEABLE_RESPONSE_CHARS
    }

    /// 命中返回负载；过期、校验失败或存储不可用都按未命中处理
    pub async fn lookup(&self, key: &str) -> Option<Value> {
        let result = match self.try_lookup(key).await {
            Ok(result) => result,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache lookup failed, treating as miss");
                None
            }
        };

        let stat = if result.is_some() {
            keys::CACHE_STATS_HITS
        } else {
            keys::CACHE_STATS_MISSES
        };
        self.bump_stat(stat, 1).await;
        result
    }

    async fn try_lookup(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let Some(entry) = get_json::<CacheEntry>(self.store.as_ref(), key).await? else {
            return Ok(None);
        };

        if !entry.is_fresh(self.clock.now()) {
            debug!(key = %key, "Cache entry past its TTL, purging");
            self.purge(key).await?;
            return Ok(None);
        }

        match Self::decode(&entry) {
            Some(payload) => Ok(Some(payload)),
            None => {
                warn!(key = %key, "Cache entry failed integrity check, purging");
                self.purge(key).await?;
                Ok(None)
            }
        }
    }

    fn decode(entry: &CacheEntry) -> Option<Value> {
        let serialized = if entry.is_compressed {
            decompress(entry.payload.as_str()?).ok()?
        } else {
            serde_json::to_string(&entry.payload).ok()?
        };
        if sha256_hex(serialized.as_bytes()) != entry.integrity_hash {
            return None;
        }
        serde_json::from_str(&serialized).ok()
    }

    async fn purge(&self, key: &str) -> Result<(), StoreError> {
        self.store.delete(key).await?;
        self.bump_stat(keys::CACHE_STATS_SIZE, -1).await;
        Ok(())
    }

    /// 写入缓存，失败只记录日志
    pub async fn store(&self, key: &str, payload: &Value, producer: &str, intensive: bool) {
        if let Err(e) = self.try_store(key, payload, producer, intensive).await {
            warn!(key = %key, error = %e, "Failed to store cache entry");
        }
    }

    async fn try_store(
        &self,
        key: &str,
        payload: &Value,
        producer: &str,
        intensive: bool,
    ) -> Result<(), StoreError> {
        let serialized = serde_json::to_string(payload)?;
        let ttl = self.config.cache_ttl(intensive);
        let is_compressed = serialized.len() > self.config.cache_compression_threshold;

        let stored_payload = if is_compressed {
            let encoded = compress(serialized.as_bytes())
                .map_err(|e| StoreError::Unavailable(format!("compression failed: {}", e)))?;
            Value::String(encoded)
        } else {
            payload.clone()
        };

        let entry = CacheEntry {
            payload: stored_payload,
            created_at: self.clock.now(),
            ttl_secs: ttl.as_secs(),
            produced_by: producer.to_string(),
            integrity_hash: sha256_hex(serialized.as_bytes()),
            is_compressed,
            intensive,
        };

        // 覆盖已有条目时条目数不变
        let existed = self.store.get(key).await?.is_some();
        set_json(self.store.as_ref(), key, &entry, Some(ttl)).await?;
        if !existed {
            self.bump_stat(keys::CACHE_STATS_SIZE, 1).await;
        }
        debug!(key = %key, is_compressed, size = serialized.len(), "Cached response");
        Ok(())
    }

    async fn read_stat(&self, key: &str) -> Result<i64, StoreError> {
        Ok(self
            .store
            .get(key)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    /// 统计是尽力而为的，并发写入下允许有偏差
    async fn bump_stat(&self, key: &str, delta: i64) {
        let result = async {
            let value = (self.read_stat(key).await? + delta).max(0);
            self.store.set(key, &value.to_string(), None).await
        }
        .await;
        if let Err(e) = result {
            debug!(key = %key, error = %e, "Failed to update cache stat");
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let read = async {
            let hits = self.read_stat(keys::CACHE_STATS_HITS).await?.max(0) as u64;
            let misses = self.read_stat(keys::CACHE_STATS_MISSES).await?.max(0) as u64;
            let size = self.read_stat(keys::CACHE_STATS_SIZE).await?.max(0) as u64;
            let last_cleanup_at = self
                .store
                .get(keys::CACHE_STATS_LAST_CLEANUP)
                .await?
                .and_then(|v| v.parse().ok());
            Ok::<_, StoreError>((hits, misses, size, last_cleanup_at))
        };

        match read.await {
            Ok((hits, misses, size, last_cleanup_at)) => {
                let total = hits + misses;
                CacheStats {
                    hits,
                    misses,
                    size,
                    hit_rate: if total == 0 {
                        0.0
                    } else {
                        hits as f64 / total as f64
                    },
                    last_cleanup_at,
                }
            }
            Err(e) => {
                warn!(error = %e, "Cache stats unavailable");
                CacheStats::default()
            }
        }
    }

    /// 删除所有已过 TTL 的条目，返回删除数量
    pub async fn cleanup(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut removed = 0;
        let mut live = 0u64;

        for (key, json) in self.store.list(keys::RESPONSE_CACHE_PREFIX).await? {
            let fresh = serde_json::from_str::<CacheEntry>(&json)
                .map(|entry| entry.is_fresh(now))
                .unwrap_or(false);
            if fresh {
                live += 1;
            } else {
                self.store.delete(&key).await?;
                removed += 1;
            }
        }

        self.store
            .set(keys::CACHE_STATS_SIZE, &live.to_string(), None)
            .await?;
        self.store
            .set(keys::CACHE_STATS_LAST_CLEANUP, &now.to_rfc3339(), None)
            .await?;

        info!(removed, remaining = live, "Cache cleanup finished");
        Ok(removed)
    }

    /// 清空所有条目和统计，返回删除的条目数量
    pub async fn clear(&self) -> Result<usize, StoreError> {
        let entries = self.store.list(keys::RESPONSE_CACHE_PREFIX).await?;
        let removed = entries.len();
        for (key, _) in entries {
            self.store.delete(&key).await?;
        }
        for (key, _) in self.store.list(keys::CACHE_STATS_PREFIX).await? {
            self.store.delete(&key).await?;
        }

        info!(removed, "Cache cleared");
        Ok(removed)
    }

    pub async fn inspect(&self, key: &str) -> Result<Option<CacheEntryInfo>, StoreError> {
        let Some(entry) = get_json::<CacheEntry>(self.store.as_ref(), key).await? else {
            return Ok(None);
        };
        let now = self.clock.now();

        Ok(Some(CacheEntryInfo {
            key: key.to_string(),
            created_at: entry.created_at,
            ttl_secs: entry.ttl_secs,
            age_secs: (now - entry.created_at).num_seconds(),
            expired: !entry.is_fresh(now),
            produced_by: entry.produced_by.clone(),
            integrity_hash: entry.integrity_hash.clone(),
            is_compressed: entry.is_compressed,
            intensive: entry.intensive,
            payload: Self::decode(&entry),
        }))
    }

    pub fn ttl(&self, intensive: bool) -> Duration {
        self.config.cache_ttl(intensive)
    }
}
