use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 缓存条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// 压缩时为 gzip 后的 base64 字符串
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: u64,
    pub produced_by: String,
    /// 未压缩序列化结果的 SHA-256
    pub integrity_hash: String,
    pub is_compressed: bool,
    pub intensive: bool,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        let age = now - self.created_at;
        age.num_seconds() <= self.ttl_secs as i64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: u64,
    pub hit_rate: f64,
    pub last_cleanup_at: Option<DateTime<Utc>>,
}

/// 管理接口查看单个条目
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntryInfo {
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: u64,
    pub age_secs: i64,
    pub expired: bool,
    pub produced_by: String,
    pub integrity_hash: String,
    pub is_compressed: bool,
    pub intensive: bool,
    pub payload: Option<serde_json::Value>,
}
