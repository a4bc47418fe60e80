//! 存储键
//!
//! 键是用 `:` 连接的层级元组，同一类记录共享前缀，便于 `list(prefix)`。

/// 限流窗口计数前缀
pub const RATE_LIMIT_PREFIX: &str = "rate_limit:";

/// 违规记录前缀
pub const VIOLATION_PREFIX: &str = "security:violation:";

/// 封禁记录前缀
pub const BLOCK_PREFIX: &str = "security:block:";

/// 安全事件前缀
pub const SECURITY_EVENT_PREFIX: &str = "security:event:";

/// 响应缓存条目前缀
pub const RESPONSE_CACHE_PREFIX: &str = "response_cache:";

/// 缓存统计前缀
pub const CACHE_STATS_PREFIX: &str = "response_cache_stats:";

pub const CACHE_STATS_HITS: &str = "response_cache_stats:hits";
pub const CACHE_STATS_MISSES: &str = "response_cache_stats:misses";
pub const CACHE_STATS_SIZE: &str = "response_cache_stats:size";
pub const CACHE_STATS_LAST_CLEANUP: &str = "response_cache_stats:last_cleanup";

/// 生成限流窗口计数键
pub fn rate_window_key(scope: &str, client_id: &str, window: &str) -> String {
    format!("{}{}:{}:{}", RATE_LIMIT_PREFIX, scope, window, client_id)
}

/// 生成违规记录键
pub fn violation_key(ip: &str) -> String {
    format!("{}{}", VIOLATION_PREFIX, ip)
}

/// 生成封禁记录键
pub fn block_key(ip: &str) -> String {
    format!("{}{}", BLOCK_PREFIX, ip)
}

/// 生成安全事件键，毫秒时间戳补零保证按键排序即按时间排序
pub fn security_event_key(timestamp_millis: i64, id: &str) -> String {
    format!("{}{:013}:{}", SECURITY_EVENT_PREFIX, timestamp_millis, id)
}

/// 从带前缀的键中取出末尾标识（IPv6 地址本身含 `:`，所以按前缀截取）
pub fn strip_prefix<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    key.strip_prefix(prefix)
}
