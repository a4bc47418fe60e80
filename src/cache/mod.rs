// 响应缓存
// 按内容指纹去重昂贵的下游调用，条目与统计都保存在键值存储中

pub mod models;
pub mod operations;

pub use models::{CacheEntry, CacheEntryInfo, CacheStats};
pub use operations::{ResponseCache, content_hash};
