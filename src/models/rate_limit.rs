use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 调用方从已校验的请求体推导出的操作标记
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationFlags {
    pub intensive: bool,
    pub has_attachment: bool,
}

/// 固定窗口计数，`now >= window_end` 后视为不存在
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateWindowCounter {
    pub count: u32,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

impl RateWindowCounter {
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        now < self.window_end
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub violation_count: u32,
    pub block_count: u32,
    pub last_violation_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub ip: String,
    pub blocked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub reason: String,
}

impl BlockRecord {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// 限流判定结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: u32,
    /// `remaining` 所在层的上限
    pub limit: u32,
    pub reset_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    /// 拒绝请求的那一层
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierStatus {
    pub tier: String,
    pub limit: u32,
    pub used: u32,
    pub remaining: u32,
    pub reset_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IpStatus {
    pub ip: String,
    pub blocked: bool,
    pub block: Option<BlockRecord>,
    pub violations: Option<ViolationRecord>,
}
