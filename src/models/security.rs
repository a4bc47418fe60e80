use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationType {
    IpBlocked,
    RequestTooLarge,
    InvalidJson,
    ValidationFailed,
    RateLimitExceeded,
}

/// 拒绝请求时记录的安全事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: String,
    pub violation_type: ViolationType,
    pub client_ip: String,
    pub user_agent: String,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}
