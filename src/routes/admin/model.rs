use serde::{Deserialize, Serialize};

use crate::models::{SecurityEvent, TierStatus};

#[derive(Debug, Deserialize)]
pub struct EntryQuery {
    pub key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub hours: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct QuotaQuery {
    pub ip: Option<String>,
    pub operation: Option<String>,
    #[serde(default)]
    pub intensive: bool,
    #[serde(default)]
    pub has_attachment: bool,
}

#[derive(Debug, Serialize)]
pub struct RemovedCount {
    pub removed: usize,
}

#[derive(Debug, Serialize)]
pub struct UnblockResult {
    pub ip: String,
    pub was_blocked: bool,
}

#[derive(Debug, Serialize)]
pub struct EventList {
    pub hours: i64,
    pub count: usize,
    pub events: Vec<SecurityEvent>,
}

#[derive(Debug, Serialize)]
pub struct QuotaReport {
    pub ip: String,
    pub operation: String,
    pub tiers: Vec<TierStatus>,
}
