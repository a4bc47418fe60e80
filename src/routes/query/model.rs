use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub operation: String,
    pub result: Value,
    pub cached: bool,
    pub timestamp: DateTime<Utc>,
}
