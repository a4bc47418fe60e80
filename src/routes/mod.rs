use axum::Json;
use chrono::Utc;
use serde_json::{Value, json};

pub mod admin;
pub mod query;

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "timestamp": Utc::now() }))
}
