use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
};

use super::model::{
    EntryQuery, EventList, EventsQuery, QuotaQuery, QuotaReport, RemovedCount, UnblockResult,
};
use crate::{
    AppState,
    error::AppError,
    models::OperationFlags,
    store::keys,
    utils::success_to_api_response,
};

const DEFAULT_EVENT_HOURS: i64 = 24;
/// 事件本身只保留 7 天
const MAX_EVENT_HOURS: i64 = 7 * 24;

fn required(value: Option<String>, name: &str) -> Result<String, AppError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::Validation(vec![format!("{} is required", name)]))
}

pub async fn cache_stats(State(state): State<AppState>) -> impl IntoResponse {
    success_to_api_response("cache_stats", state.cache.stats().await)
}

pub async fn cache_cleanup(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let removed = state.cache.cleanup().await?;
    Ok(success_to_api_response("cache_cleanup", RemovedCount { removed }))
}

pub async fn cache_clear(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let removed = state.cache.clear().await?;
    tracing::info!(removed, "Response cache cleared by admin");
    Ok(success_to_api_response("cache_clear", RemovedCount { removed }))
}

pub async fn cache_entry(
    State(state): State<AppState>,
    Query(query): Query<EntryQuery>,
) -> Result<impl IntoResponse, AppError> {
    let key = required(query.key, "key")?;
    // 只允许查看缓存命名空间
    if !key.starts_with(keys::RESPONSE_CACHE_PREFIX) {
        return Err(AppError::NotFound(key));
    }

    match state.cache.inspect(&key).await? {
        Some(info) => Ok(success_to_api_response("cache_entry", info)),
        None => Err(AppError::NotFound(key)),
    }
}

pub async fn blocked_ips(State(state): State<AppState>) -> impl IntoResponse {
    success_to_api_response("blocked_ips", state.limiter.blocked_ips().await)
}

pub async fn ip_status(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> impl IntoResponse {
    success_to_api_response("ip_status", state.limiter.ip_status(&ip).await)
}

pub async fn unblock_ip(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let was_blocked = state.limiter.unblock(&ip).await?;
    Ok(success_to_api_response("unblock_ip", UnblockResult { ip, was_blocked }))
}

pub async fn security_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let hours = query
        .hours
        .unwrap_or(DEFAULT_EVENT_HOURS)
        .clamp(1, MAX_EVENT_HOURS);
    let events = state
        .security_log
        .recent(chrono::Duration::hours(hours))
        .await;

    success_to_api_response(
        "security_events",
        EventList {
            hours,
            count: events.len(),
            events,
        },
    )
}

pub async fn rate_limit_status(
    State(state): State<AppState>,
    Query(query): Query<QuotaQuery>,
) -> Result<impl IntoResponse, AppError> {
    let ip = required(query.ip, "ip")?;
    let operation = required(query.operation, "operation")?;
    let flags = OperationFlags {
        intensive: query.intensive,
        has_attachment: query.has_attachment,
    };
    let tiers = state.limiter.quota_status(&ip, &operation, flags).await;

    Ok(success_to_api_response(
        "rate_limit_status",
        QuotaReport {
            ip,
            operation,
            tiers,
        },
    ))
}

pub async fn rate_limit_cleanup(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let removed = state.limiter.cleanup_counters().await?;
    Ok(success_to_api_response("rate_limit_cleanup", RemovedCount { removed }))
}
