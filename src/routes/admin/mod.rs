mod handler;
mod model;

use axum::{
    Router,
    routing::{delete, get, post},
};

use crate::AppState;

pub use handler::{
    blocked_ips, cache_cleanup, cache_clear, cache_entry, cache_stats, ip_status,
    rate_limit_cleanup, rate_limit_status, security_events, unblock_ip,
};

/// 管理接口，鉴权由调用方挂载
pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/cache/stats", get(cache_stats))
        .route("/cache/cleanup", post(cache_cleanup))
        .route("/cache", delete(cache_clear))
        .route("/cache/entry", get(cache_entry))
        .route("/security/blocked", get(blocked_ips))
        .route("/security/ip/{ip}", get(ip_status).delete(unblock_ip))
        .route("/security/events", get(security_events))
        .route("/rate-limit/status", get(rate_limit_status))
        .route("/rate-limit/cleanup", post(rate_limit_cleanup))
}
