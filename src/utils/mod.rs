use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// 管理接口统一响应
#[derive(Debug, Serialize)]
pub struct AdminResponse<T: Serialize> {
    pub success: bool,
    pub action: String,
    pub result: T,
    pub timestamp: DateTime<Utc>,
}

/// 错误响应
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<String>>,
    #[serde(rename = "retryAfter", skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

pub fn success_to_api_response<T: Serialize>(action: &str, result: T) -> Json<AdminResponse<T>> {
    Json(AdminResponse {
        success: true,
        action: action.to_string(),
        result,
        timestamp: Utc::now(),
    })
}

pub fn error_to_api_response(
    status: StatusCode,
    code: &'static str,
    error: String,
    details: Option<Vec<String>>,
    retry_after: Option<u64>,
) -> Response {
    (
        status,
        Json(ErrorResponse {
            error,
            code,
            timestamp: Utc::now(),
            details,
            retry_after,
        }),
    )
        .into_response()
}

pub mod error_codes {
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const INVALID_JSON: &str = "INVALID_JSON";
    pub const REQUEST_TOO_LARGE: &str = "REQUEST_TOO_LARGE";
    pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";
    pub const IP_BLOCKED: &str = "IP_BLOCKED";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const METHOD_NOT_ALLOWED: &str = "METHOD_NOT_ALLOWED";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    /// 只出现在日志里，不会返回给调用方
    pub const STORE_UNAVAILABLE: &str = "STORE_UNAVAILABLE";
}
