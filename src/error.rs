use axum::{
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};

use crate::{
    store::StoreError,
    utils::{error_codes, error_to_api_response},
};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("invalid JSON body: {0}")]
    InvalidJson(String),
    #[error("declared request size {size} exceeds {limit}")]
    RequestTooLarge { size: u64, limit: u64 },
    #[error("rate limit exceeded on tier {tier}")]
    RateLimited {
        tier: String,
        limit: u32,
        retry_after: u64,
        reset_at: DateTime<Utc>,
    },
    #[error("ip blocked")]
    IpBlocked { retry_after: u64 },
    #[error("unauthorized")]
    Unauthorized,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::InvalidJson(_) => StatusCode::BAD_REQUEST,
            AppError::RequestTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::RateLimited { .. } | AppError::IpBlocked { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => error_codes::VALIDATION_ERROR,
            AppError::InvalidJson(_) => error_codes::INVALID_JSON,
            AppError::RequestTooLarge { .. } => error_codes::REQUEST_TOO_LARGE,
            AppError::RateLimited { .. } => error_codes::RATE_LIMIT_EXCEEDED,
            AppError::IpBlocked { .. } => error_codes::IP_BLOCKED,
            AppError::Unauthorized => error_codes::UNAUTHORIZED,
            AppError::NotFound(_) => error_codes::NOT_FOUND,
            AppError::MethodNotAllowed => error_codes::METHOD_NOT_ALLOWED,
            AppError::Internal(_) => error_codes::INTERNAL_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            AppError::Validation(_) => "请求参数校验失败".to_string(),
            AppError::InvalidJson(_) => "请求体不是合法的 JSON".to_string(),
            AppError::RequestTooLarge { limit, .. } => {
                format!("请求体过大，最大允许 {} 字节", limit)
            }
            AppError::RateLimited { retry_after, .. } => {
                format!("请求过于频繁，请在{}秒后重试", retry_after)
            }
            AppError::IpBlocked { .. } => "由于多次违规，当前 IP 已被暂时封禁".to_string(),
            AppError::Unauthorized => "未授权访问".to_string(),
            AppError::NotFound(what) => format!("未找到: {}", what),
            AppError::MethodNotAllowed => "不支持的请求方法".to_string(),
            // 内部细节只写日志
            AppError::Internal(_) => "内部服务器错误".to_string(),
        }
    }

    fn details(&self) -> Option<Vec<String>> {
        match self {
            AppError::Validation(errors) => Some(errors.clone()),
            AppError::InvalidJson(reason) => Some(vec![reason.clone()]),
            _ => None,
        }
    }

    fn retry_after(&self) -> Option<u64> {
        match self {
            AppError::RateLimited { retry_after, .. } | AppError::IpBlocked { retry_after } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        tracing::warn!(code = error_codes::STORE_UNAVAILABLE, error = %e, "Store operation failed");
        AppError::Internal(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut response = error_to_api_response(
            self.status(),
            self.code(),
            self.message(),
            self.details(),
            self.retry_after(),
        );

        let headers = response.headers_mut();
        if let Some(retry_after) = self.retry_after() {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        }
        if let AppError::RateLimited {
            limit, reset_at, ..
        } = &self
        {
            headers.insert("X-RateLimit-Limit", HeaderValue::from(*limit));
            headers.insert("X-RateLimit-Remaining", HeaderValue::from(0u32));
            headers.insert("X-RateLimit-Reset", HeaderValue::from(reset_at.timestamp()));
        }

        response
    }
}
