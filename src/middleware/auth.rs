use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Bearer};
use sha2::{Digest, Sha256};

use crate::{AppState, error::AppError};

/// 比较摘要而不是原文，耗时与令牌内容无关
fn token_matches(presented: &str, expected: &str) -> bool {
    !expected.is_empty() && Sha256::digest(presented.as_bytes()) == Sha256::digest(expected.as_bytes())
}

/// 管理接口的 Bearer 令牌校验
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let authorized = request
        .headers()
        .typed_get::<Authorization<Bearer>>()
        .is_some_and(|auth| token_matches(auth.token(), &state.config.admin_token));

    if !authorized {
        tracing::warn!(path = %request.uri().path(), "Rejected admin request without valid token");
        return Err(AppError::Unauthorized);
    }

    Ok(next.run(request).await)
}
