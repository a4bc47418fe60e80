use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};

use crate::AppState;

/// 给所有响应（包括拒绝响应）加上 CORS 与安全头
pub async fn security_headers(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string);

    let mut response = next.run(request).await;
    let headers = state.validator.security_headers(origin.as_deref());
    response.headers_mut().extend(headers);
    response
}
