use axum::{
    body::{Body, to_bytes},
    http::Request,
    middleware::Next,
    response::Response,
};
use tracing::error;

/// 记录的错误响应体上限
const LOGGED_BODY_LIMIT: usize = 4096;

pub async fn log_errors(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let response = next.run(req).await;

    if response.status().is_server_error() {
        let (mut parts, body) = response.into_parts();
        let bytes = match to_bytes(body, LOGGED_BODY_LIMIT).await {
            Ok(b) => b,
            Err(e) => {
                error!(%method, %path, status = %parts.status, error = %e, "Failed to read error response body");
                return Response::from_parts(parts, Body::empty());
            }
        };

        error!(
            %method,
            %path,
            status = %parts.status,
            body = %String::from_utf8_lossy(&bytes),
            "Server error occurred"
        );

        // 重新构建响应体
        parts.headers.remove(axum::http::header::CONTENT_LENGTH);
        Response::from_parts(parts, Body::from(bytes))
    } else {
        response
    }
}
