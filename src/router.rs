use axum::{
    Router,
    http::Uri,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::{
    AppState,
    error::AppError,
    middleware::{auth_middleware, log_errors, security_headers},
    routes,
};

async fn not_found(uri: Uri) -> AppError {
    AppError::NotFound(uri.path().to_string())
}

async fn method_not_allowed() -> AppError {
    AppError::MethodNotAllowed
}

// 创建主路由
pub fn create_router(state: AppState) -> Router {
    let admin_routes = routes::admin::admin_routes()
        .method_not_allowed_fallback(method_not_allowed)
        .route_layer(from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/health", get(routes::health))
        .route("/api/query/{operation}", post(routes::query::run_query))
        .nest("/admin", admin_routes)
        .fallback(not_found)
        .method_not_allowed_fallback(method_not_allowed)
        // 安全头要覆盖拒绝响应和 404
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(from_fn_with_state(state.clone(), security_headers))
                .layer(from_fn(log_errors)),
        )
        .with_state(state)
}
