use std::net::SocketAddr;

use axum::{
    Json,
    body::to_bytes,
    extract::{ConnectInfo, Path, Request, State},
    http::{HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use tracing::{debug, info, warn};

use super::model::QueryResponse;
use crate::{
    AppState,
    cache::ResponseCache,
    error::AppError,
    middleware::AdmissionRequest,
    models::Decision,
    upstream::AnswerRequest,
};

fn rate_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert("X-RateLimit-Limit", HeaderValue::from(decision.limit));
    headers.insert("X-RateLimit-Remaining", HeaderValue::from(decision.remaining));
    headers.insert("X-RateLimit-Reset", HeaderValue::from(decision.reset_at.timestamp()));
}

/// POST /api/query/{operation}
pub async fn run_query(
    State(state): State<AppState>,
    Path(operation): Path<String>,
    request: Request,
) -> Result<Response, AppError> {
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let (parts, body) = request.into_parts();

    // 多读一个字节用来判断是否超限
    let read_limit = usize::try_from(state.config.max_request_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(1);
    let (bytes, oversized) = match to_bytes(body, read_limit).await {
        Ok(bytes) => (bytes, false),
        Err(e) => {
            debug!(error = %e, "Request body rejected while reading");
            (Default::default(), true)
        }
    };

    let admitted = state
        .admission
        .process(
            AdmissionRequest {
                method: &parts.method,
                headers: &parts.headers,
                remote_addr,
                body: &bytes,
                oversized,
            },
            &operation,
        )
        .await?;

    let body = admitted
        .body
        .clone()
        .ok_or_else(|| AppError::Validation(vec!["request body is required".to_string()]))?;
    let key = ResponseCache::make_key(
        &operation,
        &body.query,
        body.document_content.as_deref(),
        body.intensive_mode,
    );

    let (result, cached) = match state.cache.lookup(&key).await {
        Some(payload) => (payload, true),
        None => {
            let answer_request = AnswerRequest {
                operation: operation.clone(),
                query: body.query.clone(),
                document_content: body.document_content.clone(),
                intensive_mode: body.intensive_mode,
            };
            let payload = state.answerer.answer(&answer_request).await.map_err(|e| {
                warn!(
                    operation = %operation,
                    client_ip = %admitted.client_ip,
                    answerer = state.answerer.name(),
                    error = %e,
                    "Upstream answer failed"
                );
                AppError::Internal(e.to_string())
            })?;

            if ResponseCache::should_cache(&body.query, &payload) {
                state
                    .cache
                    .store(&key, &payload, state.answerer.name(), body.intensive_mode)
                    .await;
            }
            (payload, false)
        }
    };

    info!(
        operation = %operation,
        client_ip = %admitted.client_ip,
        fingerprint = %admitted.fingerprint,
        is_bot = admitted.is_bot,
        cached,
        "Query answered"
    );

    let mut response = Json(QueryResponse {
        operation,
        result,
        cached,
        timestamp: Utc::now(),
    })
    .into_response();
    let headers = response.headers_mut();
    headers.insert(
        "X-Cache",
        HeaderValue::from_static(if cached { "HIT" } else { "MISS" }),
    );
    rate_limit_headers(headers, &admitted.decision);

    Ok(response)
}
