use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use admission_gate::{
    AppState,
    clock::ManualClock,
    config::Config,
    router::create_router,
    store::MemoryStore,
    upstream::{AnswerError, AnswerRequest, Answerer},
};
use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
    response::Response,
};
use chrono::{Duration, TimeZone, Utc};
use serde_json::{Value, json};
use tower::ServiceExt;

const ADMIN_TOKEN: &str = "test-admin-token";
const CLIENT_IP: &str = "203.0.113.7";

#[derive(Default)]
struct StubAnswerer {
    calls: AtomicUsize,
}

#[async_trait]
impl Answerer for StubAnswerer {
    fn name(&self) -> &str {
        "stub"
    }

    async fn answer(&self, request: &AnswerRequest) -> Result<Value, AnswerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({
            "answer": format!("A thorough explanation for: {}", request.query),
            "operation": request.operation,
        }))
    }
}

struct TestApp {
    router: Router,
    clock: ManualClock,
    answerer: Arc<StubAnswerer>,
}

impl TestApp {
    fn new() -> Self {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap());
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let answerer = Arc::new(StubAnswerer::default());
        let config = Config {
            admin_token: ADMIN_TOKEN.to_string(),
            ..Config::default()
        };
        let state = AppState::new(config, store, Arc::new(clock.clone()), answerer.clone());

        Self {
            router: create_router(state),
            clock,
            answerer,
        }
    }

    async fn send(&self, request: Request<Body>) -> Response {
        self.router.clone().oneshot(request).await.unwrap()
    }

    async fn query(&self, ip: &str, operation: &str, body: Value) -> Response {
        let request = Request::post(format!("/api/query/{}", operation))
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::USER_AGENT, "Mozilla/5.0 (X11; Linux x86_64)")
            .header("x-real-ip", ip)
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(request).await
    }

    async fn admin(&self, method: &str, uri: &str) -> Response {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", ADMIN_TOKEN))
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }
}

async fn body_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn question() -> Value {
    json!({ "query": "How do tides depend on the moon?" })
}

#[tokio::test]
async fn health_carries_security_headers() {
    let app = TestApp::new();
    let response = app
        .send(Request::get("/health").body(Body::empty()).unwrap())
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
    assert_eq!(headers[header::X_FRAME_OPTIONS], "DENY");
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    assert!(headers.contains_key(header::CONTENT_SECURITY_POLICY));
    assert!(!headers.contains_key(header::STRICT_TRANSPORT_SECURITY));

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn second_identical_query_is_served_from_cache() {
    let app = TestApp::new();

    let first = app.query(CLIENT_IP, "explain", question()).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()["X-Cache"], "MISS");
    assert_eq!(first.headers()["X-RateLimit-Limit"], "20");
    assert_eq!(first.headers()["X-RateLimit-Remaining"], "19");
    assert_eq!(body_json(first).await["cached"], false);

    let second = app.query(CLIENT_IP, "explain", question()).await;
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers()["X-Cache"], "HIT");
    let json = body_json(second).await;
    assert_eq!(json["cached"], true);
    assert_eq!(
        json["result"]["answer"],
        "A thorough explanation for: How do tides depend on the moon?"
    );

    assert_eq!(app.answerer.calls.load(Ordering::SeqCst), 1);

    // 不同操作不共享缓存
    let other = app.query(CLIENT_IP, "summarize", question()).await;
    assert_eq!(other.headers()["X-Cache"], "MISS");
    assert_eq!(app.answerer.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn twenty_first_request_in_a_minute_is_rejected() {
    let app = TestApp::new();

    for _ in 0..20 {
        let response = app.query(CLIENT_IP, "explain", question()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let rejected = app.query(CLIENT_IP, "explain", question()).await;
    assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(rejected.headers()[header::RETRY_AFTER], "60");
    assert_eq!(rejected.headers()["X-RateLimit-Remaining"], "0");
    // 拒绝响应同样带安全头
    assert_eq!(rejected.headers()[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
    let json = body_json(rejected).await;
    assert_eq!(json["code"], "RATE_LIMIT_EXCEEDED");
    assert_eq!(json["retryAfter"], 60);

    // 其他客户端不受影响
    let other = app.query("198.51.100.2", "explain", question()).await;
    assert_eq!(other.status(), StatusCode::OK);

    app.clock.advance(Duration::seconds(61));
    let after_window = app.query(CLIENT_IP, "explain", question()).await;
    assert_eq!(after_window.status(), StatusCode::OK);
}

#[tokio::test]
async fn suspicious_body_is_rejected_and_logged() {
    let app = TestApp::new();
    let response = app
        .query(
            CLIENT_IP,
            "explain",
            json!({ "query": "<iframe src=x> please explain" }),
        )
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], "VALIDATION_ERROR");
    assert_eq!(json["details"][0], "Suspicious pattern detected: Iframe injection");
    assert_eq!(app.answerer.calls.load(Ordering::SeqCst), 0);

    let events = body_json(app.admin("GET", "/admin/security/events?hours=1").await).await;
    assert_eq!(events["success"], true);
    assert_eq!(events["result"]["count"], 1);
    assert_eq!(events["result"]["events"][0]["violation_type"], "VALIDATION_FAILED");
    assert_eq!(events["result"]["events"][0]["client_ip"], CLIENT_IP);
}

#[tokio::test]
async fn malformed_and_oversized_bodies_are_rejected() {
    let app = TestApp::new();

    let malformed = app
        .send(
            Request::post("/api/query/explain")
                .header("x-real-ip", CLIENT_IP)
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await;
    assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(malformed).await["code"], "INVALID_JSON");

    let huge = vec![b'a'; 1024 * 1024 + 16];
    let oversized = app
        .send(
            Request::post("/api/query/explain")
                .header("x-real-ip", CLIENT_IP)
                .body(Body::from(huge))
                .unwrap(),
        )
        .await;
    assert_eq!(oversized.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body_json(oversized).await["code"], "REQUEST_TOO_LARGE");

    // 两次拒绝都不消耗配额
    let status = body_json(
        app.admin(
            "GET",
            &format!("/admin/rate-limit/status?ip={}&operation=explain", CLIENT_IP),
        )
        .await,
    )
    .await;
    assert_eq!(status["result"]["tiers"][0]["tier"], "client:minute");
    assert_eq!(status["result"]["tiers"][0]["used"], 0);
}

#[tokio::test]
async fn repeated_violations_block_until_unblocked() {
    let app = TestApp::new();

    for _ in 0..20 {
        app.query(CLIENT_IP, "explain", question()).await;
    }
    for _ in 0..10 {
        let response = app.query(CLIENT_IP, "explain", question()).await;
        assert_eq!(body_json(response).await["code"], "RATE_LIMIT_EXCEEDED");
    }

    let blocked = app.query(CLIENT_IP, "explain", question()).await;
    assert_eq!(blocked.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(blocked.headers()[header::RETRY_AFTER], "3600");
    assert_eq!(body_json(blocked).await["code"], "IP_BLOCKED");

    let bad_operation = app.query(CLIENT_IP, "BAD", question()).await;
    assert_eq!(bad_operation.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body_json(bad_operation).await["code"], "IP_BLOCKED");

    let list = body_json(app.admin("GET", "/admin/security/blocked").await).await;
    assert_eq!(list["result"][0]["ip"], CLIENT_IP);
    assert_eq!(list["result"][0]["reason"], "excessive violations");

    let unblocked = body_json(
        app.admin("DELETE", &format!("/admin/security/ip/{}", CLIENT_IP))
            .await,
    )
    .await;
    assert_eq!(unblocked["action"], "unblock_ip");
    assert_eq!(unblocked["result"]["was_blocked"], true);

    let status = body_json(app.admin("GET", &format!("/admin/security/ip/{}", CLIENT_IP)).await).await;
    assert_eq!(status["result"]["blocked"], false);
    assert!(status["result"]["violations"].is_null());

    app.clock.advance(Duration::seconds(61));
    let response = app.query(CLIENT_IP, "explain", question()).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn admin_requires_bearer_token() {
    let app = TestApp::new();

    let anonymous = app
        .send(Request::get("/admin/cache/stats").body(Body::empty()).unwrap())
        .await;
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(anonymous).await["code"], "UNAUTHORIZED");

    let wrong = app
        .send(
            Request::get("/admin/cache/stats")
                .header(header::AUTHORIZATION, "Bearer nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

    let ok = app.admin("GET", "/admin/cache/stats").await;
    assert_eq!(ok.status(), StatusCode::OK);
    let json = body_json(ok).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["action"], "cache_stats");
    assert_eq!(json["result"]["hits"], 0);
}

#[tokio::test]
async fn admin_cache_operations() {
    let app = TestApp::new();
    app.query(CLIENT_IP, "explain", question()).await;
    app.query(CLIENT_IP, "explain", question()).await;

    let stats = body_json(app.admin("GET", "/admin/cache/stats").await).await;
    assert_eq!(stats["result"]["hits"], 1);
    assert_eq!(stats["result"]["misses"], 1);

    let outside = app.admin("GET", "/admin/cache/entry?key=security:block:1.2.3.4").await;
    assert_eq!(outside.status(), StatusCode::NOT_FOUND);

    let missing = app.admin("GET", "/admin/cache/entry").await;
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

    let cleared = body_json(app.admin("DELETE", "/admin/cache").await).await;
    assert_eq!(cleared["result"]["removed"], 1);

    let response = app.query(CLIENT_IP, "explain", question()).await;
    assert_eq!(response.headers()["X-Cache"], "MISS");
}

#[tokio::test]
async fn unknown_routes_and_methods_return_json_errors() {
    let app = TestApp::new();

    let missing = app
        .send(Request::get("/nope").body(Body::empty()).unwrap())
        .await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    assert_eq!(missing.headers()[header::X_FRAME_OPTIONS], "DENY");
    assert_eq!(body_json(missing).await["code"], "NOT_FOUND");

    let wrong_method = app
        .send(Request::get("/api/query/explain").body(Body::empty()).unwrap())
        .await;
    assert_eq!(wrong_method.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(body_json(wrong_method).await["code"], "METHOD_NOT_ALLOWED");

    let bad_operation = app.query(CLIENT_IP, "Not%20Valid", question()).await;
    assert_eq!(bad_operation.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(bad_operation).await["code"], "VALIDATION_ERROR");

    let events = body_json(app.admin("GET", "/admin/security/events").await).await;
    assert_eq!(events["result"]["count"], 1);
    assert_eq!(events["result"]["events"][0]["violation_type"], "VALIDATION_FAILED");
}
