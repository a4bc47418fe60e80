//! 准入流水线
//!
//! 顺序固定：解析客户端 IP → 封禁检查 → 操作名 → 大小检查 → 请求体校验 → 限流，
//! 任一步失败立即返回，调用方的业务逻辑不会执行。

use std::net::IpAddr;
use std::sync::Arc;

use axum::http::{HeaderMap, Method, header};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Value, json};
use tracing::debug;

use super::{
    rate_limit::RateLimiter,
    security_log::SecurityLog,
    validation::{InputValidator, SanitizedBody},
};
use crate::{
    config::Config,
    error::AppError,
    models::{Decision, OperationFlags, ViolationType},
};

static OPERATION_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9_-]{1,64}$").expect("valid operation regex"));

/// 准入所需的请求信息
#[derive(Debug, Clone, Copy)]
pub struct AdmissionRequest<'a> {
    pub method: &'a Method,
    pub headers: &'a HeaderMap,
    /// 连接层的对端地址
    pub remote_addr: Option<IpAddr>,
    pub body: &'a [u8],
    /// 读取请求体时已超出上限
    pub oversized: bool,
}

/// 通过准入后交给业务逻辑的数据
#[derive(Debug, Clone)]
pub struct Admitted {
    pub client_ip: String,
    pub fingerprint: String,
    pub is_bot: bool,
    pub body: Option<SanitizedBody>,
    pub decision: Decision,
}

impl Admitted {
    pub fn flags(&self) -> OperationFlags {
        flags_for(self.body.as_ref())
    }
}

fn flags_for(body: Option<&SanitizedBody>) -> OperationFlags {
    body.map(|b| OperationFlags {
        intensive: b.intensive_mode,
        has_attachment: b.has_attachment(),
    })
    .unwrap_or_default()
}

fn parse_ip(value: &str) -> Option<String> {
    value.trim().parse::<IpAddr>().ok().map(|ip| ip.to_string())
}

/// 代理头优先，其次连接地址，最后为 "unknown"
pub fn resolve_client_ip(headers: &HeaderMap, remote_addr: Option<IpAddr>) -> String {
    headers
        .get("x-real-ip")
        .and_then(|h| h.to_str().ok())
        .and_then(parse_ip)
        .or_else(|| {
            headers
                .get("x-forwarded-for")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.split(',').find(|ip| !ip.trim().is_empty()))
                .and_then(parse_ip)
        })
        .or_else(|| remote_addr.map(|ip| ip.to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

fn carries_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

#[derive(Clone)]
pub struct AdmissionMiddleware {
    limiter: RateLimiter,
    validator: InputValidator,
    security_log: SecurityLog,
    config: Arc<Config>,
}

impl AdmissionMiddleware {
    pub fn new(
        limiter: RateLimiter,
        validator: InputValidator,
        security_log: SecurityLog,
        config: Arc<Config>,
    ) -> Self {
        Self {
            limiter,
            validator,
            security_log,
            config,
        }
    }

    async fn reject(
        &self,
        client_ip: &str,
        user_agent: &str,
        violation_type: ViolationType,
        details: Value,
        error: AppError,
    ) -> AppError {
        self.security_log
            .record(violation_type, client_ip, user_agent, details)
            .await;
        error
    }

    pub async fn process(
        &self,
        request: AdmissionRequest<'_>,
        operation: &str,
    ) -> Result<Admitted, AppError> {
        let client_ip = resolve_client_ip(request.headers, request.remote_addr);
        let user_agent = request
            .headers
            .get(header::USER_AGENT)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("")
            .to_string();

        // 1. 封禁
        if let Some(block) = self.limiter.block_status(&client_ip).await {
            let details = json!({
                "operation": operation,
                "blocked_at": block.blocked_at,
                "expires_at": block.expires_at,
                "reason": block.reason,
            });
            let error = AppError::IpBlocked {
                retry_after: self.config.block_duration_secs,
            };
            return Err(self
                .reject(&client_ip, &user_agent, ViolationType::IpBlocked, details, error)
                .await);
        }

        // 2. 操作名，同时也是限流键的一部分
        if !OPERATION_NAME.is_match(operation) {
            let reason = format!("invalid operation name: {}", operation);
            let details = json!({ "operation": operation, "reason": reason });
            let error = AppError::Validation(vec![reason]);
            return Err(self
                .reject(&client_ip, &user_agent, ViolationType::ValidationFailed, details, error)
                .await);
        }

        // 3. 大小
        let declared_size = request
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0)
            .max(request.body.len() as u64);
        let limit = self.config.max_request_bytes;
        let declared_size = if request.oversized {
            declared_size.max(limit + 1)
        } else {
            declared_size
        };
        if declared_size > limit {
            let details = json!({ "operation": operation, "size": declared_size, "limit": limit });
            let error = AppError::RequestTooLarge {
                size: declared_size,
                limit,
            };
            return Err(self
                .reject(&client_ip, &user_agent, ViolationType::RequestTooLarge, details, error)
                .await);
        }

        // 4. 请求体
        let body = if carries_body(request.method) {
            let raw: Value = match serde_json::from_slice(request.body) {
                Ok(raw) => raw,
                Err(e) => {
                    let details = json!({ "operation": operation, "reason": e.to_string() });
                    let error = AppError::InvalidJson(e.to_string());
                    return Err(self
                        .reject(&client_ip, &user_agent, ViolationType::InvalidJson, details, error)
                        .await);
                }
            };

            let outcome = self.validator.validate(&raw);
            match outcome.sanitized {
                Some(body) if outcome.ok => Some(body),
                _ => {
                    let details = json!({ "operation": operation, "errors": outcome.errors });
                    let error = AppError::Validation(outcome.errors);
                    return Err(self
                        .reject(&client_ip, &user_agent, ViolationType::ValidationFailed, details, error)
                        .await);
                }
            }
        } else {
            None
        };

        // 5. 限流
        let flags = flags_for(body.as_ref());
        let decision = self.limiter.evaluate(&client_ip, operation, flags).await;
        if !decision.allowed {
            let tier = decision.tier.clone().unwrap_or_default();
            let retry_after = decision.retry_after.unwrap_or(1);
            let details = json!({
                "operation": operation,
                "tier": tier,
                "limit": decision.limit,
                "retry_after": retry_after,
            });
            let error = AppError::RateLimited {
                tier,
                limit: decision.limit,
                retry_after,
                reset_at: decision.reset_at,
            };
            return Err(self
                .reject(&client_ip, &user_agent, ViolationType::RateLimitExceeded, details, error)
                .await);
        }

        let admitted = Admitted {
            fingerprint: self.validator.request_fingerprint(request.headers),
            is_bot: self.validator.is_likely_bot(request.headers),
            client_ip,
            body,
            decision,
        };
        debug!(
            client_ip = %admitted.client_ip,
            operation = %operation,
            is_bot = admitted.is_bot,
            remaining = admitted.decision.remaining,
            "Request admitted"
        );
        Ok(admitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use axum::http::HeaderValue;
    use chrono::{Duration, TimeZone, Utc};

    struct Fixture {
        admission: AdmissionMiddleware,
        limiter: RateLimiter,
        log: SecurityLog,
    }

    fn fixture(config: Config) -> Fixture {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap());
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let config = Arc::new(config);
        let limiter = RateLimiter::new(store.clone(), Arc::new(clock.clone()), config.clone());
        let log = SecurityLog::new(store, Arc::new(clock), config.clone());
        let admission = AdmissionMiddleware::new(
            limiter.clone(),
            InputValidator::new(config.clone()),
            log.clone(),
            config,
        );
        Fixture {
            admission,
            limiter,
            log,
        }
    }

    fn headers(ip: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_str(&format!("{}, 10.0.0.1", ip)).unwrap());
        headers.insert(header::USER_AGENT, HeaderValue::from_static("Mozilla/5.0"));
        headers
    }

    fn post<'a>(headers: &'a HeaderMap, body: &'a [u8]) -> AdmissionRequest<'a> {
        AdmissionRequest {
            method: &Method::POST,
            headers,
            remote_addr: None,
            body,
            oversized: false,
        }
    }

    #[test]
    fn client_ip_resolution_order() {
        let mut headers = HeaderMap::new();
        let remote: IpAddr = "192.0.2.9".parse().unwrap();
        assert_eq!(resolve_client_ip(&headers, None), "unknown");
        assert_eq!(resolve_client_ip(&headers, Some(remote)), "192.0.2.9");

        headers.insert("x-forwarded-for", HeaderValue::from_static(" , 198.51.100.4, 10.0.0.1"));
        assert_eq!(resolve_client_ip(&headers, Some(remote)), "198.51.100.4");

        headers.insert("x-real-ip", HeaderValue::from_static("203.0.113.5"));
        assert_eq!(resolve_client_ip(&headers, Some(remote)), "203.0.113.5");

        headers.insert("x-real-ip", HeaderValue::from_static("not-an-ip"));
        assert_eq!(resolve_client_ip(&headers, Some(remote)), "198.51.100.4");
    }

    #[tokio::test]
    async fn admits_valid_request_with_sanitized_body() {
        let f = fixture(Config::default());
        let headers = headers("198.51.100.4");
        let body = br#"{"query":"<script>x</script>what is rent control","document_content":"lease","intensive_mode":true}"#;

        let admitted = f.admission.process(post(&headers, body), "ask").await.unwrap();
        assert_eq!(admitted.client_ip, "198.51.100.4");
        assert!(!admitted.is_bot);
        assert_eq!(admitted.body.as_ref().unwrap().query, "what is rent control");
        assert_eq!(
            admitted.flags(),
            OperationFlags {
                intensive: true,
                has_attachment: true
            }
        );
        assert!(admitted.decision.allowed);
        assert!(f.log.recent(Duration::hours(1)).await.is_empty());
    }

    #[tokio::test]
    async fn rejections_are_typed_and_logged() {
        let mut config = Config::default();
        config.max_request_bytes = 64;
        let f = fixture(config);
        let headers = headers("198.51.100.4");

        let err = f.admission.process(post(&headers, b"{nope"), "ask").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidJson(_)));

        let err = f
            .admission
            .process(post(&headers, br#"{"query":"javascript:alert(1)"}"#), "ask")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(ref e) if e[0].contains("JavaScript protocol")));

        let big = format!(r#"{{"query":"{}"}}"#, "a".repeat(100));
        let err = f
            .admission
            .process(post(&headers, big.as_bytes()), "ask")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::RequestTooLarge { limit: 64, .. }));

        let events = f.log.recent(Duration::hours(1)).await;
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.client_ip == "198.51.100.4"));
    }

    #[tokio::test]
    async fn blocked_ip_short_circuits_before_quota() {
        let f = fixture(Config::default());
        let client_headers = headers("198.51.100.4");
        let body = br#"{"query":"what is rent control"}"#;

        for _ in 0..30 {
            let _ = f.admission.process(post(&client_headers, body), "ask").await;
        }
        assert!(f.limiter.is_blocked("198.51.100.4").await);

        let before = f.limiter.quota_status("198.51.100.4", "ask", OperationFlags::default()).await;
        let err = f.admission.process(post(&client_headers, body), "ask").await.unwrap_err();
        assert!(matches!(err, AppError::IpBlocked { retry_after: 3600 }));
        let after = f.limiter.quota_status("198.51.100.4", "ask", OperationFlags::default()).await;
        assert_eq!(before, after);

        // 封禁检查先于大小和格式检查
        let err = f.admission.process(post(&client_headers, b"{nope"), "ask").await.unwrap_err();
        assert!(matches!(err, AppError::IpBlocked { .. }));

        // 其他 IP 不受影响
        let other = headers("198.51.100.99");
        assert!(f.admission.process(post(&other, body), "ask").await.is_ok());
    }

    #[tokio::test]
    async fn invalid_operation_is_logged_after_block_check() {
        let f = fixture(Config::default());
        let client_headers = headers("198.51.100.4");
        let body = br#"{"query":"what is rent control"}"#;

        let err = f
            .admission
            .process(post(&client_headers, body), "Not Valid")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(ref errors) if errors[0].contains("invalid operation name")));

        let events = f.log.recent(Duration::hours(1)).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].violation_type, ViolationType::ValidationFailed);
        let quota = f.limiter.quota_status("198.51.100.4", "ask", OperationFlags::default()).await;
        assert_eq!(quota[0].used, 0);

        for _ in 0..30 {
            let _ = f.admission.process(post(&client_headers, body), "ask").await;
        }

        // 已封禁的 IP 先得到封禁响应
        let err = f
            .admission
            .process(post(&client_headers, body), "BAD")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::IpBlocked { .. }));
        let events = f.log.recent(Duration::hours(1)).await;
        let blocked = events
            .iter()
            .filter(|e| e.violation_type == ViolationType::IpBlocked)
            .count();
        assert_eq!(blocked, 1);
    }

    #[tokio::test]
    async fn get_requests_skip_body_validation() {
        let f = fixture(Config::default());
        let headers = headers("198.51.100.4");
        let request = AdmissionRequest {
            method: &Method::GET,
            headers: &headers,
            remote_addr: None,
            body: b"",
            oversized: false,
        };
        let admitted = f.admission.process(request, "status").await.unwrap();
        assert!(admitted.body.is_none());
        assert_eq!(admitted.flags(), OperationFlags::default());
    }
}
